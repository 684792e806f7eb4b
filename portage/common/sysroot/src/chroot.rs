// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use processes::CommandSpec;
use std::path::PathBuf;
use tracing::{error, info};

use crate::{
    context::Context,
    error::{Error, Result},
    failures::parse_die_hook_status_file,
    run_config::UpdateArguments,
};

/// Facts about the machine the orchestration runs on.
pub trait Host {
    fn is_inside_chroot(&self) -> bool;
    fn is_root_user(&self) -> bool;
}

/// The machine this process runs on.
pub struct RealHost {
    chroot_version_file: PathBuf,
}

impl RealHost {
    pub fn new(chroot_version_file: PathBuf) -> Self {
        Self {
            chroot_version_file,
        }
    }
}

impl Host for RealHost {
    fn is_inside_chroot(&self) -> bool {
        self.chroot_version_file.exists()
    }

    fn is_root_user(&self) -> bool {
        nix::unistd::geteuid().is_root()
    }
}

pub fn assert_inside_chroot(ctx: &Context) -> Result<()> {
    if ctx.host.is_inside_chroot() {
        Ok(())
    } else {
        Err(Error::NotInChroot)
    }
}

pub fn assert_non_root_user(ctx: &Context) -> Result<()> {
    if ctx.host.is_root_user() {
        Err(Error::RootUser)
    } else {
        Ok(())
    }
}

fn update_chroot_command(ctx: &Context, args: &UpdateArguments) -> CommandSpec {
    let mut command = CommandSpec::new(ctx.layout.scripts_dir().join("update_chroot").to_string_lossy())
        .arg(format!("--toolchain_boards={}", args.toolchain_targets.join(",")))
        .arg(format!("--backtrack={}", args.backtrack));
    if let Some(jobs) = args.jobs {
        command = command.arg(format!("--jobs={jobs}"));
    }
    if args.build_source {
        command = command.arg("--nousepkg");
    }
    if !args.update_toolchain {
        command = command.arg("--skip_toolchain_update");
    }
    command
}

/// Brings the SDK's own packages up to date.
pub fn update_chroot(ctx: &Context, args: &UpdateArguments) -> Result<()> {
    info!("Updating the chroot.");
    let status_file = ctx.layout.die_hook_status_file();
    if let Err(source) = ctx.runner.run(&update_chroot_command(ctx, args)) {
        error!("Error occurred while updating the chroot. See the logs for more information.");
        let failed_packages = parse_die_hook_status_file(&status_file)?;
        return Err(Error::UpdateChroot {
            failed_packages,
            source,
        });
    }
    Ok(())
}
