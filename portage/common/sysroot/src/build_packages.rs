// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use chrono::Utc;
use itertools::Itertools;
use processes::{CommandError, CommandRunner, CommandSpec};
use std::{collections::BTreeMap, path::Path};
use tracing::{error, info, instrument, warn, Level};

use crate::{
    bazel::{bazel_build, BazelOptions},
    binhost::{log_binhost_age, resolve_binhosts},
    build_target::BuildTarget,
    chroot::{assert_inside_chroot, assert_non_root_user},
    constants::{
        BINHOST_AGE_THRESHOLD_DAYS, CRITICAL_SDK_PACKAGES, TARGET_SDK_BROOT_PKG,
        TEMP_DUPLICATE_PACKAGES,
    },
    context::Context,
    error::{PackageInstallError, Result},
    failures::{collect_failed_packages, rotate_die_hook_status_file},
    package_info::PackageInfo,
    package_set::get_force_local_build_packages,
    portage::{
        eclean_packages, emerge_command, installed_packages, join_atoms, parallel_emerge,
        portageq_envvar, print_process_tree, regen_dependency_cache,
    },
    run_config::BuildPackagesRunConfig,
    sysroot::Sysroot,
};

const PERFORMANCE_GOVERNOR: &str = "performance";

/// Switches the CPUs to the performance governor for the guard's lifetime.
///
/// Every step is best effort. The original governor is restored on drop
/// unless the change is sticky.
struct CpuGovernorGuard<'a> {
    runner: &'a dyn CommandRunner,
    restore: Option<String>,
}

impl<'a> CpuGovernorGuard<'a> {
    fn new(ctx: &Context<'a>, enabled: bool, sticky: bool) -> Self {
        let mut guard = Self {
            runner: ctx.runner,
            restore: None,
        };
        if !enabled {
            return guard;
        }

        let governor_file = ctx.layout.cpu_governor_file();
        let current = match std::fs::read_to_string(&governor_file) {
            Ok(content) => content.trim().to_owned(),
            Err(e) => {
                warn!("Cannot read {}: {e}", governor_file.display());
                return guard;
            }
        };
        if current == PERFORMANCE_GOVERNOR {
            info!("CPU governor is already {PERFORMANCE_GOVERNOR}");
            return guard;
        }
        if guard.set(PERFORMANCE_GOVERNOR) && !sticky {
            guard.restore = Some(current);
        }
        guard
    }

    fn set(&self, governor: &str) -> bool {
        info!("Setting CPU governor to {governor}");
        let result = self.runner.run(
            &CommandSpec::new("cpupower")
                .args(["-c", "all", "frequency-set", "-g", governor])
                .sudo(),
        );
        match result {
            Ok(_) => true,
            Err(e) => {
                warn!("Failed to set the CPU governor: {e}");
                false
            }
        }
    }
}

impl Drop for CpuGovernorGuard<'_> {
    fn drop(&mut self) {
        if let Some(governor) = self.restore.take() {
            self.set(&governor);
        }
    }
}

/// Builds and installs packages into the sysroot.
///
/// Failures of the package builds themselves are reported as
/// [`crate::error::Error::PackageInstall`] with the packages the die hook
/// recorded; the sysroot is left as it is.
#[instrument(skip_all, fields(board = target.name(), bazel = run_configs.bazel))]
pub fn build_packages(
    ctx: &Context,
    target: &BuildTarget,
    sysroot: &Sysroot,
    run_configs: &BuildPackagesRunConfig,
) -> Result<()> {
    assert_inside_chroot(ctx)?;
    assert_non_root_user(ctx)?;

    let status_file = ctx.layout.die_hook_status_file();
    rotate_die_hook_status_file(&status_file)?;

    info!("Bootstrapping depot_tools");
    ctx.runner.run(&CommandSpec::new(ctx.layout.ensure_bootstrap()))?;

    if ctx.env.clean_outdated_pkgs_enabled() {
        clean_outdated_packages(ctx, target)?;
    }

    let mut extra_env = run_configs.extra_env(&ctx.env);
    extra_env.insert(
        "PKGDIR".to_owned(),
        sysroot.join("packages").to_string_lossy().into_owned(),
    );

    let configured = portageq_envvar(ctx, target, "PORTAGE_BINHOST")?;
    let binhosts = resolve_binhosts(
        ctx.binhost_lookup,
        target,
        run_configs.binhost_lookup_service_data.as_ref(),
        &configured,
    );
    extra_env.insert("PORTAGE_BINHOST".to_owned(), binhosts.join(" "));
    // Each age check is a remote request.
    if tracing::enabled!(Level::DEBUG) {
        log_binhost_age(ctx.age_source, &binhosts, BINHOST_AGE_THRESHOLD_DAYS, Utc::now());
    }

    let _governor =
        CpuGovernorGuard::new(ctx, run_configs.autosetgov, run_configs.autosetgov_sticky);

    info!("Rebuilding Portage cache.");
    regen_dependency_cache(ctx, sysroot, run_configs.jobs)?;

    info!("Updating per-board bdepends");
    install_broot_packages(ctx, target, run_configs)?;

    // Ebuilds may have been removed since the binpkgs were built.
    if run_configs.eclean {
        eclean_packages(ctx, target, false)?;
    }

    let mut emerge_flags = run_configs.emerge_flags(&ctx.env);
    let rebuild = get_force_local_build_packages(ctx, sysroot, run_configs)?;
    if !rebuild.is_empty() {
        let rebuild = join_atoms(&rebuild);
        emerge_flags.push(format!("--reinstall-atoms={rebuild}"));
        emerge_flags.push(format!("--usepkg-exclude={rebuild}"));
    }
    let sdk_packages = CRITICAL_SDK_PACKAGES.join(" ");
    emerge_flags.push(format!("--useoldpkg-atoms={sdk_packages}"));
    emerge_flags.push(format!("--rebuild-exclude={sdk_packages}"));

    info!("Merging board packages now.");
    let packages = run_configs.packages();
    let timeout = run_configs.remaining_timeout(Utc::now());
    info!(
        "Timeout datetime is {:?}. The build command will be aborted after {:?}.",
        run_configs.timeout, timeout
    );

    let result = if run_configs.bazel {
        bazel_build(
            ctx,
            target,
            &packages,
            BazelOptions {
                lite: run_configs.bazel_lite,
                remote_execution: run_configs.bazel_use_remote_execution,
            },
            &extra_env,
            timeout,
        )
    } else {
        emerge_board_packages(ctx, sysroot, &emerge_flags, &packages, &extra_env, timeout)
    };
    if let Err(e) = result {
        let failed = collect_failed_packages(&status_file, sysroot.path())?;
        return Err(PackageInstallError::new("Merging board packages failed", e, failed).into());
    }
    info!("Builds complete.");

    if run_configs.eclean {
        eclean_packages(ctx, target, true)?;
    }
    Ok(())
}

fn clean_outdated_packages(ctx: &Context, target: &BuildTarget) -> Result<()> {
    let command = CommandSpec::new("cros")
        .arg("clean-outdated-pkgs")
        .arg(format!("--board={}", target.name()))
        .sudo()
        .preserve_env();
    if let Err(e) = ctx.runner.run(&command) {
        error!("While cleaning outdated packages with \"{command}\": {e}");
        return Err(e.into());
    }
    Ok(())
}

/// Packages already installed in the SDK, declared provided in the broot.
fn broot_provided_packages(sdk_vdb: &Path) -> anyhow::Result<Vec<PackageInfo>> {
    Ok(installed_packages(sdk_vdb)?
        .into_iter()
        .filter(|p| !TEMP_DUPLICATE_PACKAGES.contains(&p.cp().as_str()))
        .sorted_by_key(PackageInfo::cpvr)
        .collect())
}

fn install_broot_packages(
    ctx: &Context,
    target: &BuildTarget,
    run_configs: &BuildPackagesRunConfig,
) -> Result<()> {
    let broot = Sysroot::new(target.broot());
    broot.write_package_provided(&broot_provided_packages(&ctx.layout.sdk_vdb())?, ctx.runner)?;

    let path = broot.path().to_string_lossy();
    let mut command = parallel_emerge(&ctx.layout)
        .arg("--root")
        .arg(path.clone())
        .arg("--sysroot")
        .arg(path)
        .args([
            "--with-bdepends=n",
            "--update",
            "--deep",
            "--newuse",
            "--verbose",
            "--newrepo",
        ]);
    if run_configs.usepkg {
        command = command.args(["--usepkg", "--getbinpkg"]);
    }
    let command = command
        .arg(TARGET_SDK_BROOT_PKG)
        .env("PKGDIR", broot.join("packages").to_string_lossy())
        .env("USE", "")
        .sudo();

    if let Err(e) = ctx.runner.run(&command) {
        let failed = collect_failed_packages(&ctx.layout.die_hook_status_file(), broot.path())?;
        return Err(PackageInstallError::new("Merging broot packages failed", e, failed).into());
    }
    Ok(())
}

fn emerge_board_packages(
    ctx: &Context,
    sysroot: &Sysroot,
    flags: &[String],
    packages: &[String],
    extra_env: &BTreeMap<String, String>,
    timeout: Option<std::time::Duration>,
) -> Result<(), CommandError> {
    let command = emerge_command(&ctx.layout, sysroot)
        .args(flags)
        .args(packages)
        .envs(extra_env.clone())
        .sudo()
        .preserve_env()
        .timeout(timeout)
        .pre_timeout_hook(print_process_tree);
    ctx.runner.run(&command)?;
    Ok(())
}
