// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use anyhow::Context as _;
use processes::CommandSpec;
use tracing::{error, info, instrument, warn};

use crate::{
    binhost::best_effort,
    build_target::BuildTarget,
    chroot::{assert_inside_chroot, update_chroot},
    constants::{IMPLICIT_SYSTEM_PKG, SDK_BOARD},
    context::Context,
    error::{Error, Result},
    failures::parse_die_hook_status_file,
    makeconf::BinhostConfOptions,
    portage::parallel_emerge,
    run_config::SetupBoardRunConfig,
    sysroot::Sysroot,
};

/// Creates the board's sysroot and installs its toolchain.
#[instrument(skip_all, fields(board = target.name()))]
pub fn setup_board(
    ctx: &Context,
    target: &BuildTarget,
    accept_licenses: Option<&str>,
    run_configs: &SetupBoardRunConfig,
) -> Result<()> {
    let (sysroot, regen_only) = create_sysroot(ctx, target, run_configs, accept_licenses)?;
    if regen_only {
        return Ok(());
    }
    install_toolchain(ctx, target, &sysroot, run_configs)
}

/// Creates and configures the sysroot, up to and including the Portage
/// configuration. Safe to run on an existing sysroot.
pub fn create(
    ctx: &Context,
    target: &BuildTarget,
    run_configs: &SetupBoardRunConfig,
    accept_licenses: Option<&str>,
) -> Result<Sysroot> {
    create_sysroot(ctx, target, run_configs, accept_licenses).map(|(sysroot, _)| sysroot)
}

fn create_sysroot(
    ctx: &Context,
    target: &BuildTarget,
    run_configs: &SetupBoardRunConfig,
    accept_licenses: Option<&str>,
) -> Result<(Sysroot, bool)> {
    assert_inside_chroot(ctx)?;

    let sysroot = Sysroot::new(target.root());
    let existed = sysroot.exists();
    if existed && !run_configs.force() && !run_configs.quiet {
        warn!(
            "Board output directory already exists: {}\n\
             Use --force to clobber the board root and start again.",
            sysroot.path().display()
        );
    }

    // Regenerating configs needs something to regenerate.
    let regen_only = run_configs.regen_configs && existed;

    if run_configs.update_chroot && !regen_only {
        update_chroot(ctx, &run_configs.update_chroot_args(target.name()))?;
    }

    if existed && run_configs.force() {
        sysroot.delete(ctx.runner, true)?;
    }

    info!("Creating sysroot directories.");
    sysroot.create_skeleton(&ctx.layout, ctx.runner)?;

    info!("Installing configurations into sysroot.");
    sysroot.install_configs(&ctx.layout, target, ctx.runner)?;

    info!("Setting up portage in the sysroot.");
    install_portage_configs(ctx, target, &sysroot, run_configs, accept_licenses)?;

    if run_configs.set_default {
        let default_board = ctx.layout.default_board_file();
        std::fs::write(&default_board, target.name())
            .with_context(|| format!("Failed to write {}", default_board.display()))?;
    }

    info!("Initializing broot.");
    let broot = Sysroot::new(target.broot());
    let host = BuildTarget::new(SDK_BOARD).with_root(target.broot());
    broot.create_skeleton(&ctx.layout, ctx.runner)?;
    broot.install_configs(&ctx.layout, &host, ctx.runner)?;

    Ok((sysroot, regen_only))
}

fn install_portage_configs(
    ctx: &Context,
    target: &BuildTarget,
    sysroot: &Sysroot,
    run_configs: &SetupBoardRunConfig,
    accept_licenses: Option<&str>,
) -> Result<()> {
    sysroot.create_wrappers(&ctx.layout, target.name(), ctx.runner)?;
    choose_profile(ctx, target, sysroot)?;
    sysroot.refresh_workon_symlinks(&ctx.layout, target.name(), ctx.runner)?;

    let fetched = best_effort(
        "Binhost lookup",
        ctx.binhost_lookup
            .lookup_binhosts(target, run_configs.binhost_lookup_service_data.as_ref()),
    );

    // The binhost configuration depends on the profile.
    sysroot.install_make_conf_board(
        &ctx.layout,
        target,
        accept_licenses,
        &BinhostConfOptions {
            local_only: run_configs.local_build,
            use_cq_prebuilts: run_configs.use_cq_prebuilts,
            expanded_binhost_inheritance: run_configs.expanded_binhost_inheritance,
            binhost_overrides: fetched.unwrap_or_default(),
        },
        ctx.runner,
    )?;
    Ok(())
}

/// Selects the Portage profile. A sysroot without a profile is useless, so
/// it is removed on failure.
fn choose_profile(ctx: &Context, target: &BuildTarget, sysroot: &Sysroot) -> Result<()> {
    let mut command = CommandSpec::new(ctx.layout.chromite_bin("cros_choose_profile"))
        .args(["--board", target.name(), "--board-root"])
        .arg(sysroot.path().to_string_lossy());
    if target.has_custom_profile() {
        command = command.args(["--profile", target.profile()]);
    }
    if let Err(e) = ctx.runner.run(&command) {
        error!("Selecting profile failed, removing incomplete board directory!");
        sysroot.delete(ctx.runner, false)?;
        return Err(e.into());
    }
    Ok(())
}

/// Installs the toolchain and the implicit system packages into an existing
/// sysroot.
#[instrument(skip_all, fields(board = target.name()))]
pub fn install_toolchain(
    ctx: &Context,
    target: &BuildTarget,
    sysroot: &Sysroot,
    run_configs: &SetupBoardRunConfig,
) -> Result<()> {
    assert_inside_chroot(ctx)?;
    if !sysroot.exists() {
        return Err(Error::InvalidSysroot(sysroot.path().to_owned()));
    }

    if run_configs.init_board_pkgs {
        info!("Updating toolchain.");
        // Local packages are fine to bootstrap from unless building
        // everything from source.
        let local_init = run_configs.usepkg || run_configs.local_build;
        update_toolchain(ctx, target, sysroot, local_init)?;
    }
    Ok(())
}

fn update_toolchain(
    ctx: &Context,
    target: &BuildTarget,
    sysroot: &Sysroot,
    local_init: bool,
) -> Result<()> {
    if sysroot.is_toolchain_installed()? {
        info!("Toolchain is already installed in {}", sysroot.path().display());
        return Ok(());
    }
    let status_file = ctx.layout.die_hook_status_file();
    let toolchain_error = |source| -> Result<Error> {
        Ok(Error::ToolchainInstall {
            failed_packages: parse_die_hook_status_file(&status_file)?,
            source,
        })
    };

    let libc = CommandSpec::new(ctx.layout.chromite_bin("cros_setup_toolchains"))
        .arg("--targets=boards")
        .arg(format!("--include-boards={}", target.name()))
        .arg(format!("--sysroot={}", sysroot.path().display()))
        .sudo();
    if let Err(e) = ctx.runner.run(&libc) {
        return Err(toolchain_error(e)?);
    }

    let mut emerge = parallel_emerge(&ctx.layout)
        .arg(format!("--board={}", target.name()))
        .args(["--root-deps=rdeps", "--select", "--quiet"]);
    if local_init {
        emerge = emerge.args(["--getbinpkg", "--usepkg"]);
    }
    let emerge = emerge.arg(IMPLICIT_SYSTEM_PKG).sudo().preserve_env();
    if let Err(e) = ctx.runner.run(&emerge) {
        return Err(toolchain_error(e)?);
    }

    sysroot.set_toolchain_installed(ctx.runner)?;
    Ok(())
}
