// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::collections::BTreeSet;
use tracing::{info, instrument};

use crate::{
    constants::CHROME_PACKAGES,
    context::Context,
    error::Result,
    portage::{base_install_packages, join_atoms, list_modified_packages, reverse_dependencies},
    run_config::BuildPackagesRunConfig,
    sysroot::Sysroot,
};

/// Packages that must be built from source instead of taken from binhosts:
/// modified cros_workon packages, whatever depends on them directly, and the
/// dependents of base-install packages an incremental build would rebuild.
#[instrument(skip_all, fields(sysroot = %sysroot.path().display()))]
pub fn get_force_local_build_packages(
    ctx: &Context,
    sysroot: &Sysroot,
    run_config: &BuildPackagesRunConfig,
) -> Result<BTreeSet<String>> {
    let mut force_local = BTreeSet::new();
    let packages = run_config.packages();

    let mut workon_packages = BTreeSet::new();
    if run_config.workon {
        workon_packages.extend(list_modified_packages(ctx, sysroot)?);
        if ctx.env.chrome_origin.as_deref().is_some_and(|v| !v.is_empty()) {
            workon_packages.extend(CHROME_PACKAGES.iter().map(|p| p.to_string()));
        }

        if !workon_packages.is_empty() {
            force_local.extend(workon_packages.iter().cloned());
            let dependents = reverse_dependencies(ctx, sysroot, &workon_packages, false)?;
            info!(
                "The following packages depend directly on an active cros_workon package and \
                 will be rebuilt: {}",
                join_atoms(&dependents)
            );
            force_local.extend(dependents);
        }
    }

    if run_config.is_incremental() {
        info!("Starting reverse dependency calculations...");
        let mut flags = run_config.emerge_flags(&ctx.env);
        let all_packages = packages.join(" ");
        flags.extend([
            "--pretend".to_owned(),
            "--columns".to_owned(),
            format!("--reinstall-atoms={all_packages}"),
            format!("--usepkg-exclude={all_packages}"),
        ]);
        if !workon_packages.is_empty() {
            let workon = join_atoms(&workon_packages);
            flags.extend([
                format!("--reinstall-atoms={workon}"),
                format!("--usepkg-exclude={workon}"),
            ]);
        }

        let base_install: BTreeSet<String> = base_install_packages(ctx, sysroot, &flags, &packages)?
            .into_iter()
            .collect();
        if !base_install.is_empty() {
            info!(
                "Calculating reverse dependencies on packages: {}",
                join_atoms(&base_install)
            );
            force_local.extend(base_install.iter().cloned());

            let dependents: BTreeSet<String> = reverse_dependencies(ctx, sysroot, &base_install, true)?
                .into_iter()
                .filter(|atom| {
                    !atom.contains("virtual/")
                        && !CHROME_PACKAGES.iter().any(|chrome| atom.contains(chrome))
                })
                .collect();
            info!(
                "Final reverse dependencies that will be rebuilt: {}",
                join_atoms(&dependents)
            );
            force_local.extend(dependents);
        }
    }

    Ok(force_local)
}
