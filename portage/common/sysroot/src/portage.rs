// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Thin wrappers around the Portage tools the build drives.

use anyhow::{Context as _, Result};
use itertools::Itertools;
use lazy_static::lazy_static;
use processes::{CommandError, CommandSpec};
use regex::Regex;
use std::collections::BTreeSet;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::{
    build_target::BuildTarget,
    constants::BASE_INSTALL_HEURISTIC_PATTERNS,
    context::Context,
    layout::Layout,
    package_info::PackageInfo,
    sysroot::Sysroot,
};

lazy_static! {
    static ref PRETEND_EBUILD_RE: Regex = Regex::new(r"\[ebuild(.*?)\]\s(.*?)\s").unwrap();
}

pub fn parallel_emerge(layout: &Layout) -> CommandSpec {
    CommandSpec::new(layout.chromite_bin("parallel_emerge"))
}

/// `parallel_emerge` installing into `sysroot`.
pub fn emerge_command(layout: &Layout, sysroot: &Sysroot) -> CommandSpec {
    let path = sysroot.path().display();
    parallel_emerge(layout)
        .arg(format!("--sysroot={path}"))
        .arg(format!("--root={path}"))
}

/// Packages the user has cros_workon-started and modified for the board.
pub fn list_modified_packages(ctx: &Context, sysroot: &Sysroot) -> Result<Vec<String>, CommandError> {
    let output = ctx.runner.run(
        &CommandSpec::new("cros_list_modified_packages")
            .arg("--sysroot")
            .arg(sysroot.path().to_string_lossy())
            .capture_output(),
    )?;
    info!(
        "Detected cros_workon modified packages: {}",
        output.stdout.trim_end()
    );
    Ok(output.stdout.split_whitespace().map(str::to_owned).collect())
}

/// Packages in `sysroot` depending on any of `atoms`, as `category/package`.
/// With `indirect`, transitive dependents are included too.
pub fn reverse_dependencies(
    ctx: &Context,
    sysroot: &Sysroot,
    atoms: &BTreeSet<String>,
    indirect: bool,
) -> crate::error::Result<BTreeSet<String>> {
    let root = format!("{}/", sysroot.path().display());
    let mut command = CommandSpec::new("equery")
        .args(["--no-color", "--no-pipe", "-q", "depends"])
        .env("ROOT", root.as_str())
        .env("SYSROOT", root.as_str())
        .env("PORTAGE_CONFIGROOT", root.as_str())
        .capture_output();
    if indirect {
        command = command.arg("--indirect");
    }
    let output = ctx.runner.run(&command.args(atoms.iter().cloned()))?;

    Ok(output
        .stdout
        .split_whitespace()
        .filter_map(|token| match PackageInfo::parse(token) {
            Ok(package) => Some(package.cp()),
            Err(_) => {
                debug!("Ignoring equery output {token:?}");
                None
            }
        })
        .collect())
}

/// Packages an incremental build would rebuild from source among those whose
/// dependencies are known to be declared incompletely.
///
/// `flags` must make emerge only pretend; its output looks like
/// `[ebuild r U] chromeos-base/tast-build-deps-0.0.1 to /build/eve/ USE=...`.
pub fn base_install_packages(
    ctx: &Context,
    sysroot: &Sysroot,
    flags: &[String],
    packages: &[String],
) -> Result<Vec<String>, CommandError> {
    let output = ctx.runner.run(
        &emerge_command(&ctx.layout, sysroot)
            .args(flags.iter().cloned())
            .args(packages.iter().cloned())
            .sudo()
            .capture_output(),
    )?;
    Ok(parse_base_install_packages(&output.stdout))
}

fn parse_base_install_packages(pretend_output: &str) -> Vec<String> {
    pretend_output
        .lines()
        .filter(|line| {
            line.contains("to /build/")
                && BASE_INSTALL_HEURISTIC_PATTERNS
                    .iter()
                    .any(|pattern| line.contains(pattern))
        })
        .filter_map(|line| PRETEND_EBUILD_RE.captures(line))
        .map(|caps| caps[2].to_owned())
        .sorted()
        .dedup()
        .collect()
}

/// A variable as the board's Portage configuration resolves it.
pub fn portageq_envvar(ctx: &Context, target: &BuildTarget, var: &str) -> Result<String, CommandError> {
    let output = ctx.runner.run(
        &CommandSpec::new(target.get_command("portageq"))
            .args(["envvar", var])
            .capture_output(),
    )?;
    Ok(output.stdout.trim().to_owned())
}

/// Regenerates the metadata cache of every overlay the sysroot uses.
pub fn regen_dependency_cache(
    ctx: &Context,
    sysroot: &Sysroot,
    jobs: Option<u32>,
) -> Result<(), CommandError> {
    let mut command = CommandSpec::new(ctx.layout.chromite_bin("cros_update_metadata_cache"))
        .arg("--sysroot")
        .arg(sysroot.path().to_string_lossy());
    if let Some(jobs) = jobs {
        command = command.arg("--jobs").arg(jobs.to_string());
    }
    ctx.runner.run(&command)?;
    Ok(())
}

/// Removes binary packages in the sysroot's PKGDIR. A deep clean removes
/// every binpkg not matching an installed package; otherwise only binpkgs
/// without a matching ebuild go.
pub fn eclean_packages(ctx: &Context, target: &BuildTarget, deep: bool) -> Result<(), CommandError> {
    let mut command = CommandSpec::new(target.get_command("eclean"));
    if deep {
        command = command.arg("-d");
    }
    ctx.runner.run(&command.arg("packages"))?;
    Ok(())
}

/// Packages installed in a Portage database such as the SDK's `/var/db/pkg`.
pub fn installed_packages(vdb: &std::path::Path) -> Result<Vec<PackageInfo>> {
    let mut packages = Vec::new();
    if !vdb.is_dir() {
        return Ok(packages);
    }
    for entry in WalkDir::new(vdb).min_depth(2).max_depth(2).sort_by_file_name() {
        let entry = entry.with_context(|| format!("Failed to scan {}", vdb.display()))?;
        if !entry.file_type().is_dir() {
            continue;
        }
        let rel = entry.path().strip_prefix(vdb)?;
        let cpv = rel.to_string_lossy();
        // Merges in progress live in -MERGING-<pf> directories.
        if cpv.contains("-MERGING-") {
            continue;
        }
        match PackageInfo::parse(&cpv) {
            Ok(package) if package.version.is_some() => packages.push(package),
            _ => debug!("Ignoring {} in the package database", entry.path().display()),
        }
    }
    Ok(packages)
}

/// Pre-timeout hook: shows what is still running before the build is
/// killed.
pub fn print_process_tree() {
    info!(
        "The build process is about to be aborted because of a timeout. Printing the process tree."
    );
    match std::process::Command::new("pstree").arg("-Apal").output() {
        Ok(output) => info!("{}", String::from_utf8_lossy(&output.stdout)),
        Err(e) => info!("pstree failed: {e}"),
    }
}

/// The space-joined form emerge takes for atom list flags.
pub fn join_atoms<'a>(atoms: impl IntoIterator<Item = &'a String>) -> String {
    atoms.into_iter().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{layout::Layout, testing::{context, FakeHost}};
    use pretty_assertions::assert_eq;
    use testutil::{program, write_files, FakeRunner};

    #[test]
    fn base_install_packages_are_filtered_and_deduped() {
        let output = "\
[binary N] dev-go/containerd-1.7.1 to /build/eve/ USE=\"\"
[ebuild r U] chromeos-base/tast-build-deps-0.0.1-r5 to /build/eve/ USE=\"\"
[ebuild r U] chromeos-base/tast-build-deps-0.0.1-r5 to /build/eve/ USE=\"\"
[ebuild  N] sys-boot/coreboot-private-files-0.0.1 to /build/eve/
[ebuild r U] chromeos-base/tast-build-deps-0.0.1-r5 to /
[binary U] chromeos-base/chromeos-chrome-120 to /build/eve/
";
        assert_eq!(
            parse_base_install_packages(output),
            vec![
                "chromeos-base/tast-build-deps-0.0.1-r5",
                "sys-boot/coreboot-private-files-0.0.1",
            ]
        );
    }

    #[test]
    fn reverse_dependencies_reduce_to_cp() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let runner = FakeRunner::new();
        runner.stdout(
            program("equery"),
            "chromeos-base/shill-0.0.1-r3\nchromeos-base/debugd-0.0.1-r10\n",
        );
        let fake_host = FakeHost::default();
        let ctx = context(&runner, &fake_host, Layout::under(dir.path()));
        let sysroot = Sysroot::new("/build/eve");

        let atoms = BTreeSet::from(["chromeos-base/libbrillo".to_owned()]);
        let deps = reverse_dependencies(&ctx, &sysroot, &atoms, true)?;

        assert_eq!(
            deps,
            BTreeSet::from([
                "chromeos-base/debugd".to_owned(),
                "chromeos-base/shill".to_owned()
            ])
        );
        let calls = runner.calls_to("equery");
        assert_eq!(
            calls[0].args,
            vec!["--no-color", "--no-pipe", "-q", "depends", "--indirect", "chromeos-base/libbrillo"]
        );
        assert_eq!(calls[0].extra_env.get("ROOT").map(String::as_str), Some("/build/eve/"));
        Ok(())
    }

    #[test]
    fn eclean_uses_board_wrapper() -> Result<()> {
        let runner = FakeRunner::new();
        let fake_host = FakeHost::default();
        let ctx = context(&runner, &fake_host, Layout::default());

        eclean_packages(&ctx, &BuildTarget::new("eve"), true)?;
        eclean_packages(&ctx, &BuildTarget::new("eve"), false)?;

        let calls = runner.calls_to("eclean-eve");
        assert_eq!(calls[0].args, vec!["-d", "packages"]);
        assert_eq!(calls[1].args, vec!["packages"]);
        Ok(())
    }

    #[test]
    fn scans_package_database() -> Result<()> {
        let dir = tempfile::tempdir()?;
        write_files(
            dir.path(),
            [
                ("dev-lang/go-1.20.5/CONTENTS", ""),
                ("sys-libs/glibc-2.35-r20/CONTENTS", ""),
                ("sys-libs/-MERGING-zlib-1.3/CONTENTS", ""),
            ],
        )?;

        let packages = installed_packages(dir.path())?;

        assert_eq!(
            packages.iter().map(PackageInfo::cpvr).collect::<Vec<_>>(),
            vec!["dev-lang/go-1.20.5", "sys-libs/glibc-2.35-r20"]
        );
        assert!(installed_packages(&dir.path().join("missing"))?.is_empty());
        Ok(())
    }
}
