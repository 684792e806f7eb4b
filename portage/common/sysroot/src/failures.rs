// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Recovers which packages failed from the die hook status file that the
//! Portage die hook appends to.

use anyhow::{Context, Result};
use itertools::Itertools;
use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};
use tracing::warn;

use crate::package_info::PackageInfo;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FailedPackage {
    pub package: PackageInfo,
    /// The newest Portage log of the package in the sysroot, if any.
    pub log_path: Option<PathBuf>,
}

/// Reads `<cpv> <phase>` lines. A missing file means nothing failed.
pub fn parse_die_hook_status_file(path: &Path) -> Result<Vec<PackageInfo>> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).with_context(|| format!("Failed to read {}", path.display())),
    };

    Ok(content
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .filter_map(|cpv| match PackageInfo::parse(cpv) {
            Ok(pkg) => Some(pkg),
            Err(e) => {
                warn!("Ignoring die hook entry: {e:#}");
                None
            }
        })
        .collect())
}

/// Writes the file in the die hook's format, for build engines that don't
/// run the die hook. The phase is always `unknown`.
pub fn write_die_hook_status_file(path: &Path, packages: &[PackageInfo]) -> Result<()> {
    let content = packages
        .iter()
        .map(|pkg| format!("{} unknown", pkg.cpvr()))
        .join("\n");
    std::fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))
}

/// Moves a previous run's status file aside so its entries aren't reported
/// again.
pub fn rotate_die_hook_status_file(path: &Path) -> Result<()> {
    if !path.try_exists()? {
        return Ok(());
    }
    let mut rotated = path.as_os_str().to_owned();
    rotated.push(".old");
    std::fs::rename(path, &rotated)
        .with_context(|| format!("Failed to rotate {}", path.display()))
}

/// Finds the newest `<cat>:<pf>:<timestamp>.log` under the sysroot's
/// Portage log directory.
pub fn find_package_log(sysroot: &Path, package: &PackageInfo) -> Option<PathBuf> {
    let prefix = format!("{}:{}:", package.category, package.pf());
    let entries = std::fs::read_dir(sysroot.join("tmp/portage/logs")).ok()?;
    entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with(&prefix) && name.ends_with(".log"))
        })
        .max()
}

/// Parses the die hook status file and attaches each package's log.
pub fn collect_failed_packages(status_file: &Path, sysroot: &Path) -> Result<Vec<FailedPackage>> {
    Ok(parse_die_hook_status_file(status_file)?
        .into_iter()
        .map(|package| FailedPackage {
            log_path: find_package_log(sysroot, &package),
            package,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use testutil::write_files;

    #[test]
    fn parses_status_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("portage_die_hook_status");
        std::fs::write(
            &path,
            "\nfoo/bar-1.2.3 src_install\n   \n\ncat/pkg-2-r2\tpkg_post_inst\nanother/pkg-3 unknown\n\t\n\n",
        )?;

        let parsed = parse_die_hook_status_file(&path)?;

        assert_eq!(
            parsed.iter().map(|p| p.cpvr()).collect::<Vec<_>>(),
            vec!["foo/bar-1.2.3", "cat/pkg-2-r2", "another/pkg-3"]
        );
        Ok(())
    }

    #[test]
    fn missing_status_file_is_empty() -> Result<()> {
        let dir = tempfile::tempdir()?;
        assert!(parse_die_hook_status_file(&dir.path().join("nope"))?.is_empty());
        Ok(())
    }

    #[test]
    fn write_then_rotate() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("status");
        let pkgs = vec![PackageInfo::parse("cat/x-1.0")?, PackageInfo::parse("cat/y-2.0")?];

        write_die_hook_status_file(&path, &pkgs)?;
        assert_eq!(std::fs::read_to_string(&path)?, "cat/x-1.0 unknown\ncat/y-2.0 unknown");
        assert_eq!(parse_die_hook_status_file(&path)?, pkgs);

        rotate_die_hook_status_file(&path)?;
        assert!(!path.exists());
        assert!(dir.path().join("status.old").exists());
        Ok(())
    }

    #[test]
    fn attaches_newest_log() -> Result<()> {
        let dir = tempfile::tempdir()?;
        write_files(
            dir.path(),
            [
                ("status", "cat/x-1.0 src_compile\ncat/y-2.0 src_install\n"),
                ("sysroot/tmp/portage/logs/cat:x-1.0:20240101-010101.log", ""),
                ("sysroot/tmp/portage/logs/cat:x-1.0:20240301-010101.log", ""),
                ("sysroot/tmp/portage/logs/cat:x-1.0.1:20240401-010101.log", ""),
            ],
        )?;

        let failed = collect_failed_packages(&dir.path().join("status"), &dir.path().join("sysroot"))?;

        assert_eq!(failed.len(), 2);
        assert_eq!(
            failed[0].log_path.as_deref(),
            Some(
                dir.path()
                    .join("sysroot/tmp/portage/logs/cat:x-1.0:20240301-010101.log")
                    .as_path()
            )
        );
        assert_eq!(failed[1].log_path, None);
        Ok(())
    }
}
