// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Uploads a board's binary packages to Google Storage.

use anyhow::{anyhow, Context, Result};
use processes::{CommandError, CommandRunner, CommandSpec};
use std::{
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::{info, instrument, warn};
use walkdir::WalkDir;

/// The package index. It's uploaded last so that readers never see an index
/// referring to binpkgs that aren't there yet.
const PACKAGE_INDEX: &str = "Packages";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retries: u32,
    /// Attempt `n` is followed by a `n * sleep` pause.
    pub sleep: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 10,
            sleep: Duration::from_secs(60),
        }
    }
}

/// Copies `local` to `remote` with `gsutil cp`, retrying failures.
pub fn copy_with_retries(
    runner: &dyn CommandRunner,
    local: &Path,
    remote: &str,
    policy: RetryPolicy,
) -> Result<(), CommandError> {
    let command = CommandSpec::new("gsutil")
        .arg("cp")
        .arg(local.to_string_lossy())
        .arg(remote);
    let mut attempt = 1;
    loop {
        match runner.run(&command) {
            Ok(_) => return Ok(()),
            Err(e) if attempt > policy.retries => return Err(e),
            Err(e) => {
                let delay = policy.sleep * attempt;
                warn!("Upload to {remote} failed (attempt {attempt}), retrying in {delay:?}: {e}");
                std::thread::sleep(delay);
                attempt += 1;
            }
        }
    }
}

/// What to upload for one board.
#[derive(Clone, Debug)]
pub struct BoardPrebuilts {
    /// The board's PKGDIR.
    pub package_dir: PathBuf,
    /// `gs://` location the packages and tarball are uploaded under.
    pub remote_location: String,
    /// A tarball of the whole board root, packaged beforehand.
    pub board_tarball: Option<PathBuf>,
}

fn package_files(package_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut index = None;
    for entry in WalkDir::new(package_dir).sort_by_file_name() {
        let entry = entry.with_context(|| format!("Failed to scan {}", package_dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry.path().strip_prefix(package_dir)?.to_owned();
        if rel == Path::new(PACKAGE_INDEX) {
            index = Some(rel);
        } else {
            files.push(rel);
        }
    }
    files.extend(index);
    Ok(files)
}

/// Uploads the board's binary packages. The board tarball, if any, uploads
/// concurrently on its own thread and is always waited for; its failure
/// fails the sync.
///
/// Returns the binhost URL of the uploaded packages.
#[instrument(skip_all, fields(remote = %prebuilts.remote_location))]
pub fn sync_board_prebuilts(
    runner: &dyn CommandRunner,
    prebuilts: &BoardPrebuilts,
    policy: RetryPolicy,
) -> Result<String> {
    let remote = prebuilts.remote_location.trim_end_matches('/');
    if !remote.starts_with("gs://") {
        return Err(anyhow!("Not a Google Storage location: {remote}"));
    }
    let packages_url = format!("{remote}/packages");

    std::thread::scope(|scope| {
        let tarball_upload = prebuilts.board_tarball.as_deref().map(|tarball| {
            scope.spawn(move || -> Result<()> {
                let name = tarball
                    .file_name()
                    .with_context(|| format!("Invalid tarball path {}", tarball.display()))?;
                let dest = format!("{remote}/{}", name.to_string_lossy());
                info!("Uploading board tarball to {dest}");
                copy_with_retries(runner, tarball, &dest, policy)?;
                Ok(())
            })
        });

        let packages_result = (|| -> Result<()> {
            for rel in package_files(&prebuilts.package_dir)? {
                let dest = format!("{packages_url}/{}", rel.display());
                copy_with_retries(runner, &prebuilts.package_dir.join(&rel), &dest, policy)?;
            }
            Ok(())
        })();

        if let Some(handle) = tarball_upload {
            handle
                .join()
                .map_err(|_| anyhow!("Board tarball upload panicked"))?
                .context("Board tarball upload failed")?;
        }
        packages_result
    })?;

    Ok(format!("{packages_url}/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use processes::CommandOutput;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };
    use testutil::{failure, program, program_with_arg, write_files, FakeRunner};

    const NO_WAIT: RetryPolicy = RetryPolicy {
        retries: 2,
        sleep: Duration::ZERO,
    };

    #[test]
    fn retries_until_success() -> Result<()> {
        let runner = FakeRunner::new();
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        runner.on(program("gsutil"), move |spec| {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(failure(spec, 1))
            } else {
                Ok(CommandOutput::default())
            }
        });

        copy_with_retries(&runner, Path::new("/tmp/a.tbz2"), "gs://bucket/a.tbz2", NO_WAIT)?;
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        Ok(())
    }

    #[test]
    fn gives_up_after_retries() {
        let runner = FakeRunner::new();
        runner.fail(program("gsutil"), 1);

        let result = copy_with_retries(&runner, Path::new("/tmp/a.tbz2"), "gs://bucket/a.tbz2", NO_WAIT);

        assert!(result.is_err());
        assert_eq!(runner.calls_to("gsutil").len(), 3);
    }

    #[test]
    fn uploads_packages_index_last_and_tarball() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let package_dir = dir.path().join("packages");
        write_files(
            &package_dir,
            [
                ("Packages", "TTL: 31536000\n"),
                ("chromeos-base/shill-0.0.1-r1.tbz2", ""),
                ("sys-apps/dbus-1.12.tbz2", ""),
            ],
        )?;
        let tarball = dir.path().join("eve.tar.zst");
        std::fs::write(&tarball, "")?;
        let runner = FakeRunner::new();

        let url = sync_board_prebuilts(
            &runner,
            &BoardPrebuilts {
                package_dir: package_dir.clone(),
                remote_location: "gs://bucket/board/eve/R120/".to_owned(),
                board_tarball: Some(tarball),
            },
            NO_WAIT,
        )?;

        assert_eq!(url, "gs://bucket/board/eve/R120/packages/");
        let mut package_uploads: Vec<String> = runner
            .calls_to("gsutil")
            .iter()
            .filter_map(|c| c.args.last().cloned())
            .collect();
        package_uploads.retain(|dest| dest != "gs://bucket/board/eve/R120/eve.tar.zst");
        assert_eq!(
            package_uploads,
            vec![
                "gs://bucket/board/eve/R120/packages/chromeos-base/shill-0.0.1-r1.tbz2",
                "gs://bucket/board/eve/R120/packages/sys-apps/dbus-1.12.tbz2",
                "gs://bucket/board/eve/R120/packages/Packages",
            ]
        );
        assert_eq!(runner.calls_to("gsutil").len(), 4);
        Ok(())
    }

    #[test]
    fn tarball_failure_fails_sync_after_packages() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let package_dir = dir.path().join("packages");
        write_files(&package_dir, [("Packages", "")])?;
        let runner = FakeRunner::new();
        runner.fail(program_with_arg("gsutil", "gs://bucket/eve/eve.tar.zst"), 1);

        let result = sync_board_prebuilts(
            &runner,
            &BoardPrebuilts {
                package_dir,
                remote_location: "gs://bucket/eve".to_owned(),
                board_tarball: Some(dir.path().join("eve.tar.zst")),
            },
            NO_WAIT,
        );

        assert!(result.is_err());
        assert!(runner
            .calls_to("gsutil")
            .iter()
            .any(|c| c.has_arg("gs://bucket/eve/packages/Packages")));
        Ok(())
    }

    #[test]
    fn rejects_non_gs_locations() {
        let runner = FakeRunner::new();
        let result = sync_board_prebuilts(
            &runner,
            &BoardPrebuilts {
                package_dir: PathBuf::from("/build/eve/packages"),
                remote_location: "/local/dir".to_owned(),
                board_tarball: None,
            },
            NO_WAIT,
        );
        assert!(result.is_err());
        assert!(runner.calls().is_empty());
    }
}
