// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::{
    ffi::{OsStr, OsString},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use tracing::{debug, error};

use crate::remove_dir_all_with_chmod;

/// `cros_sysroot.<program>.`, so leftovers can be traced to their creator.
fn default_prefix() -> OsString {
    let program = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.file_name().map(OsStr::to_owned))
        .unwrap_or_else(|| OsString::from("__unknown__"));
    let mut prefix = OsString::from("cros_sysroot.");
    prefix.push(program);
    prefix.push(".");
    prefix
}

/// A scratch directory removed with [`remove_dir_all_with_chmod`] on drop.
///
/// Staged sysroot trees contain read-only directories (the package database,
/// the binary package directory) that [`tempfile::TempDir`] can't remove.
pub struct SafeTempDir {
    dir: PathBuf,
}

impl SafeTempDir {
    /// Creates a directory under the system temporary directory.
    pub fn new() -> Result<Self> {
        SafeTempDirBuilder::new().build()
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }
}

impl Drop for SafeTempDir {
    fn drop(&mut self) {
        debug!("Removing {}", self.dir.display());
        if let Err(e) = remove_dir_all_with_chmod(&self.dir) {
            error!("Failed to remove temporary directory {}: {e:#}", self.dir.display());
        }
    }
}

#[derive(Default)]
pub struct SafeTempDirBuilder {
    prefix: Option<OsString>,
    base_dir: Option<PathBuf>,
}

impl SafeTempDirBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the directory under `dir` instead of the system temporary
    /// directory. `dir` is created if missing.
    pub fn base_dir(mut self, dir: &Path) -> Self {
        self.base_dir = Some(dir.to_owned());
        self
    }

    pub fn prefix(mut self, prefix: impl AsRef<OsStr>) -> Self {
        self.prefix = Some(prefix.as_ref().to_owned());
        self
    }

    pub fn build(self) -> Result<SafeTempDir> {
        let base_dir = self.base_dir.unwrap_or_else(std::env::temp_dir);
        std::fs::create_dir_all(&base_dir)
            .with_context(|| format!("Failed to create {}", base_dir.display()))?;
        let prefix = self.prefix.unwrap_or_else(default_prefix);
        let dir = tempfile::Builder::new()
            .prefix(&prefix)
            .tempdir_in(&base_dir)
            .with_context(|| format!("Failed to create a directory in {}", base_dir.display()))?;
        Ok(SafeTempDir {
            dir: dir.into_path(),
        })
    }
}
