// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use anyhow::{Context, Result};
use std::fs::{metadata, remove_dir_all, set_permissions, Permissions};
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::Path;
use walkdir::WalkDir;

const S_IRWXU: u32 = 0o700;

/// Runs `action` after adding `permissions` to `path`, then restores the
/// original permissions.
fn with_permissions(
    path: &Path,
    permissions: u32,
    action: impl FnOnce() -> Result<()>,
) -> Result<()> {
    let mode = metadata(path)?.mode();
    let new_mode = mode | permissions;

    if mode != new_mode {
        set_permissions(path, Permissions::from_mode(new_mode)).with_context(|| {
            format!("Failed to set permissions for {:?} to {:o}", path, new_mode)
        })?;
    }

    let result = action();

    if mode != new_mode {
        set_permissions(path, Permissions::from_mode(mode)).with_context(|| {
            format!("Failed to restore permissions of {:?} to {:o}", path, mode)
        })?;
    }

    result
}

/// Removes a tree we own even if some directories in it lost `u+rwx`.
///
/// A missing `path` is not an error.
pub fn remove_dir_all_with_chmod(path: &Path) -> Result<()> {
    match metadata(path) {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
        Ok(_) => {}
    }

    // Listing a directory without permissions fails before we get to fix it;
    // remove_dir_all reports anything that is still wrong.
    for entry in WalkDir::new(path)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_dir())
    {
        let mode = entry.metadata()?.mode();
        if mode & S_IRWXU != S_IRWXU {
            let new_mode = mode | S_IRWXU;
            set_permissions(entry.path(), Permissions::from_mode(new_mode)).with_context(|| {
                format!("Failed to set permissions for {:?} to {:o}", entry.path(), new_mode)
            })?;
        }
    }

    let remove = || remove_dir_all(path).with_context(|| format!("Failed to delete {:?}", path));
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => with_permissions(parent, S_IRWXU, remove),
        _ => remove(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{create_dir_all, write};

    #[test]
    fn removes_locked_tree() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let root = dir.path().join("sysroot");
        let locked = root.join("var/db/pkg");
        create_dir_all(&locked)?;
        write(locked.join("CONTENTS"), "obj /usr/bin/foo")?;
        set_permissions(&locked, Permissions::from_mode(0o500))?;

        remove_dir_all_with_chmod(&root)?;

        assert!(!root.try_exists()?);
        Ok(())
    }

    #[test]
    fn missing_path_is_ok() -> Result<()> {
        let dir = tempfile::tempdir()?;
        remove_dir_all_with_chmod(&dir.path().join("nope"))
    }
}
