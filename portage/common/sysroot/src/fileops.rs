// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use anyhow::{Context, Result};
use processes::{CommandRunner, CommandSpec};
use std::io::{ErrorKind, Write};
use std::os::unix::fs::symlink;
use std::{
    fs::create_dir_all,
    path::{Path, PathBuf},
};

/// A filesystem change inside a sysroot. Paths are absolute and resolved
/// against the sysroot's root when executed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FileOps {
    /// Creates `target` pointing at `source`, replacing whatever was there.
    Symlink { target: PathBuf, source: PathBuf },
    /// Writes `content` to `path`, replacing whatever was there.
    PlainFile { path: PathBuf, content: String },
    Mkdir { path: PathBuf },
}

impl FileOps {
    pub fn symlink(target: impl AsRef<Path>, source: impl AsRef<Path>) -> Self {
        FileOps::Symlink {
            target: target.as_ref().to_owned(),
            source: source.as_ref().to_owned(),
        }
    }

    pub fn plainfile(path: impl AsRef<Path>, content: impl AsRef<str>) -> Self {
        FileOps::PlainFile {
            path: path.as_ref().to_owned(),
            content: content.as_ref().to_owned(),
        }
    }

    pub fn mkdir(path: impl AsRef<Path>) -> Self {
        FileOps::Mkdir {
            path: path.as_ref().to_owned(),
        }
    }

    fn path(&self) -> &Path {
        match self {
            FileOps::Symlink { target, .. } => target,
            FileOps::PlainFile { path, .. } => path,
            FileOps::Mkdir { path } => path,
        }
    }
}

/// Joins an absolute `path` to `root`.
pub fn join_absolute(root: &Path, path: &Path) -> Result<PathBuf> {
    Ok(root.join(
        path.strip_prefix("/")
            .with_context(|| format!("path {} is not absolute", path.display()))?,
    ))
}

fn make_parent_dir(path: &Path) -> std::io::Result<()> {
    match path.parent() {
        Some(parent) => create_dir_all(parent),
        None => Ok(()),
    }
}

fn apply(op: &FileOps, path: &Path) -> std::io::Result<()> {
    match op {
        FileOps::Symlink { source, .. } => {
            make_parent_dir(path)?;
            if path.symlink_metadata().is_ok() {
                std::fs::remove_file(path)?;
            }
            symlink(source, path)
        }
        FileOps::PlainFile { content, .. } => {
            make_parent_dir(path)?;
            std::fs::write(path, content)
        }
        FileOps::Mkdir { .. } => create_dir_all(path),
    }
}

fn apply_with_sudo(op: &FileOps, path: &Path, runner: &dyn CommandRunner) -> Result<()> {
    let path_str = path.to_string_lossy().into_owned();
    let parent = path
        .parent()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|| "/".to_owned());
    match op {
        FileOps::Mkdir { .. } => {
            runner.run(&CommandSpec::new("mkdir").args(["-p", path_str.as_str()]).sudo())?;
        }
        FileOps::Symlink { source, .. } => {
            runner.run(&CommandSpec::new("mkdir").args(["-p", parent.as_str()]).sudo())?;
            runner.run(
                &CommandSpec::new("ln")
                    .arg("-sfn")
                    .arg(source.to_string_lossy())
                    .arg(path_str)
                    .sudo(),
            )?;
        }
        FileOps::PlainFile { content, .. } => {
            let mut staged = tempfile::NamedTempFile::new()?;
            staged.write_all(content.as_bytes())?;
            runner.run(
                &CommandSpec::new("install")
                    .args(["-D", "-m", "0644"])
                    .arg(staged.path().to_string_lossy())
                    .arg(path_str)
                    .sudo(),
            )?;
        }
    }
    Ok(())
}

/// Applies `ops` under `root`. With a `sudo` runner, operations the current
/// user isn't permitted to do are retried through sudo.
pub fn execute_file_ops(
    ops: &[FileOps],
    root: &Path,
    sudo: Option<&dyn CommandRunner>,
) -> Result<()> {
    for op in ops {
        let path = join_absolute(root, op.path())?;
        match (apply(op, &path), sudo) {
            (Ok(()), _) => {}
            (Err(e), Some(runner)) if e.kind() == ErrorKind::PermissionDenied => {
                apply_with_sudo(op, &path, runner)
                    .with_context(|| format!("{:?} with sudo", op))?;
            }
            (Err(e), _) => return Err(e).with_context(|| format!("{:?}", op)),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn applies_ops_idempotently() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let root = dir.path();
        let ops = vec![
            FileOps::mkdir("/etc/portage/hooks"),
            FileOps::plainfile("/etc/make.conf.board", "USE=\"foo\"\n"),
            FileOps::symlink("/etc/make.conf", "/mnt/host/source/make.conf.generic-target"),
        ];

        execute_file_ops(&ops, root, None)?;
        execute_file_ops(&ops, root, None)?;

        assert!(root.join("etc/portage/hooks").is_dir());
        assert_eq!(std::fs::read_to_string(root.join("etc/make.conf.board"))?, "USE=\"foo\"\n");
        assert_eq!(
            std::fs::read_link(root.join("etc/make.conf"))?,
            Path::new("/mnt/host/source/make.conf.generic-target")
        );
        Ok(())
    }

    #[test]
    fn rejects_relative_paths() -> Result<()> {
        let dir = tempfile::tempdir()?;
        assert!(execute_file_ops(&[FileOps::mkdir("etc")], dir.path(), None).is_err());
        Ok(())
    }
}
