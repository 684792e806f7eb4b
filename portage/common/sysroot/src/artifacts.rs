// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Build artifacts produced from a sysroot for CI uploads.

use anyhow::{bail, Context as _};
use fileutil::SafeTempDirBuilder;
use processes::{CommandError, CommandRunner, CommandSpec};
use std::{
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
};
use tracing::{error, info, instrument, warn};

use crate::{
    build_target::BuildTarget,
    constants::{
        CHROME_EBUILD_ENV_FILE, CHROME_ENV_FILE, DEBUG_SYMBOLS_FILE, FUZZER_SYSROOT_FILE,
        SIMPLE_CHROME_SYSROOT_FILE, SYSROOT_ARCHIVE_FILE, TARGET_FUZZERS_PKG,
        TARGET_SYSROOT_FILE,
    },
    context::Context,
    error::{Error, Result},
    layout::Layout,
    sysroot::Sysroot,
};

const CHROME_CP: &str = "chromeos-base/chromeos-chrome";

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ArtifactKind {
    SimpleChromeSysroot,
    FuzzerSysroot,
    ChromeEbuildEnv,
    DebugSymbols,
    BazelPerformanceArtifacts,
    SysrootArchive,
}

impl ArtifactKind {
    pub const ALL: [ArtifactKind; 6] = [
        ArtifactKind::SimpleChromeSysroot,
        ArtifactKind::FuzzerSysroot,
        ArtifactKind::ChromeEbuildEnv,
        ArtifactKind::DebugSymbols,
        ArtifactKind::BazelPerformanceArtifacts,
        ArtifactKind::SysrootArchive,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ArtifactKind::SimpleChromeSysroot => "simple-chrome-sysroot",
            ArtifactKind::FuzzerSysroot => "fuzzer-sysroot",
            ArtifactKind::ChromeEbuildEnv => "chrome-ebuild-env",
            ArtifactKind::DebugSymbols => "debug-symbols",
            ArtifactKind::BazelPerformanceArtifacts => "bazel-performance-artifacts",
            ArtifactKind::SysrootArchive => "sysroot-archive",
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ArtifactKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match ArtifactKind::ALL.into_iter().find(|kind| kind.name() == s) {
            Some(kind) => Ok(kind),
            None => bail!("Unknown artifact type: {s}"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Compression {
    Gzip,
    Xz,
    Zstd,
}

impl Compression {
    fn from_file_name(name: &str) -> anyhow::Result<Self> {
        if name.ends_with(".tgz") || name.ends_with(".gz") {
            Ok(Compression::Gzip)
        } else if name.ends_with(".xz") {
            Ok(Compression::Xz)
        } else if name.ends_with(".zst") {
            Ok(Compression::Zstd)
        } else {
            bail!("Unknown compression for {name}")
        }
    }

    fn program(self, layout: &Layout) -> String {
        match self {
            Compression::Gzip => "pigz".to_owned(),
            Compression::Xz => layout
                .source_root
                .join("chromite/scripts/xz_auto")
                .to_string_lossy()
                .into_owned(),
            Compression::Zstd => "zstd".to_owned(),
        }
    }
}

/// `tar` creating `tarball` from the contents of `dir`.
///
/// `excludes` are member names relative to `dir`, like `./breakpad`. GNU tar
/// only applies an exclude to operands that follow it, so they go before `.`.
fn tar_create(
    layout: &Layout,
    tarball: &Path,
    dir: &Path,
    excludes: &[&str],
) -> Result<CommandSpec> {
    let name = tarball.file_name().unwrap_or_default().to_string_lossy();
    let compression = Compression::from_file_name(&name)?;
    Ok(CommandSpec::new("tar")
        .args(["--sparse", "--hole-detection=raw", "--use-compress-program"])
        .arg(compression.program(layout))
        .args(excludes.iter().map(|pattern| format!("--exclude={pattern}")))
        .args(["-c", "-f"])
        .arg(tarball.to_string_lossy())
        .arg(".")
        .cwd(dir))
}

/// Produces the artifact `kind` in `output_dir`. An artifact whose inputs
/// don't exist produces no files.
#[instrument(skip(ctx, target, sysroot), fields(board = target.name()))]
pub fn bundle(
    ctx: &Context,
    kind: ArtifactKind,
    target: &BuildTarget,
    sysroot: &Sysroot,
    output_dir: &Path,
) -> Result<Vec<PathBuf>> {
    if !output_dir.is_dir() {
        return Err(Error::InvalidArguments(format!(
            "output directory {} does not exist",
            output_dir.display()
        )));
    }
    let path = match kind {
        ArtifactKind::SimpleChromeSysroot => Some(create_sysroot_archive(
            ctx,
            target,
            output_dir,
            &[CHROME_CP],
            SIMPLE_CHROME_SYSROOT_FILE,
            true,
        )?),
        ArtifactKind::FuzzerSysroot => Some(create_sysroot_archive(
            ctx,
            target,
            output_dir,
            &[TARGET_FUZZERS_PKG],
            FUZZER_SYSROOT_FILE,
            false,
        )?),
        ArtifactKind::ChromeEbuildEnv => chrome_ebuild_env(ctx, sysroot, output_dir)?,
        ArtifactKind::DebugSymbols => debug_symbols(ctx, sysroot, output_dir)?,
        ArtifactKind::BazelPerformanceArtifacts => {
            return bazel_performance_artifacts(&ctx.layout, output_dir)
        }
        ArtifactKind::SysrootArchive => archive_sysroot(ctx, sysroot, output_dir)?,
    };
    Ok(path.into_iter().collect())
}

/// Generates a tarball of `packages` and their dependencies for
/// informational builders.
pub fn generate_archive(
    ctx: &Context,
    output_dir: &Path,
    target: &BuildTarget,
    packages: &[String],
) -> Result<PathBuf> {
    if packages.is_empty() {
        return Err(Error::InvalidArguments(
            "at least one package is required".to_owned(),
        ));
    }
    ctx.runner.run(
        &CommandSpec::new("cros_generate_sysroot")
            .args(["--out-file", TARGET_SYSROOT_FILE, "--out-dir"])
            .arg(output_dir.to_string_lossy())
            .args(["--board", target.name(), "--package"])
            .arg(packages.join(" "))
            .cwd(&ctx.layout.source_root),
    )?;
    Ok(output_dir.join(TARGET_SYSROOT_FILE))
}

fn create_sysroot_archive(
    ctx: &Context,
    target: &BuildTarget,
    output_dir: &Path,
    packages: &[&str],
    output_file: &str,
    deps_only: bool,
) -> Result<PathBuf> {
    let tempdir = SafeTempDirBuilder::new()
        .base_dir(&ctx.layout.tmp_dir)
        .build()?;
    let mut command = CommandSpec::new("cros_generate_sysroot")
        .arg("--out-dir")
        .arg(tempdir.path().to_string_lossy())
        .args(["--board", target.name(), "--package"])
        .arg(packages.join(" "))
        .args(["--out-file", output_file]);
    if deps_only {
        command = command.arg("--deps-only");
    }
    ctx.runner.run(&command.cwd(&ctx.layout.source_root))?;

    let generated = tempdir.path().join(output_file);
    let path = output_dir.join(output_file);
    std::fs::copy(&generated, &path)
        .with_context(|| format!("Failed to copy {} to {}", generated.display(), path.display()))?;
    Ok(path)
}

/// Package database entries of Chrome, oldest version first.
fn installed_chrome_dirs(sysroot: &Sysroot) -> anyhow::Result<Vec<PathBuf>> {
    let category_dir = sysroot.join("var/db/pkg/chromeos-base");
    let mut dirs = Vec::new();
    if !category_dir.is_dir() {
        return Ok(dirs);
    }
    for entry in std::fs::read_dir(&category_dir)
        .with_context(|| format!("Failed to read {}", category_dir.display()))?
    {
        let entry = entry?;
        if entry.file_name().to_string_lossy().starts_with("chromeos-chrome-") {
            dirs.push(entry.path());
        }
    }
    dirs.sort();
    Ok(dirs)
}

/// Repackages the saved build environment of the installed Chrome.
fn chrome_ebuild_env(ctx: &Context, sysroot: &Sysroot, output_dir: &Path) -> Result<Option<PathBuf>> {
    let candidates = installed_chrome_dirs(sysroot)?;
    let Some(chrome_dir) = candidates.last() else {
        warn!("No package found for {CHROME_CP}");
        return Ok(None);
    };
    if candidates.len() > 1 {
        warn!("Expected one package for {CHROME_CP}, found {}", candidates.len());
    }

    let output = ctx.runner.run(
        &CommandSpec::new("bzip2")
            .args(["-d", "-c"])
            .arg(chrome_dir.join("environment.bz2").to_string_lossy())
            .capture_output(),
    )?;
    let tempdir = SafeTempDirBuilder::new()
        .base_dir(&ctx.layout.tmp_dir)
        .build()?;
    std::fs::write(tempdir.path().join(CHROME_ENV_FILE), output.stdout)
        .context("Failed to write the Chrome environment")?;

    let path = output_dir.join(CHROME_EBUILD_ENV_FILE);
    ctx.runner.run(&tar_create(&ctx.layout, &path, tempdir.path(), &[])?)?;
    Ok(Some(path))
}

/// Tars up `usr/lib/debug` minus the breakpad symbols and the kernel's debug
/// image. A tar failure isn't fatal as long as the tarball exists.
fn debug_symbols(ctx: &Context, sysroot: &Sysroot, output_dir: &Path) -> Result<Option<PathBuf>> {
    let debug_dir = sysroot.join("usr/lib/debug");
    if !debug_dir.is_dir() {
        error!("No debug directory found at {}.", debug_dir.display());
        return Ok(None);
    }

    let path = output_dir.join(DEBUG_SYMBOLS_FILE);
    let command = tar_create(
        &ctx.layout,
        &path,
        &debug_dir,
        &["./breakpad", "./boot/vmlinux.debug"],
    )?
    .sudo()
        .preserve_env();
    if let Err(e) = ctx.runner.run(&command) {
        error!(
            "Error when creating tarball {} from {}: {e}",
            path.display(),
            debug_dir.display()
        );
    }
    Ok(path.exists().then_some(path))
}

fn bazel_performance_artifacts(layout: &Layout, output_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut copied = Vec::new();
    for artifact in layout.bazel_performance_artifacts() {
        if !artifact.exists() {
            continue;
        }
        let Some(name) = artifact.file_name() else {
            continue;
        };
        let dest = output_dir.join(name);
        std::fs::copy(&artifact, &dest)
            .with_context(|| format!("Failed to copy {}", artifact.display()))?;
        copied.push(dest);
    }
    Ok(copied)
}

fn archive_sysroot(ctx: &Context, sysroot: &Sysroot, output_dir: &Path) -> Result<Option<PathBuf>> {
    if !sysroot.exists() {
        return Ok(None);
    }
    let path = output_dir.join(SYSROOT_ARCHIVE_FILE);
    info!("Archiving {} to {}", sysroot.path().display(), path.display());
    ctx.runner.run(
        &tar_create(&ctx.layout, &path, sysroot.path(), &[])?
            .sudo()
            .preserve_env(),
    )?;
    Ok(Some(path))
}

fn tar_extract(
    runner: &dyn CommandRunner,
    layout: &Layout,
    archive: &Path,
    dest: &Path,
) -> Result<(), CommandError> {
    let name = archive.file_name().unwrap_or_default().to_string_lossy();
    let mut command = CommandSpec::new("tar");
    if let Ok(compression) = Compression::from_file_name(&name) {
        command = command
            .arg("--use-compress-program")
            .arg(compression.program(layout));
    }
    runner.run(
        &command
            .args(["-x", "-f"])
            .arg(archive.to_string_lossy())
            .arg("-C")
            .arg(dest.to_string_lossy())
            .sudo(),
    )?;
    Ok(())
}

/// Unpacks a sysroot archive into an existing sysroot. Returns `None` when
/// the sysroot doesn't exist.
pub fn extract_sysroot(ctx: &Context, sysroot: &Sysroot, archive: &Path) -> Result<Option<PathBuf>> {
    if !sysroot.exists() {
        return Ok(None);
    }
    if !archive.exists() {
        return Err(Error::NoFiles(archive.display().to_string()));
    }
    tar_extract(ctx.runner, &ctx.layout, archive, sysroot.path())?;
    Ok(Some(sysroot.path().to_owned()))
}
