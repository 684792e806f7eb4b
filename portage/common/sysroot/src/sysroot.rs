// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use anyhow::{bail, Context, Result};
use itertools::Itertools;
use lazy_static::lazy_static;
use processes::{CommandRunner, CommandSpec};
use regex::Regex;
use serde::Serialize;
use std::{
    collections::BTreeMap,
    io::ErrorKind,
    path::{Path, PathBuf},
};
use tera::Tera;
use tracing::{info, instrument};

use crate::{
    build_target::BuildTarget,
    constants::WRAPPED_TOOLS,
    fileops::{execute_file_ops, FileOps},
    layout::Layout,
    makeconf::{self, BinhostConfOptions},
    overlay::board_overlays,
    package_info::PackageInfo,
    toolchain::load_toolchains,
};

lazy_static! {
    static ref TEMPLATES: Tera = {
        let mut tera: Tera = Default::default();
        tera.add_raw_templates([
            ("wrapper.sh", include_str!("templates/wrapper.sh")),
            ("pkg-config.sh", include_str!("templates/pkg-config.sh")),
        ])
        .unwrap();
        tera
    };
    static ref CACHED_FIELD_RE: Regex = Regex::new(r#"^(\w+)="(.*)"$"#).unwrap();
}

const SKELETON_DIRS: &[&str] = &[
    "/etc/portage/hooks",
    "/etc/portage/profile",
    "/etc/portage/package.keywords",
    "/etc/portage/package.unmask",
    "/etc/portage/package.mask",
    "/build/bin",
    "/packages",
    "/tmp/portage/logs",
    "/var/lib/portage",
    "/var/cache/distfiles",
    "/usr/local/bin",
];

const CACHE_FILE: &str = "var/cache/edb/chromeos";
const TOOLCHAIN_INSTALLED_FIELD: &str = "TOOLCHAIN_INSTALLED";
const PACKAGE_PROVIDED: &str = "etc/portage/profile/package.provided";
const MAKE_CONF_BOARD_SETUP: &str = "etc/make.conf.board_setup";

/// Characters that would break a cached field when the cache file is sourced
/// by shell scripts.
const FORBIDDEN_CACHE_CHARS: &[char] = &['"', '\\', '\n', '$', '`'];

#[derive(Serialize)]
struct WrapperContext<'a> {
    chost: &'a str,
    sysroot: String,
    command: &'a str,
}

/// A board root, `/build/<board>` unless the build target says otherwise.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sysroot {
    path: PathBuf,
}

impl Sysroot {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_dir()
    }

    /// Joins a path relative to the sysroot's root.
    pub fn join(&self, rel: impl AsRef<Path>) -> PathBuf {
        self.path.join(rel)
    }

    fn apply(&self, ops: &[FileOps], runner: &dyn CommandRunner) -> Result<()> {
        execute_file_ops(ops, &self.path, Some(runner))
    }

    /// Creates the directory tree and links the Portage hooks.
    #[instrument(skip_all, fields(sysroot = %self.path.display()))]
    pub fn create_skeleton(&self, layout: &Layout, runner: &dyn CommandRunner) -> Result<()> {
        let mut ops: Vec<FileOps> = SKELETON_DIRS.iter().map(FileOps::mkdir).collect();

        let hooks_dir = layout.hooks_dir();
        if hooks_dir.is_dir() {
            for entry in std::fs::read_dir(&hooks_dir)? {
                let entry = entry?;
                ops.push(FileOps::symlink(
                    Path::new("/etc/portage/hooks").join(entry.file_name()),
                    entry.path(),
                ));
            }
        }
        self.apply(&ops, runner)
    }

    /// Installs the make.conf files that don't depend on the profile, plus
    /// the build target description. They are always overwritten.
    #[instrument(skip_all, fields(sysroot = %self.path.display(), target = target.name()))]
    pub fn install_configs(
        &self,
        layout: &Layout,
        target: &BuildTarget,
        runner: &dyn CommandRunner,
    ) -> Result<()> {
        let (make_conf, overlays) = if target.is_host() {
            (layout.make_conf_sdk(), Vec::new())
        } else {
            (
                layout.make_conf_generic_target(),
                board_overlays(layout, target.name())?,
            )
        };
        let toolchains = load_toolchains(&overlays)?;
        let board_setup = makeconf::board_setup_config(layout, target, &overlays, &toolchains)?;

        let mut ops = vec![
            FileOps::symlink("/etc/make.conf", make_conf),
            FileOps::plainfile(format!("/{MAKE_CONF_BOARD_SETUP}"), board_setup),
            FileOps::symlink("/etc/make.conf.user", layout.make_conf_user()),
            FileOps::plainfile("/etc/portage/build_target.json", target.to_json()?),
        ];
        if target.is_host() {
            ops.push(FileOps::symlink(
                "/etc/portage/make.profile",
                layout.sdk_profile(),
            ));
        }
        self.apply(&ops, runner)
    }

    /// Writes `<tool>-<board>` wrappers that run the Portage tools against
    /// this sysroot, and links them onto the chroot's PATH.
    pub fn create_wrappers(
        &self,
        layout: &Layout,
        board: &str,
        runner: &dyn CommandRunner,
    ) -> Result<()> {
        let chost = self
            .standard_field("CHOST")?
            .with_context(|| format!("CHOST is not set in {}", self.join(MAKE_CONF_BOARD_SETUP).display()))?;
        let sysroot = self.path.display().to_string();

        let mut sysroot_ops = Vec::new();
        let mut chroot_ops = Vec::new();
        let mut wrappers = Vec::new();
        for tool in WRAPPED_TOOLS {
            let content = TEMPLATES.render(
                "wrapper.sh",
                &tera::Context::from_serialize(WrapperContext {
                    chost: &chost,
                    sysroot: sysroot.clone(),
                    command: tool,
                })?,
            )?;
            wrappers.push((format!("{tool}-{board}"), content));
        }
        let mut context = tera::Context::new();
        context.insert("sysroot", &sysroot);
        wrappers.push((
            format!("pkg-config-{board}"),
            TEMPLATES.render("pkg-config.sh", &context)?,
        ));
        // make.conf.board_setup points PKG_CONFIG at the unsuffixed name.
        sysroot_ops.push(FileOps::symlink("/build/bin/pkg-config", format!("pkg-config-{board}")));

        for (name, content) in wrappers {
            let wrapper = Path::new("/build/bin").join(&name);
            chroot_ops.push(FileOps::symlink(
                layout.wrapper_bin_dir().join(&name),
                self.path.join(wrapper.strip_prefix("/")?),
            ));
            sysroot_ops.push(FileOps::plainfile(wrapper, content));
        }
        self.apply(&sysroot_ops, runner)?;
        self.make_executable(runner)?;
        execute_file_ops(&chroot_ops, Path::new("/"), Some(runner))
    }

    fn make_executable(&self, runner: &dyn CommandRunner) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let bin = self.join("build/bin");
        for entry in std::fs::read_dir(&bin)? {
            let path = entry?.path();
            if path.is_symlink() {
                continue;
            }
            if let Err(e) =
                std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            {
                if e.kind() != ErrorKind::PermissionDenied {
                    return Err(e).with_context(|| format!("chmod {}", path.display()));
                }
                runner.run(
                    &CommandSpec::new("chmod")
                        .arg("0755")
                        .arg(path.to_string_lossy())
                        .sudo(),
                )?;
            }
        }
        Ok(())
    }

    /// Points the sysroot's cros-workon keyword/unmask/mask files at the
    /// per-board lists so packages worked on before a re-create stay
    /// worked on.
    pub fn refresh_workon_symlinks(
        &self,
        layout: &Layout,
        board: &str,
        runner: &dyn CommandRunner,
    ) -> Result<()> {
        let workon_dir = layout.workon_dir();
        let list = workon_dir.join(board);
        let mask = workon_dir.join(format!("{board}.mask"));
        for file in [&list, &mask] {
            if !file.try_exists()? {
                std::fs::create_dir_all(&workon_dir)?;
                std::fs::write(file, "")?;
            }
        }

        self.apply(
            &[
                FileOps::symlink("/etc/portage/package.keywords/cros-workon", &list),
                FileOps::symlink("/etc/portage/package.unmask/cros-workon", &list),
                FileOps::symlink("/etc/portage/package.mask/cros-workon", &mask),
            ],
            runner,
        )
    }

    /// Writes `etc/make.conf.board`. Must run after the profile is chosen.
    pub fn install_make_conf_board(
        &self,
        layout: &Layout,
        target: &BuildTarget,
        accepted_licenses: Option<&str>,
        options: &BinhostConfOptions,
        runner: &dyn CommandRunner,
    ) -> Result<()> {
        let overlays = board_overlays(layout, target.name())?;
        let mut content = makeconf::board_make_conf(&overlays, accepted_licenses)?;
        let arch = if options.expanded_binhost_inheritance {
            self.standard_field("ARCH")?
        } else {
            None
        };
        if let Some(binhosts) =
            makeconf::binhost_conf(layout, target.name(), arch.as_deref(), options)?
        {
            content.push('\n');
            content.push_str(&binhosts);
        }
        self.apply(&[FileOps::plainfile("/etc/make.conf.board", content)], runner)
    }

    /// A variable from `etc/make.conf.board_setup`.
    pub fn standard_field(&self, key: &str) -> Result<Option<String>> {
        makeconf::read_standard_field(&self.join(MAKE_CONF_BOARD_SETUP), key)
    }

    fn read_cache(&self) -> Result<BTreeMap<String, String>> {
        let path = self.join(CACHE_FILE);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(e).with_context(|| format!("Failed to read {}", path.display())),
        };
        Ok(content
            .lines()
            .filter_map(|line| CACHED_FIELD_RE.captures(line))
            .map(|caps| (caps[1].to_owned(), caps[2].to_owned()))
            .collect())
    }

    pub fn cached_field(&self, key: &str) -> Result<Option<String>> {
        Ok(self.read_cache()?.remove(key))
    }

    /// Sets (or with `None`, removes) a field in the sysroot's cache file,
    /// preserving the other fields.
    pub fn set_cached_field(
        &self,
        key: &str,
        value: Option<&str>,
        runner: &dyn CommandRunner,
    ) -> Result<()> {
        if let Some(value) = value {
            if value.contains(FORBIDDEN_CACHE_CHARS) {
                bail!("Invalid value {value:?} for cached field {key}");
            }
        }

        let mut cache = self.read_cache()?;
        match value {
            Some(value) => cache.insert(key.to_owned(), value.to_owned()),
            None => cache.remove(key),
        };
        let content = cache
            .iter()
            .map(|(key, value)| format!("{key}=\"{value}\"\n"))
            .join("");
        self.apply(&[FileOps::plainfile(format!("/{CACHE_FILE}"), content)], runner)
    }

    pub fn is_toolchain_installed(&self) -> Result<bool> {
        Ok(self.cached_field(TOOLCHAIN_INSTALLED_FIELD)?.as_deref() == Some("yes"))
    }

    pub fn set_toolchain_installed(&self, runner: &dyn CommandRunner) -> Result<()> {
        self.set_cached_field(TOOLCHAIN_INSTALLED_FIELD, Some("yes"), runner)
    }

    /// Removes the sysroot. A background delete moves the tree aside first
    /// so the path can be reused immediately.
    #[instrument(skip(self, runner), fields(sysroot = %self.path.display()))]
    pub fn delete(&self, runner: &dyn CommandRunner, background: bool) -> Result<()> {
        if !self.path.try_exists()? {
            return Ok(());
        }
        if !background {
            runner.run(
                &CommandSpec::new("rm")
                    .arg("-rf")
                    .arg("--one-file-system")
                    .arg(self.path.to_string_lossy())
                    .sudo(),
            )?;
            return Ok(());
        }

        let mut doomed = self.path.clone().into_os_string();
        doomed.push(format!(".deleting.{}", std::process::id()));
        let doomed = PathBuf::from(doomed);
        runner.run(
            &CommandSpec::new("mv")
                .arg(self.path.to_string_lossy())
                .arg(doomed.to_string_lossy())
                .sudo(),
        )?;
        info!("Deleting {} in the background", doomed.display());
        runner.run_detached(
            &CommandSpec::new("rm")
                .arg("-rf")
                .arg("--one-file-system")
                .arg(doomed.to_string_lossy())
                .sudo(),
        )?;
        Ok(())
    }

    /// Declares `packages` as provided so Portage doesn't install them here.
    pub fn write_package_provided(
        &self,
        packages: &[PackageInfo],
        runner: &dyn CommandRunner,
    ) -> Result<()> {
        let content = packages.iter().map(|p| format!("{}\n", p.cpvr())).join("");
        self.apply(&[FileOps::plainfile(format!("/{PACKAGE_PROVIDED}"), content)], runner)
    }

    /// Packages listed in `package.provided`. Comments are ignored.
    pub fn provided_packages(&self) -> Result<Vec<PackageInfo>> {
        let path = self.join(PACKAGE_PROVIDED);
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        content
            .lines()
            .map(|line| line.split('#').next().unwrap_or_default().trim())
            .filter(|line| !line.is_empty())
            .map(PackageInfo::parse)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use testutil::{write_files, FakeRunner};

    fn setup() -> Result<(tempfile::TempDir, Layout, Sysroot)> {
        let dir = tempfile::tempdir()?;
        let layout = Layout::under(dir.path());
        let sysroot = Sysroot::new(dir.path().join("build/eve"));
        Ok((dir, layout, sysroot))
    }

    #[test]
    fn exists() -> Result<()> {
        let (_dir, _layout, sysroot) = setup()?;
        assert!(!sysroot.exists());
        std::fs::create_dir_all(sysroot.path())?;
        assert!(sysroot.exists());
        Ok(())
    }

    #[test]
    fn skeleton_links_hooks() -> Result<()> {
        let (_dir, layout, sysroot) = setup()?;
        write_files(&layout.hooks_dir(), [("install/gen-package-licenses.sh", "")])?;
        let runner = FakeRunner::new();

        sysroot.create_skeleton(&layout, &runner)?;
        sysroot.create_skeleton(&layout, &runner)?;

        for dir in SKELETON_DIRS {
            assert!(sysroot.join(&dir[1..]).is_dir(), "{dir} missing");
        }
        assert_eq!(
            std::fs::read_link(sysroot.join("etc/portage/hooks/install"))?,
            layout.hooks_dir().join("install")
        );
        assert!(runner.calls().is_empty());
        Ok(())
    }

    #[test]
    fn installs_configs_for_board() -> Result<()> {
        let (_dir, layout, sysroot) = setup()?;
        write_files(
            &layout.source_root,
            [("src/overlays/overlay-eve/toolchain.conf", "x86_64-cros-linux-gnu\n")],
        )?;
        let target = BuildTarget::new("eve").with_root(sysroot.path());
        let runner = FakeRunner::new();

        sysroot.install_configs(&layout, &target, &runner)?;

        assert_eq!(
            std::fs::read_link(sysroot.join("etc/make.conf"))?,
            layout.make_conf_generic_target()
        );
        assert_eq!(
            std::fs::read_link(sysroot.join("etc/make.conf.user"))?,
            layout.make_conf_user()
        );
        assert_eq!(sysroot.standard_field("CHOST")?.as_deref(), Some("x86_64-cros-linux-gnu"));
        let stored = std::fs::read_to_string(sysroot.join("etc/portage/build_target.json"))?;
        assert_eq!(BuildTarget::from_json(&stored)?, target);
        assert!(!sysroot.join("etc/portage/make.profile").exists());
        Ok(())
    }

    #[test]
    fn configs_include_inherited_overlays() -> Result<()> {
        let (_dir, layout, sysroot) = setup()?;
        let src = layout.source_root.join("src");
        write_files(
            &src,
            [
                (
                    "overlays/baseboard-poppy/metadata/layout.conf",
                    "repo-name = baseboard-poppy\nmasters = portage-stable chromiumos\n",
                ),
                ("overlays/baseboard-poppy/toolchain.conf", "x86_64-cros-linux-gnu\n"),
                ("overlays/baseboard-poppy/make.conf", "USE=\"${USE} poppy\"\n"),
                (
                    "overlays/overlay-eve/metadata/layout.conf",
                    "repo-name = eve\nmasters = portage-stable chromiumos baseboard-poppy\n",
                ),
            ],
        )?;
        let target = BuildTarget::new("eve").with_root(sysroot.path());
        let runner = FakeRunner::new();

        sysroot.install_configs(&layout, &target, &runner)?;
        sysroot.install_make_conf_board(
            &layout,
            &target,
            None,
            &BinhostConfOptions {
                local_only: true,
                ..Default::default()
            },
            &runner,
        )?;

        assert_eq!(sysroot.standard_field("CHOST")?.as_deref(), Some("x86_64-cros-linux-gnu"));
        assert_eq!(
            sysroot.standard_field("BOARD_OVERLAY")?,
            Some(format!(
                "{}\n{}",
                src.join("overlays/baseboard-poppy").display(),
                src.join("overlays/overlay-eve").display()
            ))
        );
        let board = std::fs::read_to_string(sysroot.join("etc/make.conf.board"))?;
        let baseboard_conf = src.join("overlays/baseboard-poppy/make.conf");
        assert!(board.contains(&*baseboard_conf.to_string_lossy()), "{board}");
        Ok(())
    }

    #[test]
    fn installs_configs_for_host() -> Result<()> {
        let (_dir, layout, _sysroot) = setup()?;
        let broot = Sysroot::new(layout.chroot_root.join("build/eve/build/broot"));
        let target = BuildTarget::new("amd64-host").with_root(broot.path());

        broot.install_configs(&layout, &target, &FakeRunner::new())?;

        assert_eq!(
            std::fs::read_link(broot.join("etc/make.conf"))?,
            layout.make_conf_sdk()
        );
        assert_eq!(
            std::fs::read_link(broot.join("etc/portage/make.profile"))?,
            layout.sdk_profile()
        );
        Ok(())
    }

    #[test]
    fn creates_wrappers() -> Result<()> {
        let (_dir, layout, sysroot) = setup()?;
        write_files(
            sysroot.path(),
            [(MAKE_CONF_BOARD_SETUP, "CHOST=\"x86_64-cros-linux-gnu\"\n")],
        )?;

        sysroot.create_wrappers(&layout, "eve", &FakeRunner::new())?;

        let emerge = std::fs::read_to_string(sysroot.join("build/bin/emerge-eve"))?;
        assert!(emerge.contains("export CHOST=\"x86_64-cros-linux-gnu\"\n"));
        assert!(emerge.contains(&format!("export ROOT=\"{}\"\n", sysroot.path().display())));
        assert!(emerge.ends_with("exec sudo -E emerge \"$@\"\n"));
        assert_eq!(
            std::fs::read_link(layout.wrapper_bin_dir().join("equery-eve"))?,
            sysroot.join("build/bin/equery-eve")
        );
        assert!(sysroot.join("build/bin/pkg-config").exists());
        Ok(())
    }

    #[test]
    fn refreshes_workon_symlinks() -> Result<()> {
        let (_dir, layout, sysroot) = setup()?;

        sysroot.refresh_workon_symlinks(&layout, "eve", &FakeRunner::new())?;

        assert_eq!(
            std::fs::read_link(sysroot.join("etc/portage/package.keywords/cros-workon"))?,
            layout.workon_dir().join("eve")
        );
        assert_eq!(
            std::fs::read_link(sysroot.join("etc/portage/package.mask/cros-workon"))?,
            layout.workon_dir().join("eve.mask")
        );
        assert!(layout.workon_dir().join("eve.mask").is_file());
        Ok(())
    }

    #[test]
    fn make_conf_board_combines_board_and_binhosts() -> Result<()> {
        let (_dir, layout, sysroot) = setup()?;
        write_files(&layout.source_root, [("src/overlays/overlay-eve/make.conf", "")])?;
        let target = BuildTarget::new("eve");

        sysroot.install_make_conf_board(
            &layout,
            &target,
            None,
            &BinhostConfOptions::default(),
            &FakeRunner::new(),
        )?;

        let content = std::fs::read_to_string(sysroot.join("etc/make.conf.board"))?;
        assert!(content.contains("source "));
        assert!(content.ends_with("PORTAGE_BINHOST=\"$FULL_BINHOST\"\n"));
        Ok(())
    }

    #[test]
    fn cached_fields() -> Result<()> {
        let (_dir, _layout, sysroot) = setup()?;
        let runner = FakeRunner::new();

        assert_eq!(sysroot.cached_field("foo")?, None);
        sysroot.set_cached_field("foo", Some("bar"), &runner)?;
        assert_eq!(sysroot.cached_field("foo")?.as_deref(), Some("bar"));

        sysroot.set_cached_field("hello", Some("bonjour"), &runner)?;
        assert_eq!(sysroot.cached_field("foo")?.as_deref(), Some("bar"));
        assert_eq!(sysroot.cached_field("hello")?.as_deref(), Some("bonjour"));

        sysroot.set_cached_field("hello", None, &runner)?;
        assert_eq!(sysroot.cached_field("hello")?, None);

        for bad in ["hello\"bonjour", "hello\\bonjour", "hello\nbonjour", "hello$bonjour", "hello`bonjour"] {
            assert!(sysroot.set_cached_field("FOO", Some(bad), &runner).is_err());
        }

        assert!(!sysroot.is_toolchain_installed()?);
        sysroot.set_toolchain_installed(&runner)?;
        assert!(sysroot.is_toolchain_installed()?);
        Ok(())
    }

    #[test]
    fn background_delete_moves_tree_aside() -> Result<()> {
        let (_dir, _layout, sysroot) = setup()?;
        std::fs::create_dir_all(sysroot.path())?;
        let runner = FakeRunner::new();

        sysroot.delete(&runner, true)?;

        let calls = runner.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].program, "mv");
        assert_eq!(calls[1].program, "rm");
        assert!(calls[1].args[2].contains(".deleting."));
        Ok(())
    }

    #[test]
    fn reads_package_provided() -> Result<()> {
        let (_dir, _layout, sysroot) = setup()?;
        write_files(
            sysroot.path(),
            [(
                PACKAGE_PROVIDED,
                "\nfoo/bar-2-r3\n\n# Comment line.\ncat/pkg-1.0.0 # Comment after package.\n",
            )],
        )?;

        assert_eq!(
            sysroot.provided_packages()?,
            vec![PackageInfo::parse("foo/bar-2-r3")?, PackageInfo::parse("cat/pkg-1.0.0")?]
        );

        let runner = FakeRunner::new();
        sysroot.write_package_provided(&[PackageInfo::parse("dev-lang/go-1.20")?], &runner)?;
        assert_eq!(sysroot.provided_packages()?, vec![PackageInfo::parse("dev-lang/go-1.20")?]);
        Ok(())
    }
}
