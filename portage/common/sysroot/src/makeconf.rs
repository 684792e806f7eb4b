// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Generates the make.conf layers of a sysroot.

use anyhow::{Context, Result};
use itertools::Itertools;
use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tera::Tera;

use crate::{build_target::BuildTarget, layout::Layout, toolchain::ToolchainConfig};

lazy_static! {
    static ref TEMPLATES: Tera = {
        let mut tera: Tera = Default::default();
        tera.add_raw_template("make.conf", include_str!("templates/make.conf"))
            .unwrap();
        tera
    };
}

const SDK_CHOST: &str = "x86_64-pc-linux-gnu";

#[derive(Serialize, Debug)]
struct MakeVar {
    key: &'static str,
    value: String,
}

fn var(key: &'static str, value: impl Into<String>) -> MakeVar {
    MakeVar {
        key,
        value: value.into(),
    }
}

#[derive(Serialize, Debug)]
struct MakeConfContext {
    sources: Vec<String>,
    vars: Vec<MakeVar>,
}

fn render(sources: Vec<String>, vars: Vec<MakeVar>) -> Result<String> {
    let context = MakeConfContext { sources, vars };
    Ok(TEMPLATES.render("make.conf", &tera::Context::from_serialize(context)?)?)
}

fn join_paths(paths: &[PathBuf]) -> String {
    paths.iter().map(|p| p.display()).join("\n")
}

/// `make.conf.board_setup`: the variables that identify the board.
///
/// `overlays` are the board's own overlays in stacking order. A board
/// without a primary toolchain can't be configured.
pub fn board_setup_config(
    layout: &Layout,
    target: &BuildTarget,
    overlays: &[PathBuf],
    toolchains: &ToolchainConfig,
) -> Result<String> {
    let root = target.root().display();
    if target.is_host() {
        // PKGDIR and friends in make.conf.amd64-host point at the SDK itself;
        // a host sysroot keeps them under $ROOT.
        return render(
            vec![],
            vec![
                var("ARCH", "amd64"),
                var("BOARD_USE", target.name()),
                var("CHOST", SDK_CHOST),
                var("PKGDIR", "$ROOT/packages/"),
                var("PORTAGE_TMPDIR", "$ROOT/tmp/"),
                var("PORT_LOGDIR", "$ROOT/tmp/portage/logs/"),
                var("ROOT", format!("{root}/")),
            ],
        );
    }

    let primary = toolchains
        .primary()
        .with_context(|| format!("No primary toolchain configured for {}", target.name()))?;

    let mut portdir = vec![
        layout.chromiumos_overlay(),
        layout.source_root.join("src/third_party/portage-stable"),
    ];
    portdir.extend(overlays.iter().cloned());

    render(
        vec![],
        vec![
            var("ARCH", primary.portage_arch()?),
            var("BOARD_OVERLAY", join_paths(overlays)),
            var("BOARD_USE", target.name()),
            var("CHOST", primary.name.as_str()),
            var("PKG_CONFIG", format!("{root}/build/bin/pkg-config")),
            var("PORTDIR_OVERLAY", join_paths(&portdir)),
            // Trailing slash is important!
            var("ROOT", format!("{root}/")),
        ],
    )
}

/// The board part of `make.conf.board`: every overlay's own make.conf, plus
/// the accepted licenses.
pub fn board_make_conf(overlays: &[PathBuf], accepted_licenses: Option<&str>) -> Result<String> {
    let mut sources = Vec::new();
    for overlay in overlays {
        let make_conf = overlay.join("make.conf");
        if make_conf.try_exists()? {
            sources.push(make_conf.display().to_string());
        }
    }
    let vars = accepted_licenses
        .filter(|licenses| !licenses.is_empty())
        .map(|licenses| var("ACCEPT_LICENSE", licenses))
        .into_iter()
        .collect();
    render(sources, vars)
}

/// How `make.conf.board` points Portage at binhosts.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BinhostConfOptions {
    /// Build without any remote binhost.
    pub local_only: bool,
    pub use_cq_prebuilts: bool,
    /// Also inherit the binhosts of the board's base `<arch>-generic` board.
    pub expanded_binhost_inheritance: bool,
    /// Binhosts from the lookup service; they replace the checked-in ones.
    pub binhost_overrides: Vec<String>,
}

/// Base boards by Portage ARCH, for binhost inheritance.
pub fn base_arch_board(arch: &str) -> Option<&'static str> {
    match arch {
        "amd64" => Some("amd64-generic"),
        "arm" => Some("arm-generic"),
        "arm64" => Some("arm64-generic"),
        "mips" => Some("mipsel-o32-generic"),
        _ => None,
    }
}

/// The binhost part of `make.conf.board`.
///
/// Checked-in binhost files are sourced in priority order: public then
/// private postsubmit, then (for CQ builds) private then public CQ.
pub fn binhost_conf(
    layout: &Layout,
    board_use: &str,
    arch: Option<&str>,
    options: &BinhostConfOptions,
) -> Result<Option<String>> {
    if options.local_only {
        return Ok(None);
    }

    if !options.binhost_overrides.is_empty() {
        return Ok(Some(format!(
            "# Binhosts from the lookup service.\n\
             LOOKUP_SERVICE_BINHOST=\"{}\"\n\
             PORTAGE_BINHOST=\"$LOOKUP_SERVICE_BINHOST\"\n",
            options.binhost_overrides.join(" ")
        )));
    }

    let mut boards = vec![board_use.to_owned()];
    if options.expanded_binhost_inheritance {
        if let Some(base) = arch.and_then(base_arch_board) {
            if base != board_use {
                boards.push(base.to_owned());
            }
        }
    }

    let public = layout.public_binhost_conf_dir().join("target");
    let private = layout.private_binhost_conf_dir().join("target");
    let mut candidates: Vec<(PathBuf, &str)> = Vec::new();
    for board in &boards {
        let mut order = vec![
            (&public, "POSTSUBMIT_BINHOST"),
            (&private, "POSTSUBMIT_BINHOST"),
        ];
        if options.use_cq_prebuilts {
            order.extend([(&private, "CQ_BINHOST"), (&public, "CQ_BINHOST")]);
        }
        for (dir, key) in order {
            candidates.push((dir.join(format!("{board}-{key}.conf")), key));
        }
    }

    let mut lines = vec![
        "# Binhosts for this board. AUTO-GENERATED FILE. DO NOT EDIT.".to_owned(),
        "PORTAGE_BINHOST=\"$FULL_BINHOST\"".to_owned(),
    ];
    for (path, key) in candidates {
        if path.try_exists()? {
            lines.push(format!("source {}", path.display()));
            lines.push(format!("PORTAGE_BINHOST=\"$PORTAGE_BINHOST ${key}\""));
        }
    }
    Ok(Some(lines.join("\n") + "\n"))
}

/// Reads `KEY="value"` from a make.conf-style file. Values may span lines.
pub fn read_standard_field(path: &Path, key: &str) -> Result<Option<String>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let re = Regex::new(&format!(r#"(?ms)^{}="(.*?)""#, regex::escape(key)))?;
    Ok(re.captures(&content).map(|caps| caps[1].to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::toolchain::load_toolchains;
    use pretty_assertions::assert_eq;
    use testutil::write_files;

    fn non_comment_lines(conf: &str) -> Vec<&str> {
        conf.lines()
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .collect()
    }

    #[test]
    fn board_setup_for_board() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let layout = Layout::under(dir.path());
        let overlay = layout.source_root.join("src/overlays/overlay-eve");
        write_files(&overlay, [("toolchain.conf", "x86_64-cros-linux-gnu\n")])?;
        let toolchains = load_toolchains(&[&overlay])?;
        let target = BuildTarget::new("eve");

        let conf = board_setup_config(&layout, &target, &[overlay.clone()], &toolchains)?;

        let src = layout.source_root.display();
        assert_eq!(
            conf,
            format!(
                "# AUTO-GENERATED FILE. DO NOT EDIT.\n\
                 ARCH=\"amd64\"\n\
                 BOARD_OVERLAY=\"{src}/src/overlays/overlay-eve\"\n\
                 BOARD_USE=\"eve\"\n\
                 CHOST=\"x86_64-cros-linux-gnu\"\n\
                 PKG_CONFIG=\"/build/eve/build/bin/pkg-config\"\n\
                 PORTDIR_OVERLAY=\"{src}/src/third_party/chromiumos-overlay\n\
                 {src}/src/third_party/portage-stable\n\
                 {src}/src/overlays/overlay-eve\"\n\
                 ROOT=\"/build/eve/\"\n"
            )
        );
        assert_eq!(
            read_standard_field_from_str(&conf, "ARCH").as_deref(),
            Some("amd64")
        );
        Ok(())
    }

    fn read_standard_field_from_str(conf: &str, key: &str) -> Option<String> {
        let dir = tempfile::tempdir().ok()?;
        let path = dir.path().join("make.conf.board_setup");
        std::fs::write(&path, conf).ok()?;
        read_standard_field(&path, key).ok()?
    }

    #[test]
    fn board_setup_without_toolchain_fails() {
        let layout = Layout::default();
        let result = board_setup_config(
            &layout,
            &BuildTarget::new("eve"),
            &[],
            &ToolchainConfig::default(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn host_setup_keeps_dirs_under_root() -> Result<()> {
        let target = BuildTarget::new("amd64-host").with_root("/build/eve/build/broot");
        let conf = board_setup_config(&Layout::default(), &target, &[], &ToolchainConfig::default())?;
        assert!(conf.contains("PKGDIR=\"$ROOT/packages/\"\n"));
        assert!(conf.contains("ROOT=\"/build/eve/build/broot/\"\n"));
        Ok(())
    }

    #[test]
    fn board_make_conf_sources_existing_overlays() -> Result<()> {
        let dir = tempfile::tempdir()?;
        write_files(dir.path(), [("overlay-eve/make.conf", "USE=\"foo\"")])?;
        let overlays = vec![dir.path().join("overlay-eve"), dir.path().join("overlay-eve-private")];

        let conf = board_make_conf(&overlays, Some("Google-TOS"))?;

        assert_eq!(
            non_comment_lines(&conf),
            vec![
                format!("source {}", dir.path().join("overlay-eve/make.conf").display()).as_str(),
                "ACCEPT_LICENSE=\"Google-TOS\"",
            ]
        );
        Ok(())
    }

    #[test]
    fn full_binhost_only() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let layout = Layout::under(dir.path());
        let conf = binhost_conf(&layout, "foofoo", None, &BinhostConfOptions::default())?
            .context("no conf")?;
        assert_eq!(non_comment_lines(&conf), vec!["PORTAGE_BINHOST=\"$FULL_BINHOST\""]);
        Ok(())
    }

    #[test]
    fn all_binhosts_with_cq() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let layout = Layout::under(dir.path());
        let public = layout.public_binhost_conf_dir().join("target");
        let private = layout.private_binhost_conf_dir().join("target");
        for (dir, key) in [
            (&public, "CQ_BINHOST"),
            (&private, "CQ_BINHOST"),
            (&public, "POSTSUBMIT_BINHOST"),
            (&private, "POSTSUBMIT_BINHOST"),
        ] {
            write_files(dir, [(format!("foofoo-{key}.conf").as_str(), "X=\"gs://bar/bar\"")])?;
        }
        let conf_path =
            |dir: &PathBuf, key: &str| dir.join(format!("foofoo-{key}.conf")).display().to_string();

        let postsubmit_only =
            binhost_conf(&layout, "foofoo", None, &BinhostConfOptions::default())?.context("no conf")?;
        assert_eq!(non_comment_lines(&postsubmit_only).len(), 5);

        let options = BinhostConfOptions {
            use_cq_prebuilts: true,
            ..Default::default()
        };
        let conf = binhost_conf(&layout, "foofoo", None, &options)?.context("no conf")?;

        let postsubmit = "PORTAGE_BINHOST=\"$PORTAGE_BINHOST $POSTSUBMIT_BINHOST\"";
        let cq = "PORTAGE_BINHOST=\"$PORTAGE_BINHOST $CQ_BINHOST\"";
        assert_eq!(
            non_comment_lines(&conf),
            vec![
                "PORTAGE_BINHOST=\"$FULL_BINHOST\"",
                format!("source {}", conf_path(&public, "POSTSUBMIT_BINHOST")).as_str(),
                postsubmit,
                format!("source {}", conf_path(&private, "POSTSUBMIT_BINHOST")).as_str(),
                postsubmit,
                format!("source {}", conf_path(&private, "CQ_BINHOST")).as_str(),
                cq,
                format!("source {}", conf_path(&public, "CQ_BINHOST")).as_str(),
                cq,
            ]
        );
        Ok(())
    }

    #[test]
    fn expanded_inheritance_adds_base_board() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let layout = Layout::under(dir.path());
        let public = layout.public_binhost_conf_dir().join("target");
        write_files(&public, [("arm64-generic-POSTSUBMIT_BINHOST.conf", "")])?;
        let options = BinhostConfOptions {
            expanded_binhost_inheritance: true,
            ..Default::default()
        };

        let conf = binhost_conf(&layout, "kukui", Some("arm64"), &options)?.context("no conf")?;

        assert_eq!(non_comment_lines(&conf).len(), 3);
        assert!(conf.contains("arm64-generic-POSTSUBMIT_BINHOST.conf"));
        Ok(())
    }

    #[test]
    fn overrides_replace_checked_in_binhosts() -> Result<()> {
        let options = BinhostConfOptions {
            binhost_overrides: vec![
                "gs://override/binhost1".to_owned(),
                "gs://override/binhost2".to_owned(),
            ],
            ..Default::default()
        };
        let conf = binhost_conf(&Layout::default(), "eve", None, &options)?.context("no conf")?;
        assert_eq!(
            non_comment_lines(&conf),
            vec![
                "LOOKUP_SERVICE_BINHOST=\"gs://override/binhost1 gs://override/binhost2\"",
                "PORTAGE_BINHOST=\"$LOOKUP_SERVICE_BINHOST\"",
            ]
        );

        let local = BinhostConfOptions {
            local_only: true,
            ..options
        };
        assert_eq!(binhost_conf(&Layout::default(), "eve", None, &local)?, None);
        Ok(())
    }

    #[test]
    fn reads_multiline_field() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("make.conf.board_setup");
        std::fs::write(&path, "FOO=\"bar\"\nTEST=\"foo\nbar\nbaz\n\"\n")?;
        assert_eq!(read_standard_field(&path, "TEST")?.as_deref(), Some("foo\nbar\nbaz\n"));
        assert_eq!(read_standard_field(&path, "FOO")?.as_deref(), Some("bar"));
        assert_eq!(read_standard_field(&path, "MISSING")?, None);
        Ok(())
    }
}
