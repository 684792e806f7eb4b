// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use anyhow::{bail, Context, Result};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use std::{path::Path, str::FromStr};

lazy_static! {
    static ref COMMENT_RE: Regex = Regex::new(r"\s*#.*$").unwrap();
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct ToolchainOptions {
    pub default: Option<bool>,
    pub sdk: Option<bool>,
    pub crossdev: Option<String>,
}

/// A cross compiler, named by its target triple.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Toolchain {
    pub name: String,
    pub arch: String,
    pub options: ToolchainOptions,
}

impl FromStr for Toolchain {
    type Err = anyhow::Error;

    /// Parses a `toolchain.conf` entry: a triple, optionally followed by JSON
    /// options, e.g. `x86_64-cros-linux-gnu {"default": false}`.
    fn from_str(line: &str) -> Result<Self> {
        let line = line.trim();
        let (triple, json) = match line.split_once(char::is_whitespace) {
            Some((triple, json)) => (triple, Some(json.trim_start())),
            None => (line, None),
        };
        if triple.is_empty() {
            bail!("Toolchain triple is missing");
        }
        let arch = triple.split('-').next().unwrap_or(triple);

        let options = match json {
            Some(json) => serde_json::from_str(json)
                .with_context(|| format!("Invalid options for toolchain {triple}"))?,
            None => ToolchainOptions::default(),
        };

        Ok(Toolchain {
            name: triple.to_owned(),
            arch: arch.to_owned(),
            options,
        })
    }
}

impl Toolchain {
    pub fn can_be_default(&self) -> bool {
        self.options.default.unwrap_or(true)
    }

    /// The Portage ARCH the toolchain builds for.
    pub fn portage_arch(&self) -> Result<&'static str> {
        match self.arch.as_str() {
            "aarch64" => Ok("arm64"),
            "arm" | "armv7a" | "armv7m" => Ok("arm"),
            "i686" => Ok("x86"),
            "x86_64" => Ok("amd64"),
            _ => bail!("Unknown arch {}", &self.arch),
        }
    }
}

/// The toolchains a board needs, from its overlays' `toolchain.conf` files.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ToolchainConfig {
    pub toolchains: Vec<Toolchain>,
    pub default_index: Option<usize>,
}

impl ToolchainConfig {
    /// The toolchain whose triple becomes the board's CHOST.
    pub fn primary(&self) -> Option<&Toolchain> {
        self.default_index.and_then(|index| self.toolchains.get(index))
    }

    fn load(&mut self, path: &Path) -> Result<()> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;

        for line in content.lines() {
            let line = COMMENT_RE.replace(line, "");
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let toolchain = Toolchain::from_str(line)?;

            // The leaf overlay is loaded first and picks the primary
            // toolchain; parents redeclaring it are only allowed to agree.
            match self.toolchains.iter().find(|t| t.name == toolchain.name) {
                Some(existing) if existing.options != toolchain.options => bail!(
                    "Conflicting declaration of toolchain {} in {}",
                    toolchain.name,
                    path.display()
                ),
                Some(_) => {}
                None => {
                    if self.default_index.is_none() && toolchain.can_be_default() {
                        self.default_index = Some(self.toolchains.len());
                    }
                    self.toolchains.push(toolchain);
                }
            }
        }
        Ok(())
    }
}

/// Loads `toolchain.conf` from each overlay, given in stacking order (the
/// leaf overlay last). Overlays without one are skipped.
pub fn load_toolchains<P: AsRef<Path>>(overlays: &[P]) -> Result<ToolchainConfig> {
    let mut config = ToolchainConfig::default();
    for overlay in overlays.iter().rev() {
        let path = overlay.as_ref().join("toolchain.conf");
        if path.try_exists()? {
            config.load(&path)?;
        }
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use testutil::write_files;

    #[test]
    fn leaf_overlay_picks_primary() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let dir = dir.path();
        write_files(
            dir,
            [
                (
                    "overlay-eve/toolchain.conf",
                    "# The main toolchain.\nx86_64-cros-linux-gnu # trailing comment\n\n\
                     # AP firmware.\ni686-cros-linux-gnu\narm-none-eabi\n",
                ),
                (
                    "overlay-eve-private/toolchain.conf",
                    r#"arm-none-eabi {"default": false}"#,
                ),
            ],
        )?;

        let err = load_toolchains(&[dir.join("overlay-eve"), dir.join("overlay-eve-private")]);
        assert!(err.is_err(), "conflicting options must be rejected");

        std::fs::write(dir.join("overlay-eve-private/toolchain.conf"), "aarch64-cros-linux-gnu\n")?;
        let config = load_toolchains(&[
            dir.join("overlay-eve"),
            dir.join("overlay-eve-private"),
            dir.join("missing"),
        ])?;

        let names: Vec<_> = config.toolchains.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "aarch64-cros-linux-gnu",
                "x86_64-cros-linux-gnu",
                "i686-cros-linux-gnu",
                "arm-none-eabi"
            ]
        );
        assert_eq!(config.primary().map(|t| t.name.as_str()), Some("aarch64-cros-linux-gnu"));
        Ok(())
    }

    #[test]
    fn non_default_toolchain_is_skipped_for_primary() -> Result<()> {
        let dir = tempfile::tempdir()?;
        write_files(
            dir.path(),
            [("overlay/toolchain.conf", "x86_64-cros-linux-gnu   {\"default\": false}\narmv7a-cros-linux-gnueabihf\n")],
        )?;

        let config = load_toolchains(&[dir.path().join("overlay")])?;

        let primary = config.primary().context("no primary")?;
        assert_eq!(primary.name, "armv7a-cros-linux-gnueabihf");
        assert_eq!(primary.portage_arch()?, "arm");
        assert_eq!(config.toolchains[0].options.default, Some(false));
        Ok(())
    }

    #[test]
    fn unknown_arch() -> Result<()> {
        assert!(Toolchain::from_str("riscv64-cros-linux-gnu")?.portage_arch().is_err());
        Ok(())
    }
}
