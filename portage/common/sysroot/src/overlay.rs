// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use anyhow::{anyhow, bail, Context, Result};
use lazy_static::lazy_static;
use regex::Regex;
use std::{
    collections::HashSet,
    path::{Path, PathBuf},
};

use crate::layout::Layout;

lazy_static! {
    static ref LAYOUT_CONF_LINE_RE: Regex = Regex::new(r"^\s*(\S+)\s*=\s*(.*)$").unwrap();
}

/// The parts of `metadata/layout.conf` that decide overlay stacking.
#[derive(Clone, Debug, PartialEq, Eq)]
struct OverlayLayout {
    name: String,
    masters: Vec<String>,
}

impl OverlayLayout {
    fn path(overlay: &Path) -> PathBuf {
        overlay.join("metadata/layout.conf")
    }

    fn load(overlay: &Path) -> Result<Self> {
        let path = Self::path(overlay);
        let context = || format!("Failed to load {}", path.display());
        let content = std::fs::read_to_string(&path).with_context(context)?;

        let mut name = None;
        let mut masters = Vec::new();
        for (lineno, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let caps = LAYOUT_CONF_LINE_RE
                .captures(line)
                .ok_or_else(|| anyhow!("Line {}: syntax error", lineno + 1))
                .with_context(context)?;
            match &caps[1] {
                "repo-name" => name = Some(caps[2].trim().to_owned()),
                "masters" => {
                    masters = caps[2].split_ascii_whitespace().map(str::to_owned).collect()
                }
                _ => {}
            }
        }
        let name = name
            .ok_or_else(|| anyhow!("repo-name not defined"))
            .with_context(context)?;
        Ok(Self { name, masters })
    }
}

/// Finds a board-level overlay by repository name. Only the board overlay
/// roots are searched; masters such as `portage-stable` are always part of
/// a sysroot's overlays and aren't board overlays.
fn find_board_overlay(layout: &Layout, name: &str) -> Result<Option<PathBuf>> {
    for root in layout.board_overlay_roots() {
        for dir in [name.to_owned(), format!("overlay-{name}")] {
            let overlay = root.join(dir);
            if !OverlayLayout::path(&overlay).try_exists()? {
                continue;
            }
            let found = OverlayLayout::load(&overlay)?;
            if found.name != name {
                bail!(
                    "Overlay {} has the unexpected name {}, expected {name}",
                    overlay.display(),
                    found.name
                );
            }
            return Ok(Some(overlay));
        }
    }
    Ok(None)
}

struct Stack<'a> {
    layout: &'a Layout,
    overlays: Vec<PathBuf>,
    visiting: HashSet<PathBuf>,
}

impl Stack<'_> {
    /// Adds `overlay` after its masters, depth first.
    fn push(&mut self, overlay: PathBuf) -> Result<()> {
        if self.overlays.contains(&overlay) {
            return Ok(());
        }
        if !self.visiting.insert(overlay.clone()) {
            bail!("Overlay {} inherits from itself", overlay.display());
        }
        if OverlayLayout::path(&overlay).try_exists()? {
            for master in OverlayLayout::load(&overlay)?.masters {
                if let Some(parent) = find_board_overlay(self.layout, &master)? {
                    self.push(parent)?;
                }
            }
        }
        self.visiting.remove(&overlay);
        self.overlays.push(overlay);
        Ok(())
    }
}

/// Board overlays that exist in the checkout, in stacking order: inherited
/// overlays (baseboards, chipsets) before the overlays inheriting from them,
/// the public board overlay before the private one.
pub fn board_overlays(layout: &Layout, board: &str) -> Result<Vec<PathBuf>> {
    let mut stack = Stack {
        layout,
        overlays: Vec::new(),
        visiting: HashSet::new(),
    };
    for overlay in layout.board_overlays(board) {
        if overlay.try_exists()? {
            stack.push(overlay)?;
        }
    }
    Ok(stack.overlays)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use testutil::write_files;

    fn layout_conf(name: &str, masters: &str) -> String {
        format!("repo-name = {name}\nmasters = {masters}\n# comment\nprofile-formats = portage-2\n")
    }

    #[test]
    fn follows_masters_to_baseboards() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let layout = Layout::under(dir.path());
        let src = layout.source_root.join("src");
        let chipset = layout_conf("chipset-kbl", "portage-stable chromiumos");
        let baseboard = layout_conf("baseboard-poppy", "portage-stable chromiumos chipset-kbl");
        let eve = layout_conf("eve", "portage-stable chromiumos baseboard-poppy");
        let private = layout_conf("eve-private", "chromiumos eve baseboard-poppy-private");
        let baseboard_private = layout_conf("baseboard-poppy-private", "baseboard-poppy");
        write_files(
            &src,
            [
                ("overlays/chipset-kbl/metadata/layout.conf", chipset.as_str()),
                ("overlays/baseboard-poppy/metadata/layout.conf", baseboard.as_str()),
                ("overlays/overlay-eve/metadata/layout.conf", eve.as_str()),
                (
                    "private-overlays/baseboard-poppy-private/metadata/layout.conf",
                    baseboard_private.as_str(),
                ),
                ("private-overlays/overlay-eve-private/metadata/layout.conf", private.as_str()),
                ("third_party/portage-stable/metadata/layout.conf", "repo-name = portage-stable\n"),
            ],
        )?;

        let overlays = board_overlays(&layout, "eve")?;

        assert_eq!(
            overlays,
            vec![
                src.join("overlays/chipset-kbl"),
                src.join("overlays/baseboard-poppy"),
                src.join("overlays/overlay-eve"),
                src.join("private-overlays/baseboard-poppy-private"),
                src.join("private-overlays/overlay-eve-private"),
            ]
        );
        Ok(())
    }

    #[test]
    fn overlay_without_layout_conf_stands_alone() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let layout = Layout::under(dir.path());
        let eve = layout.source_root.join("src/overlays/overlay-eve");
        write_files(&eve, [("toolchain.conf", "x86_64-cros-linux-gnu\n")])?;

        assert_eq!(board_overlays(&layout, "eve")?, vec![eve]);
        assert!(board_overlays(&layout, "nonexistent")?.is_empty());
        Ok(())
    }

    #[test]
    fn rejects_bad_layouts() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let layout = Layout::under(dir.path());
        let a = layout_conf("a", "b");
        let b = layout_conf("b", "a");
        write_files(
            &layout.source_root.join("src/overlays"),
            [
                ("overlay-a/metadata/layout.conf", a.as_str()),
                ("overlay-b/metadata/layout.conf", b.as_str()),
                ("overlay-c/metadata/layout.conf", "masters = a\n"),
                ("overlay-d/metadata/layout.conf", "repo-name = d\nmasters = wrong\n"),
                ("overlay-wrong/metadata/layout.conf", "repo-name = right\n"),
            ],
        )?;

        let err = board_overlays(&layout, "a").unwrap_err();
        assert!(format!("{err:#}").contains("inherits from itself"), "{err:#}");
        let err = board_overlays(&layout, "c").unwrap_err();
        assert!(format!("{err:#}").contains("repo-name not defined"), "{err:#}");
        let err = board_overlays(&layout, "d").unwrap_err();
        assert!(format!("{err:#}").contains("unexpected name right"), "{err:#}");
        Ok(())
    }
}
