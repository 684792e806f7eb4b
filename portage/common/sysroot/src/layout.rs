// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::path::{Path, PathBuf};

/// Where things live inside the SDK chroot.
///
/// The default is the real chroot; tests root everything in a temporary
/// directory with [`Layout::under`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Layout {
    /// The checkout, `/mnt/host/source` inside the chroot.
    pub source_root: PathBuf,
    /// The chroot's own root. The SDK's package database and user config
    /// live under it.
    pub chroot_root: PathBuf,
    /// Scratch space for the die hook status file and Bazel artifacts.
    pub tmp_dir: PathBuf,
}

impl Default for Layout {
    fn default() -> Self {
        Self {
            source_root: PathBuf::from("/mnt/host/source"),
            chroot_root: PathBuf::from("/"),
            tmp_dir: PathBuf::from("/tmp"),
        }
    }
}

impl Layout {
    pub fn under(root: &Path) -> Self {
        Self {
            source_root: root.join("mnt/host/source"),
            chroot_root: root.to_owned(),
            tmp_dir: root.join("tmp"),
        }
    }

    pub fn chromite_bin(&self, tool: &str) -> String {
        self.source_root
            .join("chromite/bin")
            .join(tool)
            .to_string_lossy()
            .into_owned()
    }

    pub fn chromite_shell(&self, tool: &str) -> String {
        self.source_root
            .join("chromite/shell")
            .join(tool)
            .to_string_lossy()
            .into_owned()
    }

    pub fn scripts_dir(&self) -> PathBuf {
        self.source_root.join("src/scripts")
    }

    /// Portage hooks installed into every sysroot.
    pub fn hooks_dir(&self) -> PathBuf {
        self.scripts_dir().join("hooks")
    }

    /// Where the per-board Portage tool wrappers are put on PATH.
    pub fn wrapper_bin_dir(&self) -> PathBuf {
        self.chroot_root.join("usr/local/bin")
    }

    pub fn default_board_file(&self) -> PathBuf {
        self.scripts_dir().join(".default_board")
    }

    pub fn ensure_bootstrap(&self) -> String {
        self.source_root
            .join("src/chromium/depot_tools/ensure_bootstrap")
            .to_string_lossy()
            .into_owned()
    }

    pub fn chromiumos_overlay(&self) -> PathBuf {
        self.source_root.join("src/third_party/chromiumos-overlay")
    }

    /// Directories holding board, baseboard and chipset overlays.
    pub fn board_overlay_roots(&self) -> [PathBuf; 2] {
        [
            self.source_root.join("src/overlays"),
            self.source_root.join("src/private-overlays"),
        ]
    }

    /// The board's own overlays in the order Portage stacks them: public,
    /// then private. See [`crate::overlay::board_overlays`] for the overlays
    /// they inherit from.
    pub fn board_overlays(&self, board: &str) -> Vec<PathBuf> {
        vec![
            self.source_root.join(format!("src/overlays/overlay-{board}")),
            self.source_root
                .join(format!("src/private-overlays/overlay-{board}-private")),
        ]
    }

    pub fn public_binhost_conf_dir(&self) -> PathBuf {
        self.chromiumos_overlay().join("chromeos/binhost")
    }

    pub fn private_binhost_conf_dir(&self) -> PathBuf {
        self.source_root
            .join("src/private-overlays/chromeos-partner-overlay/chromeos/binhost")
    }

    pub fn make_conf_generic_target(&self) -> PathBuf {
        self.chromiumos_overlay()
            .join("chromeos/config/make.conf.generic-target")
    }

    pub fn make_conf_sdk(&self) -> PathBuf {
        self.chromiumos_overlay()
            .join("chromeos/config/make.conf.amd64-host")
    }

    pub fn make_conf_user(&self) -> PathBuf {
        self.chroot_root.join("etc/make.conf.user")
    }

    pub fn sdk_profile(&self) -> PathBuf {
        self.chromiumos_overlay()
            .join("profiles/default/linux/amd64/10.0/sdk")
    }

    /// Per-board cros_workon package lists.
    pub fn workon_dir(&self) -> PathBuf {
        self.source_root.join(".config/cros_workon")
    }

    pub fn sdk_vdb(&self) -> PathBuf {
        self.chroot_root.join("var/db/pkg")
    }

    pub fn chroot_version_file(&self) -> PathBuf {
        self.chroot_root.join("etc/cros_chroot_version")
    }

    pub fn bazel_workspace(&self) -> PathBuf {
        self.source_root.join("src")
    }

    /// The kernel's current CPU frequency governor.
    pub fn cpu_governor_file(&self) -> PathBuf {
        self.chroot_root
            .join("sys/devices/system/cpu/cpu0/cpufreq/scaling_governor")
    }

    pub fn die_hook_status_file(&self) -> PathBuf {
        self.tmp_dir.join("portage_die_hook_status")
    }

    pub fn bazel_command_profile(&self) -> PathBuf {
        self.tmp_dir.join("allpackages_command.profile.gz")
    }

    pub fn bazel_cquery_profile(&self) -> PathBuf {
        self.tmp_dir.join("allpackages_cquery.profile.gz")
    }

    pub fn bazel_action_logs(&self) -> PathBuf {
        self.tmp_dir.join("allpackages_action_logs.tar.gz")
    }

    pub fn bazel_exec_log(&self) -> PathBuf {
        self.tmp_dir.join("allpackages_exec_compact.log")
    }

    pub fn bazel_prebuilts(&self) -> PathBuf {
        self.tmp_dir.join("prebuilts.bzl")
    }

    pub fn bazel_graph_log(&self) -> PathBuf {
        self.tmp_dir.join("allpackages_graph.log")
    }

    pub fn bazel_build_events(&self) -> PathBuf {
        self.tmp_dir.join("chromeos_bazel_build_events.json")
    }

    /// Everything a Bazel build leaves for offline analysis.
    pub fn bazel_performance_artifacts(&self) -> Vec<PathBuf> {
        vec![
            self.bazel_command_profile(),
            self.bazel_cquery_profile(),
            self.bazel_action_logs(),
            self.bazel_exec_log(),
            self.bazel_prebuilts(),
            self.bazel_graph_log(),
            self.bazel_build_events(),
        ]
    }
}
