// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

/// Chrome is versioned independently and always taken from its own binhost
/// unless built locally.
pub const CHROME_PACKAGES: [&str; 2] = ["chromeos-base/chromeos-chrome", "chromeos-base/chrome-icu"];

/// SDK packages that must keep their installed version and never be rebuilt
/// as a side effect of a board build.
pub const CRITICAL_SDK_PACKAGES: [&str; 4] = [
    "dev-lang/rust",
    "dev-lang/go",
    "sys-libs/glibc",
    "sys-devel/gcc",
];

pub const BACKTRACK_DEFAULT: u32 = 30;

pub const SDK_BOARD: &str = "amd64-host";
pub const SDK_BOOTSTRAP_PROFILE: &str = "sdk/bootstrap";

pub const TARGET_OS_PKG: &str = "virtual/target-os";
pub const TARGET_OS_DEV_PKG: &str = "virtual/target-os-dev";
pub const TARGET_OS_FACTORY_PKG: &str = "virtual/target-os-factory";
pub const TARGET_OS_FACTORY_SHIM_PKG: &str = "virtual/target-os-factory-shim";
pub const TARGET_OS_TEST_PKG: &str = "virtual/target-os-test";
pub const AUTOTEST_PKG: &str = "chromeos-base/autotest-all";
pub const TARGET_SDK_BROOT_PKG: &str = "virtual/target-sdk-broot";
pub const TARGET_FUZZERS_PKG: &str = "virtual/target-fuzzers";
pub const IMPLICIT_SYSTEM_PKG: &str = "virtual/implicit-system";

/// Base-install packages whose declared dependencies are known to be
/// incomplete. Changes to them force their reverse dependencies to rebuild.
pub const BASE_INSTALL_HEURISTIC_PATTERNS: [&str; 2] =
    ["coreboot-private-files", "tast-build-deps"];

/// Binhosts whose URL contains this marker serve Chrome prebuilts.
pub const CHROME_BINHOST_MARKER: &str = "cq-";

pub const BINHOST_AGE_THRESHOLD_DAYS: i64 = 30;

/// Packages allowed in both the SDK and the board's broot while they migrate.
/// They are left out of the broot's package.provided so the broot installs
/// its own copy.
pub const TEMP_DUPLICATE_PACKAGES: &[&str] = &[
    "chromeos-base/tast-cmd",
    "chromeos-base/tast-remote-tests",
    "chromeos-base/tast-remote-tests-cros",
    "chromeos-base/tast-remote-tests-crosint",
    "chromeos-base/tast-remote-tests-crosint_intel",
    "chromeos-base/tast-tests-remote-data",
    "dev-libs/flatbuffers",
    "dev-util/android-provision",
    "dev-util/cros-ctp2-filters",
    "dev-util/cros-dut",
    "dev-util/cros-fw-provision",
    "dev-util/cros-hpt",
    "dev-util/cros-provision",
    "dev-util/cros-publish",
    "dev-util/cros-servod",
    "dev-util/cros-test",
    "dev-util/cros-test-finder",
    "dev-util/fw-provision",
    "dev-util/post-process",
    "dev-util/pre-process",
    "dev-util/test-services",
    "dev-util/testlabenv-local",
    "dev-util/vm-provision",
    "virtual/tast-remote-tests",
];

/// Portage tools that get a `<tool>-<board>` wrapper in the sysroot.
pub const WRAPPED_TOOLS: &[&str] = &[
    "ebuild", "eclean", "emaint", "emerge", "equery", "portageq", "qcheck", "qdepends", "qfile",
    "qlist", "qmerge", "qsize",
];

pub const SYSROOT_ARCHIVE_FILE: &str = "sysroot.tar.zst";
pub const TARGET_SYSROOT_FILE: &str = "sysroot.tar.xz";
pub const SIMPLE_CHROME_SYSROOT_FILE: &str = "sysroot_chromeos-base_chromeos-chrome.tar.xz";
pub const FUZZER_SYSROOT_FILE: &str = "sysroot_virtual_target-os.tar.xz";
pub const CHROME_EBUILD_ENV_FILE: &str = "environment_chromeos-base_chromeos-chrome.tar.xz";
pub const CHROME_ENV_FILE: &str = "environment";
pub const DEBUG_SYMBOLS_FILE: &str = "debug.tgz";
