// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The knobs of `setup-board` and `build-packages`, and the emerge flags,
//! environment, and package lists they imply.

use chrono::{DateTime, Utc};
use std::{collections::BTreeMap, time::Duration};

use crate::{
    binhost::BinhostLookupServiceData,
    constants::{
        AUTOTEST_PKG, BACKTRACK_DEFAULT, CHROME_PACKAGES, TARGET_OS_DEV_PKG,
        TARGET_OS_FACTORY_PKG, TARGET_OS_FACTORY_SHIM_PKG, TARGET_OS_PKG, TARGET_OS_TEST_PKG,
    },
};

/// The parts of the process environment the build reads.
///
/// Captured once so that the derived flags are a function of their inputs.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProcessEnv {
    pub use_flags: Option<String>,
    pub features: Option<String>,
    pub extra_board_flags: Option<String>,
    pub chrome_origin: Option<String>,
    pub clean_outdated_pkgs: Option<String>,
}

impl ProcessEnv {
    pub fn capture() -> Self {
        let var = |name| std::env::var(name).ok();
        Self {
            use_flags: var("USE"),
            features: var("FEATURES"),
            extra_board_flags: var("EXTRA_BOARD_FLAGS"),
            chrome_origin: var("CHROME_ORIGIN"),
            clean_outdated_pkgs: var("CROS_CLEAN_OUTDATED_PKGS"),
        }
    }

    /// `CROS_CLEAN_OUTDATED_PKGS=0` turns the outdated package cleanup off.
    pub fn clean_outdated_pkgs_enabled(&self) -> bool {
        self.clean_outdated_pkgs.as_deref() != Some("0")
    }
}

fn split_env(value: &Option<String>) -> impl Iterator<Item = String> + '_ {
    value
        .iter()
        .flat_map(|v| v.split_whitespace())
        .map(str::to_owned)
}

/// Arguments for updating the SDK before a board is set up.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpdateArguments {
    pub build_source: bool,
    pub toolchain_targets: Vec<String>,
    pub jobs: Option<u32>,
    pub backtrack: u32,
    pub update_toolchain: bool,
}

/// Configuration of `setup-board`.
///
/// Construct it with [`SetupBoardRunConfig::builder`]; `force` can't be set
/// directly so that a toolchain change always forces a rebuild.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SetupBoardRunConfig {
    pub set_default: bool,
    force: bool,
    pub usepkg: bool,
    pub jobs: Option<u32>,
    pub regen_configs: bool,
    pub quiet: bool,
    pub update_toolchain: bool,
    pub update_chroot: bool,
    pub init_board_pkgs: bool,
    pub local_build: bool,
    pub expanded_binhost_inheritance: bool,
    pub use_cq_prebuilts: bool,
    pub backtrack: u32,
    pub binhost_lookup_service_data: Option<BinhostLookupServiceData>,
}

impl Default for SetupBoardRunConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl SetupBoardRunConfig {
    pub fn builder() -> SetupBoardRunConfigBuilder {
        SetupBoardRunConfigBuilder::default()
    }

    /// Whether an existing sysroot is deleted and recreated.
    pub fn force(&self) -> bool {
        self.force
    }

    pub fn update_chroot_args(&self, toolchain_target: &str) -> UpdateArguments {
        UpdateArguments {
            build_source: !self.usepkg,
            toolchain_targets: vec![toolchain_target.to_owned()],
            jobs: self.jobs,
            backtrack: self.backtrack,
            update_toolchain: self.update_toolchain,
        }
    }
}

#[derive(Clone, Debug)]
pub struct SetupBoardRunConfigBuilder {
    config: SetupBoardRunConfig,
    toolchain_changed: bool,
}

impl Default for SetupBoardRunConfigBuilder {
    fn default() -> Self {
        Self {
            config: SetupBoardRunConfig {
                set_default: false,
                force: false,
                usepkg: true,
                jobs: None,
                regen_configs: false,
                quiet: false,
                update_toolchain: false,
                update_chroot: true,
                init_board_pkgs: true,
                local_build: false,
                expanded_binhost_inheritance: false,
                use_cq_prebuilts: false,
                backtrack: BACKTRACK_DEFAULT,
                binhost_lookup_service_data: None,
            },
            toolchain_changed: false,
        }
    }
}

macro_rules! setter {
    ($name:ident: $ty:ty) => {
        pub fn $name(mut self, value: $ty) -> Self {
            self.config.$name = value;
            self
        }
    };
}

impl SetupBoardRunConfigBuilder {
    setter!(set_default: bool);
    setter!(force: bool);
    setter!(usepkg: bool);
    setter!(jobs: Option<u32>);
    setter!(regen_configs: bool);
    setter!(quiet: bool);
    setter!(update_toolchain: bool);
    setter!(update_chroot: bool);
    setter!(init_board_pkgs: bool);
    setter!(local_build: bool);
    setter!(expanded_binhost_inheritance: bool);
    setter!(use_cq_prebuilts: bool);
    setter!(backtrack: u32);
    setter!(binhost_lookup_service_data: Option<BinhostLookupServiceData>);

    /// A changed toolchain invalidates the whole sysroot, so it implies
    /// `force`.
    pub fn toolchain_changed(mut self, value: bool) -> Self {
        self.toolchain_changed = value;
        self
    }

    pub fn build(self) -> SetupBoardRunConfig {
        SetupBoardRunConfig {
            force: self.config.force || self.toolchain_changed,
            ..self.config
        }
    }
}

/// Configuration of `build-packages`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BuildPackagesRunConfig {
    pub usepkg: bool,
    /// Packages to build. `None` or empty builds the image meta-packages
    /// selected by the `*_image` flags.
    pub packages: Option<Vec<String>>,
    pub use_flags: Option<Vec<String>>,
    pub use_remoteexec: bool,
    pub reproxy_cfg_file: String,
    pub incremental_build: bool,
    pub dryrun: bool,
    pub usepkgonly: bool,
    pub workon: bool,
    pub install_auto_test: bool,
    pub autosetgov: bool,
    pub autosetgov_sticky: bool,
    pub use_any_chrome: bool,
    pub internal_chrome: bool,
    pub eclean: bool,
    pub jobs: Option<u32>,
    pub local_pkg: bool,
    pub dev_image: bool,
    pub factory_image: bool,
    pub test_image: bool,
    pub debug_version: bool,
    pub backtrack: u32,
    pub bazel: bool,
    pub bazel_lite: bool,
    pub noclean: bool,
    pub binhost_lookup_service_data: Option<BinhostLookupServiceData>,
    /// Wall-clock deadline for the package build.
    pub timeout: Option<DateTime<Utc>>,
    pub bazel_use_remote_execution: bool,
}

impl Default for BuildPackagesRunConfig {
    fn default() -> Self {
        Self {
            usepkg: true,
            packages: None,
            use_flags: None,
            use_remoteexec: false,
            reproxy_cfg_file: String::new(),
            incremental_build: true,
            dryrun: false,
            usepkgonly: false,
            workon: true,
            install_auto_test: true,
            autosetgov: false,
            autosetgov_sticky: false,
            use_any_chrome: true,
            internal_chrome: false,
            eclean: true,
            jobs: None,
            local_pkg: false,
            dev_image: true,
            factory_image: true,
            test_image: true,
            debug_version: true,
            backtrack: BACKTRACK_DEFAULT,
            bazel: false,
            bazel_lite: false,
            noclean: false,
            binhost_lookup_service_data: None,
            timeout: None,
            bazel_use_remote_execution: false,
        }
    }
}

impl BuildPackagesRunConfig {
    pub fn is_incremental(&self) -> bool {
        self.incremental_build
    }

    /// The USE value for the build. `None` means leave USE unset; it is never
    /// `Some("")`, which would clear the profile's USE.
    pub fn use_flags(&self, env: &ProcessEnv) -> Option<String> {
        let mut flags: Vec<String> = split_env(&env.use_flags).collect();
        if let Some(extra) = &self.use_flags {
            flags.extend(extra.iter().cloned());
        }
        if self.internal_chrome {
            flags.push("chrome_internal".to_owned());
        }
        if !self.debug_version {
            flags.push("-cros-debug".to_owned());
        }
        (!flags.is_empty()).then(|| flags.join(" "))
    }

    pub fn features(&self, env: &ProcessEnv) -> Option<String> {
        let mut features: Vec<String> = split_env(&env.features).collect();
        if self.noclean {
            features.push("noclean".to_owned());
        }
        (!features.is_empty()).then(|| features.join(" "))
    }

    /// Environment variables to add on top of the inherited environment.
    pub fn extra_env(&self, env: &ProcessEnv) -> BTreeMap<String, String> {
        let mut extra = BTreeMap::new();
        if let Some(use_flags) = self.use_flags(env) {
            extra.insert("USE".to_owned(), use_flags);
        }
        if let Some(features) = self.features(env) {
            extra.insert("FEATURES".to_owned(), features);
        }
        if self.use_remoteexec {
            extra.insert("USE_REMOTEEXEC".to_owned(), "true".to_owned());
            extra.insert("REPROXY_CFG_FILE".to_owned(), self.reproxy_cfg_file.clone());
        }
        extra
    }

    /// The emerge flags, in the order downstream log scrapers expect.
    pub fn emerge_flags(&self, env: &ProcessEnv) -> Vec<String> {
        let mut flags: Vec<String> = vec![
            "-uDNv".to_owned(),
            format!("--backtrack={}", self.backtrack),
            "--newrepo".to_owned(),
            "--with-test-deps".to_owned(),
            "y".to_owned(),
        ];
        if self.use_any_chrome {
            flags.extend(
                CHROME_PACKAGES
                    .iter()
                    .map(|pkg| format!("--force-remote-binary={pkg}")),
            );
        }
        flags.extend(split_env(&env.extra_board_flags));
        if self.dryrun {
            flags.push("--pretend".to_owned());
        }
        if self.usepkg || self.local_pkg || self.usepkgonly {
            flags.extend(["--getbinpkg", "--with-bdeps", "y"].map(str::to_owned));
            flags.push(if self.usepkgonly { "--usepkgonly" } else { "--usepkg" }.to_owned());
        }
        if let Some(jobs) = self.jobs {
            flags.push(format!("--jobs={jobs}"));
        }
        flags
    }

    pub fn packages(&self) -> Vec<String> {
        if let Some(packages) = self.packages.as_ref().filter(|p| !p.is_empty()) {
            return packages.clone();
        }
        let mut packages = vec![TARGET_OS_PKG];
        if self.dev_image {
            packages.push(TARGET_OS_DEV_PKG);
        }
        if self.factory_image {
            packages.extend([TARGET_OS_FACTORY_PKG, TARGET_OS_FACTORY_SHIM_PKG]);
        }
        if self.test_image {
            packages.push(TARGET_OS_TEST_PKG);
        }
        if self.install_auto_test {
            packages.push(AUTOTEST_PKG);
        }
        packages.into_iter().map(str::to_owned).collect()
    }

    /// Time left until the deadline, clamped at zero.
    pub fn remaining_timeout(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.timeout
            .map(|deadline| (deadline - now).to_std().unwrap_or(Duration::ZERO))
    }
}
