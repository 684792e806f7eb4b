// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Sets up board sysroots and builds packages into them.
//!
//! [`setup_board`] creates a sysroot for a [`BuildTarget`] and installs its
//! toolchain; [`build_packages`] builds the requested packages into it with
//! emerge or Bazel. Everything that reaches outside the process goes through
//! a [`Context`].

pub mod artifacts;
pub mod bazel;
pub mod binhost;
pub mod build_events;
pub mod build_packages;
pub mod build_target;
pub mod chroot;
pub mod constants;
pub mod context;
pub mod error;
pub mod failures;
pub mod fileops;
pub mod layout;
pub mod lookup_service;
pub mod makeconf;
pub mod overlay;
pub mod package_info;
pub mod package_set;
pub mod portage;
pub mod prebuilts;
pub mod run_config;
pub mod setup_board;
pub mod sysroot;
pub mod toolchain;

#[cfg(test)]
mod testing;

pub use crate::artifacts::{bundle, extract_sysroot, generate_archive, ArtifactKind};
pub use crate::binhost::{BinhostLookup, BinhostLookupServiceData, GsutilAgeSource, NoBinhostLookup};
pub use crate::build_packages::build_packages;
pub use crate::build_target::BuildTarget;
pub use crate::chroot::{Host, RealHost};
pub use crate::context::Context;
pub use crate::error::{Error, PackageInstallError, Result};
pub use crate::layout::Layout;
pub use crate::lookup_service::ServiceBinhostLookup;
pub use crate::run_config::{BuildPackagesRunConfig, ProcessEnv, SetupBoardRunConfig};
pub use crate::setup_board::{create, install_toolchain, setup_board};
pub use crate::sysroot::Sysroot;
