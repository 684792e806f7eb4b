// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use itertools::Itertools;
use processes::{CommandError, CommandOutput};
use std::{collections::BTreeSet, path::PathBuf};
use thiserror::Error;

use crate::{failures::FailedPackage, package_info::PackageInfo};

#[derive(Debug, Error)]
pub enum Error {
    #[error("this command must run inside the SDK chroot")]
    NotInChroot,
    #[error("sysroot {} does not exist", .0.display())]
    InvalidSysroot(PathBuf),
    #[error("this command must not run as root")]
    RootUser,
    #[error("updating the chroot failed ({} failed package(s))", .failed_packages.len())]
    UpdateChroot {
        failed_packages: Vec<PackageInfo>,
        #[source]
        source: CommandError,
    },
    #[error("installing the toolchain failed ({} failed package(s))", .failed_packages.len())]
    ToolchainInstall {
        failed_packages: Vec<PackageInfo>,
        #[source]
        source: CommandError,
    },
    #[error(transparent)]
    PackageInstall(#[from] PackageInstallError),
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("no files to bundle: {0}")]
    NoFiles(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Some packages failed to build or install.
///
/// The sysroot is left as it is so the caller can inspect logs or retry just
/// the failed packages.
#[derive(Debug, Error)]
#[error("{message}{}", describe_failed(.failed_packages))]
pub struct PackageInstallError {
    pub message: String,
    #[source]
    pub source: CommandError,
    pub failed_packages: Vec<FailedPackage>,
}

fn describe_failed(failed: &[FailedPackage]) -> String {
    if failed.is_empty() {
        return String::new();
    }
    format!(
        ": {}",
        failed.iter().map(|f| f.package.cpvr()).join(", ")
    )
}

impl PackageInstallError {
    pub fn new(message: &str, source: CommandError, failed_packages: Vec<FailedPackage>) -> Self {
        Self {
            message: message.to_owned(),
            source,
            failed_packages,
        }
    }

    /// The result of the command that failed, if it ran to completion.
    pub fn result(&self) -> Option<&CommandOutput> {
        self.source.output()
    }

    /// `(category, package)` of every failed package.
    pub fn failed_cps(&self) -> BTreeSet<(String, String)> {
        self.failed_packages
            .iter()
            .map(|f| (f.package.category.clone(), f.package.package.clone()))
            .collect()
    }
}
