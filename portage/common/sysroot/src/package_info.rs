// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use anyhow::{bail, Result};
use lazy_static::lazy_static;
use regex::Regex;
use std::{fmt, str::FromStr};

lazy_static! {
    static ref CPV_RE: Regex = Regex::new(
        r"^(?P<category>[\w+][\w+.-]*)/(?P<package>[\w+][\w+-]*?)(?:-(?P<version>\d+(?:\.\d+)*[a-z]?(?:_(?:alpha|beta|pre|rc|p)\d*)*)(?:-r(?P<revision>\d+))?)?$"
    )
    .unwrap();
}

/// A Portage package reference: `category/package` with an optional
/// `-version[-rN]` suffix.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PackageInfo {
    pub category: String,
    pub package: String,
    pub version: Option<String>,
    pub revision: u32,
}

impl PackageInfo {
    pub fn parse(s: &str) -> Result<Self> {
        let Some(caps) = CPV_RE.captures(s.trim()) else {
            bail!("Invalid package atom: {s:?}");
        };
        Ok(Self {
            category: caps["category"].to_owned(),
            package: caps["package"].to_owned(),
            version: caps.name("version").map(|m| m.as_str().to_owned()),
            revision: match caps.name("revision") {
                Some(m) => m.as_str().parse()?,
                None => 0,
            },
        })
    }

    /// `category/package`.
    pub fn cp(&self) -> String {
        format!("{}/{}", self.category, self.package)
    }

    /// `version[-rN]`, omitting a zero revision.
    pub fn pvr(&self) -> Option<String> {
        self.version.as_ref().map(|version| match self.revision {
            0 => version.clone(),
            revision => format!("{version}-r{revision}"),
        })
    }

    /// `package-version[-rN]`, the name Portage gives logs and binpkgs.
    pub fn pf(&self) -> String {
        match self.pvr() {
            Some(pvr) => format!("{}-{}", self.package, pvr),
            None => self.package.clone(),
        }
    }

    /// `category/package-version[-rN]`.
    pub fn cpvr(&self) -> String {
        format!("{}/{}", self.category, self.pf())
    }
}

impl FromStr for PackageInfo {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for PackageInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.cpvr())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_cpv_with_revision() -> Result<()> {
        let pkg = PackageInfo::parse("cat/pkg-2-r2")?;
        assert_eq!(pkg.category, "cat");
        assert_eq!(pkg.package, "pkg");
        assert_eq!(pkg.version.as_deref(), Some("2"));
        assert_eq!(pkg.revision, 2);
        assert_eq!(pkg.cpvr(), "cat/pkg-2-r2");
        Ok(())
    }

    #[test]
    fn parses_hyphenated_names() -> Result<()> {
        let pkg = PackageInfo::parse("chromeos-base/tast-build-deps-0.0.1_pre20240101-r15")?;
        assert_eq!(pkg.cp(), "chromeos-base/tast-build-deps");
        assert_eq!(pkg.pvr().as_deref(), Some("0.0.1_pre20240101-r15"));
        assert_eq!(pkg.pf(), "tast-build-deps-0.0.1_pre20240101-r15");
        Ok(())
    }

    #[test]
    fn parses_cp_without_version() -> Result<()> {
        let pkg = PackageInfo::parse("virtual/target-os-factory-shim")?;
        assert_eq!(pkg.package, "target-os-factory-shim");
        assert_eq!(pkg.version, None);
        assert_eq!(pkg.to_string(), "virtual/target-os-factory-shim");
        Ok(())
    }

    #[test]
    fn rejects_bare_names() {
        assert!(PackageInfo::parse("glibc").is_err());
        assert!(PackageInfo::parse("").is_err());
    }
}
