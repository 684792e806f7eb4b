// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::constants::SDK_BOARD;

fn default_name() -> String {
    SDK_BOARD.to_owned()
}

fn default_profile() -> String {
    "base".to_owned()
}

/// A board (or the SDK itself) that packages are built for.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildTarget {
    #[serde(default = "default_name")]
    name: String,
    #[serde(default = "default_profile")]
    profile: String,
    root: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    public: Option<bool>,
}

impl BuildTarget {
    /// A target rooted at the conventional `/build/<name>`.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            profile: default_profile(),
            root: Path::new("/build").join(name),
            public: None,
        }
    }

    pub fn with_profile(self, profile: &str) -> Self {
        Self {
            profile: profile.to_owned(),
            ..self
        }
    }

    pub fn with_root(self, root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..self
        }
    }

    pub fn with_public(self, public: Option<bool>) -> Self {
        Self { public, ..self }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn profile(&self) -> &str {
        &self.profile
    }

    /// Whether the profile was chosen by the caller rather than defaulted.
    pub fn has_custom_profile(&self) -> bool {
        self.profile != default_profile()
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn public(&self) -> Option<bool> {
        self.public
    }

    /// The build root holding the board's build-time dependencies.
    pub fn broot(&self) -> PathBuf {
        self.root.join("build/broot")
    }

    pub fn is_host(&self) -> bool {
        self.name.ends_with("-host")
    }

    /// The board-specific wrapper of a Portage tool, e.g. `emerge-eve`.
    pub fn get_command(&self, base: &str) -> String {
        if self.is_host() {
            base.to_owned()
        } else {
            format!("{base}-{}", self.name)
        }
    }

    pub fn full_path(&self, rel: impl AsRef<Path>) -> PathBuf {
        let rel = rel.as_ref();
        self.root.join(rel.strip_prefix("/").unwrap_or(rel))
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Invalid build target config")
    }
}
