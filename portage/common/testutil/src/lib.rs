// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Helpers shared by the sysroot crates' tests.

mod fake_runner;

pub use fake_runner::*;

use anyhow::Result;
use std::path::Path;

/// Creates files under `base_dir`, creating parent directories as needed.
pub fn write_files<'a>(
    base_dir: &Path,
    files: impl IntoIterator<Item = (&'a str, &'a str)>,
) -> Result<()> {
    for (rel_path, content) in files {
        let path = base_dir.join(rel_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
    }
    Ok(())
}
