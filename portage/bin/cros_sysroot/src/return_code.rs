// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::process::{ExitCode, Termination};

/// Exit codes understood by the build recipes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReturnCode {
    Success = 0,
    /// Also what `cli_main` reports for any error that escapes `main`.
    Unrecoverable = 1,
    /// The command failed and printed the packages responsible.
    UnsuccessfulResponseAvailable = 2,
    /// The command failed with nothing more specific to report.
    CompletedUnsuccessfully = 3,
    /// `--validate-only` found the arguments acceptable.
    ValidInput = 4,
}

impl Termination for ReturnCode {
    fn report(self) -> ExitCode {
        ExitCode::from(self as u8)
    }
}
