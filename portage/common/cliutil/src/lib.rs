// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Startup and shutdown shared by the sysroot command-line programs.

use itertools::Itertools;
use std::{
    fmt::Debug,
    process::{ExitCode, Termination},
};

mod config;
mod logging;

pub use crate::config::*;
pub use crate::logging::*;

/// Runs `main` with logging configured by `config`.
///
/// A logging setup failure is reported like an error returned from `main`.
pub fn cli_main<F, T, E>(main: F, config: Config) -> ExitCode
where
    F: FnOnce() -> Result<T, E>,
    T: Termination,
    E: Debug,
{
    let Config {
        logging,
        log_command_line,
    } = config;
    let _guard = match logging.setup() {
        Ok(guard) => guard,
        Err(error) => return handle_top_level_result::<ExitCode, _>(Err(error)),
    };
    if log_command_line {
        log_current_command_line();
    }
    handle_top_level_result(main())
}

pub fn log_current_command_line() {
    tracing::info!("COMMAND: {}", escaped_command_line(std::env::args()));
}

pub(crate) fn escaped_command_line(args: impl IntoIterator<Item = String>) -> String {
    args.into_iter()
        .map(|arg| shell_escape::escape(arg.into()))
        .join(" ")
}

/// Turns the result of `main` into an exit code. Errors are printed to stderr
/// with a `FATAL:` prefix whether or not console logging is enabled.
pub fn handle_top_level_result<T: Termination, E: Debug>(result: Result<T, E>) -> ExitCode {
    result.map_or_else(
        |error| {
            eprintln!("FATAL: {}: {error:?}", get_current_process_name());
            ExitCode::FAILURE
        },
        Termination::report,
    )
}

pub(crate) fn get_current_process_name() -> String {
    std::env::current_exe()
        .ok()
        .as_deref()
        .and_then(|exe| exe.file_name())
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "__unknown__".to_owned())
}
