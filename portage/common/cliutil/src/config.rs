// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::LoggingConfig;

/// Startup options for [`crate::cli_main`].
pub struct Config {
    pub(crate) logging: LoggingConfig,
    pub(crate) log_command_line: bool,
}

impl Config {
    pub fn new(logging: LoggingConfig) -> Self {
        Self {
            logging,
            log_command_line: true,
        }
    }

    /// Skips the `COMMAND:` line at startup.
    pub fn quiet(mut self) -> Self {
        self.log_command_line = false;
        self
    }
}

impl Default for Config {
    /// Reads the logging destinations from `CHROMITE_*`. A malformed
    /// environment degrades to console logging so the run can still report
    /// its own errors.
    fn default() -> Self {
        let logging = LoggingConfig::from_env().unwrap_or_else(|error| {
            eprintln!("WARNING: ignoring logging environment: {error:#}");
            LoggingConfig::console_only()
        });
        Self::new(logging)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quiet_keeps_logging() {
        let config = Config::new(LoggingConfig::console_only()).quiet();
        assert!(!config.log_command_line);
        assert_eq!(config.logging, LoggingConfig::console_only());
    }
}
