// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use anyhow::{bail, Context, Result};
use std::{
    ffi::OsString,
    fs::File,
    path::{Path, PathBuf},
    sync::Mutex,
    time::SystemTime,
};
use tracing_chrome::{ChromeLayerBuilder, FlushGuard};
use tracing_subscriber::{
    filter::{EnvFilter, LevelFilter},
    prelude::*,
    Layer, Registry,
};

/// Writes a Chrome trace (JSON) to this file, or to a fresh file in this
/// directory. Setting both is an error.
pub const TRACE_FILE_ENV: &str = "CHROMITE_TRACE_FILE";
pub const TRACE_DIR_ENV: &str = "CHROMITE_TRACE_DIR";

/// Like the trace variables, for a plain-text log.
pub const LOG_FILE_ENV: &str = "CHROMITE_LOG_FILE";
pub const LOG_DIR_ENV: &str = "CHROMITE_LOG_DIR";

/// "0" silences the console log.
pub const CONSOLE_LOG_ENV: &str = "CHROMITE_LOG_CONSOLE";

/// Keeps the trace file flushed and the `main` span open until dropped.
pub struct LogGuard {
    _main_span: tracing::span::EnteredSpan,
    _trace_flush: Option<FlushGuard>,
}

/// Where logs and traces go.
///
/// Console and log-file verbosity follows `RUST_LOG` and defaults to INFO.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LoggingConfig {
    pub trace_file: Option<PathBuf>,
    pub log_file: Option<PathBuf>,
    pub console: bool,
}

fn filter() -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy()
}

/// Resolves one `*_FILE`/`*_DIR` pair. A file variable is removed from the
/// environment afterwards: emerge and Bazel inherit it, and must not write
/// into our file.
fn output_path(file_env: &str, dir_env: &str, stamp: &str, ext: &str) -> Result<Option<PathBuf>> {
    let file = std::env::var_os(file_env);
    let dir = std::env::var_os(dir_env);
    Ok(match (file, dir) {
        (Some(_), Some(_)) => bail!("{file_env} and {dir_env} are mutually exclusive"),
        (Some(file), None) => {
            std::env::remove_var(file_env);
            Some(PathBuf::from(file))
        }
        (None, Some(dir)) => {
            let mut name = OsString::from(crate::get_current_process_name());
            name.push(format!(".{stamp}.{ext}"));
            Some(Path::new(&dir).join(name))
        }
        (None, None) => None,
    })
}

fn create(path: &Path, what: &str) -> Result<File> {
    File::create(path).with_context(|| format!("Failed to create {what} {}", path.display()))
}

impl LoggingConfig {
    /// INFO and above to stderr, nothing else.
    pub fn console_only() -> Self {
        Self {
            console: true,
            ..Default::default()
        }
    }

    pub fn from_env() -> Result<Self> {
        let stamp = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos()
            .to_string();
        Ok(Self {
            trace_file: output_path(TRACE_FILE_ENV, TRACE_DIR_ENV, &stamp, "json")?,
            log_file: output_path(LOG_FILE_ENV, LOG_DIR_ENV, &stamp, "log")?,
            console: std::env::var(CONSOLE_LOG_ENV).as_deref() != Ok("0"),
        })
    }

    /// Installs the global subscriber and enters the `main` span.
    pub fn setup(self) -> Result<LogGuard> {
        let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();

        let trace_flush = match &self.trace_file {
            Some(path) => {
                let (layer, guard) = ChromeLayerBuilder::new()
                    .writer(create(path, "trace file")?)
                    .include_args(true)
                    .build();
                layers.push(layer.boxed());
                Some(guard)
            }
            None => None,
        };

        if self.console {
            layers.push(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_filter(filter())
                    .boxed(),
            );
        }

        if let Some(path) = &self.log_file {
            let file = create(path, "log file")?;
            layers.push(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file))
                    .with_filter(filter())
                    .boxed(),
            );
        }

        tracing_subscriber::registry()
            .with(layers)
            .try_init()
            .context("A global tracing subscriber is already installed")?;

        let args = crate::escaped_command_line(std::env::args());
        let main_span = tracing::trace_span!("main", args = args).entered();

        Ok(LogGuard {
            _main_span: main_span,
            _trace_flush: trace_flush,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use fileutil::SafeTempDir;

    // The subscriber is process-global, so this is the only test that calls
    // setup(), and the only one touching the variables.
    #[test]
    fn writes_log_and_trace_files() -> Result<()> {
        let dir = SafeTempDir::new()?;
        let trace_file = dir.path().join("trace.json");
        std::env::set_var("RUST_LOG", "info");
        std::env::set_var(TRACE_FILE_ENV, &trace_file);
        std::env::set_var(LOG_DIR_ENV, dir.path());
        std::env::set_var(CONSOLE_LOG_ENV, "0");

        let config = LoggingConfig::from_env()?;
        assert!(!config.console);
        assert_eq!(config.trace_file.as_deref(), Some(trace_file.as_path()));
        assert!(std::env::var_os(TRACE_FILE_ENV).is_none());
        let log_file = config.log_file.clone().unwrap();
        assert_eq!(log_file.parent(), Some(dir.path()));

        {
            let _guard = config.setup()?;
            tracing::warn!("binhost is stale");
            tracing::info!("emerging 3 packages");
            tracing::debug!("portageq said nothing");
        }

        let log = std::fs::read_to_string(&log_file)?;
        assert!(log.contains("binhost is stale"), "{log}");
        assert!(log.contains("emerging 3 packages"), "{log}");
        assert!(!log.contains("portageq said nothing"), "{log}");

        let trace = std::fs::read_to_string(&trace_file)?;
        assert!(trace.contains("emerging 3 packages"), "{trace}");

        std::env::set_var(TRACE_FILE_ENV, &trace_file);
        std::env::set_var(TRACE_DIR_ENV, dir.path());
        assert!(LoggingConfig::from_env().is_err());
        std::env::remove_var(TRACE_FILE_ENV);
        std::env::remove_var(TRACE_DIR_ENV);
        std::env::remove_var(LOG_DIR_ENV);
        Ok(())
    }

    #[test]
    fn console_only_has_no_files() {
        let config = LoggingConfig::console_only();
        assert!(config.console);
        assert_eq!(config.trace_file, None);
        assert_eq!(config.log_file, None);
    }
}
