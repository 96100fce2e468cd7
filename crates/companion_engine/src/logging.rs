//! Process-wide tracing setup for hosts embedding the engine.

use std::fs::OpenOptions;
use std::path::Path;
use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

pub const DEFAULT_LOG_LEVEL: &str = "info";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoggingError {
    #[error("open log file failed ({path}): {message}")]
    OpenLogFile { path: String, message: String },
    #[error("install tracing subscriber failed: {0}")]
    Install(String),
}

/// Builds the filter for `level`, falling back to `info` when the directive
/// does not parse.
pub fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_LEVEL))
}

/// Installs the global subscriber. Logs go to stdout, or are appended to
/// `log_file` without ANSI colors when one is given.
pub fn init_tracing(level: &str, log_file: Option<&Path>) -> Result<(), LoggingError> {
    let filter = env_filter(level);
    let installed = match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|err| LoggingError::OpenLogFile {
                    path: path.display().to_string(),
                    message: err.to_string(),
                })?;
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(file)
                        .with_ansi(false),
                )
                .try_init()
        }
        None => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init(),
    };
    installed.map_err(|err| LoggingError::Install(err.to_string()))
}
