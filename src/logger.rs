//! Logging setup
//!
//! `RUST_LOG` wins when set; otherwise the configured level applies to the whole process.

use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, thiserror::Error)]
pub enum LoggerError {
    #[error("invalid log filter {0:?}")]
    Filter(String),
    #[error("global logger already installed")]
    AlreadyInstalled,
}

fn env_filter(level: &str) -> Result<EnvFilter, LoggerError> {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .map_err(|_| LoggerError::Filter(level.to_string()))
}

/// Install the global subscriber
pub fn init_logger(level: &str) -> Result<(), LoggerError> {
    fmt()
        .with_env_filter(env_filter(level)?)
        .with_file(false)
        .with_line_number(false)
        .with_thread_ids(false)
        .with_target(false)
        .try_init()
        .map_err(|_| LoggerError::AlreadyInstalled)
}
