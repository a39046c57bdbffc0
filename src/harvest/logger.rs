//! Structured logging for the harvester
//!
//! Console output always goes to stderr. When enabled, a daily rolling file in
//! the configured log directory receives the same events, as JSON or as plain
//! lines. `RUST_LOG` overrides the configured level.

use std::path::Path;

use thiserror::Error;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan, time::UtcTime},
    prelude::*,
};

use crate::harvest::config_loader::{LogFormat, Logging};

/// Error types for logging
#[derive(Error, Debug)]
pub enum LoggerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Logging error: {0}")]
    Logging(String),
}

/// Result type for logging operations
pub type LoggerResult<T> = Result<T, LoggerError>;

/// Keeps the file writer alive; dropping it flushes pending lines.
pub struct LoggerGuard {
    _file_guard: Option<WorkerGuard>,
}

/// Install the global subscriber.
pub fn init_logger(logging: &Logging, log_dir: &Path) -> LoggerResult<LoggerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.log_level))
        .map_err(|e| LoggerError::Logging(e.to_string()))?;

    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .boxed();

    let (file_layer, file_guard) = if logging.log_to_file {
        if !log_dir.exists() {
            std::fs::create_dir_all(log_dir)?;
        }
        let file_appender = RollingFileAppender::new(Rotation::DAILY, log_dir, "image_harvester.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        let layer = match logging.log_format {
            LogFormat::Json => fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_timer(UtcTime::rfc_3339())
                .with_span_events(FmtSpan::CLOSE)
                .boxed(),
            LogFormat::Line => fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_timer(UtcTime::rfc_3339())
                .with_span_events(FmtSpan::CLOSE)
                .boxed(),
        };
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| LoggerError::Logging(e.to_string()))?;

    info!(
        log_format = ?logging.log_format,
        log_level = logging.log_level.as_str(),
        "Logger initialized"
    );

    Ok(LoggerGuard {
        _file_guard: file_guard,
    })
}
