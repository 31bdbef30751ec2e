//! Structured logging for the fetcher
//!
//! This module provides functionality for:
//! 1. Recording every fetch outcome, dispatched group and written file
//! 2. Including run ID, post ID, origin, status, and timestamp
//! 3. Writing logs to a daily rotating file in JSON or line format, optionally mirrored to the terminal

use std::path::{Path, PathBuf};

use chrono::Utc;
use thiserror::Error;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    EnvFilter, Layer, Registry,
    fmt::{self, format::FmtSpan, time::ChronoUtc},
    prelude::*,
};
use uuid::Uuid;

use crate::danbooru::io::config_loader::AppConfig;
use crate::danbooru::orchestrator::{FetchOutcome, FetchReport};

const LOG_FILE_NAME: &str = "danbooru_fetcher.log";

#[derive(Error, Debug)]
pub enum LoggerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Logging error: {0}")]
    Logging(String),
}

pub type LoggerResult<T> = Result<T, LoggerError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogEntryType {
    Fetch,
    Materialize,
    System,
    Error,
}

impl std::fmt::Display for LogEntryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogEntryType::Fetch => write!(f, "fetch"),
            LogEntryType::Materialize => write!(f, "materialize"),
            LogEntryType::System => write!(f, "system"),
            LogEntryType::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationStatus {
    Completed,
    Skipped,
    Failed,
    Cancelled,
}

impl std::fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationStatus::Completed => write!(f, "completed"),
            OperationStatus::Skipped => write!(f, "skipped"),
            OperationStatus::Failed => write!(f, "failed"),
            OperationStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Owns the subscriber setup. Dropping it flushes the file writer.
pub struct Logger {
    log_dir: PathBuf,
    _guard: Option<WorkerGuard>,
}

impl Logger {
    pub fn new(app_config: &AppConfig) -> LoggerResult<Self> {
        let logging = &app_config.logging;
        let log_dir = PathBuf::from(&app_config.paths.log_directory);
        if logging.log_to_file && !log_dir.exists() {
            std::fs::create_dir_all(&log_dir)?;
        }

        let filter = build_filter(&logging.log_level)?;
        let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();
        let mut guard = None;

        if logging.log_to_file {
            let file_appender = RollingFileAppender::new(Rotation::DAILY, &log_dir, LOG_FILE_NAME);
            let (non_blocking, file_guard) = tracing_appender::non_blocking(file_appender);
            guard = Some(file_guard);

            let layer = match logging.log_format.as_str() {
                "json" => fmt::layer()
                    .json()
                    .with_writer(non_blocking)
                    .with_timer(ChronoUtc::rfc_3339())
                    .with_span_events(FmtSpan::CLOSE)
                    .boxed(),
                _ => fmt::layer()
                    .with_ansi(false)
                    .with_writer(non_blocking)
                    .with_timer(ChronoUtc::rfc_3339())
                    .with_span_events(FmtSpan::CLOSE)
                    .boxed(),
            };
            layers.push(layer);
        }

        if logging.log_to_terminal {
            layers.push(
                fmt::layer()
                    .compact()
                    .with_target(false)
                    .with_writer(std::io::stderr)
                    .boxed(),
            );
        }

        // Also installs the bridge for `log` records.
        tracing_subscriber::registry()
            .with(layers)
            .with(filter)
            .try_init()
            .map_err(|e| LoggerError::Logging(e.to_string()))?;

        info!(
            log_format = logging.log_format.as_str(),
            log_level = logging.log_level.as_str(),
            log_to_file = logging.log_to_file,
            "Logger initialized"
        );

        Ok(Self { log_dir, _guard: guard })
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    pub fn log_fetch(&self, run_id: Uuid, report: &FetchReport) {
        let status = match &report.outcome {
            FetchOutcome::Success(_) | FetchOutcome::Degraded(_, _) => OperationStatus::Completed,
            FetchOutcome::NotFound | FetchOutcome::Forbidden(_) => OperationStatus::Skipped,
            _ => OperationStatus::Failed,
        };
        info!(
            entry_type = %LogEntryType::Fetch,
            run_id = %run_id,
            position = report.position,
            origin = %report.origin,
            post_id = ?report.post_id,
            outcome = report.outcome.kind(),
            status = %status,
            timestamp = %Utc::now().to_rfc3339(),
            "Fetch {} for {}", status, report.origin
        );
    }

    pub fn log_materialize(
        &self,
        run_id: Uuid,
        post_id: u64,
        file_path: &str,
        status: OperationStatus,
        file_size: Option<u64>,
    ) {
        info!(
            entry_type = %LogEntryType::Materialize,
            run_id = %run_id,
            post_id,
            file_path,
            status = %status,
            file_size,
            timestamp = %Utc::now().to_rfc3339(),
            "Materialize {} for post {}", status, post_id
        );
    }

    pub fn log_system_event(&self, event_type: &str, details: &str) {
        info!(
            entry_type = %LogEntryType::System,
            event_type,
            details,
            timestamp = %Utc::now().to_rfc3339(),
            "System event: {}", event_type
        );
    }

    pub fn log_error(&self, run_id: Option<Uuid>, error_type: &str, message: &str, details: Option<&str>) {
        error!(
            entry_type = %LogEntryType::Error,
            run_id = run_id.map(|id| id.to_string()),
            error_type,
            details,
            timestamp = %Utc::now().to_rfc3339(),
            "Error: {}", message
        );
    }
}

/// `RUST_LOG` wins over the configured level.
fn build_filter(level: &str) -> LoggerResult<EnvFilter> {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .map_err(|e| {
            warn!("Invalid log level {:?}: {}", level, e);
            LoggerError::Logging(e.to_string())
        })
}

pub fn init_logger(app_config: &AppConfig) -> LoggerResult<Logger> {
    Logger::new(app_config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_labels() {
        assert_eq!(LogEntryType::Materialize.to_string(), "materialize");
        assert_eq!(OperationStatus::Skipped.to_string(), "skipped");
        assert_eq!(OperationStatus::Cancelled.to_string(), "cancelled");
    }

    #[test]
    fn test_filter_accepts_directives() {
        assert!(build_filter("info").is_ok());
        assert!(build_filter("danbooru_fetcher=debug,reqwest=warn").is_ok());
    }
}
