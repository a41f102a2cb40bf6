//! Structured logging setup.
//!
//! The daemon logs to rolling daily files under `{support_dir}/logs` plus a
//! compact stderr layer for development. The bridge binary must not touch
//! stdout (reserved for JSON-RPC), so it gets a stderr-only variant.
//!
//! Token secrets and message bodies are never passed to the log macros;
//! callers log lengths, ids, and error kinds instead.

use std::fs;
use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize daemon logging: rolling file + stderr.
///
/// Returns a guard that must be held for the process lifetime so buffered
/// log lines are flushed on shutdown.
pub fn init(log_dir: &Path) -> Option<WorkerGuard> {
    let _ = fs::create_dir_all(log_dir);

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("imcpd")
        .filename_suffix("log")
        .max_log_files(5)
        .build(log_dir);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match appender {
        Ok(appender) => {
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file_layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true);
            let stderr_layer = fmt::layer().with_writer(std::io::stderr).compact();
            tracing_subscriber::registry()
                .with(filter)
                .with(file_layer)
                .with(stderr_layer)
                .init();
            Some(guard)
        }
        Err(e) => {
            // Fall back to stderr-only rather than refusing to start.
            init_stderr();
            tracing::warn!("Log file appender unavailable: {}", e);
            None
        }
    }
}

/// Initialize stderr-only logging (bridge binary).
pub fn init_stderr() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}
