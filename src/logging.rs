use std::path::Path;

use file_rotate::compression::Compression;
use file_rotate::suffix::AppendCount;
use file_rotate::{ContentLimit, FileRotate};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::{AppError, AppResult};

pub const LOG_ENV: &str = "FIELDSYNC_LOG";
pub const DEFAULT_FILTER: &str = "fieldsync=info,sqlx=warn";
const LOG_FILE_NAME: &str = "fieldsync.log";
const LOG_MAX_BYTES: usize = 5 * 1024 * 1024;
const LOG_MAX_FILES: usize = 5;

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// JSON logs to stderr. Later calls are no-ops.
pub fn init_logging() {
    let _ = tracing_log::LogTracer::init();
    let _ = tracing_subscriber::registry()
        .with(env_filter())
        .with(
            fmt::layer()
                .json()
                .with_target(true)
                .with_timer(UtcTime::rfc_3339())
                .with_writer(std::io::stderr),
        )
        .try_init();
}

/// Like [`init_logging`], plus a size-rotated JSON file under `dir`. Keep
/// the returned guard alive or buffered lines are lost on exit.
pub fn init_file_logging(dir: &Path) -> AppResult<WorkerGuard> {
    std::fs::create_dir_all(dir).map_err(|err| {
        AppError::new("LOGGING/DIR_CREATE_FAILED", "Failed to create log directory")
            .with_context("path", dir.display().to_string())
            .with_cause(err)
    })?;
    let rotate = FileRotate::new(
        dir.join(LOG_FILE_NAME),
        AppendCount::new(LOG_MAX_FILES),
        ContentLimit::Bytes(LOG_MAX_BYTES),
        Compression::None,
        #[cfg(unix)]
        None,
    );
    let (writer, guard) = tracing_appender::non_blocking(rotate);

    let _ = tracing_log::LogTracer::init();
    let _ = tracing_subscriber::registry()
        .with(env_filter())
        .with(
            fmt::layer()
                .json()
                .with_target(true)
                .with_timer(UtcTime::rfc_3339())
                .with_writer(std::io::stderr),
        )
        .with(
            fmt::layer()
                .json()
                .with_target(true)
                .with_ansi(false)
                .with_timer(UtcTime::rfc_3339())
                .with_writer(writer),
        )
        .try_init();
    Ok(guard)
}
