use std::path::Path;

use error_stack::{Report, Result, ResultExt};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{filter::LevelFilter, fmt, prelude::*, EnvFilter};

use crate::error::LoggingError;

fn file_filter(debug: bool) -> EnvFilter {
    let level = if debug { "debug" } else { "info" };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(format!("{level},rumqttc=warn")))
}

/// Install the global subscriber.
///
/// With a log file, detailed records at the requested level go to the file and
/// bare messages at `info` go to stderr. Without one, detailed records go to
/// stderr. `RUST_LOG` replaces the detailed filter. The returned guard must be
/// kept alive until exit so buffered file records are flushed.
pub fn init_logging(debug: bool, log_file: Option<&Path>) -> Result<Option<WorkerGuard>, LoggingError> {
    let Some(path) = log_file else {
        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_filter(file_filter(debug)),
            )
            .try_init()
            .change_context(LoggingError::Init)?;
        return Ok(None);
    };

    let origin = path.display().to_string();
    let file_name = path
        .file_name()
        .ok_or_else(|| Report::new(LoggingError::InvalidLogFile(origin.clone())))?;
    let directory = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::NEVER)
        .filename_prefix(file_name.to_string_lossy())
        .build(directory)
        .change_context_lazy(|| LoggingError::OpenLogFile(origin.clone()))?;
    let (writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_file(true)
                .with_line_number(true)
                .with_filter(file_filter(debug)),
        )
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .without_time()
                .with_level(false)
                .with_target(false)
                .with_filter(LevelFilter::INFO),
        )
        .try_init()
        .change_context(LoggingError::Init)?;

    Ok(Some(guard))
}
