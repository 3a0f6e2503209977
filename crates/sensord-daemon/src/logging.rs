//! Logging setup.
//!
//! Everything goes to stderr filtered by `RUST_LOG` (default `sensord=info`).
//! A second, non-blocking layer writes to the log file at its own level.

use std::path::PathBuf;

use clap::ValueEnum;
use directories::ProjectDirs;
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const LOG_TARGET: &str = "sensord";
const LOG_FILE_NAME: &str = "sensord.log";

/// Level of the log file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogFileLevel {
    Off,
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl From<LogFileLevel> for LevelFilter {
    fn from(level: LogFileLevel) -> Self {
        match level {
            LogFileLevel::Off => LevelFilter::OFF,
            LogFileLevel::Error => LevelFilter::ERROR,
            LogFileLevel::Warn => LevelFilter::WARN,
            LogFileLevel::Info => LevelFilter::INFO,
            LogFileLevel::Debug => LevelFilter::DEBUG,
            LogFileLevel::Trace => LevelFilter::TRACE,
        }
    }
}

/// `<cache dir>/sensord/sensord.log`, or the temp dir when there is no home
#[must_use]
pub fn log_file_path() -> PathBuf {
    ProjectDirs::from("", "", LOG_TARGET).map_or_else(
        || std::env::temp_dir().join(LOG_FILE_NAME),
        |dirs| dirs.cache_dir().join(LOG_FILE_NAME),
    )
}

/// Install the global subscriber.
///
/// The returned guard flushes the file writer on drop and must live as long
/// as the process logs.
#[must_use]
pub fn setup_logging(file_level: LogFileLevel) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{LOG_TARGET}=info")));

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_filter(filter);

    let (file_layer, guard) = match open_log_file(file_level) {
        Some((writer, guard)) => {
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true)
                .with_line_number(true)
                .with_filter(Targets::new().with_target(LOG_TARGET, LevelFilter::from(file_level)));
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .init();

    guard
}

fn open_log_file(
    level: LogFileLevel,
) -> Option<(tracing_appender::non_blocking::NonBlocking, WorkerGuard)> {
    if level == LogFileLevel::Off {
        return None;
    }

    let path = log_file_path();
    let dir = path.parent()?;
    if let Err(e) = std::fs::create_dir_all(dir) {
        eprintln!("Cannot create log directory {}: {e}", dir.display());
        return None;
    }

    let file_name = path.file_name()?;
    let appender = tracing_appender::rolling::never(dir, file_name);
    Some(tracing_appender::non_blocking(appender))
}
