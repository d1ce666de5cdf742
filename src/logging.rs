//! Tracing subscriber setup.
//!
//! Console output is always on. When a log directory is configured, records
//! are also written to a daily rolling file through a non-blocking writer;
//! the returned guard must be held until exit so buffered lines are flushed.

use crate::config::LoggingConfig;
use crate::constants::LOG_FILE_NAME;
use crate::error::{Error, Result};
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_log::LogTracer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

/// Builds the filter: `RUST_LOG` wins, then the configured directive, then
/// the configured level.
pub fn env_filter(config: &LoggingConfig) -> EnvFilter {
    let level: Level = config.level.parse().unwrap_or(Level::INFO);
    let directives = config.filter.as_deref().unwrap_or("");

    match std::env::var(EnvFilter::DEFAULT_ENV) {
        Ok(env) if !env.is_empty() => EnvFilter::builder()
            .with_default_directive(level.into())
            .parse_lossy(env),
        _ => EnvFilter::builder()
            .with_default_directive(level.into())
            .parse_lossy(directives),
    }
}

/// Installs the global subscriber.
pub fn init(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    LogTracer::init()
        .map_err(|e| Error::Internal(format!("Failed to initialize log tracer: {}", e)))?;

    let console = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .boxed();

    let (file, guard) = match &config.dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = RollingFileAppender::new(Rotation::DAILY, dir, LOG_FILE_NAME);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let layer = if config.json {
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_writer(non_blocking)
                    .boxed()
            } else {
                fmt::layer()
                    .with_ansi(false)
                    .with_target(true)
                    .with_writer(non_blocking)
                    .boxed()
            };
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter(config))
        .with(console)
        .with(file)
        .try_init()
        .map_err(|e| Error::Internal(format!("Failed to initialize tracing: {}", e)))?;

    Ok(guard)
}
