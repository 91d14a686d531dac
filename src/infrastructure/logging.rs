//! Tracing initialization for the gateway process.

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::domain::models::config::LoggingConfig;

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over the configured level. When a log directory is
/// configured, a daily-rotated file layer is added; the returned guard
/// must be held for the life of the process so buffered lines flush.
pub fn init(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .context("invalid log level")?;

    let registry = tracing_subscriber::registry().with(filter);

    let mut guard = None;
    let file_layer = config.dir.as_ref().map(|dir| {
        let appender = tracing_appender::rolling::daily(dir, "praktor.log");
        let (writer, g) = tracing_appender::non_blocking(appender);
        guard = Some(g);
        fmt::layer().json().with_writer(writer).boxed()
    });

    if config.format == "json" {
        registry.with(fmt::layer().json().boxed()).with(file_layer).init();
    } else {
        registry.with(fmt::layer().boxed()).with(file_layer).init();
    }

    Ok(guard)
}
