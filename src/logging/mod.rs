// Logging module - tracing subscriber setup
//
// Stdout always gets a layer (human-readable or JSON). File logging is opt-in
// and writes JSON through a non-blocking rolling appender; the returned guard
// must live as long as the process or buffered lines are lost.
//
// Precedence for the filter: RUST_LOG env var > config level > "info"

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::{LogRotation, LoggingConfig};

/// Default directive when RUST_LOG is unset
pub fn default_directive(config: &LoggingConfig) -> String {
    format!("lens={},tower_http=info", config.level)
}

/// Install the global subscriber
///
/// Returns the file writer guard when file logging is enabled. Falls back to
/// stdout-only logging (with a warning) if the log directory can't be created.
pub fn init(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive(config)));

    let stdout_layer = if config.json {
        fmt::layer().json().boxed()
    } else {
        fmt::layer().boxed()
    };

    let mut fallback_warning = None;
    let (file_layer, guard) = if config.file_enabled {
        match std::fs::create_dir_all(&config.file_dir) {
            Ok(()) => {
                let appender = match config.file_rotation {
                    LogRotation::Hourly => {
                        tracing_appender::rolling::hourly(&config.file_dir, &config.file_prefix)
                    }
                    LogRotation::Daily => {
                        tracing_appender::rolling::daily(&config.file_dir, &config.file_prefix)
                    }
                    LogRotation::Never => {
                        tracing_appender::rolling::never(&config.file_dir, &config.file_prefix)
                    }
                };

                // Writes happen on a background thread
                let (non_blocking, guard) = tracing_appender::non_blocking(appender);
                let layer = fmt::layer()
                    .json()
                    .with_writer(non_blocking)
                    .with_ansi(false);
                (Some(layer), Some(guard))
            }
            Err(e) => {
                fallback_warning = Some(format!(
                    "Could not create log directory {}: {}; file logging disabled",
                    config.file_dir.display(),
                    e
                ));
                (None, None)
            }
        }
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    if let Some(warning) = fallback_warning {
        tracing::warn!("{}", warning);
    }

    Ok(guard)
}
