use crate::config::LoggingConfig;
use anyhow::{Context, Result};
use std::fs;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Build the `EnvFilter`; `RUST_LOG` wins over the configured level
fn env_filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level))
}

/// Setup logging from the loop configuration.
///
/// Console output (plain or JSON) and a daily rotating file are both optional.
///
/// # Returns
/// The file writer's guard when file logging is enabled; it must be held for
/// the duration of the program to keep logging active
pub fn init_logging(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let (file_layer, guard) = match config.log_dir() {
        Some(log_dir) => {
            if !log_dir.exists() {
                fs::create_dir_all(&log_dir)
                    .with_context(|| format!("Failed to create log directory: {}", log_dir))?;
            }
            let file_appender = rolling::daily(log_dir.as_std_path(), &config.file_prefix);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false) // No ANSI codes in log files
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let (plain_console, json_console) = match (config.console, config.json) {
        (false, _) => (None, None),
        (true, false) => (Some(tracing_subscriber::fmt::layer().with_target(false)), None),
        (true, true) => (None, Some(tracing_subscriber::fmt::layer().json())),
    };

    tracing_subscriber::registry()
        .with(env_filter(config))
        .with(file_layer)
        .with(plain_console)
        .with(json_console)
        .try_init()
        .context("A global tracing subscriber is already installed")?;

    tracing::info!(
        "Logging initialized: level={}, console={}, json={}, dir={:?}",
        config.level,
        config.console,
        config.json,
        config.log_dir
    );

    Ok(guard)
}
