//! tracing subscriber setup: stderr always, plus an optional daily log file.

use color_eyre::{eyre::eyre, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{Config, LogConfig};

/// Install the global subscriber. Keep the returned guard alive until exit so
/// buffered file output is flushed.
pub fn init(config: &LogConfig) -> Result<Option<WorkerGuard>> {
  let filter =
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

  let stderr_layer = fmt::layer()
    .with_writer(std::io::stderr)
    .with_target(false);

  if config.file {
    let log_dir = Config::data_dir()?;
    std::fs::create_dir_all(&log_dir)
      .map_err(|e| eyre!("Failed to create log directory: {}", e))?;

    let file_appender = tracing_appender::rolling::daily(&log_dir, "outpost.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let file_layer = fmt::layer()
      .with_writer(non_blocking)
      .with_ansi(false);

    tracing_subscriber::registry()
      .with(filter)
      .with(stderr_layer)
      .with(file_layer)
      .try_init()
      .map_err(|e| eyre!("Failed to install tracing subscriber: {}", e))?;

    Ok(Some(guard))
  } else {
    tracing_subscriber::registry()
      .with(filter)
      .with(stderr_layer)
      .try_init()
      .map_err(|e| eyre!("Failed to install tracing subscriber: {}", e))?;

    Ok(None)
  }
}
