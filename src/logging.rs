//! Log setup: daily rolling file in the data directory, plus stderr when
//! running verbose.

use color_eyre::{eyre::eyre, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config;

const DEFAULT_FILTER: &str = "dashsync=info";

/// Install the global subscriber. Keep the returned guard alive for the
/// life of the process or buffered lines are lost.
pub fn init(verbose: bool) -> Result<WorkerGuard> {
  let log_dir = config::data_dir()?.join("logs");
  std::fs::create_dir_all(&log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let appender = tracing_appender::rolling::daily(&log_dir, "dashsync.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);

  let env_filter = EnvFilter::try_from_default_env()
    .or_else(|_| EnvFilter::try_new(DEFAULT_FILTER))
    .map_err(|e| eyre!("Invalid log filter: {}", e))?;

  let file_layer = fmt::layer()
    .with_writer(writer)
    .with_ansi(false)
    .with_target(true)
    .with_filter(env_filter);

  let stderr_layer = verbose.then(|| {
    fmt::layer()
      .with_writer(std::io::stderr)
      .with_target(false)
      .with_filter(EnvFilter::new("dashsync=debug"))
  });

  tracing_subscriber::registry()
    .with(file_layer)
    .with(stderr_layer)
    .try_init()
    .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;

  Ok(guard)
}
