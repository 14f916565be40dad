//! Logging setup for the skyline binary

use skyline_core::LoggingConfig;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

const LOG_FILE: &str = "skyline.log";

/// Console logging for short-lived commands
pub fn init_cli_logging() {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into()))
    .with_target(false)
    .init();
}

/// Parse log level from config string
fn parse_log_level(level: &str) -> tracing::level_filters::LevelFilter {
  use tracing::level_filters::LevelFilter;

  match level.to_lowercase().as_str() {
    "off" => LevelFilter::OFF,
    "error" => LevelFilter::ERROR,
    "warn" => LevelFilter::WARN,
    "info" => LevelFilter::INFO,
    "debug" => LevelFilter::DEBUG,
    "trace" => LevelFilter::TRACE,
    _ => LevelFilter::INFO,
  }
}

/// Initialize logging for `skyline run`.
///
/// Console with colors unless `to_file` is set or the config names a log
/// directory, in which case logs go to a rolling file only.
///
/// Returns the guard that must be kept alive for the duration of the program
pub fn init_run_logging(config: &LoggingConfig, to_file: bool) -> Option<WorkerGuard> {
  let level = parse_log_level(&config.level);

  // RUST_LOG overrides the configured level
  let env_filter = EnvFilter::builder().with_default_directive(level.into()).from_env_lossy();

  let log_dir = if to_file || config.dir.is_some() {
    config.log_dir()
  } else {
    None
  };

  let Some(log_dir) = log_dir else {
    tracing_subscriber::fmt()
      .with_env_filter(env_filter)
      .with_target(true)
      .with_ansi(true)
      .init();
    return None;
  };

  if let Err(e) = std::fs::create_dir_all(&log_dir) {
    // Fall back to console-only logging
    tracing_subscriber::fmt()
      .with_env_filter(env_filter)
      .with_target(true)
      .with_ansi(true)
      .init();
    tracing::warn!(dir = %log_dir.display(), error = %e, "Cannot create log directory, logging to console");
    return None;
  }

  let file_appender = match config.rotation.as_str() {
    "hourly" => tracing_appender::rolling::hourly(&log_dir, LOG_FILE),
    "never" => tracing_appender::rolling::never(&log_dir, LOG_FILE),
    _ => tracing_appender::rolling::daily(&log_dir, LOG_FILE),
  };
  let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

  tracing_subscriber::fmt()
    .with_env_filter(env_filter)
    .with_target(true)
    .with_ansi(false)
    .with_writer(file_writer)
    .init();

  Some(guard)
}
