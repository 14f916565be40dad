//! Skyline - autoscaling firehose ingestion

use std::{
  path::{Path, PathBuf},
  sync::Arc,
};

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use skyline::{FirehoseSubscription, indexing::MemoryIndex};
use skyline_core::{Config, DeliveryMode, ScalingConfig};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod logging;

use logging::{init_cli_logging, init_run_logging};

#[derive(Parser)]
#[command(name = "skyline")]
#[command(about = "Autoscaling firehose ingestion and delivery")]
#[command(after_help = "\
QUICK START:
  skyline config init             # Write a default config file
  skyline run                     # Subscribe using the config file
  skyline run --direct            # Skip the relay queue (frames may be lost)")]
struct Cli {
  /// Config file (default: ~/.config/skyline/config.toml)
  #[arg(long, global = true, value_name = "PATH")]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Subscribe to the firehose until interrupted
  Run(RunArgs),
  /// Manage configuration
  Config {
    #[command(subcommand)]
    command: ConfigCommand,
  },
}

/// Overrides applied on top of the config file
#[derive(Args, Debug, Default)]
struct RunArgs {
  /// Relay or PDS URL
  #[arg(long)]
  service: Option<String>,
  /// Sequence to start from when nothing is queued
  #[arg(long)]
  cursor: Option<i64>,
  /// Deliver straight to workers without the relay queue
  #[arg(long)]
  direct: bool,
  #[arg(long)]
  min_workers: Option<usize>,
  #[arg(long)]
  max_workers: Option<usize>,
  /// Log to a rolling file instead of the console
  #[arg(long)]
  log_file: bool,
}

#[derive(Subcommand)]
enum ConfigCommand {
  /// Write the default config template to the user config path
  Init {
    /// Overwrite an existing file
    #[arg(long)]
    force: bool,
  },
  /// Print the effective configuration
  Show,
}

impl RunArgs {
  fn apply(&self, config: &mut Config) {
    if let Some(service) = &self.service {
      config.firehose.service = service.clone();
    }
    if let Some(cursor) = self.cursor {
      config.firehose.cursor = Some(cursor);
    }
    if let Some(min) = self.min_workers {
      config.pool.min_workers = min;
    }
    if let Some(max) = self.max_workers {
      config.pool.max_workers = max;
    }
    if self.direct {
      config.queue.mode = DeliveryMode::Direct;
      // Direct delivery has no backlog to measure
      if matches!(config.pool.scaling, ScalingConfig::Backlog { .. }) {
        config.pool.scaling = ScalingConfig::default_latency();
      }
    }
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  let cli = Cli::parse();

  match cli.command {
    Commands::Run(args) => cmd_run(cli.config.as_deref(), args).await,
    Commands::Config { command } => {
      init_cli_logging();
      match command {
        ConfigCommand::Init { force } => cmd_config_init(force),
        ConfigCommand::Show => cmd_config_show(cli.config.as_deref()),
      }
    }
  }
}

async fn cmd_run(config_path: Option<&Path>, args: RunArgs) -> Result<()> {
  let mut config = Config::load(config_path)?;
  args.apply(&mut config);
  config.validate()?;

  let _guard = init_run_logging(&config.logging, args.log_file);
  info!(
    service = %config.firehose.service,
    mode = ?config.queue.mode,
    min = config.pool.min_workers,
    max = config.pool.max_workers,
    "Starting skyline"
  );

  let cancel = CancellationToken::new();
  tokio::spawn(shutdown_on_signal(cancel.clone()));

  let subscription = FirehoseSubscription::new(config, Arc::new(MemoryIndex::new()));
  subscription.run(cancel).await?;

  info!("Skyline stopped");
  Ok(())
}

/// Cancel on Ctrl-C or SIGTERM.
async fn shutdown_on_signal(cancel: CancellationToken) {
  #[cfg(unix)]
  let terminate = async {
    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
      Ok(mut stream) => {
        stream.recv().await;
      }
      Err(e) => {
        warn!(error = %e, "Failed to listen for SIGTERM");
        std::future::pending::<()>().await;
      }
    }
  };
  #[cfg(not(unix))]
  let terminate = std::future::pending::<()>();

  tokio::select! {
    result = tokio::signal::ctrl_c() => {
      if let Err(e) = result {
        warn!(error = %e, "Failed to listen for ctrl-c");
        return;
      }
      info!("Received ctrl-c, shutting down...");
    }
    _ = terminate => info!("Received SIGTERM, shutting down..."),
  }
  cancel.cancel();
}

fn cmd_config_init(force: bool) -> Result<()> {
  let Some(path) = Config::user_config_path() else {
    bail!("Cannot determine a config directory; pass --config to `skyline run` instead");
  };
  write_template(&path, force)?;

  println!("Created config: {}", path.display());
  println!("Edit the file to customize settings.");
  Ok(())
}

fn write_template(path: &Path, force: bool) -> Result<()> {
  if path.exists() && !force {
    bail!("Config file already exists: {} (use --force to overwrite)", path.display());
  }
  if let Some(parent) = path.parent() {
    std::fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
  }
  std::fs::write(path, Config::generate_template()).with_context(|| format!("writing {}", path.display()))?;
  Ok(())
}

fn cmd_config_show(config_path: Option<&Path>) -> Result<()> {
  let config = Config::load(config_path)?;

  match config_path.map(Path::to_path_buf).or_else(Config::user_config_path) {
    Some(path) if path.exists() => println!("# Using config: {}", path.display()),
    _ => println!("# Using default configuration (no config file found)"),
  }
  println!();
  println!("{}", config.to_toml()?);

  if let Err(e) = config.validate() {
    warn!("{e}");
  }
  Ok(())
}
