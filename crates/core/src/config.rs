//! Configuration system for Skyline.
//!
//! Config priority: explicit path > `$SKYLINE_CONFIG_DIR/config.toml` >
//! `$XDG_CONFIG_HOME/skyline/config.toml` > platform config dir. A missing file
//! means defaults; a file that exists but fails to parse is an error.
//!
//! Everything here is fixed for the lifetime of a subscription. There is no
//! runtime reconfiguration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

// ============================================================================
// Firehose Configuration
// ============================================================================

/// Upstream firehose connection settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FirehoseConfig {
  /// Relay or PDS base URL (e.g., "wss://bsky.network")
  pub service: String,

  /// Sequence to resume from when the relay queue holds nothing older
  #[serde(skip_serializing_if = "Option::is_none")]
  pub cursor: Option<i64>,

  /// Seconds without a frame before the connection is considered dead
  pub idle_timeout_secs: u64,

  /// First reconnect delay after a failed connection attempt
  pub reconnect_initial_backoff_ms: u64,

  /// Upper bound for the reconnect delay
  pub reconnect_max_backoff_ms: u64,
}

impl Default for FirehoseConfig {
  fn default() -> Self {
    Self {
      service: "wss://bsky.network".to_string(),
      cursor: None,
      idle_timeout_secs: 60,
      reconnect_initial_backoff_ms: 250,
      reconnect_max_backoff_ms: 30_000,
    }
  }
}

impl FirehoseConfig {
  pub fn idle_timeout(&self) -> Duration {
    Duration::from_secs(self.idle_timeout_secs)
  }
}

// ============================================================================
// Queue Configuration
// ============================================================================

/// How frames travel from the stream reader to the workers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
  /// Frames are appended to a durable Redis stream and claimed by workers.
  /// At-least-once: unacked entries are reclaimed after the claim timeout.
  #[default]
  Queue,
  /// Frames are pushed round-robin into worker mailboxes. Faster, but a
  /// frame in flight on a crashed worker is lost.
  Direct,
}

/// Durable relay queue settings (used when `mode = "queue"`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
  /// Delivery mode: "queue" or "direct"
  pub mode: DeliveryMode,

  /// Redis connection URL
  pub redis_url: String,

  /// Stream key holding pending frames
  pub stream_name: String,

  /// Consumer group shared by all workers
  pub group_name: String,

  /// Claims older than this are reclaimable by any worker
  pub claim_timeout_ms: u64,

  /// How long a claim blocks when the stream is empty
  pub block_ms: u64,
}

impl Default for QueueConfig {
  fn default() -> Self {
    Self {
      mode: DeliveryMode::Queue,
      redis_url: "redis://127.0.0.1:6379".to_string(),
      stream_name: "bsky_indexer:firehose".to_string(),
      group_name: "bsky_indexer_consumers".to_string(),
      claim_timeout_ms: 60_000,
      block_ms: 1_000,
    }
  }
}

impl QueueConfig {
  pub fn claim_timeout(&self) -> Duration {
    Duration::from_millis(self.claim_timeout_ms)
  }

  pub fn block(&self) -> Duration {
    Duration::from_millis(self.block_ms)
  }
}

// ============================================================================
// Pool Configuration
// ============================================================================

/// Autoscaling signal. One strategy per deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "lowercase")]
pub enum ScalingConfig {
  /// Scale on relay queue depth (queue mode only)
  Backlog {
    /// Growing backlog above this counts toward scale-up
    #[serde(default = "default_high_water")]
    high_water: u64,
    /// Backlog above this counts toward scale-up regardless of trend
    #[serde(default = "default_ceiling")]
    ceiling: u64,
    /// Backlog below this allows removing one worker per tick
    #[serde(default = "default_low_water")]
    low_water: u64,
  },
  /// Scale on mean worker latency (event time to apply time)
  Latency {
    #[serde(default = "default_target_latency_ms")]
    target_latency_ms: u64,
  },
}

fn default_high_water() -> u64 {
  5_000
}
fn default_ceiling() -> u64 {
  75_000
}
fn default_low_water() -> u64 {
  500
}
fn default_target_latency_ms() -> u64 {
  10_000
}

impl ScalingConfig {
  /// Latency strategy with the default target
  pub fn default_latency() -> Self {
    ScalingConfig::Latency {
      target_latency_ms: default_target_latency_ms(),
    }
  }
}

impl Default for ScalingConfig {
  fn default() -> Self {
    ScalingConfig::Backlog {
      high_water: default_high_water(),
      ceiling: default_ceiling(),
      low_water: default_low_water(),
    }
  }
}

/// Worker pool sizing and autoscaling settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
  /// Workers started at boot and the floor for scale-down
  pub min_workers: usize,

  /// Ceiling for scale-up. Defaults to the CPU count.
  pub max_workers: usize,

  /// Controller tick interval
  pub scale_check_interval_ms: u64,

  /// Delay before the first controller tick, so workers can become ready
  pub initial_delay_ms: u64,

  /// Consecutive qualifying ticks required before scaling up
  pub debounce_ticks: u32,

  /// Scaling signal
  pub scaling: ScalingConfig,
}

impl Default for PoolConfig {
  fn default() -> Self {
    Self {
      min_workers: 2,
      max_workers: num_cpus::get().max(2),
      scale_check_interval_ms: 5_000,
      initial_delay_ms: 30_000,
      debounce_ticks: 3,
      scaling: ScalingConfig::default(),
    }
  }
}

impl PoolConfig {
  pub fn scale_check_interval(&self) -> Duration {
    Duration::from_millis(self.scale_check_interval_ms)
  }

  pub fn initial_delay(&self) -> Duration {
    Duration::from_millis(self.initial_delay_ms)
  }
}

// ============================================================================
// Worker Configuration
// ============================================================================

/// Per-worker processing settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
  /// Maximum concurrent applies per worker
  pub concurrency: usize,

  /// Number of samples in the rolling processing-time window
  pub stats_window: usize,

  /// Time allowed for in-flight applies to finish on shutdown
  pub shutdown_grace_ms: u64,

  /// Skip repeat handle refreshes for the same DID within this window
  pub handle_refresh_ttl_secs: u64,

  /// Delay before a replacement worker starts after a fault
  pub restart_delay_ms: u64,
}

impl Default for WorkerConfig {
  fn default() -> Self {
    Self {
      concurrency: 50,
      stats_window: 100,
      shutdown_grace_ms: 10_000,
      handle_refresh_ttl_secs: 300,
      restart_delay_ms: 1_000,
    }
  }
}

impl WorkerConfig {
  pub fn shutdown_grace(&self) -> Duration {
    Duration::from_millis(self.shutdown_grace_ms)
  }

  pub fn handle_refresh_ttl(&self) -> Duration {
    Duration::from_secs(self.handle_refresh_ttl_secs)
  }

  pub fn restart_delay(&self) -> Duration {
    Duration::from_millis(self.restart_delay_ms)
  }
}

// ============================================================================
// Indexing Configuration
// ============================================================================

/// Connection parameters handed to each worker's indexing service at init.
///
/// The engine never interprets these; they are passed through to the
/// `IndexingFactory` supplied by the embedder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexingConfig {
  /// Postgres URL for the index store
  #[serde(skip_serializing_if = "Option::is_none")]
  pub database_url: Option<String>,

  /// Postgres schema
  #[serde(skip_serializing_if = "Option::is_none")]
  pub database_schema: Option<String>,

  /// Connections per worker
  pub pool_size: u32,

  /// DID PLC directory used for identity resolution
  pub plc_url: String,

  /// Identity resolution timeout
  pub resolver_timeout_ms: u64,
}

impl Default for IndexingConfig {
  fn default() -> Self {
    Self {
      database_url: None,
      database_schema: None,
      pool_size: 100,
      plc_url: "https://plc.directory".to_string(),
      resolver_timeout_ms: 60_000,
    }
  }
}

// ============================================================================
// Logging Configuration
// ============================================================================

/// Logging and telemetry settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
  /// Log level: "off", "error", "warn", "info", "debug", "trace"
  pub level: String,

  /// Log file rotation: "daily", "hourly", "never"
  pub rotation: String,

  /// Directory for log files (console only when unset)
  #[serde(skip_serializing_if = "Option::is_none")]
  pub dir: Option<PathBuf>,

  /// Interval for per-worker throughput lines
  pub stats_interval_secs: u64,

  /// Interval for receive/process skew lines
  pub skew_interval_secs: u64,
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
      rotation: "daily".to_string(),
      dir: None,
      stats_interval_secs: 30,
      skew_interval_secs: 10,
    }
  }
}

impl LoggingConfig {
  /// Where log files go: the configured dir, else the user data dir.
  pub fn log_dir(&self) -> Option<PathBuf> {
    self
      .dir
      .clone()
      .or_else(|| dirs::data_local_dir().map(|p| p.join("skyline")))
  }
}

// ============================================================================
// Main Configuration
// ============================================================================

/// Skyline configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Upstream firehose settings
  pub firehose: FirehoseConfig,

  /// Relay queue and delivery mode
  pub queue: QueueConfig,

  /// Pool sizing and autoscaling
  pub pool: PoolConfig,

  /// Per-worker processing
  pub worker: WorkerConfig,

  /// Indexing service connection parameters
  pub indexing: IndexingConfig,

  /// Logging and telemetry
  pub logging: LoggingConfig,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
  #[error("Failed to read config {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("Failed to parse config {path}: {source}")]
  Parse {
    path: PathBuf,
    #[source]
    source: toml::de::Error,
  },
  #[error("Failed to serialize config: {0}")]
  Serialize(#[from] toml::ser::Error),
  #[error("Invalid config: {0}")]
  Invalid(String),
}

impl Config {
  /// Load config from an explicit path, or the user config path, or defaults.
  pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
    if let Some(path) = explicit {
      return Self::load_from(path);
    }

    match Self::user_config_path() {
      Some(path) if path.exists() => Self::load_from(&path),
      _ => Ok(Self::default()),
    }
  }

  /// Load and parse a config file. Missing keys fall back to defaults.
  pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
      path: path.to_path_buf(),
      source,
    })?;

    toml::from_str(&content).map_err(|source| ConfigError::Parse {
      path: path.to_path_buf(),
      source,
    })
  }

  /// Get the user-level config path
  pub fn user_config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("SKYLINE_CONFIG_DIR") {
      return Some(PathBuf::from(path).join("config.toml"));
    }

    if let Ok(path) = std::env::var("XDG_CONFIG_HOME") {
      return Some(PathBuf::from(path).join("skyline").join("config.toml"));
    }

    dirs::config_dir().map(|p: PathBuf| p.join("skyline").join("config.toml"))
  }

  /// Reject combinations the engine cannot run with.
  pub fn validate(&self) -> Result<(), ConfigError> {
    let pool = &self.pool;
    if pool.min_workers == 0 {
      return Err(ConfigError::Invalid("pool.min_workers must be at least 1".into()));
    }
    if pool.min_workers > pool.max_workers {
      return Err(ConfigError::Invalid(format!(
        "pool.min_workers ({}) exceeds pool.max_workers ({})",
        pool.min_workers, pool.max_workers
      )));
    }
    if pool.scale_check_interval_ms == 0 {
      return Err(ConfigError::Invalid("pool.scale_check_interval_ms must be non-zero".into()));
    }
    if pool.debounce_ticks == 0 {
      return Err(ConfigError::Invalid("pool.debounce_ticks must be at least 1".into()));
    }

    match pool.scaling {
      ScalingConfig::Backlog {
        high_water,
        ceiling,
        low_water,
      } => {
        if self.queue.mode == DeliveryMode::Direct {
          return Err(ConfigError::Invalid(
            "backlog scaling needs a relay queue; use the latency strategy with direct delivery".into(),
          ));
        }
        if low_water >= high_water || high_water > ceiling {
          return Err(ConfigError::Invalid(format!(
            "backlog thresholds must satisfy low_water < high_water <= ceiling (got {low_water}, {high_water}, {ceiling})"
          )));
        }
      }
      ScalingConfig::Latency { target_latency_ms } => {
        if target_latency_ms == 0 {
          return Err(ConfigError::Invalid("target_latency_ms must be non-zero".into()));
        }
      }
    }

    if self.worker.concurrency == 0 {
      return Err(ConfigError::Invalid("worker.concurrency must be at least 1".into()));
    }
    if self.worker.stats_window == 0 {
      return Err(ConfigError::Invalid("worker.stats_window must be at least 1".into()));
    }
    if self.queue.mode == DeliveryMode::Queue && self.queue.claim_timeout_ms == 0 {
      return Err(ConfigError::Invalid("queue.claim_timeout_ms must be non-zero".into()));
    }

    Ok(())
  }

  /// Render the effective config as TOML
  pub fn to_toml(&self) -> Result<String, ConfigError> {
    Ok(toml::to_string_pretty(self)?)
  }

  /// Generate a default config file as a string
  pub fn generate_template() -> String {
    let defaults = Self::default();
    let f = &defaults.firehose;
    let q = &defaults.queue;
    let p = &defaults.pool;
    let w = &defaults.worker;
    let i = &defaults.indexing;
    let l = &defaults.logging;

    format!(
      r#"# Skyline Configuration
# Place in ~/.config/skyline/config.toml or pass --config

# ============================================================================
# Firehose
# ============================================================================
[firehose]
# Relay or PDS to subscribe to
service = "{service}"
# Sequence to start from when the relay queue is empty (omit for latest)
# cursor = 0
# Reconnect if no frame arrives for this long
idle_timeout_secs = {idle}
reconnect_initial_backoff_ms = {backoff_initial}
reconnect_max_backoff_ms = {backoff_max}

# ============================================================================
# Delivery
# ============================================================================
[queue]
# "queue": durable Redis stream, at-least-once delivery
# "direct": in-process round-robin, frames on a crashed worker are lost
mode = "queue"
redis_url = "{redis_url}"
stream_name = "{stream}"
group_name = "{group}"
# Unacked claims become reclaimable after this long
claim_timeout_ms = {claim_timeout}
block_ms = {block}

# ============================================================================
# Worker Pool
# ============================================================================
[pool]
min_workers = {min}
max_workers = {max}
scale_check_interval_ms = {interval}
# First scaling check waits for workers to come up
initial_delay_ms = {initial_delay}
debounce_ticks = {debounce}

[pool.scaling]
# "backlog" (queue mode) or "latency"
strategy = "backlog"
high_water = {high}
ceiling = {ceiling}
low_water = {low}
# strategy = "latency"
# target_latency_ms = {target}

# ============================================================================
# Workers
# ============================================================================
[worker]
concurrency = {concurrency}
stats_window = {window}
shutdown_grace_ms = {grace}
handle_refresh_ttl_secs = {refresh_ttl}
restart_delay_ms = {restart}

# ============================================================================
# Indexing Service
# ============================================================================
[indexing]
# database_url = "postgres://localhost/bsky"
# database_schema = "bsky"
pool_size = {pool_size}
plc_url = "{plc_url}"
resolver_timeout_ms = {resolver_timeout}

# ============================================================================
# Logging
# ============================================================================
[logging]
level = "{level}"
rotation = "{rotation}"
# dir = "/var/log/skyline"
stats_interval_secs = {stats_interval}
skew_interval_secs = {skew_interval}
"#,
      service = f.service,
      idle = f.idle_timeout_secs,
      backoff_initial = f.reconnect_initial_backoff_ms,
      backoff_max = f.reconnect_max_backoff_ms,
      redis_url = q.redis_url,
      stream = q.stream_name,
      group = q.group_name,
      claim_timeout = q.claim_timeout_ms,
      block = q.block_ms,
      min = p.min_workers,
      max = p.max_workers,
      interval = p.scale_check_interval_ms,
      initial_delay = p.initial_delay_ms,
      debounce = p.debounce_ticks,
      high = default_high_water(),
      ceiling = default_ceiling(),
      low = default_low_water(),
      target = default_target_latency_ms(),
      concurrency = w.concurrency,
      window = w.stats_window,
      grace = w.shutdown_grace_ms,
      refresh_ttl = w.handle_refresh_ttl_secs,
      restart = w.restart_delay_ms,
      pool_size = i.pool_size,
      plc_url = i.plc_url,
      resolver_timeout = i.resolver_timeout_ms,
      level = l.level,
      rotation = l.rotation,
      stats_interval = l.stats_interval_secs,
      skew_interval = l.skew_interval_secs,
    )
  }
}
