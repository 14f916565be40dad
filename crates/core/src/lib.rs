pub mod config;

pub use config::{
  Config, ConfigError, DeliveryMode, FirehoseConfig, IndexingConfig, LoggingConfig, PoolConfig, QueueConfig,
  ScalingConfig, WorkerConfig,
};
