//! Worker pool
//!
//! The pool is an actor that owns every worker unit. Other components talk to
//! it through a cheap-to-clone [`PoolHandle`]:
//!
//! - the subscription spawns the initial workers and destroys the pool on
//!   shutdown
//! - the scaling controller reads snapshots and grows or shrinks the pool
//! - in direct mode the stream reader dispatches frames through a
//!   [`Dispatcher`] fed by the pool's published mailboxes
//!
//! # Supervision
//!
//! Each worker runs as its own task. A worker that panics or fails to
//! initialize is reported through the error handler and replaced. In direct
//! mode the replacement reuses the slot's id; in queue mode it gets a fresh id
//! and picks up the dead worker's claims once they expire.

mod dispatch;
mod handle;
mod supervisor;

use std::{fmt, time::Duration};

use skyline_core::{PoolConfig, ScalingConfig};

pub use self::{
  dispatch::{DispatchCancelled, Dispatcher, Mailbox, Routes},
  handle::{PoolHandle, SendError},
};
pub(crate) use self::supervisor::PoolActor;
use crate::worker::WorkerStats;

/// Stable identifier of a worker slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(pub u64);

impl fmt::Display for WorkerId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// Pool sizing and scaling parameters, resolved from config.
#[derive(Debug, Clone)]
pub struct PoolSettings {
  pub min_workers: usize,
  pub max_workers: usize,
  pub scale_check_interval: Duration,
  pub initial_delay: Duration,
  pub debounce_ticks: u32,
  pub scaling: ScalingConfig,
}

impl PoolSettings {
  pub fn from_config(config: &PoolConfig) -> Self {
    Self {
      min_workers: config.min_workers,
      max_workers: config.max_workers.max(config.min_workers),
      scale_check_interval: config.scale_check_interval(),
      initial_delay: config.initial_delay(),
      debounce_ticks: config.debounce_ticks.max(1),
      scaling: config.scaling.clone(),
    }
  }

  /// Clamp a target size into `[min_workers, max_workers]`.
  pub fn clamp(&self, size: usize) -> usize {
    size.clamp(self.min_workers, self.max_workers)
  }
}

/// Point-in-time view of the live (non-terminating) workers.
#[derive(Debug, Clone, Default)]
pub struct PoolSnapshot {
  pub workers: Vec<(WorkerId, WorkerStats)>,
}

impl PoolSnapshot {
  pub fn size(&self) -> usize {
    self.workers.len()
  }

  pub fn ids(&self) -> Vec<WorkerId> {
    self.workers.iter().map(|(id, _)| *id).collect()
  }

  pub fn stats(&self) -> impl Iterator<Item = &WorkerStats> {
    self.workers.iter().map(|(_, stats)| stats)
  }
}
