//! Indexing service boundary
//!
//! The engine never persists anything itself. Each worker asks the
//! [`IndexingFactory`] for its own [`IndexingService`] during its init
//! handshake and applies domain events through it. Implementations must be
//! idempotent per `(uri, cid)` and `(did, rev)`: delivery is at-least-once and
//! two workers may touch the same repository concurrently.

mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use skyline_core::IndexingConfig;

pub use memory::{ActorState, IndexSnapshot, MemoryIndex, StoredRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteAction {
  Create,
  Update,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum IndexError {
  #[error("failed to connect indexing service: {0}")]
  Connect(String),
  #[error("store error: {0}")]
  Store(String),
  #[error("identity resolution failed for {did}: {reason}")]
  Resolution { did: String, reason: String },
}

#[async_trait]
pub trait IndexingService: Send + Sync {
  /// Upsert a record body under its content identifier.
  async fn index_record(
    &self,
    uri: &str,
    cid: &str,
    record: &Value,
    action: WriteAction,
    time: &str,
  ) -> Result<(), IndexError>;

  async fn delete_record(&self, uri: &str) -> Result<(), IndexError>;

  /// Resolve and index the handle for `did`. `force` marks the result
  /// authoritative even if a fresher one is cached.
  async fn index_handle(&self, did: &str, time: &str, force: bool) -> Result<(), IndexError>;

  async fn update_actor_status(&self, did: &str, active: bool, status: Option<&str>) -> Result<(), IndexError>;

  /// Remove everything indexed for `did`.
  async fn delete_actor(&self, did: &str) -> Result<(), IndexError>;

  async fn set_commit_last_seen(&self, did: &str, commit: Option<&str>, rev: &str) -> Result<(), IndexError>;
}

/// Builds one isolated indexing service per worker.
#[async_trait]
pub trait IndexingFactory: Send + Sync {
  async fn connect(&self, config: &IndexingConfig) -> Result<Arc<dyn IndexingService>, IndexError>;
}
