//! Durable relay queue
//!
//! An ordered append log with consumer-group semantics sitting between the
//! stream reader and the workers:
//!
//! - the reader appends every frame with its sequence number
//! - a worker claims one entry at a time, reclaiming expired claims first
//! - an entry is acked (removed) only after all its events are applied
//!
//! A claim that is never acked becomes reclaimable by any consumer after the
//! claim timeout, so a crashed worker's entries are redelivered. Delivery is
//! at-least-once; the queue does not deduplicate appends.

mod memory;
mod redis;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

pub use self::{memory::MemoryQueue, redis::RedisQueue};

/// A claimed queue entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
  /// Opaque delivery handle used to ack
  pub id: String,
  pub sequence: i64,
  pub payload: Bytes,
  /// Consumer currently holding the claim
  pub owner: String,
  /// True when this claim took over an expired one
  pub reclaimed: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
  #[error("redis: {0}")]
  Redis(#[from] ::redis::RedisError),
  #[error("entry {id} is malformed: {reason}")]
  Malformed { id: String, reason: &'static str },
  #[error("queue closed")]
  Closed,
}

#[async_trait]
pub trait RelayQueue: Send + Sync {
  /// Create the consumer group if it does not exist yet.
  async fn ensure_group(&self) -> Result<(), QueueError>;

  /// Append a frame. Returns the entry id.
  async fn append(&self, sequence: i64, payload: Bytes) -> Result<String, QueueError>;

  /// Claim the next entry for `consumer`.
  ///
  /// Expired claims are taken over first; otherwise a fresh entry is claimed.
  /// Blocks up to the poll interval when the stream is empty, then returns
  /// `None`.
  async fn claim_next(&self, consumer: &str) -> Result<Option<QueueEntry>, QueueError>;

  /// Remove an entry. Call only after its events are fully applied.
  async fn ack(&self, entry_id: &str) -> Result<(), QueueError>;

  /// Entries appended but not yet acked.
  async fn depth(&self) -> Result<u64, QueueError>;

  /// Sequence of the oldest entry still in the queue.
  async fn oldest_sequence(&self) -> Result<Option<i64>, QueueError>;

  /// A handle on the same queue with its own connection, so one consumer's
  /// blocking claim does not stall another's.
  async fn connect_consumer(&self) -> Result<Arc<dyn RelayQueue>, QueueError>;
}
