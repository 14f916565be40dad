//! Handle for talking to the pool actor

use tokio::sync::{mpsc, oneshot, watch};

use super::{Dispatcher, PoolSnapshot, Routes, WorkerId};

// ============================================================================
// Messages
// ============================================================================

pub(crate) enum PoolCommand {
  Spawn {
    id: Option<WorkerId>,
    reply: oneshot::Sender<Option<WorkerId>>,
  },
  Grow {
    by: usize,
    reply: oneshot::Sender<Vec<WorkerId>>,
  },
  Shrink {
    by: usize,
    reply: oneshot::Sender<Vec<WorkerId>>,
  },
  Terminate {
    id: WorkerId,
    reply: oneshot::Sender<bool>,
  },
  Snapshot {
    reply: oneshot::Sender<PoolSnapshot>,
  },
  DestroyAll {
    reply: oneshot::Sender<()>,
  },
}

// ============================================================================
// Pool Handle
// ============================================================================

/// Handle to communicate with the pool actor
///
/// Cheap to clone. Every request waits for the actor's reply, so a returned
/// size or id list reflects the pool after the change was applied.
#[derive(Clone, Debug)]
pub struct PoolHandle {
  tx: mpsc::Sender<PoolCommand>,
  routes: watch::Receiver<Routes>,
}

impl PoolHandle {
  pub(crate) fn new(tx: mpsc::Sender<PoolCommand>, routes: watch::Receiver<Routes>) -> Self {
    Self { tx, routes }
  }

  async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> PoolCommand) -> Result<T, SendError> {
    let (reply_tx, reply_rx) = oneshot::channel();
    self.tx.send(make(reply_tx)).await.map_err(|_| SendError::ActorGone)?;
    reply_rx.await.map_err(|_| SendError::ActorGone)
  }

  /// Start one worker, optionally under a specific id.
  ///
  /// Returns `None` when the pool is at `max_workers` or the id is taken.
  pub async fn spawn(&self, id: Option<WorkerId>) -> Result<Option<WorkerId>, SendError> {
    self.request(|reply| PoolCommand::Spawn { id, reply }).await
  }

  /// Add up to `by` workers without exceeding `max_workers`.
  pub async fn grow(&self, by: usize) -> Result<Vec<WorkerId>, SendError> {
    self.request(|reply| PoolCommand::Grow { by, reply }).await
  }

  /// Gracefully remove up to `by` workers, newest first, never going below
  /// `min_workers`.
  pub async fn shrink(&self, by: usize) -> Result<Vec<WorkerId>, SendError> {
    self.request(|reply| PoolCommand::Shrink { by, reply }).await
  }

  /// Gracefully stop one worker. Returns false for unknown ids.
  pub async fn terminate(&self, id: WorkerId) -> Result<bool, SendError> {
    self.request(|reply| PoolCommand::Terminate { id, reply }).await
  }

  pub async fn snapshot(&self) -> Result<PoolSnapshot, SendError> {
    self.request(|reply| PoolCommand::Snapshot { reply }).await
  }

  /// Stop every worker and wait for them to drain. The actor exits afterwards.
  pub async fn destroy_all(&self) -> Result<(), SendError> {
    self.request(|reply| PoolCommand::DestroyAll { reply }).await
  }

  /// Round-robin dispatcher over the pool's live mailboxes (direct mode).
  pub fn dispatcher(&self) -> Dispatcher {
    Dispatcher::new(self.routes.clone())
  }
}

// ============================================================================
// Errors
// ============================================================================

/// Error when sending to the pool actor
#[derive(Debug, Clone, thiserror::Error)]
pub enum SendError {
  #[error("Actor has shut down")]
  ActorGone,
}
