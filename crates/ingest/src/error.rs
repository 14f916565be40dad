//! Error taxonomy and the error callback
//!
//! Nothing in the engine is fatal to ingestion except shutdown. Every failure
//! is classified into one of the variants below and handed to the
//! [`ErrorHandler`]; what happens to the frame is decided where the error
//! occurred:
//!
//! | Variant     | Effect                                                      |
//! |-------------|-------------------------------------------------------------|
//! | Connection  | reader reconnects                                           |
//! | Decode      | frame skipped, not retried                                  |
//! | Validation  | frame skipped, not retried                                  |
//! | Apply       | queue mode: left unacked for reclaim; direct mode: dropped  |
//! | Queue       | caller retries                                              |
//! | WorkerFault | worker replaced                                             |
//! | Scaling     | tick skipped                                                |

use std::sync::Arc;

use tracing::error;

use crate::{
  event::{DecodeError, FrameError, ValidationError},
  pool::WorkerId,
  queue::QueueError,
  stream::ConnectionError,
  worker::ApplyError,
};

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
  #[error("connection error: {0}")]
  Connection(#[from] ConnectionError),
  #[error("decode error: {0}")]
  Decode(#[from] DecodeError),
  #[error("validation error: {0}")]
  Validation(#[from] ValidationError),
  #[error("apply error: {0}")]
  Apply(#[from] ApplyError),
  #[error("queue error: {0}")]
  Queue(#[from] QueueError),
  #[error("worker {worker} faulted: {reason}")]
  WorkerFault { worker: WorkerId, reason: String },
  #[error("scaling error: {0}")]
  Scaling(String),
}

impl From<FrameError> for IngestError {
  fn from(err: FrameError) -> Self {
    match err {
      FrameError::Decode(e) => IngestError::Decode(e),
      FrameError::Validation(e) => IngestError::Validation(e),
    }
  }
}

/// Callback receiving every reported error.
pub type ErrorHandler = Arc<dyn Fn(&IngestError) + Send + Sync>;

/// Default handler: log and move on.
pub fn log_errors() -> ErrorHandler {
  Arc::new(|err: &IngestError| error!(error = %err, "Ingestion error"))
}
