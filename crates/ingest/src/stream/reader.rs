//! Reconnecting stream reader
//!
//! Cursor precedence on every (re)connect:
//!
//! 1. the last sequence this reader handed off
//! 2. the oldest entry still in the relay queue (queue mode)
//! 3. the configured cursor
//! 4. none (live tip)

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use futures::StreamExt;
use skyline_core::FirehoseConfig;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ConnectionError, FirehoseConnector, FrameStream};
use crate::{
  backoff::Backoff,
  error::{ErrorHandler, IngestError},
  event::codec::{FrameSummary, peek},
  pool::Dispatcher,
  queue::RelayQueue,
  telemetry::Watermarks,
  worker::Delivery,
};

/// Where the reader hands frames off.
pub enum FrameSink {
  Queue(Arc<dyn RelayQueue>),
  Direct(Dispatcher),
}

/// How one connection ended.
enum SessionEnd {
  Cancelled,
  Failed(ConnectionError),
}

pub struct StreamReader {
  connector: Arc<dyn FirehoseConnector>,
  sink: FrameSink,
  configured_cursor: Option<i64>,
  idle_timeout: Duration,
  reconnect: Backoff,
  /// Queue append retries
  append_retry: Backoff,
  watermarks: Arc<Watermarks>,
  on_error: ErrorHandler,
  last_handed_off: Option<i64>,
}

impl StreamReader {
  pub fn new(
    connector: Arc<dyn FirehoseConnector>,
    sink: FrameSink,
    config: &FirehoseConfig,
    watermarks: Arc<Watermarks>,
    on_error: ErrorHandler,
  ) -> Self {
    Self {
      connector,
      sink,
      configured_cursor: config.cursor,
      idle_timeout: config.idle_timeout(),
      reconnect: Backoff::new(
        Duration::from_millis(config.reconnect_initial_backoff_ms),
        Duration::from_millis(config.reconnect_max_backoff_ms),
      ),
      append_retry: Backoff::new(Duration::from_millis(50), Duration::from_secs(5)),
      watermarks,
      on_error,
      last_handed_off: None,
    }
  }

  async fn resume_cursor(&self) -> Option<i64> {
    if self.last_handed_off.is_some() {
      return self.last_handed_off;
    }
    if let FrameSink::Queue(queue) = &self.sink {
      match queue.oldest_sequence().await {
        Ok(Some(seq)) => return Some(seq),
        Ok(None) => {}
        Err(e) => (self.on_error)(&IngestError::Queue(e)),
      }
    }
    self.configured_cursor
  }

  /// Read until cancelled, reconnecting after every failure.
  ///
  /// A connection that delivered frames is re-established immediately;
  /// consecutive connections that deliver nothing back off.
  pub async fn run(mut self, cancel: CancellationToken) {
    let mut barren = 0u32;

    while !cancel.is_cancelled() {
      let cursor = self.resume_cursor().await;
      info!(cursor, "Connecting to firehose");

      let connected = tokio::select! {
          biased;
          _ = cancel.cancelled() => break,
          connected = self.connector.connect(cursor) => connected,
      };

      let (handed_off, end) = match connected {
        Ok(frames) => self.consume(frames, &cancel).await,
        Err(e) => (0, SessionEnd::Failed(e)),
      };

      match end {
        SessionEnd::Cancelled => break,
        SessionEnd::Failed(e) => {
          warn!(error = %e, handed_off, cursor = self.last_handed_off, "Firehose connection lost");
          (self.on_error)(&IngestError::Connection(e));
        }
      }

      if handed_off > 0 {
        barren = 0;
        continue;
      }
      // Only refused or empty sessions wait; a live stream never does
      let delay = self.reconnect.delay_for_attempt(barren);
      barren += 1;
      tokio::select! {
          biased;
          _ = cancel.cancelled() => break,
          _ = sleep(delay) => {}
      }
    }

    info!(cursor = self.last_handed_off, "Stream reader stopped");
  }

  async fn consume(&mut self, mut frames: FrameStream, cancel: &CancellationToken) -> (u64, SessionEnd) {
    let mut handed_off = 0u64;

    loop {
      let next = tokio::select! {
          biased;
          _ = cancel.cancelled() => return (handed_off, SessionEnd::Cancelled),
          next = timeout(self.idle_timeout, frames.next()) => next,
      };
      let frame = match next {
        Err(_) => return (handed_off, SessionEnd::Failed(ConnectionError::IdleTimeout(self.idle_timeout))),
        Ok(None) => return (handed_off, SessionEnd::Failed(ConnectionError::Closed)),
        Ok(Some(Err(e))) => return (handed_off, SessionEnd::Failed(e)),
        Ok(Some(Ok(frame))) => frame,
      };

      match peek(&frame) {
        // Reconnecting would replay the same bytes; skip instead
        Err(e) => {
          debug!(error = %e, cursor = self.last_handed_off, "Skipping undecodable frame");
          (self.on_error)(&IngestError::Decode(e));
        }
        Ok(FrameSummary::Error { error, message }) => {
          return (handed_off, SessionEnd::Failed(ConnectionError::Upstream { error, message }));
        }
        Ok(FrameSummary::Message { seq: None, event_type, .. }) => {
          debug!(event_type = event_type.as_deref().unwrap_or("none"), "Skipping frame without sequence");
        }
        Ok(FrameSummary::Message {
          seq: Some(seq), time, ..
        }) => {
          if let Some(time) = &time {
            self.watermarks.observe_received(time);
          }
          if !self.hand_off(seq, frame, cancel).await {
            return (handed_off, SessionEnd::Cancelled);
          }
          self.last_handed_off = Some(seq);
          handed_off += 1;
        }
      }
    }
  }

  /// Returns false if cancelled before the frame was handed off.
  async fn hand_off(&mut self, seq: i64, payload: Bytes, cancel: &CancellationToken) -> bool {
    match &mut self.sink {
      FrameSink::Queue(queue) => {
        let mut attempt = 0;
        loop {
          match queue.append(seq, payload.clone()).await {
            Ok(_) => return true,
            Err(e) => {
              (self.on_error)(&IngestError::Queue(e));
              let delay = self.append_retry.delay_for_attempt(attempt);
              attempt += 1;
              tokio::select! {
                  biased;
                  _ = cancel.cancelled() => return false,
                  _ = sleep(delay) => {}
              }
            }
          }
        }
      }
      FrameSink::Direct(dispatcher) => {
        let delivery = Delivery {
          sequence: seq,
          payload,
          entry_id: None,
        };
        dispatcher.dispatch(delivery, cancel).await.is_ok()
      }
    }
  }
}
