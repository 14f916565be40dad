//! In-process relay queue with the same claim/reclaim/ack semantics as the
//! Redis backend. Used for tests and single-process runs without Redis.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::{
  sync::{Mutex, Notify},
  time::Instant,
};

use super::{QueueEntry, QueueError, RelayQueue};

#[derive(Debug)]
struct Claim {
  owner: String,
  at: Instant,
}

#[derive(Debug)]
struct Stored {
  sequence: i64,
  payload: Bytes,
  claim: Option<Claim>,
}

#[derive(Debug, Default)]
struct State {
  next_id: u64,
  entries: BTreeMap<u64, Stored>,
  acked: u64,
}

#[derive(Clone)]
pub struct MemoryQueue {
  state: Arc<Mutex<State>>,
  appended: Arc<Notify>,
  claim_timeout: Duration,
  block: Duration,
}

impl MemoryQueue {
  pub fn new(claim_timeout: Duration, block: Duration) -> Self {
    Self {
      state: Arc::new(Mutex::new(State::default())),
      appended: Arc::new(Notify::new()),
      claim_timeout,
      block,
    }
  }

  /// Total entries acked since creation.
  pub async fn acked(&self) -> u64 {
    self.state.lock().await.acked
  }

  fn entry(id: u64, stored: &Stored, reclaimed: bool) -> QueueEntry {
    QueueEntry {
      id: id.to_string(),
      sequence: stored.sequence,
      payload: stored.payload.clone(),
      owner: stored.claim.as_ref().map(|c| c.owner.clone()).unwrap_or_default(),
      reclaimed,
    }
  }

  fn try_claim(&self, state: &mut State, consumer: &str) -> Option<QueueEntry> {
    let now = Instant::now();

    let expired = state.entries.iter_mut().find(|(_, stored)| {
      stored
        .claim
        .as_ref()
        .is_some_and(|claim| now.duration_since(claim.at) > self.claim_timeout)
    });
    if let Some((id, stored)) = expired {
      stored.claim = Some(Claim {
        owner: consumer.to_string(),
        at: now,
      });
      return Some(Self::entry(*id, stored, true));
    }

    let (id, stored) = state.entries.iter_mut().find(|(_, stored)| stored.claim.is_none())?;
    stored.claim = Some(Claim {
      owner: consumer.to_string(),
      at: now,
    });
    Some(Self::entry(*id, stored, false))
  }
}

#[async_trait]
impl RelayQueue for MemoryQueue {
  async fn ensure_group(&self) -> Result<(), QueueError> {
    Ok(())
  }

  async fn append(&self, sequence: i64, payload: Bytes) -> Result<String, QueueError> {
    let mut state = self.state.lock().await;
    let id = state.next_id;
    state.next_id += 1;
    state.entries.insert(
      id,
      Stored {
        sequence,
        payload,
        claim: None,
      },
    );
    drop(state);

    self.appended.notify_waiters();
    Ok(id.to_string())
  }

  async fn claim_next(&self, consumer: &str) -> Result<Option<QueueEntry>, QueueError> {
    let deadline = Instant::now() + self.block;
    loop {
      // Register before releasing the lock so an append in between is not missed
      let appended = self.appended.notified();
      {
        let mut state = self.state.lock().await;
        if let Some(entry) = self.try_claim(&mut state, consumer) {
          return Ok(Some(entry));
        }
      }

      if tokio::time::timeout_at(deadline, appended).await.is_err() {
        return Ok(None);
      }
    }
  }

  async fn ack(&self, entry_id: &str) -> Result<(), QueueError> {
    let id: u64 = entry_id.parse().map_err(|_| QueueError::Malformed {
      id: entry_id.to_string(),
      reason: "not a memory queue id",
    })?;
    let mut state = self.state.lock().await;
    if state.entries.remove(&id).is_some() {
      state.acked += 1;
    }
    Ok(())
  }

  async fn depth(&self) -> Result<u64, QueueError> {
    Ok(self.state.lock().await.entries.len() as u64)
  }

  async fn oldest_sequence(&self) -> Result<Option<i64>, QueueError> {
    Ok(self.state.lock().await.entries.values().next().map(|stored| stored.sequence))
  }

  async fn connect_consumer(&self) -> Result<Arc<dyn RelayQueue>, QueueError> {
    Ok(Arc::new(self.clone()))
  }
}
