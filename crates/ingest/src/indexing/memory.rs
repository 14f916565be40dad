//! In-process index store.
//!
//! Used by the CLI when no external store is linked, and by tests. Every
//! worker connected through the same `MemoryIndex` shares one store, like
//! workers sharing one database.

use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use serde_json::Value;
use skyline_core::IndexingConfig;
use tokio::sync::Mutex;
use tracing::trace;

use super::{IndexError, IndexingFactory, IndexingService, WriteAction};

#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
  pub cid: String,
  pub record: Value,
  pub indexed_at: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActorState {
  pub active: bool,
  pub status: Option<String>,
  pub handle_checked_at: Option<String>,
  pub last_commit: Option<String>,
  pub last_rev: Option<String>,
}

/// Point-in-time copy of the store, comparable across runs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndexSnapshot {
  pub records: BTreeMap<String, StoredRecord>,
  pub actors: BTreeMap<String, ActorState>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryIndex {
  state: Arc<Mutex<IndexSnapshot>>,
}

impl MemoryIndex {
  pub fn new() -> Self {
    Self::default()
  }

  pub async fn snapshot(&self) -> IndexSnapshot {
    self.state.lock().await.clone()
  }

  pub async fn record_count(&self) -> usize {
    self.state.lock().await.records.len()
  }
}

fn actor_of(uri: &str) -> Option<&str> {
  uri.strip_prefix("at://")?.split('/').next()
}

#[async_trait]
impl IndexingService for MemoryIndex {
  async fn index_record(
    &self,
    uri: &str,
    cid: &str,
    record: &Value,
    action: WriteAction,
    time: &str,
  ) -> Result<(), IndexError> {
    trace!(uri, cid, ?action, "Indexing record");
    let mut state = self.state.lock().await;
    if let Some(did) = actor_of(uri) {
      state.actors.entry(did.to_string()).or_insert_with(|| ActorState {
        active: true,
        ..Default::default()
      });
    }
    state.records.insert(
      uri.to_string(),
      StoredRecord {
        cid: cid.to_string(),
        record: record.clone(),
        indexed_at: time.to_string(),
      },
    );
    Ok(())
  }

  async fn delete_record(&self, uri: &str) -> Result<(), IndexError> {
    trace!(uri, "Deleting record");
    self.state.lock().await.records.remove(uri);
    Ok(())
  }

  async fn index_handle(&self, did: &str, time: &str, _force: bool) -> Result<(), IndexError> {
    let mut state = self.state.lock().await;
    let actor = state.actors.entry(did.to_string()).or_insert_with(|| ActorState {
      active: true,
      ..Default::default()
    });
    actor.handle_checked_at = Some(time.to_string());
    Ok(())
  }

  async fn update_actor_status(&self, did: &str, active: bool, status: Option<&str>) -> Result<(), IndexError> {
    let mut state = self.state.lock().await;
    let actor = state.actors.entry(did.to_string()).or_default();
    actor.active = active;
    actor.status = status.map(str::to_string);
    Ok(())
  }

  async fn delete_actor(&self, did: &str) -> Result<(), IndexError> {
    let mut state = self.state.lock().await;
    let prefix = format!("at://{did}/");
    state.records.retain(|uri, _| !uri.starts_with(&prefix));
    state.actors.remove(did);
    Ok(())
  }

  async fn set_commit_last_seen(&self, did: &str, commit: Option<&str>, rev: &str) -> Result<(), IndexError> {
    let mut state = self.state.lock().await;
    let actor = state.actors.entry(did.to_string()).or_insert_with(|| ActorState {
      active: true,
      ..Default::default()
    });
    if let Some(commit) = commit {
      actor.last_commit = Some(commit.to_string());
    }
    actor.last_rev = Some(rev.to_string());
    Ok(())
  }
}

#[async_trait]
impl IndexingFactory for MemoryIndex {
  async fn connect(&self, _config: &IndexingConfig) -> Result<Arc<dyn IndexingService>, IndexError> {
    Ok(Arc::new(self.clone()))
  }
}
