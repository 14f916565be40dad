//! Best-effort handle refresh after record events.

use std::{sync::Arc, time::Duration};

use moka::sync::Cache;
use tokio_util::task::TaskTracker;
use tracing::debug;

use crate::indexing::IndexingService;

/// Fire-and-forget handle refresh, throttled per DID.
#[derive(Clone)]
pub(crate) struct HandleRefresher {
  indexer: Arc<dyn IndexingService>,
  recent: Cache<String, ()>,
  tasks: TaskTracker,
}

impl HandleRefresher {
  pub fn new(indexer: Arc<dyn IndexingService>, ttl: Duration) -> Self {
    Self {
      indexer,
      recent: Cache::builder().max_capacity(100_000).time_to_live(ttl).build(),
      tasks: TaskTracker::new(),
    }
  }

  /// Schedule a refresh unless one ran for `did` within the TTL.
  /// Never blocks and never fails the caller.
  pub fn schedule(&self, did: &str, time: &str) {
    if self.recent.contains_key(did) {
      return;
    }
    self.recent.insert(did.to_string(), ());

    let indexer = self.indexer.clone();
    let did = did.to_string();
    let time = time.to_string();
    self.tasks.spawn(async move {
      if let Err(e) = indexer.index_handle(&did, &time, false).await {
        debug!(did = %did, error = %e, "Background handle refresh failed");
      }
    });
  }

  /// Wait for scheduled refreshes to finish.
  pub async fn drain(&self) {
    self.tasks.close();
    self.tasks.wait().await;
  }
}
