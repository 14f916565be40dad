//! Routing of domain events onto the indexing service.

use tracing::trace;

use super::background::HandleRefresher;
use crate::{
  event::DomainEvent,
  indexing::{IndexError, IndexingService, WriteAction},
};

#[derive(Debug, thiserror::Error)]
#[error("{kind} event for {did} (seq {seq}): {source}")]
pub struct ApplyError {
  pub seq: i64,
  pub kind: &'static str,
  pub did: String,
  #[source]
  pub source: IndexError,
}

/// Apply one domain event.
///
/// Identity and account events touch only the actor. Every other event
/// schedules a background handle refresh and records the repository's
/// last-seen commit alongside the record mutation.
pub(crate) async fn apply_event(
  indexer: &dyn IndexingService,
  refresher: &HandleRefresher,
  event: &DomainEvent,
) -> Result<(), IndexError> {
  trace!(kind = event.kind(), did = event.did(), "Applying event");

  match event {
    DomainEvent::IdentityUpdate { did, time, .. } => indexer.index_handle(did, time, true).await,

    DomainEvent::AccountStatusChange {
      did, active, status, ..
    } => {
      if !active && status.as_deref() == Some("deleted") {
        indexer.delete_actor(did).await
      } else {
        indexer.update_actor_status(did, *active, status.as_deref()).await
      }
    }

    DomainEvent::RecordCreate(write) | DomainEvent::RecordUpdate(write) => {
      let action = match event {
        DomainEvent::RecordCreate(_) => WriteAction::Create,
        _ => WriteAction::Update,
      };
      refresher.schedule(&write.did, &write.time);
      tokio::try_join!(
        indexer.index_record(&write.uri, &write.cid, &write.record, action, &write.time),
        indexer.set_commit_last_seen(&write.did, Some(write.commit.as_str()), &write.rev),
      )?;
      Ok(())
    }

    DomainEvent::RecordDelete(delete) => {
      refresher.schedule(&delete.did, &delete.time);
      tokio::try_join!(
        indexer.delete_record(&delete.uri),
        indexer.set_commit_last_seen(&delete.did, Some(delete.commit.as_str()), &delete.rev),
      )?;
      Ok(())
    }

    DomainEvent::SyncCheckpoint { did, time, commit, rev } => {
      refresher.schedule(did, time);
      indexer.set_commit_last_seen(did, commit.as_deref(), rev).await
    }
  }
}
