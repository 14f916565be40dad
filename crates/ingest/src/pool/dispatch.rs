//! Direct-mode frame dispatch
//!
//! Round-robin over the live mailboxes the pool publishes. Frames are never
//! dropped here: an empty pool (mid scale-down or restart) means wait and
//! retry, a closed mailbox means pick the next worker.

use std::{sync::Arc, time::Duration};

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use super::WorkerId;
use crate::worker::Delivery;

const EMPTY_POOL_RETRY: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct Mailbox {
  pub id: WorkerId,
  pub tx: mpsc::Sender<Delivery>,
}

pub type Routes = Arc<[Mailbox]>;

#[derive(Debug, thiserror::Error)]
#[error("dispatch cancelled before seq {0} was delivered")]
pub struct DispatchCancelled(pub i64);

pub struct Dispatcher {
  routes: watch::Receiver<Routes>,
  next: usize,
}

impl Dispatcher {
  pub fn new(routes: watch::Receiver<Routes>) -> Self {
    Self { routes, next: 0 }
  }

  fn pick(&mut self) -> Option<Mailbox> {
    let routes = self.routes.borrow();
    if routes.is_empty() {
      return None;
    }
    let mailbox = routes[self.next % routes.len()].clone();
    self.next = self.next.wrapping_add(1);
    Some(mailbox)
  }

  /// Push a frame to the next worker, waiting out empty-pool windows.
  pub async fn dispatch(&mut self, mut delivery: Delivery, cancel: &CancellationToken) -> Result<WorkerId, DispatchCancelled> {
    loop {
      if cancel.is_cancelled() {
        return Err(DispatchCancelled(delivery.sequence));
      }

      let Some(mailbox) = self.pick() else {
        trace!(seq = delivery.sequence, "No live workers, retrying dispatch");
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DispatchCancelled(delivery.sequence)),
            _ = self.routes.changed() => {}
            _ = tokio::time::sleep(EMPTY_POOL_RETRY) => {}
        }
        continue;
      };

      let sequence = delivery.sequence;
      let sent = tokio::select! {
          biased;
          _ = cancel.cancelled() => return Err(DispatchCancelled(sequence)),
          sent = mailbox.tx.send(delivery) => sent,
      };
      match sent {
        Ok(()) => return Ok(mailbox.id),
        // Worker went away between publish and send
        Err(mpsc::error::SendError(returned)) => delivery = returned,
      }
    }
  }
}
