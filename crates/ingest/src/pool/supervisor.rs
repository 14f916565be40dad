//! Pool actor: owns worker slots and supervises their tasks.

use std::{any::Any, collections::BTreeMap, panic::AssertUnwindSafe, sync::Arc, time::Duration};

use futures::FutureExt;
use tokio::{
  sync::{mpsc, watch},
  task::{JoinError, JoinSet},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
  Mailbox, PoolSettings, PoolSnapshot, Routes, WorkerId,
  handle::{PoolCommand, PoolHandle},
};
use crate::{
  error::IngestError,
  worker::{Delivery, Transport, Worker, WorkerContext, WorkerStats},
};

/// Direct-mode mailbox depth per worker
const MAILBOX_CAPACITY: usize = 64;

// ============================================================================
// Worker Slots
// ============================================================================

struct WorkerSlot {
  cancel: CancellationToken,
  stats: watch::Receiver<WorkerStats>,
  mailbox: Option<mpsc::Sender<Delivery>>,
  /// Spawn order; shrink removes the highest first
  generation: u64,
  terminating: bool,
}

enum WorkerExit {
  Stopped,
  Failed(String),
  Panicked(String),
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
  if let Some(msg) = panic.downcast_ref::<&str>() {
    (*msg).to_string()
  } else if let Some(msg) = panic.downcast_ref::<String>() {
    msg.clone()
  } else {
    "worker panicked".to_string()
  }
}

// ============================================================================
// Pool Actor
// ============================================================================

pub(crate) struct PoolActor {
  settings: PoolSettings,
  ctx: Arc<WorkerContext>,
  slots: BTreeMap<WorkerId, WorkerSlot>,
  tasks: JoinSet<(WorkerId, WorkerExit)>,
  next_id: u64,
  generation: u64,
  commands: mpsc::Receiver<PoolCommand>,
  routes: watch::Sender<Routes>,
  cancel: CancellationToken,
  shutting_down: bool,
}

impl PoolActor {
  /// Spawn the pool actor with no workers and return its handle.
  ///
  /// Workers get child tokens of `cancel`, so cancelling it drains the whole
  /// pool even if nobody calls `destroy_all`.
  pub fn spawn(settings: PoolSettings, ctx: Arc<WorkerContext>, cancel: CancellationToken) -> PoolHandle {
    let (tx, commands) = mpsc::channel(32);
    let (routes, routes_rx) = watch::channel::<Routes>(Vec::new().into());

    let actor = Self {
      settings,
      ctx,
      slots: BTreeMap::new(),
      tasks: JoinSet::new(),
      next_id: 1,
      generation: 0,
      commands,
      routes,
      cancel,
      shutting_down: false,
    };
    tokio::spawn(actor.run());

    PoolHandle::new(tx, routes_rx)
  }

  async fn run(mut self) {
    debug!(
      min = self.settings.min_workers,
      max = self.settings.max_workers,
      "Pool actor started"
    );

    loop {
      tokio::select! {
        biased;

        _ = self.cancel.cancelled() => {
          info!(size = self.size(), "Pool cancelled, draining workers");
          self.destroy_all().await;
          break;
        }

        Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => {
          self.on_exit(joined);
        }

        Some(command) = self.commands.recv() => {
          if self.handle_command(command).await {
            break;
          }
        }
      }
    }

    info!("Pool actor stopped");
  }

  /// Returns true once the pool has been destroyed.
  async fn handle_command(&mut self, command: PoolCommand) -> bool {
    match command {
      PoolCommand::Spawn { id, reply } => {
        let spawned = self.spawn_one(id, Duration::ZERO);
        self.publish_routes();
        let _ = reply.send(spawned);
      }
      PoolCommand::Grow { by, reply } => {
        let added = self.grow(by);
        let _ = reply.send(added);
      }
      PoolCommand::Shrink { by, reply } => {
        let removed = self.shrink(by);
        let _ = reply.send(removed);
      }
      PoolCommand::Terminate { id, reply } => {
        let found = self.terminate(id);
        self.publish_routes();
        let _ = reply.send(found);
      }
      PoolCommand::Snapshot { reply } => {
        let _ = reply.send(self.snapshot());
      }
      PoolCommand::DestroyAll { reply } => {
        self.destroy_all().await;
        let _ = reply.send(());
        return true;
      }
    }
    false
  }

  // --------------------------------------------------------------------------
  // Lifecycle
  // --------------------------------------------------------------------------

  fn size(&self) -> usize {
    self.slots.values().filter(|slot| !slot.terminating).count()
  }

  fn allocate_id(&mut self) -> WorkerId {
    let id = WorkerId(self.next_id);
    self.next_id += 1;
    id
  }

  fn spawn_one(&mut self, id: Option<WorkerId>, start_delay: Duration) -> Option<WorkerId> {
    if self.shutting_down || self.size() >= self.settings.max_workers {
      return None;
    }
    let id = match id {
      Some(id) if self.slots.contains_key(&id) => return None,
      Some(id) => {
        self.next_id = self.next_id.max(id.0 + 1);
        id
      }
      None => self.allocate_id(),
    };
    self.start_worker(id, start_delay);
    Some(id)
  }

  fn start_worker(&mut self, id: WorkerId, start_delay: Duration) {
    let cancel = self.cancel.child_token();
    let (stats_tx, stats_rx) = watch::channel(WorkerStats::default());
    let (mailbox_tx, mailbox_rx) = match self.ctx.transport {
      Transport::Direct => {
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        (Some(tx), Some(rx))
      }
      Transport::Queue(_) => (None, None),
    };

    let worker = Worker {
      id,
      ctx: self.ctx.clone(),
      mailbox: mailbox_rx,
      stats: stats_tx,
      cancel: cancel.clone(),
      start_delay,
    };
    self.tasks.spawn(async move {
      let exit = match AssertUnwindSafe(worker.run()).catch_unwind().await {
        Ok(Ok(())) => WorkerExit::Stopped,
        Ok(Err(e)) => WorkerExit::Failed(e.to_string()),
        Err(panic) => WorkerExit::Panicked(panic_message(panic.as_ref())),
      };
      (id, exit)
    });

    self.generation += 1;
    self.slots.insert(
      id,
      WorkerSlot {
        cancel,
        stats: stats_rx,
        mailbox: mailbox_tx,
        generation: self.generation,
        terminating: false,
      },
    );
    debug!(worker_id = %id, "Worker spawned");
  }

  fn grow(&mut self, by: usize) -> Vec<WorkerId> {
    let room = self.settings.max_workers.saturating_sub(self.size());
    let added: Vec<_> = (0..by.min(room)).filter_map(|_| self.spawn_one(None, Duration::ZERO)).collect();
    if !added.is_empty() {
      self.publish_routes();
      debug!(added = added.len(), size = self.size(), "Pool grown");
    }
    added
  }

  fn shrink(&mut self, by: usize) -> Vec<WorkerId> {
    let removable = self.size().saturating_sub(self.settings.min_workers);
    let mut live: Vec<_> = self
      .slots
      .iter()
      .filter(|(_, slot)| !slot.terminating)
      .map(|(id, slot)| (slot.generation, *id))
      .collect();
    live.sort_unstable_by(|a, b| b.cmp(a));

    let removed: Vec<_> = live.into_iter().take(by.min(removable)).map(|(_, id)| id).collect();
    for id in &removed {
      self.terminate(*id);
    }
    if !removed.is_empty() {
      self.publish_routes();
      debug!(removed = removed.len(), size = self.size(), "Pool shrunk");
    }
    removed
  }

  /// Cancel a worker; it drains and its task exit clears the slot.
  fn terminate(&mut self, id: WorkerId) -> bool {
    let Some(slot) = self.slots.get_mut(&id) else {
      return false;
    };
    if !slot.terminating {
      slot.terminating = true;
      // Dropping the sender closes the mailbox once queued frames are read
      slot.mailbox = None;
      slot.cancel.cancel();
    }
    true
  }

  async fn destroy_all(&mut self) {
    self.shutting_down = true;
    let ids: Vec<_> = self.slots.keys().copied().collect();
    for id in ids {
      self.terminate(id);
    }
    self.publish_routes();

    while let Some(joined) = self.tasks.join_next().await {
      self.on_exit(joined);
    }
    self.slots.clear();
    debug!("All workers stopped");
  }

  fn on_exit(&mut self, joined: Result<(WorkerId, WorkerExit), JoinError>) {
    let (id, exit) = match joined {
      Ok(exited) => exited,
      Err(e) => {
        warn!(error = %e, "Worker task failed to join");
        return;
      }
    };
    let Some(slot) = self.slots.remove(&id) else {
      return;
    };
    // Stops anything the worker left running, such as its claim task
    slot.cancel.cancel();

    if slot.terminating || self.shutting_down {
      debug!(worker_id = %id, "Worker stopped");
      return;
    }

    let (reason, restart_delay) = match exit {
      WorkerExit::Stopped => ("exited without being asked to stop".to_string(), Duration::ZERO),
      WorkerExit::Failed(reason) => (reason, self.ctx.settings.restart_delay()),
      WorkerExit::Panicked(reason) => (reason, Duration::ZERO),
    };
    (self.ctx.on_error)(&IngestError::WorkerFault { worker: id, reason });

    // Direct mode keeps the slot; queue mode relies on claim reclaim instead
    let replacement = match self.ctx.transport {
      Transport::Direct => id,
      Transport::Queue(_) => self.allocate_id(),
    };
    self.start_worker(replacement, restart_delay);
    self.publish_routes();
    info!(worker_id = %id, replacement = %replacement, "Replaced faulted worker");
  }

  fn snapshot(&self) -> PoolSnapshot {
    PoolSnapshot {
      workers: self
        .slots
        .iter()
        .filter(|(_, slot)| !slot.terminating)
        .map(|(id, slot)| (*id, slot.stats.borrow().clone()))
        .collect(),
    }
  }

  fn publish_routes(&self) {
    let routes: Vec<Mailbox> = self
      .slots
      .iter()
      .filter(|(_, slot)| !slot.terminating)
      .filter_map(|(id, slot)| slot.mailbox.clone().map(|tx| Mailbox { id: *id, tx }))
      .collect();
    self.routes.send_replace(routes.into());
  }
}
