//! Worker units
//!
//! A worker owns its own indexing service and processes frames from one
//! intake channel:
//!
//! - queue mode: a claim task pulls entries from the relay queue
//! - direct mode: the dispatcher pushes into the worker's mailbox
//!
//! Deliveries wait in a local priority queue (lowest sequence first) until
//! one of `concurrency` apply slots is free. When every slot is busy the
//! worker reports itself saturated.
//!
//! ```text
//! intake -> LocalQueue -> JoinSet (<= concurrency) -> decode -> expand -> apply -> ack
//! ```
//!
//! A frame is acked only after every domain event it expands to is applied.
//! On shutdown the worker stops taking new work and gives in-flight applies a
//! grace period; anything still unfinished is abandoned unacked.

mod apply;
mod background;
mod local_queue;
mod stats;

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use skyline_core::{IndexingConfig, WorkerConfig};
use tokio::{
  sync::{mpsc, watch},
  task::JoinSet,
  time::{Instant, sleep, sleep_until},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

pub(crate) use self::apply::apply_event;
pub use self::{
  apply::ApplyError,
  stats::{StatsRecorder, WorkerStats},
};
use self::{background::HandleRefresher, local_queue::LocalQueue};
use crate::{
  backoff::Backoff,
  error::{ErrorHandler, IngestError},
  event::{self, SchemaValidator},
  indexing::{IndexError, IndexingFactory, IndexingService},
  pool::WorkerId,
  queue::{QueueError, RelayQueue},
  telemetry::Watermarks,
};

/// A frame handed to a worker.
#[derive(Debug, Clone)]
pub struct Delivery {
  pub sequence: i64,
  pub payload: Bytes,
  /// Relay queue entry to ack (queue mode only)
  pub entry_id: Option<String>,
}

/// How frames reach workers.
#[derive(Clone)]
pub enum Transport {
  Queue(Arc<dyn RelayQueue>),
  Direct,
}

/// Everything a worker needs that is shared across the pool.
pub(crate) struct WorkerContext {
  pub transport: Transport,
  pub factory: Arc<dyn IndexingFactory>,
  pub indexing: IndexingConfig,
  pub validator: Arc<dyn SchemaValidator>,
  pub settings: WorkerConfig,
  pub watermarks: Arc<Watermarks>,
  pub on_error: ErrorHandler,
  /// Unique per process; prefixes queue consumer names
  pub instance: String,
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
  #[error("indexing service init failed: {0}")]
  Init(#[from] IndexError),
  #[error("queue consumer unavailable: {0}")]
  Consumer(#[from] QueueError),
  #[error("direct-mode worker started without a mailbox")]
  NoIntake,
}

enum Outcome {
  Applied {
    events: usize,
    elapsed: Duration,
    event_time: Option<DateTime<Utc>>,
  },
  Skipped,
  Failed,
}

pub(crate) struct Worker {
  pub id: WorkerId,
  pub ctx: Arc<WorkerContext>,
  /// Direct-mode mailbox
  pub mailbox: Option<mpsc::Receiver<Delivery>>,
  pub stats: watch::Sender<WorkerStats>,
  pub cancel: CancellationToken,
  /// Wait before init (restarts after an init failure)
  pub start_delay: Duration,
}

impl Worker {
  pub async fn run(self) -> Result<(), WorkerError> {
    let Worker {
      id,
      ctx,
      mailbox,
      stats,
      cancel,
      start_delay,
    } = self;

    if !start_delay.is_zero() {
      tokio::select! {
          biased;
          _ = cancel.cancelled() => return Ok(()),
          _ = sleep(start_delay) => {}
      }
    }

    // Init handshake: own indexing service, own queue connection
    let indexer = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Ok(()),
        indexer = ctx.factory.connect(&ctx.indexing) => indexer?,
    };

    let (intake, consumer_queue, claim_task) = match (&ctx.transport, mailbox) {
      (Transport::Direct, Some(mailbox)) => (mailbox, None, None),
      (Transport::Queue(queue), _) => {
        let consumer_queue = queue.connect_consumer().await?;
        let consumer = format!("{}-{}", ctx.instance, id);
        let (tx, rx) = mpsc::channel(1);
        let task = tokio::spawn(claim_loop(
          id,
          consumer_queue.clone(),
          consumer,
          tx,
          cancel.clone(),
          ctx.on_error.clone(),
        ));
        (rx, Some(consumer_queue), Some(task))
      }
      (Transport::Direct, None) => return Err(WorkerError::NoIntake),
    };

    let pipeline = Arc::new(Pipeline {
      worker: id,
      refresher: HandleRefresher::new(indexer.clone(), ctx.settings.handle_refresh_ttl()),
      indexer,
      validator: ctx.validator.clone(),
      queue: consumer_queue,
      on_error: ctx.on_error.clone(),
    });

    info!(worker_id = %id, "Worker ready");
    let refresher = pipeline.refresher.clone();
    let result = process_loop(id, &ctx, pipeline, intake, stats, cancel).await;
    if let Some(task) = claim_task {
      task.abort();
    }

    // Handle refreshes get the same grace as in-flight applies
    if tokio::time::timeout(ctx.settings.shutdown_grace(), refresher.drain()).await.is_err() {
      debug!(worker_id = %id, "Abandoning background handle refreshes");
    }
    result
  }
}

async fn process_loop(
  id: WorkerId,
  ctx: &WorkerContext,
  pipeline: Arc<Pipeline>,
  mut intake: mpsc::Receiver<Delivery>,
  stats: watch::Sender<WorkerStats>,
  cancel: CancellationToken,
) -> Result<(), WorkerError> {
  let concurrency = ctx.settings.concurrency.max(1);
  let mut recorder = StatsRecorder::new(ctx.settings.stats_window);
  let mut local = LocalQueue::default();
  let mut running: JoinSet<Outcome> = JoinSet::new();
  let mut intake_open = true;
  let mut drain_deadline: Option<Instant> = None;

  stats.send_replace(recorder.mark_ready().clone());

  loop {
    while running.len() < concurrency {
      let Some(delivery) = local.pop() else { break };
      running.spawn(pipeline.clone().process(delivery));
    }

    if recorder.set_saturated(running.len() >= concurrency) {
      trace!(worker_id = %id, saturated = recorder.stats().saturated, queued = local.len(), "Saturation changed");
      stats.send_replace(recorder.stats().clone());
    }

    if drain_deadline.is_some() && !intake_open && local.is_empty() && running.is_empty() {
      debug!(worker_id = %id, "Worker drained");
      break;
    }

    tokio::select! {
        biased;

        _ = cancel.cancelled(), if drain_deadline.is_none() => {
            debug!(worker_id = %id, in_flight = running.len(), queued = local.len(), "Worker draining");
            intake.close();
            drain_deadline = Some(Instant::now() + ctx.settings.shutdown_grace());
        }

        _ = sleep_until(drain_deadline.unwrap_or_else(Instant::now)), if drain_deadline.is_some() => {
            warn!(
                worker_id = %id,
                abandoned = running.len() + local.len(),
                "Shutdown grace elapsed, leaving unfinished work unacked"
            );
            running.shutdown().await;
            break;
        }

        Some(joined) = running.join_next(), if !running.is_empty() => {
            match joined {
                Ok(Outcome::Applied { events, elapsed, event_time }) if events > 0 => {
                    recorder.record(elapsed, events, event_time, Utc::now());
                    stats.send_replace(recorder.stats().clone());
                    if let Some(time) = event_time {
                        ctx.watermarks.observe_processed(time);
                    }
                }
                Ok(_) => {}
                // A panicking apply takes the worker down with it
                Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                Err(_) => {}
            }
        }

        delivery = intake.recv(), if intake_open && local.len() < concurrency => {
            match delivery {
                Some(delivery) => local.push(delivery),
                None => intake_open = false,
            }
        }
    }
  }

  Ok(())
}

/// Claim entries for one worker until cancelled.
async fn claim_loop(
  id: WorkerId,
  queue: Arc<dyn RelayQueue>,
  consumer: String,
  tx: mpsc::Sender<Delivery>,
  cancel: CancellationToken,
  on_error: ErrorHandler,
) {
  let backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(5));
  let mut failures = 0;

  while !cancel.is_cancelled() {
    match queue.claim_next(&consumer).await {
      Ok(Some(entry)) => {
        failures = 0;
        if entry.reclaimed {
          debug!(worker_id = %id, seq = entry.sequence, entry = %entry.id, "Reclaimed expired entry");
        }
        let delivery = Delivery {
          sequence: entry.sequence,
          payload: entry.payload,
          entry_id: Some(entry.id),
        };
        // Closed intake: the claim is left for reclaim
        if tx.send(delivery).await.is_err() {
          break;
        }
      }
      Ok(None) => failures = 0,
      Err(e) => {
        on_error(&IngestError::Queue(e));
        let delay = backoff.delay_for_attempt(failures);
        failures += 1;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = sleep(delay) => {}
        }
      }
    }
  }
}

/// Per-worker apply pipeline shared by its in-flight tasks.
struct Pipeline {
  worker: WorkerId,
  indexer: Arc<dyn IndexingService>,
  refresher: HandleRefresher,
  validator: Arc<dyn SchemaValidator>,
  queue: Option<Arc<dyn RelayQueue>>,
  on_error: ErrorHandler,
}

impl Pipeline {
  async fn process(self: Arc<Self>, delivery: Delivery) -> Outcome {
    let started = Instant::now();

    let repo_event = match event::decode(&delivery.payload, self.validator.as_ref()) {
      Ok(repo_event) => repo_event,
      Err(e) => {
        debug!(worker_id = %self.worker, seq = delivery.sequence, error = %e, "Skipping undecodable frame");
        (self.on_error)(&e.into());
        // Retrying cannot fix malformed input
        self.ack(&delivery).await;
        return Outcome::Skipped;
      }
    };

    let events = event::expand(repo_event);
    for domain_event in &events {
      if let Err(source) = apply_event(self.indexer.as_ref(), &self.refresher, domain_event).await {
        (self.on_error)(&IngestError::Apply(ApplyError {
          seq: delivery.sequence,
          kind: domain_event.kind(),
          did: domain_event.did().to_string(),
          source,
        }));
        return Outcome::Failed;
      }
    }

    self.ack(&delivery).await;

    Outcome::Applied {
      events: events.len(),
      elapsed: started.elapsed(),
      event_time: events.last().and_then(|e| parse_time(e.time())),
    }
  }

  async fn ack(&self, delivery: &Delivery) {
    let (Some(queue), Some(entry_id)) = (&self.queue, &delivery.entry_id) else {
      return;
    };
    // A failed ack means redelivery, which idempotent apply tolerates
    if let Err(e) = queue.ack(entry_id).await {
      (self.on_error)(&IngestError::Queue(e));
    }
  }
}

pub(crate) fn parse_time(time: &str) -> Option<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(time).ok().map(|t| t.with_timezone(&Utc))
}
