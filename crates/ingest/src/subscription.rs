//! Top-level firehose subscription
//!
//! Wires the stream reader, the relay queue (or direct dispatch), the worker
//! pool, the scaling controller and the telemetry reporter together and runs
//! them until cancelled.
//!
//! # Shutdown order
//!
//! 1. the reader stops and drops the upstream connection
//! 2. the scaling controller and the reporter stop
//! 3. every worker drains within its grace period
//!
//! Unacked queue entries left behind are picked up on the next run.

use std::{sync::Arc, time::Duration};

use skyline_core::{Config, ConfigError, DeliveryMode};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
  error::{ErrorHandler, log_errors},
  event::{AcceptAll, SchemaValidator},
  indexing::IndexingFactory,
  pool::{PoolActor, PoolSettings},
  queue::{QueueError, RedisQueue, RelayQueue},
  scaling::ScalingController,
  stream::{FirehoseConnector, FrameSink, StreamReader, WebSocketConnector},
  telemetry::{Reporter, Watermarks},
  worker::{Transport, WorkerContext},
};

#[derive(Debug, thiserror::Error)]
pub enum SubscriptionError {
  #[error("invalid configuration: {0}")]
  Config(#[from] ConfigError),
  #[error("relay queue unavailable: {0}")]
  Queue(#[from] QueueError),
}

pub struct FirehoseSubscription {
  config: Config,
  factory: Arc<dyn IndexingFactory>,
  connector: Option<Arc<dyn FirehoseConnector>>,
  queue: Option<Arc<dyn RelayQueue>>,
  validator: Arc<dyn SchemaValidator>,
  on_error: ErrorHandler,
}

impl FirehoseSubscription {
  pub fn new(config: Config, factory: Arc<dyn IndexingFactory>) -> Self {
    Self {
      config,
      factory,
      connector: None,
      queue: None,
      validator: Arc::new(AcceptAll),
      on_error: log_errors(),
    }
  }

  /// Replace the WebSocket connector built from `[firehose]`.
  pub fn with_connector(mut self, connector: Arc<dyn FirehoseConnector>) -> Self {
    self.connector = Some(connector);
    self
  }

  /// Replace the Redis queue built from `[queue]` (queue mode only).
  pub fn with_queue(mut self, queue: Arc<dyn RelayQueue>) -> Self {
    self.queue = Some(queue);
    self
  }

  pub fn with_validator(mut self, validator: Arc<dyn SchemaValidator>) -> Self {
    self.validator = validator;
    self
  }

  pub fn with_error_handler(mut self, on_error: ErrorHandler) -> Self {
    self.on_error = on_error;
    self
  }

  /// Run until `cancel` fires, then shut down in order.
  pub async fn run(self, cancel: CancellationToken) -> Result<(), SubscriptionError> {
    let Self {
      config,
      factory,
      connector,
      queue,
      validator,
      on_error,
    } = self;
    config.validate()?;

    let connector = connector.unwrap_or_else(|| Arc::new(WebSocketConnector::from_config(&config.firehose)));

    let queue = match config.queue.mode {
      DeliveryMode::Direct => None,
      DeliveryMode::Queue => {
        let queue = match queue {
          Some(queue) => queue,
          None => Arc::new(RedisQueue::connect(&config.queue).await?) as Arc<dyn RelayQueue>,
        };
        queue.ensure_group().await?;
        Some(queue)
      }
    };
    if queue.is_none() {
      warn!("Direct delivery: frames in flight on a crashed worker are lost");
    }

    let instance = Uuid::now_v7().to_string();
    let watermarks = Arc::new(Watermarks::default());
    let settings = PoolSettings::from_config(&config.pool);
    let ctx = Arc::new(WorkerContext {
      transport: match &queue {
        Some(queue) => Transport::Queue(queue.clone()),
        None => Transport::Direct,
      },
      factory,
      indexing: config.indexing.clone(),
      validator,
      settings: config.worker.clone(),
      watermarks: watermarks.clone(),
      on_error: on_error.clone(),
      instance: instance.clone(),
    });

    // The pool outlives the other components so workers can drain last
    let pool_cancel = CancellationToken::new();
    let pool = PoolActor::spawn(settings.clone(), ctx, pool_cancel.clone());
    let started = pool.grow(settings.min_workers).await.map(|ids| ids.len()).unwrap_or(0);
    info!(
      instance = %instance,
      mode = ?config.queue.mode,
      workers = started,
      max = settings.max_workers,
      "Firehose subscription starting"
    );

    let sink = match &queue {
      Some(queue) => FrameSink::Queue(queue.clone()),
      None => FrameSink::Direct(pool.dispatcher()),
    };
    let reader = StreamReader::new(connector, sink, &config.firehose, watermarks.clone(), on_error.clone());
    let controller = ScalingController::new(pool.clone(), queue, settings, on_error);
    let reporter = Reporter::new(
      pool.clone(),
      watermarks,
      Duration::from_secs(config.logging.stats_interval_secs.max(1)),
      Duration::from_secs(config.logging.skew_interval_secs.max(1)),
    );

    let reader_cancel = cancel.child_token();
    let control_cancel = cancel.child_token();
    let reader_task = tokio::spawn(reader.run(reader_cancel.clone()));
    let controller_task = tokio::spawn(controller.run(control_cancel.clone()));
    let reporter_task = tokio::spawn(reporter.run(control_cancel.clone()));

    cancel.cancelled().await;
    info!("Firehose subscription shutting down");

    reader_cancel.cancel();
    if let Err(e) = reader_task.await {
      warn!(error = %e, "Stream reader task failed");
    }
    control_cancel.cancel();
    for (name, task) in [("controller", controller_task), ("reporter", reporter_task)] {
      if let Err(e) = task.await {
        warn!(task = name, error = %e, "Task failed during shutdown");
      }
    }
    if pool.destroy_all().await.is_err() {
      pool_cancel.cancel();
    }

    info!("Firehose subscription stopped");
    Ok(())
  }
}
