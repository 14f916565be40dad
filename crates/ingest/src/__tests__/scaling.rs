//! Scaling controller and pool bound tests against a live pool actor.

#[cfg(test)]
mod tests {
  use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    time::Duration,
  };

  use async_trait::async_trait;
  use bytes::Bytes;
  use skyline_core::PoolConfig;
  use tokio_util::sync::CancellationToken;

  use crate::{
    IngestError,
    __tests__::helpers::{ErrorLog, Fault, FaultyFactory, worker_context},
    pool::{PoolActor, PoolHandle, PoolSettings, WorkerId},
    queue::{QueueEntry, QueueError, RelayQueue},
    scaling::{ScaleDecision, ScaleReason, ScalingController},
    worker::Transport,
  };

  /// Reports a scripted sequence of depths; the last one repeats.
  struct ScriptedDepth {
    depths: Mutex<VecDeque<u64>>,
    last: Mutex<Option<u64>>,
  }

  impl ScriptedDepth {
    fn new(depths: impl IntoIterator<Item = u64>) -> Arc<Self> {
      Arc::new(Self {
        depths: Mutex::new(depths.into_iter().collect()),
        last: Mutex::new(None),
      })
    }

    fn push(&self, depth: u64) {
      self.depths.lock().unwrap().push_back(depth);
    }
  }

  #[async_trait]
  impl RelayQueue for ScriptedDepth {
    async fn ensure_group(&self) -> Result<(), QueueError> {
      Ok(())
    }

    async fn append(&self, _sequence: i64, _payload: Bytes) -> Result<String, QueueError> {
      Err(QueueError::Closed)
    }

    async fn claim_next(&self, _consumer: &str) -> Result<Option<QueueEntry>, QueueError> {
      Ok(None)
    }

    async fn ack(&self, _entry_id: &str) -> Result<(), QueueError> {
      Ok(())
    }

    async fn depth(&self) -> Result<u64, QueueError> {
      let next = self.depths.lock().unwrap().pop_front();
      let mut last = self.last.lock().unwrap();
      if next.is_some() {
        *last = next;
      }
      last.ok_or(QueueError::Closed)
    }

    async fn oldest_sequence(&self) -> Result<Option<i64>, QueueError> {
      Ok(None)
    }

    async fn connect_consumer(&self) -> Result<Arc<dyn RelayQueue>, QueueError> {
      Err(QueueError::Closed)
    }
  }

  fn settings(min: usize, max: usize) -> PoolSettings {
    PoolSettings::from_config(&PoolConfig {
      min_workers: min,
      max_workers: max,
      scale_check_interval_ms: 5_000,
      initial_delay_ms: 30_000,
      ..Default::default()
    })
  }

  fn pool(settings: &PoolSettings, errors: &ErrorLog) -> PoolHandle {
    let factory = FaultyFactory::new(Fault::Fail, "never-matches");
    let ctx = worker_context(Transport::Direct, Arc::new(factory), errors.handler());
    PoolActor::spawn(settings.clone(), ctx, CancellationToken::new())
  }

  #[tokio::test]
  async fn test_backlog_grows_then_shrinks_newest_first() {
    let errors = ErrorLog::default();
    let settings = settings(2, 8);
    let pool = pool(&settings, &errors);
    pool.grow(2).await.unwrap();

    let depths = ScriptedDepth::new([100, 6_000, 7_000, 8_000]);
    let queue: Arc<dyn RelayQueue> = depths.clone();
    let mut controller = ScalingController::new(pool.clone(), Some(queue), settings, errors.handler());

    for _ in 0..3 {
      assert_eq!(controller.tick().await.unwrap(), ScaleDecision::Hold);
    }
    assert_eq!(
      controller.tick().await.unwrap(),
      ScaleDecision::Grow {
        by: 1,
        reason: ScaleReason::Backlog { depth: 8_000 },
      }
    );
    assert_eq!(pool.snapshot().await.unwrap().ids(), vec![WorkerId(1), WorkerId(2), WorkerId(3)]);

    depths.push(10);
    assert!(matches!(
      controller.tick().await.unwrap(),
      ScaleDecision::Shrink { by: 1, .. }
    ));
    assert_eq!(pool.snapshot().await.unwrap().ids(), vec![WorkerId(1), WorkerId(2)]);

    // Drained but already at the floor
    assert_eq!(controller.tick().await.unwrap(), ScaleDecision::Hold);
    assert_eq!(pool.snapshot().await.unwrap().size(), 2);
    assert_eq!(errors.count("scaling"), 0);

    pool.destroy_all().await.unwrap();
  }

  #[tokio::test]
  async fn test_depth_failure_is_a_scaling_error() {
    let errors = ErrorLog::default();
    let settings = settings(1, 4);
    let pool = pool(&settings, &errors);
    pool.grow(1).await.unwrap();

    let mut controller = ScalingController::new(
      pool.clone(),
      Some(ScriptedDepth::new(None) as Arc<dyn RelayQueue>),
      settings,
      errors.handler(),
    );

    let err = controller.tick().await.unwrap_err();
    assert!(matches!(err, IngestError::Scaling(msg) if msg.contains("queue depth unavailable")));
    assert_eq!(pool.snapshot().await.unwrap().size(), 1);

    pool.destroy_all().await.unwrap();
  }

  #[tokio::test]
  async fn test_pool_size_stays_within_bounds() {
    let errors = ErrorLog::default();
    let pool = pool(&settings(2, 8), &errors);

    assert_eq!(pool.grow(100).await.unwrap().len(), 8);
    assert_eq!(pool.spawn(None).await.unwrap(), None);

    let removed = pool.shrink(100).await.unwrap();
    assert_eq!(removed.len(), 6);
    assert_eq!(removed[0], WorkerId(8));
    assert_eq!(pool.snapshot().await.unwrap().ids(), vec![WorkerId(1), WorkerId(2)]);

    assert!(!pool.terminate(WorkerId(99)).await.unwrap());
    assert!(pool.terminate(WorkerId(2)).await.unwrap());
    assert_eq!(pool.snapshot().await.unwrap().ids(), vec![WorkerId(1)]);

    // Explicit ids are honored once and never reallocated
    assert_eq!(pool.spawn(Some(WorkerId(50))).await.unwrap(), Some(WorkerId(50)));
    assert_eq!(pool.spawn(Some(WorkerId(50))).await.unwrap(), None);
    assert_eq!(pool.spawn(None).await.unwrap(), Some(WorkerId(51)));

    pool.destroy_all().await.unwrap();
  }

  #[tokio::test(start_paused = true)]
  async fn test_controller_waits_out_initial_delay() {
    let errors = ErrorLog::default();
    let settings = settings(2, 8);
    let pool = pool(&settings, &errors);
    pool.grow(2).await.unwrap();

    // Above the ceiling on every tick
    let depths = ScriptedDepth::new([90_000]);
    let queue: Arc<dyn RelayQueue> = depths;
    let controller = ScalingController::new(pool.clone(), Some(queue), settings, errors.handler());
    let cancel = CancellationToken::new();
    let task = tokio::spawn(controller.run(cancel.clone()));

    tokio::time::sleep(Duration::from_secs(29)).await;
    assert_eq!(pool.snapshot().await.unwrap().size(), 2);

    // Ticks at 30s, 35s and 40s; the third acts
    tokio::time::sleep(Duration::from_secs(12)).await;
    assert_eq!(pool.snapshot().await.unwrap().size(), 3);

    cancel.cancel();
    task.await.unwrap();
    pool.destroy_all().await.unwrap();
  }
}
