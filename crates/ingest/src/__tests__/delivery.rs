//! Queue-mode delivery tests.
//!
//! Runs the whole subscription against a scripted firehose and an in-memory
//! relay queue, and checks that crashes and apply failures never lose frames.

#[cfg(test)]
mod tests {
  use std::{
    sync::{
      Arc,
      atomic::{AtomicBool, Ordering},
    },
    time::Duration,
  };

  use async_trait::async_trait;
  use bytes::Bytes;
  use skyline_core::{Config, DeliveryMode};
  use tokio_util::sync::CancellationToken;

  use crate::{
    FirehoseSubscription,
    __tests__::helpers::{ErrorLog, Fault, FaultyFactory, FrameBuilder, ScriptedConnector, frames, wait_for},
    queue::{MemoryQueue, QueueEntry, QueueError, RelayQueue},
  };

  const DID: &str = "did:plc:abc";

  fn config() -> Config {
    let mut config = Config::default();
    config.queue.mode = DeliveryMode::Queue;
    config.pool.min_workers = 2;
    config.pool.max_workers = 2;
    config.pool.initial_delay_ms = 60_000;
    config.worker.concurrency = 4;
    config.worker.shutdown_grace_ms = 1_000;
    config.worker.restart_delay_ms = 50;
    config
  }

  fn queue() -> MemoryQueue {
    MemoryQueue::new(Duration::from_millis(200), Duration::from_millis(20))
  }

  /// Memory queue that drops the first ack it sees.
  #[derive(Clone)]
  struct LosesFirstAck {
    inner: MemoryQueue,
    lost: Arc<AtomicBool>,
  }

  #[async_trait]
  impl RelayQueue for LosesFirstAck {
    async fn ensure_group(&self) -> Result<(), QueueError> {
      self.inner.ensure_group().await
    }

    async fn append(&self, sequence: i64, payload: Bytes) -> Result<String, QueueError> {
      self.inner.append(sequence, payload).await
    }

    async fn claim_next(&self, consumer: &str) -> Result<Option<QueueEntry>, QueueError> {
      self.inner.claim_next(consumer).await
    }

    async fn ack(&self, entry_id: &str) -> Result<(), QueueError> {
      if !self.lost.swap(true, Ordering::SeqCst) {
        return Err(QueueError::Closed);
      }
      self.inner.ack(entry_id).await
    }

    async fn depth(&self) -> Result<u64, QueueError> {
      self.inner.depth().await
    }

    async fn oldest_sequence(&self) -> Result<Option<i64>, QueueError> {
      self.inner.oldest_sequence().await
    }

    async fn connect_consumer(&self) -> Result<Arc<dyn RelayQueue>, QueueError> {
      Ok(Arc::new(self.clone()))
    }
  }

  struct Run {
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<Result<(), crate::SubscriptionError>>,
  }

  impl Run {
    fn start(subscription: FirehoseSubscription) -> Self {
      let cancel = CancellationToken::new();
      let task = tokio::spawn(subscription.run(cancel.clone()));
      Self { cancel, task }
    }

    async fn stop(self) {
      self.cancel.cancel();
      self.task.await.expect("subscription task").expect("subscription run");
    }
  }

  async fn settled(factory: &FaultyFactory, queue: &MemoryQueue, records: usize) -> bool {
    let factory = factory.clone();
    let queue = queue.clone();
    wait_for(Duration::from_secs(10), || {
      let factory = factory.clone();
      let queue = queue.clone();
      async move { factory.index.record_count().await == records && queue.depth().await.unwrap_or(1) == 0 }
    })
    .await
  }

  #[tokio::test]
  async fn test_panicking_worker_loses_nothing() {
    let queue = queue();
    let factory = FaultyFactory::new(Fault::Panic, "app.bsky.feed.post/3");
    let errors = ErrorLog::default();
    let connector = Arc::new(ScriptedConnector::new(vec![frames(
      (1..=10).map(|seq| FrameBuilder::post(seq, DID)),
    )]));

    let run = Run::start(
      FirehoseSubscription::new(config(), Arc::new(factory.clone()))
        .with_connector(connector)
        .with_queue(Arc::new(queue.clone()))
        .with_error_handler(errors.handler()),
    );

    let done = settled(&factory, &queue, 10).await;
    run.stop().await;

    assert!(done, "all frames should be indexed and acked after the crash");
    assert!(factory.tripped());
    assert_eq!(errors.count("worker_fault"), 1);
    assert!(errors.messages("worker_fault")[0].contains("injected panic"));
    assert_eq!(queue.acked().await, 10);
  }

  #[tokio::test]
  async fn test_apply_failure_is_retried_after_claim_expires() {
    let queue = queue();
    let factory = FaultyFactory::new(Fault::Fail, "app.bsky.feed.post/2");
    let errors = ErrorLog::default();
    let connector = Arc::new(ScriptedConnector::new(vec![frames(
      (1..=5).map(|seq| FrameBuilder::post(seq, DID)),
    )]));

    let run = Run::start(
      FirehoseSubscription::new(config(), Arc::new(factory.clone()))
        .with_connector(connector)
        .with_queue(Arc::new(queue.clone()))
        .with_error_handler(errors.handler()),
    );

    let done = settled(&factory, &queue, 5).await;
    run.stop().await;

    assert!(done, "failed frame should be redelivered and applied");
    assert_eq!(errors.count("apply"), 1);
    assert_eq!(errors.count("worker_fault"), 0);
    let snapshot = factory.index.snapshot().await;
    assert!(snapshot.records.contains_key("at://did:plc:abc/app.bsky.feed.post/2"));
  }

  #[tokio::test]
  async fn test_bad_frames_are_acked_and_skipped() {
    let queue = queue();
    let factory = FaultyFactory::new(Fault::Fail, "never-matches");
    let errors = ErrorLog::default();
    let connector = Arc::new(ScriptedConnector::new(vec![frames([
      FrameBuilder::post(1, DID),
      FrameBuilder::raw("#bogus", 2),
      FrameBuilder::post(3, DID),
      FrameBuilder::account_without_active(4, DID),
    ])]));

    let run = Run::start(
      FirehoseSubscription::new(config(), Arc::new(factory.clone()))
        .with_connector(connector)
        .with_queue(Arc::new(queue.clone()))
        .with_error_handler(errors.handler()),
    );

    let done = settled(&factory, &queue, 2).await;
    let acked = wait_for(Duration::from_secs(5), || {
      let queue = queue.clone();
      async move { queue.acked().await == 4 }
    })
    .await;
    run.stop().await;

    assert!(done && acked);
    assert_eq!(errors.count("decode"), 1);
    assert_eq!(errors.count("validation"), 1);
  }

  #[tokio::test]
  async fn test_entry_redelivered_after_lost_ack_indexes_the_same() {
    let posts = || frames((1..=5).map(|seq| FrameBuilder::post(seq, DID)));

    let clean_queue = queue();
    let clean = FaultyFactory::new(Fault::Fail, "never-matches");
    let run = Run::start(
      FirehoseSubscription::new(config(), Arc::new(clean.clone()))
        .with_connector(Arc::new(ScriptedConnector::new(vec![posts()])))
        .with_queue(Arc::new(clean_queue.clone())),
    );
    let clean_done = settled(&clean, &clean_queue, 5).await;
    run.stop().await;

    let lossy = LosesFirstAck {
      inner: queue(),
      lost: Arc::new(AtomicBool::new(false)),
    };
    let factory = FaultyFactory::new(Fault::Fail, "never-matches");
    let errors = ErrorLog::default();
    let run = Run::start(
      FirehoseSubscription::new(config(), Arc::new(factory.clone()))
        .with_connector(Arc::new(ScriptedConnector::new(vec![posts()])))
        .with_queue(Arc::new(lossy.clone()))
        .with_error_handler(errors.handler()),
    );
    // Depth only reaches zero once the unacked entry is reclaimed and applied again
    let done = settled(&factory, &lossy.inner, 5).await;
    run.stop().await;

    assert!(clean_done && done);
    assert_eq!(errors.count("queue"), 1);
    assert_eq!(lossy.inner.acked().await, 5);
    assert_eq!(factory.index.snapshot().await.records, clean.index.snapshot().await.records);
  }
}
