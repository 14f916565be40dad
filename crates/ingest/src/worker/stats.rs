use std::{collections::VecDeque, time::Duration};

use chrono::{DateTime, Utc};

/// Throughput and latency snapshot published by one worker.
///
/// The worker is the only writer. The pool reads the latest value through a
/// watch channel, so a snapshot is always one complete report.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkerStats {
  /// Init handshake finished
  pub ready: bool,
  pub processed_count: u64,
  /// Mean over the rolling window
  pub avg_processing_ms: f64,
  pub last_event_time: Option<DateTime<Utc>>,
  /// `now - last_event_time` at the last report
  pub current_latency_ms: u64,
  /// Every apply slot is busy; intake stops once the local queue fills too
  pub saturated: bool,
}

/// Keeps the rolling window behind [`WorkerStats`].
#[derive(Debug)]
pub struct StatsRecorder {
  window: VecDeque<f64>,
  capacity: usize,
  stats: WorkerStats,
}

impl StatsRecorder {
  pub fn new(capacity: usize) -> Self {
    Self {
      window: VecDeque::with_capacity(capacity),
      capacity: capacity.max(1),
      stats: WorkerStats::default(),
    }
  }

  pub fn stats(&self) -> &WorkerStats {
    &self.stats
  }

  pub fn mark_ready(&mut self) -> &WorkerStats {
    self.stats.ready = true;
    &self.stats
  }

  /// Returns whether the flag changed.
  pub fn set_saturated(&mut self, saturated: bool) -> bool {
    let changed = self.stats.saturated != saturated;
    self.stats.saturated = saturated;
    changed
  }

  /// Record one applied frame that produced `events` domain events.
  pub fn record(&mut self, elapsed: Duration, events: usize, event_time: Option<DateTime<Utc>>, now: DateTime<Utc>) {
    if self.window.len() == self.capacity {
      self.window.pop_front();
    }
    self.window.push_back(elapsed.as_secs_f64() * 1000.0);

    self.stats.processed_count += events as u64;
    self.stats.avg_processing_ms = self.window.iter().sum::<f64>() / self.window.len() as f64;
    if let Some(time) = event_time {
      self.stats.last_event_time = Some(time);
      self.stats.current_latency_ms = (now - time).num_milliseconds().max(0) as u64;
    }
  }
}
