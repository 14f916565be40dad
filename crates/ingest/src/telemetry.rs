//! Lag watermarks and periodic stats logging
//!
//! Two high-water marks track how far behind the engine runs:
//!
//! - `last_received`: event time of the newest frame the reader saw
//! - `last_processed`: event time of the newest frame a worker fully applied
//!
//! Skew is `now - mark`. Both are written from many tasks, so they are plain
//! atomics holding unix milliseconds (0 = never).

use std::{
  collections::HashMap,
  sync::{
    Arc,
    atomic::{AtomicI64, AtomicU64, Ordering},
  },
  time::Duration,
};

use chrono::{DateTime, Utc};
use tokio::time::{Instant, MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
  pool::{PoolHandle, PoolSnapshot, WorkerId},
  worker::parse_time,
};

// ============================================================================
// Watermarks
// ============================================================================

#[derive(Debug, Default)]
pub struct Watermarks {
  last_received_ms: AtomicI64,
  last_processed_ms: AtomicI64,
  received: AtomicU64,
  processed: AtomicU64,
}

impl Watermarks {
  /// Reader side; `time` is the frame's RFC 3339 timestamp.
  pub fn observe_received(&self, time: &str) {
    self.received.fetch_add(1, Ordering::Relaxed);
    if let Some(time) = parse_time(time) {
      self.last_received_ms.fetch_max(time.timestamp_millis(), Ordering::Relaxed);
    }
  }

  /// Worker side, once a frame is fully applied.
  pub fn observe_processed(&self, time: DateTime<Utc>) {
    self.processed.fetch_add(1, Ordering::Relaxed);
    self.last_processed_ms.fetch_max(time.timestamp_millis(), Ordering::Relaxed);
  }

  pub fn last_received(&self) -> Option<DateTime<Utc>> {
    from_millis(self.last_received_ms.load(Ordering::Relaxed))
  }

  pub fn last_processed(&self) -> Option<DateTime<Utc>> {
    from_millis(self.last_processed_ms.load(Ordering::Relaxed))
  }

  pub fn received(&self) -> u64 {
    self.received.load(Ordering::Relaxed)
  }

  pub fn processed(&self) -> u64 {
    self.processed.load(Ordering::Relaxed)
  }
}

fn from_millis(ms: i64) -> Option<DateTime<Utc>> {
  if ms == 0 { None } else { DateTime::from_timestamp_millis(ms) }
}

/// Format a lag as `1m2.345s`, `2.345s` or `345ms`. Negative lag reads as 0.
pub fn fmt_time(ms: i64) -> String {
  let ms = ms.max(0);
  if ms >= 60_000 {
    format!("{}m{}.{:03}s", ms / 60_000, (ms % 60_000) / 1000, ms % 1000)
  } else if ms >= 1000 {
    format!("{}.{:03}s", ms / 1000, ms % 1000)
  } else {
    format!("{ms}ms")
  }
}

fn skew(now: DateTime<Utc>, mark: Option<DateTime<Utc>>) -> String {
  match mark {
    Some(mark) => fmt_time((now - mark).num_milliseconds()),
    None => "n/a".to_string(),
  }
}

// ============================================================================
// Reporter
// ============================================================================

/// Per-worker `<events/s>/s; <avg ms>ms` lines, newest worker first.
fn worker_lines(snapshot: &PoolSnapshot, previous: &HashMap<WorkerId, u64>, elapsed: Duration) -> Vec<(WorkerId, String)> {
  let secs = elapsed.as_secs_f64().max(f64::EPSILON);
  snapshot
    .workers
    .iter()
    .rev()
    .map(|(id, stats)| {
      let before = previous.get(id).copied().unwrap_or(0);
      let rate = stats.processed_count.saturating_sub(before) as f64 / secs;
      (*id, format!("{rate:.2}/s; {:.2}ms", stats.avg_processing_ms))
    })
    .collect()
}

pub(crate) struct Reporter {
  pool: PoolHandle,
  watermarks: Arc<Watermarks>,
  stats_interval: Duration,
  skew_interval: Duration,
}

impl Reporter {
  pub fn new(pool: PoolHandle, watermarks: Arc<Watermarks>, stats_interval: Duration, skew_interval: Duration) -> Self {
    Self {
      pool,
      watermarks,
      stats_interval,
      skew_interval,
    }
  }

  pub async fn run(self, cancel: CancellationToken) {
    let mut stats_tick = interval(self.stats_interval);
    let mut skew_tick = interval(self.skew_interval);
    stats_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    skew_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick fires immediately
    stats_tick.tick().await;
    skew_tick.tick().await;

    let mut counts: HashMap<WorkerId, u64> = HashMap::new();
    let mut stats_at = Instant::now();
    let mut processed = self.watermarks.processed();
    let mut skew_at = Instant::now();

    loop {
      tokio::select! {
        biased;

        _ = cancel.cancelled() => break,

        _ = stats_tick.tick() => {
          let Ok(snapshot) = self.pool.snapshot().await else { break };
          for (id, line) in worker_lines(&snapshot, &counts, stats_at.elapsed()) {
            info!(worker_id = %id, "{line}");
          }
          info!(size = snapshot.size(), "Pool stats");
          counts = snapshot.workers.iter().map(|(id, stats)| (*id, stats.processed_count)).collect();
          stats_at = Instant::now();
        }

        _ = skew_tick.tick() => {
          let now = Utc::now();
          let total = self.watermarks.processed();
          let rate = total.saturating_sub(processed) as f64 / skew_at.elapsed().as_secs_f64().max(f64::EPSILON);
          info!(
            receive_skew = %skew(now, self.watermarks.last_received()),
            process_skew = %skew(now, self.watermarks.last_processed()),
            rate = %format!("{rate:.2}/s"),
            "Firehose skew"
          );
          processed = total;
          skew_at = Instant::now();
        }
      }
    }

    debug!("Telemetry reporter stopped");
  }
}
