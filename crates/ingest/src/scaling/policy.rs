//! Scaling policy
//!
//! Pure decision logic: given what the controller observed on one tick, say
//! whether the pool should grow, shrink or hold. The only state carried
//! between ticks is the previous backlog depth and the debounce counter.
//!
//! Rules, in order:
//!
//! 1. Empty pool: never act.
//! 2. Below `min_workers`: grow back to the minimum.
//! 3. More than half the workers saturated: add one worker now.
//! 4. Strategy rule (backlog or latency), scale-up debounced.

use std::fmt;

use skyline_core::ScalingConfig;

use crate::{pool::PoolSettings, worker::WorkerStats};

/// What the controller saw on one tick.
#[derive(Debug, Clone, Default)]
pub struct Observation {
  pub size: usize,
  /// Relay queue depth; `None` when there is no queue
  pub depth: Option<u64>,
  pub workers: Vec<WorkerStats>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScaleReason {
  BelowMinimum,
  Saturated { saturated: usize },
  Backlog { depth: u64 },
  BacklogDrained { depth: u64 },
  HighLatency { mean_ms: u64 },
  LowLatency { mean_ms: u64 },
}

impl fmt::Display for ScaleReason {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::BelowMinimum => write!(f, "pool below minimum"),
      Self::Saturated { saturated } => write!(f, "{saturated} workers saturated"),
      Self::Backlog { depth } => write!(f, "backlog at {depth}"),
      Self::BacklogDrained { depth } => write!(f, "backlog drained to {depth}"),
      Self::HighLatency { mean_ms } => write!(f, "mean latency {mean_ms}ms"),
      Self::LowLatency { mean_ms } => write!(f, "mean latency down to {mean_ms}ms"),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScaleDecision {
  Hold,
  /// Scale-up warranted but the pool is at `max_workers`
  AtCapacity { reason: ScaleReason },
  Grow { by: usize, reason: ScaleReason },
  Shrink { by: usize, reason: ScaleReason },
}

#[derive(Debug)]
pub struct Autoscaler {
  settings: PoolSettings,
  previous_depth: Option<u64>,
  /// Consecutive ticks the scale-up condition held
  qualifying: u32,
}

impl Autoscaler {
  pub fn new(settings: PoolSettings) -> Self {
    Self {
      settings,
      previous_depth: None,
      qualifying: 0,
    }
  }

  pub fn decide(&mut self, observation: &Observation) -> ScaleDecision {
    let size = observation.size;
    if size == 0 {
      return ScaleDecision::Hold;
    }
    if size < self.settings.min_workers {
      self.qualifying = 0;
      return ScaleDecision::Grow {
        by: self.settings.min_workers - size,
        reason: ScaleReason::BelowMinimum,
      };
    }

    let decision = match self.settings.scaling {
      ScalingConfig::Backlog {
        high_water,
        ceiling,
        low_water,
      } => self.backlog(size, observation.depth, high_water, ceiling, low_water),
      ScalingConfig::Latency { target_latency_ms } => self.latency(size, &observation.workers, target_latency_ms),
    };

    // Saturation bypasses the debounce but never overrides a bigger step
    let saturated = observation.workers.iter().filter(|w| w.saturated).count();
    if saturated * 2 > size && !matches!(decision, ScaleDecision::Grow { .. } | ScaleDecision::AtCapacity { .. }) {
      return self.grow(size, 1, ScaleReason::Saturated { saturated });
    }
    decision
  }

  fn backlog(&mut self, size: usize, depth: Option<u64>, high_water: u64, ceiling: u64, low_water: u64) -> ScaleDecision {
    let Some(depth) = depth else {
      return ScaleDecision::Hold;
    };
    let growing = self.previous_depth.is_some_and(|previous| depth > previous);
    self.previous_depth = Some(depth);

    if (growing && depth > high_water) || depth > ceiling {
      self.qualifying += 1;
      if self.qualifying >= self.settings.debounce_ticks {
        self.qualifying = 0;
        return self.grow(size, size.div_ceil(2), ScaleReason::Backlog { depth });
      }
      return ScaleDecision::Hold;
    }

    self.qualifying = 0;
    if depth < low_water && size > self.settings.min_workers {
      return ScaleDecision::Shrink {
        by: 1,
        reason: ScaleReason::BacklogDrained { depth },
      };
    }
    ScaleDecision::Hold
  }

  fn latency(&mut self, size: usize, workers: &[WorkerStats], target_latency_ms: u64) -> ScaleDecision {
    // Workers that have not applied anything yet carry no latency signal
    let samples: Vec<u64> = workers
      .iter()
      .filter(|w| w.last_event_time.is_some())
      .map(|w| w.current_latency_ms)
      .collect();
    if samples.is_empty() {
      self.qualifying = 0;
      return ScaleDecision::Hold;
    }
    let mean_ms = samples.iter().sum::<u64>() / samples.len() as u64;

    if mean_ms > target_latency_ms {
      self.qualifying += 1;
      if self.qualifying >= self.settings.debounce_ticks {
        self.qualifying = 0;
        return self.grow(size, size.div_ceil(2), ScaleReason::HighLatency { mean_ms });
      }
      return ScaleDecision::Hold;
    }

    self.qualifying = 0;
    if mean_ms < target_latency_ms / 2 {
      let target = self.settings.clamp((size * 3).div_ceil(4));
      if target < size {
        return ScaleDecision::Shrink {
          by: size - target,
          reason: ScaleReason::LowLatency { mean_ms },
        };
      }
    }
    ScaleDecision::Hold
  }

  fn grow(&self, size: usize, by: usize, reason: ScaleReason) -> ScaleDecision {
    if size >= self.settings.max_workers {
      return ScaleDecision::AtCapacity { reason };
    }
    let target = self.settings.clamp(size + by);
    ScaleDecision::Grow {
      by: target - size,
      reason,
    }
  }
}
