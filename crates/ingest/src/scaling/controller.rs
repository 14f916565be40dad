//! Autoscaling control loop

use std::sync::Arc;

use skyline_core::ScalingConfig;
use tokio::time::{MissedTickBehavior, interval, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::policy::{Autoscaler, Observation, ScaleDecision};
use crate::{
  error::{ErrorHandler, IngestError},
  pool::{PoolHandle, PoolSettings},
  queue::RelayQueue,
};

/// Periodically observes the pool (and queue) and applies the policy.
pub struct ScalingController {
  pool: PoolHandle,
  queue: Option<Arc<dyn RelayQueue>>,
  settings: PoolSettings,
  autoscaler: Autoscaler,
  on_error: ErrorHandler,
}

impl ScalingController {
  pub fn new(
    pool: PoolHandle,
    queue: Option<Arc<dyn RelayQueue>>,
    settings: PoolSettings,
    on_error: ErrorHandler,
  ) -> Self {
    Self {
      pool,
      autoscaler: Autoscaler::new(settings.clone()),
      queue,
      settings,
      on_error,
    }
  }

  pub async fn run(mut self, cancel: CancellationToken) {
    // Give the initial workers time to become ready
    tokio::select! {
        biased;
        _ = cancel.cancelled() => return,
        _ = sleep(self.settings.initial_delay) => {}
    }

    let mut ticker = interval(self.settings.scale_check_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(
      interval_ms = self.settings.scale_check_interval.as_millis() as u64,
      "Scaling controller started"
    );

    loop {
      tokio::select! {
          biased;
          _ = cancel.cancelled() => break,
          _ = ticker.tick() => {
              if let Err(e) = self.tick().await {
                  (self.on_error)(&e);
              }
          }
      }
    }

    debug!("Scaling controller stopped");
  }

  /// Run one observation and apply the resulting decision.
  pub async fn tick(&mut self) -> Result<ScaleDecision, IngestError> {
    let snapshot = self
      .pool
      .snapshot()
      .await
      .map_err(|e| IngestError::Scaling(format!("pool unavailable: {e}")))?;

    let depth = match (&self.queue, &self.settings.scaling) {
      (Some(queue), ScalingConfig::Backlog { .. }) => Some(
        queue
          .depth()
          .await
          .map_err(|e| IngestError::Scaling(format!("queue depth unavailable: {e}")))?,
      ),
      _ => None,
    };

    let size = snapshot.size();
    let observation = Observation {
      size,
      depth,
      workers: snapshot.stats().cloned().collect(),
    };
    let decision = self.autoscaler.decide(&observation);

    match decision {
      ScaleDecision::Hold => trace!(size, depth, "Holding pool size"),
      ScaleDecision::AtCapacity { reason } => {
        warn!(size, max = self.settings.max_workers, reason = %reason, "Scale-up warranted but pool at max");
      }
      ScaleDecision::Grow { by, reason } => {
        let added = self
          .pool
          .grow(by)
          .await
          .map_err(|e| IngestError::Scaling(e.to_string()))?;
        info!(from = size, to = size + added.len(), reason = %reason, "Scaling up");
      }
      ScaleDecision::Shrink { by, reason } => {
        let removed = self
          .pool
          .shrink(by)
          .await
          .map_err(|e| IngestError::Scaling(e.to_string()))?;
        let ids: Vec<_> = removed.iter().map(ToString::to_string).collect();
        info!(
          from = size,
          to = size - removed.len(),
          terminated = %ids.join(","),
          reason = %reason,
          "Scaling down"
        );
      }
    }

    Ok(decision)
  }
}
