//! Exponential backoff for reconnects and queue retries.

use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct Backoff {
  pub initial: Duration,
  pub max: Duration,
  pub multiplier: f64,
}

impl Backoff {
  pub fn new(initial: Duration, max: Duration) -> Self {
    Self {
      initial,
      max,
      multiplier: 2.0,
    }
  }

  /// Delay before retry number `attempt` (0-based), capped at `max`.
  pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
    let exp = self.multiplier.powi(attempt.min(32) as i32);
    let delay = self.initial.as_secs_f64() * exp;
    Duration::from_secs_f64(delay.min(self.max.as_secs_f64()))
  }
}
