mod backoff;
mod error;
mod subscription;
mod telemetry;

pub mod event;
pub mod indexing;
pub mod pool;
pub mod queue;
pub mod scaling;
pub mod stream;
pub mod worker;

#[cfg(test)]
mod __tests__;

pub use backoff::Backoff;
pub use error::{ErrorHandler, IngestError, log_errors};
pub use subscription::{FirehoseSubscription, SubscriptionError};
pub use telemetry::{Watermarks, fmt_time};
