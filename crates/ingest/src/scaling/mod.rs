//! Autoscaling: a pure policy and the loop that drives it.

mod controller;
mod policy;

pub use self::{
  controller::ScalingController,
  policy::{Autoscaler, Observation, ScaleDecision, ScaleReason},
};
