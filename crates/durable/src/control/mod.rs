//! Operator control surface
//!
//! [`ControlApi`] bundles the executor and the schedule manager behind the
//! operations an operator needs: start, cancel and inspect runs, list what
//! is running, and manage schedules. Transport layers (the HTTP server in
//! `keel-control-plane`) only translate requests and map
//! [`ErrorCategory`](crate::error::ErrorCategory) to their own status codes.

mod api;
mod types;

pub use api::{ControlApi, ControlError};
pub use types::{ActivityProgress, ControlConfig, RunDetails, RunSummary};
