//! Reliability patterns for durable execution
//!
//! This module provides:
//! - [`RetryPolicy`] - Activity retries with exponential backoff
//! - [`retry_transient`] - Bounded retry of transient backend failures

mod retry;
mod transient;

pub use retry::{jitter_seed, RetryPolicy};
pub use transient::{retry_transient, Transient, TransientRetryConfig};
