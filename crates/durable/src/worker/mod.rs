//! Workers
//!
//! This module provides:
//! - [`WorkerPool`] - Leases queued work and drives it through the engine
//! - [`QueuePoller`] - Queue polling with exponential backoff
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                       WorkerPool                          │
//! │  ┌─────────────┐                                          │
//! │  │ QueuePoller │ ── dequeue (lease) ──► TaskQueue         │
//! │  └──────┬──────┘                                          │
//! │         ▼                                                 │
//! │  ┌────────────────────────────────────────────────────┐   │
//! │  │          Semaphore-limited processing              │   │
//! │  │  Activity    → ActivityExecutor → report outcome   │   │
//! │  │  TimerFired  → engine                              │   │
//! │  │  RunTimeout  → engine                              │   │
//! │  │  (lease renewed while an activity runs)            │   │
//! │  └────────────────────────────────────────────────────┘   │
//! │         │                                                 │
//! │         ▼  ack / nack                                     │
//! └──────────────────────────────────────────────────────────┘
//! ```

mod poller;
mod pool;

pub use poller::{PollerConfig, PollerError, QueuePoller};
pub use pool::{WorkerPool, WorkerPoolConfig, WorkerPoolError, WorkerPoolStatus};
