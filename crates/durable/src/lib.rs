//! # Keel Durable Execution Core
//!
//! An event-sourced workflow engine: runs are driven by deterministic
//! workflow code, their history is an append-only event log, and every
//! side effect happens in an activity executed by a worker.
//!
//! ## Features
//!
//! - **Event-sourced runs**: state is rebuilt by replaying history, with
//!   snapshots to keep loads short
//! - **Activity retries**: fixed or exponential backoff with deterministic jitter
//! - **Leased task queue**: at-least-once delivery with lease expiry for crash detection
//! - **Schedules**: interval and cron triggers that start runs
//! - **Control API**: start, cancel and inspect runs, manage schedules
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │             ControlApi          TriggerEvaluator             │
//! │       (operator requests)      (fires due schedules)         │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      WorkflowExecutor                        │
//! │   (StateMachine decisions, optimistic appends, dispatch)     │
//! └─────────────────────────────────────────────────────────────┘
//!               │                               │
//!               ▼                               ▼
//! ┌──────────────────────────┐    ┌──────────────────────────────┐
//! │    WorkflowEventStore    │    │          TaskQueue           │
//! │ (runs, events, snapshots)│    │ (activities, timers, leases) │
//! └──────────────────────────┘    └──────────────────────────────┘
//!                                               │
//!                                               ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         WorkerPool                           │
//! │  (leases work, executes activities, renews leases)          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use keel_durable::prelude::*;
//!
//! let clock = keel_durable::clock::system_clock();
//! let executor = Arc::new(WorkflowExecutor::new(
//!     Arc::new(InMemoryWorkflowEventStore::new()),
//!     Arc::new(InMemoryTaskQueue::new()),
//!     WorkflowRegistry::new().with::<SequenceWorkflow>(),
//!     ExecutorConfig::default(),
//! ));
//!
//! let activities = ActivityExecutor::new().with(EchoActivity);
//! let pool = WorkerPool::new(executor.clone(), Arc::new(activities), WorkerPoolConfig::new());
//! pool.start()?;
//!
//! let run = executor
//!     .start_run(StartRunRequest::new("sequence", json!({ "steps": ["a", "b"] })))
//!     .await?;
//! ```

pub mod activity;
pub mod builtin;
pub mod clock;
pub mod control;
pub mod engine;
pub mod error;
pub mod persistence;
pub mod queue;
pub mod reliability;
pub mod schedule;
pub mod worker;
pub mod workflow;

mod serde_millis;

/// Prelude for common imports
pub mod prelude {
    pub use std::sync::Arc;

    pub use async_trait::async_trait;
    pub use serde::{Deserialize, Serialize};
    pub use serde_json::{json, Value};

    pub use crate::activity::{Activity, ActivityContext, ActivityError, ActivityExecutor};
    pub use crate::builtin::{EchoActivity, SequenceInput, SequenceWorkflow};
    pub use crate::control::{ControlApi, ControlConfig, ControlError};
    pub use crate::engine::{
        ExecutorConfig, ExecutorError, StartRunRequest, WorkflowExecutor, WorkflowRegistry,
    };
    pub use crate::error::ErrorCategory;
    pub use crate::persistence::{InMemoryWorkflowEventStore, StoreError, WorkflowEventStore};
    pub use crate::queue::{InMemoryTaskQueue, TaskQueue};
    pub use crate::reliability::RetryPolicy;
    pub use crate::schedule::{ScheduleManager, ScheduleRequest, Trigger};
    pub use crate::worker::{WorkerPool, WorkerPoolConfig, WorkerPoolError};
    pub use crate::workflow::{
        ActivityOptions, RunKey, RunStatus, Workflow, WorkflowAction, WorkflowError,
    };
}

// Re-export key types at crate root
pub use activity::{Activity, ActivityContext, ActivityError, ActivityExecutor};
pub use control::{ControlApi, ControlConfig, ControlError};
pub use engine::{ExecutorConfig, ExecutorError, StartRunRequest, WorkflowExecutor, WorkflowRegistry};
pub use error::ErrorCategory;
pub use persistence::{InMemoryWorkflowEventStore, StoreError, WorkflowEventStore};
pub use reliability::RetryPolicy;
pub use schedule::{ScheduleManager, TriggerEvaluator};
pub use worker::{WorkerPool, WorkerPoolConfig, WorkerPoolError};
pub use workflow::{
    ActivityOptions, RunKey, RunStatus, Workflow, WorkflowAction, WorkflowError, WorkflowEvent,
};
