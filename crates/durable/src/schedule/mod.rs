//! Schedules
//!
//! A schedule starts a run of its workflow type every time its trigger
//! fires. The [`ScheduleManager`] handles the lifecycle (create, pause,
//! unpause, delete) and the [`TriggerEvaluator`] fires due schedules in
//! the background.
//!
//! ```text
//!            create                pause
//!   ──────────────────► ACTIVE ◄─────────────► PAUSED
//!                          │        unpause       │
//!                          │ cancel               │ cancel
//!                          ▼                      ▼
//!                       DELETED ◄─────────────────┘
//! ```

mod evaluator;
mod manager;
mod store;
mod trigger;
mod types;

pub use evaluator::{RunLauncher, TriggerEvaluator, TriggerEvaluatorConfig};
pub use manager::ScheduleManager;
pub use store::{InMemoryScheduleStore, ScheduleError, ScheduleStore};
pub use trigger::Trigger;
pub use types::{
    Schedule, ScheduleAction, ScheduleRequest, ScheduleStatus, RECENT_RUNS_LIMIT,
};
