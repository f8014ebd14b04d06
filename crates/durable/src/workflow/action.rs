//! Workflow actions and activity options

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::WorkflowError;
use crate::reliability::RetryPolicy;
use crate::serde_millis;

/// Actions a workflow handler can request
///
/// The engine turns each accepted action into one or more
/// [`WorkflowEvent`](super::WorkflowEvent)s before anything is dispatched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowAction {
    /// Schedule an activity for execution
    ScheduleActivity {
        /// Unique within the run
        activity_id: String,

        /// Selects the activity implementation
        activity_type: String,

        input: serde_json::Value,

        options: ActivityOptions,
    },

    /// Fire `on_timer_fired(timer_id)` after `duration`
    StartTimer {
        timer_id: String,

        #[serde(with = "serde_millis")]
        duration: Duration,
    },

    /// Finish the run successfully
    CompleteWorkflow { result: serde_json::Value },

    /// Finish the run with an error
    FailWorkflow { error: WorkflowError },

    /// Abandon an in-flight activity (advisory for the worker running it)
    CancelActivity { activity_id: String },
}

impl WorkflowAction {
    /// Schedule an activity with default options
    pub fn schedule_activity(
        activity_id: impl Into<String>,
        activity_type: impl Into<String>,
        input: serde_json::Value,
    ) -> Self {
        Self::ScheduleActivity {
            activity_id: activity_id.into(),
            activity_type: activity_type.into(),
            input,
            options: ActivityOptions::default(),
        }
    }

    pub fn complete(result: serde_json::Value) -> Self {
        Self::CompleteWorkflow { result }
    }

    pub fn fail(error: WorkflowError) -> Self {
        Self::FailWorkflow { error }
    }

    pub fn timer(timer_id: impl Into<String>, duration: Duration) -> Self {
        Self::StartTimer {
            timer_id: timer_id.into(),
            duration,
        }
    }

    /// Replace the options of a `ScheduleActivity`; no-op otherwise
    pub fn with_options(mut self, new_options: ActivityOptions) -> Self {
        if let Self::ScheduleActivity { options, .. } = &mut self {
            *options = new_options;
        }
        self
    }
}

/// Options for activity execution
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActivityOptions {
    /// Engine-level retries of failed or timed-out attempts
    pub retry_policy: RetryPolicy,

    /// Maximum time for a single attempt, enforced by the executor
    #[serde(with = "serde_millis")]
    pub start_to_close_timeout: Duration,
}

impl Default for ActivityOptions {
    fn default() -> Self {
        Self {
            retry_policy: RetryPolicy::default(),
            start_to_close_timeout: Duration::from_secs(300),
        }
    }
}

impl ActivityOptions {
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_start_to_close_timeout(mut self, timeout: Duration) -> Self {
        self.start_to_close_timeout = timeout;
        self
    }
}
