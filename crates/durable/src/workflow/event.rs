//! Workflow events for persistence

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ActivityOptions, RunStatus, WorkflowError};
use crate::activity::ActivityError;

/// Events in a run's append-only history
///
/// Events are immutable once written. The run snapshot is reconstructed by
/// folding every event in sequence order; timeouts at each layer have their
/// own kind (`ActivityTimedOut` for the execution limit, `WorkflowTimedOut`
/// for the run deadline).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    // =========================================================================
    // Run Lifecycle Events
    // =========================================================================
    /// First event of every run
    WorkflowStarted {
        workflow_type: String,
        input: serde_json::Value,
        /// Run deadline, relative to the start
        #[serde(default, skip_serializing_if = "Option::is_none")]
        run_timeout_ms: Option<u64>,
        /// Schedule that fired this run
        #[serde(default, skip_serializing_if = "Option::is_none")]
        schedule_id: Option<String>,
    },

    /// Cancellation was requested; status is unaffected until unwinding ends
    CancelRequested { reason: String },

    WorkflowCompleted { result: serde_json::Value },

    WorkflowFailed { error: WorkflowError },

    WorkflowCancelled { reason: String },

    /// The run deadline passed before the run finished
    WorkflowTimedOut,

    // =========================================================================
    // Activity Lifecycle Events
    // =========================================================================
    /// An attempt of an activity was scheduled
    ActivityScheduled {
        activity_id: String,
        activity_type: String,
        input: serde_json::Value,
        options: ActivityOptions,
        /// 1-based attempt number
        attempt: u32,
        /// Earliest dispatch time (later than the event time for retries)
        not_before: DateTime<Utc>,
    },

    /// A worker began executing an attempt
    ActivityStarted {
        activity_id: String,
        attempt: u32,
        worker_id: String,
    },

    ActivityCompleted {
        activity_id: String,
        attempt: u32,
        result: serde_json::Value,
    },

    /// An attempt failed; `will_retry` tells whether another attempt follows
    ActivityFailed {
        activity_id: String,
        attempt: u32,
        error: ActivityError,
        will_retry: bool,
    },

    /// An attempt exceeded its start-to-close timeout
    ActivityTimedOut {
        activity_id: String,
        attempt: u32,
        will_retry: bool,
    },

    /// The activity was abandoned (cancellation or workflow request)
    ActivityCancelled { activity_id: String, reason: String },

    // =========================================================================
    // Timer Events
    // =========================================================================
    TimerStarted {
        timer_id: String,
        fire_at: DateTime<Utc>,
    },

    TimerFired { timer_id: String },
}

impl WorkflowEvent {
    /// Stable kind name, as used in logs and listings
    pub fn kind(&self) -> &'static str {
        match self {
            Self::WorkflowStarted { .. } => "STARTED",
            Self::CancelRequested { .. } => "CANCEL_REQUESTED",
            Self::WorkflowCompleted { .. } => "COMPLETED",
            Self::WorkflowFailed { .. } => "FAILED",
            Self::WorkflowCancelled { .. } => "CANCELLED",
            Self::WorkflowTimedOut => "TIMED_OUT",
            Self::ActivityScheduled { .. } => "ACTIVITY_SCHEDULED",
            Self::ActivityStarted { .. } => "ACTIVITY_STARTED",
            Self::ActivityCompleted { .. } => "ACTIVITY_COMPLETED",
            Self::ActivityFailed { .. } => "ACTIVITY_FAILED",
            Self::ActivityTimedOut { .. } => "ACTIVITY_TIMED_OUT",
            Self::ActivityCancelled { .. } => "ACTIVITY_CANCELLED",
            Self::TimerStarted { .. } => "TIMER_STARTED",
            Self::TimerFired { .. } => "TIMER_FIRED",
        }
    }

    /// Get the activity_id if this is an activity-related event
    pub fn activity_id(&self) -> Option<&str> {
        match self {
            Self::ActivityScheduled { activity_id, .. }
            | Self::ActivityStarted { activity_id, .. }
            | Self::ActivityCompleted { activity_id, .. }
            | Self::ActivityFailed { activity_id, .. }
            | Self::ActivityTimedOut { activity_id, .. }
            | Self::ActivityCancelled { activity_id, .. } => Some(activity_id),
            _ => None,
        }
    }

    /// Status this event closes the run with, if it is terminal
    pub fn terminal_status(&self) -> Option<RunStatus> {
        match self {
            Self::WorkflowCompleted { .. } => Some(RunStatus::Completed),
            Self::WorkflowFailed { .. } => Some(RunStatus::Failed),
            Self::WorkflowCancelled { .. } => Some(RunStatus::Cancelled),
            Self::WorkflowTimedOut => Some(RunStatus::TimedOut),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal_status().is_some()
    }
}

/// A persisted event
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventRecord {
    /// Starts at 1 per run; strictly increasing and gap-free
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub event: WorkflowEvent,
}

impl EventRecord {
    pub fn new(sequence: u64, timestamp: DateTime<Utc>, event: WorkflowEvent) -> Self {
        Self {
            sequence,
            timestamp,
            event,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_workflow_event_wire_tag() {
        let event = WorkflowEvent::WorkflowStarted {
            workflow_type: "order".to_string(),
            input: json!({"order_id": "123"}),
            run_timeout_ms: None,
            schedule_id: None,
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "workflow_started");
        assert!(json.get("run_timeout_ms").is_none());
    }

    #[test]
    fn test_activity_id_extraction() {
        let event = WorkflowEvent::ActivityStarted {
            activity_id: "my-activity".to_string(),
            attempt: 1,
            worker_id: "worker-1".to_string(),
        };
        assert_eq!(event.activity_id(), Some("my-activity"));

        let event = WorkflowEvent::CancelRequested {
            reason: "operator".to_string(),
        };
        assert_eq!(event.activity_id(), None);
    }

    #[test]
    fn test_terminal_events() {
        assert_eq!(
            WorkflowEvent::WorkflowCompleted { result: json!({}) }.terminal_status(),
            Some(RunStatus::Completed)
        );
        assert_eq!(
            WorkflowEvent::WorkflowFailed {
                error: WorkflowError::new("error")
            }
            .terminal_status(),
            Some(RunStatus::Failed)
        );
        assert!(WorkflowEvent::WorkflowCancelled {
            reason: "cancelled".to_string()
        }
        .is_terminal());
        assert!(WorkflowEvent::WorkflowTimedOut.is_terminal());

        assert!(!WorkflowEvent::CancelRequested {
            reason: "x".to_string()
        }
        .is_terminal());
        assert!(!WorkflowEvent::ActivityCompleted {
            activity_id: "x".to_string(),
            attempt: 1,
            result: json!({})
        }
        .is_terminal());
    }

    #[test]
    fn test_unit_variant_round_trips() {
        let record = EventRecord::new(7, Utc::now(), WorkflowEvent::WorkflowTimedOut);
        let json = serde_json::to_string(&record).unwrap();
        let parsed: EventRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, record);
        assert_eq!(parsed.event.kind(), "TIMED_OUT");
    }
}
