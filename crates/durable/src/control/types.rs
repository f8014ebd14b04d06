//! Views returned by the control API

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::{ActivityInvocation, ActivityStatus, RunSnapshot};
use crate::workflow::{RunStatus, WorkflowError};

/// Control API configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ControlConfig {
    /// Used when `list_running_runs` gets no limit
    pub default_max_results: usize,

    /// Larger limits are clamped to this
    pub max_results_limit: usize,

    /// Used when a cancel request carries no reason
    pub default_cancel_reason: String,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            default_max_results: 100,
            max_results_limit: 1000,
            default_cancel_reason: "Cancelled via API".to_string(),
        }
    }
}

impl ControlConfig {
    pub fn with_max_results_limit(mut self, limit: usize) -> Self {
        self.max_results_limit = limit.max(1);
        self
    }

    pub fn with_default_cancel_reason(mut self, reason: impl Into<String>) -> Self {
        self.default_cancel_reason = reason.into();
        self
    }
}

/// An activity of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityProgress {
    pub activity_id: String,
    pub activity_type: String,
    pub status: ActivityStatus,
    pub attempt: u32,
    /// When the current attempt started executing
    pub started_time: Option<DateTime<Utc>>,
}

impl From<&ActivityInvocation> for ActivityProgress {
    fn from(activity: &ActivityInvocation) -> Self {
        Self {
            activity_id: activity.activity_id.clone(),
            activity_type: activity.activity_type.clone(),
            status: activity.status,
            attempt: activity.attempt,
            started_time: activity.started_at,
        }
    }
}

/// One line of the running-runs listing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub workflow_id: String,
    pub run_id: Uuid,
    pub workflow_type: String,
    pub start_time: DateTime<Utc>,
    pub status: RunStatus,
    /// In-flight (scheduled or started) activities
    pub activity_count: usize,
    pub activities_in_progress: Vec<ActivityProgress>,
}

impl From<&RunSnapshot> for RunSummary {
    fn from(snapshot: &RunSnapshot) -> Self {
        Self {
            workflow_id: snapshot.key.workflow_id.clone(),
            run_id: snapshot.key.run_id,
            workflow_type: snapshot.workflow_type.clone(),
            start_time: snapshot.start_time,
            status: snapshot.status,
            activity_count: snapshot.activity_count(),
            activities_in_progress: snapshot.in_flight().map(ActivityProgress::from).collect(),
        }
    }
}

/// Everything known about one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunDetails {
    #[serde(flatten)]
    pub summary: RunSummary,
    pub close_time: Option<DateTime<Utc>>,
    pub deadline: Option<DateTime<Utc>>,
    pub schedule_id: Option<String>,
    pub input: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub error: Option<WorkflowError>,
    pub cancel_reason: Option<String>,
    /// Every activity of the run, in flight or not
    pub activities: Vec<ActivityProgress>,
    /// Number of events in the run's history
    pub event_count: u64,
}

impl From<&RunSnapshot> for RunDetails {
    fn from(snapshot: &RunSnapshot) -> Self {
        Self {
            summary: RunSummary::from(snapshot),
            close_time: snapshot.close_time,
            deadline: snapshot.deadline,
            schedule_id: snapshot.schedule_id.clone(),
            input: snapshot.input.clone(),
            result: snapshot.result.clone(),
            error: snapshot.error.clone(),
            cancel_reason: snapshot.cancel_reason.clone(),
            activities: snapshot.activities.values().map(ActivityProgress::from).collect(),
            event_count: snapshot.last_sequence,
        }
    }
}
