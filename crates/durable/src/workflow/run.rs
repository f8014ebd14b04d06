//! Run identity and lifecycle status

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity of one run: (workflow_id, run_id)
///
/// `workflow_id` is caller-chosen and stable across re-executions;
/// `run_id` disambiguates each execution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunKey {
    pub workflow_id: String,
    pub run_id: Uuid,
}

impl RunKey {
    pub fn new(workflow_id: impl Into<String>, run_id: Uuid) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            run_id,
        }
    }

    /// Fresh run of `workflow_id` with a time-ordered run id
    pub fn generate(workflow_id: impl Into<String>) -> Self {
        Self::new(workflow_id, Uuid::now_v7())
    }
}

impl fmt::Display for RunKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.workflow_id, self.run_id)
    }
}

/// Run status
///
/// Transitions are monotonic: `Running` moves to exactly one terminal
/// status and never leaves it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "RUNNING",
            RunStatus::Completed => "COMPLETED",
            RunStatus::Failed => "FAILED",
            RunStatus::Cancelled => "CANCELLED",
            RunStatus::TimedOut => "TIMED_OUT",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Store-level summary of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunInfo {
    pub key: RunKey,
    pub workflow_type: String,
    pub status: RunStatus,
    pub start_time: DateTime<Utc>,
    pub close_time: Option<DateTime<Utc>>,
    /// Schedule that started this run, if any
    pub schedule_id: Option<String>,
    /// Sequence number of the newest event
    pub last_sequence: u64,
}

impl RunInfo {
    pub fn is_open(&self) -> bool {
        !self.status.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(!RunStatus::Running.is_terminal());
        for status in [
            RunStatus::Completed,
            RunStatus::Failed,
            RunStatus::Cancelled,
            RunStatus::TimedOut,
        ] {
            assert!(status.is_terminal(), "{status} should be terminal");
        }
    }

    #[test]
    fn test_status_wire_format() {
        let json = serde_json::to_string(&RunStatus::TimedOut).unwrap();
        assert_eq!(json, "\"TIMED_OUT\"");
        assert_eq!(RunStatus::TimedOut.to_string(), "TIMED_OUT");
    }

    #[test]
    fn test_run_key_display() {
        let run_id = Uuid::now_v7();
        let key = RunKey::new("order-42", run_id);
        assert_eq!(key.to_string(), format!("order-42/{run_id}"));
    }
}
