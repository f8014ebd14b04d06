//! Schedule records, requests and actions

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ScheduleError, Trigger};
use crate::engine::StartRunRequest;
use crate::serde_millis;
use crate::workflow::RunKey;

/// Number of recent runs kept on a schedule
pub const RECENT_RUNS_LIMIT: usize = 10;

/// Schedule status
///
/// `Deleted` is terminal: a deleted schedule never fires again and every
/// later operation on it fails with not-found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScheduleStatus {
    Active,
    Paused,
    Deleted,
}

impl fmt::Display for ScheduleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScheduleStatus::Active => "ACTIVE",
            ScheduleStatus::Paused => "PAUSED",
            ScheduleStatus::Deleted => "DELETED",
        };
        f.write_str(name)
    }
}

/// Operator action on a schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScheduleAction {
    /// Delete the schedule
    Cancel,
    Pause,
    Unpause,
}

impl FromStr for ScheduleAction {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "CANCEL" => Ok(ScheduleAction::Cancel),
            "PAUSE" => Ok(ScheduleAction::Pause),
            "UNPAUSE" => Ok(ScheduleAction::Unpause),
            _ => Err(ScheduleError::InvalidAction(s.to_string())),
        }
    }
}

impl fmt::Display for ScheduleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScheduleAction::Cancel => "CANCEL",
            ScheduleAction::Pause => "PAUSE",
            ScheduleAction::Unpause => "UNPAUSE",
        };
        f.write_str(name)
    }
}

/// Request to create a schedule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleRequest {
    /// Generated when absent
    #[serde(default)]
    pub schedule_id: Option<String>,
    pub trigger: Trigger,
    pub workflow_type: String,
    /// Input of every run the schedule starts
    #[serde(default)]
    pub input: serde_json::Value,
    /// Timeout applied to every run the schedule starts
    #[serde(default, with = "serde_millis::option")]
    pub run_timeout: Option<Duration>,
}

impl ScheduleRequest {
    pub fn new(trigger: Trigger, workflow_type: impl Into<String>, input: serde_json::Value) -> Self {
        Self {
            schedule_id: None,
            trigger,
            workflow_type: workflow_type.into(),
            input,
            run_timeout: None,
        }
    }

    pub fn with_schedule_id(mut self, schedule_id: impl Into<String>) -> Self {
        self.schedule_id = Some(schedule_id.into());
        self
    }

    pub fn with_run_timeout(mut self, timeout: Duration) -> Self {
        self.run_timeout = Some(timeout);
        self
    }
}

/// A recurring definition that starts runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    pub schedule_id: String,
    pub trigger: Trigger,
    pub workflow_type: String,
    pub input: serde_json::Value,
    #[serde(default, with = "serde_millis::option")]
    pub run_timeout: Option<Duration>,
    pub status: ScheduleStatus,
    pub pause_reason: Option<String>,
    /// `None` while paused, deleted, or when a cron expression is exhausted
    pub next_fire_at: Option<DateTime<Utc>>,
    pub last_fired_at: Option<DateTime<Utc>>,
    pub fire_count: u64,
    /// Runs started by this schedule, newest first
    pub recent_runs: Vec<RunKey>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Bumped on every write; stores reject writes of an outdated version
    pub version: u64,
}

impl Schedule {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == ScheduleStatus::Active && self.next_fire_at.is_some_and(|at| at <= now)
    }

    /// Workflow id of the run started for the firing at `fire_at`
    ///
    /// Deterministic, so coordinators racing on one firing collide on the
    /// workflow id instead of starting two runs.
    pub fn run_workflow_id(&self, fire_at: DateTime<Utc>) -> String {
        format!("{}-{}", self.schedule_id, fire_at.format("%Y%m%dT%H%M%S%.3fZ"))
    }

    /// Start request for the firing at `fire_at`
    pub fn run_request(&self, fire_at: DateTime<Utc>) -> StartRunRequest {
        let request = StartRunRequest::new(self.workflow_type.clone(), self.input.clone())
            .with_workflow_id(self.run_workflow_id(fire_at))
            .with_schedule_id(self.schedule_id.clone());
        match self.run_timeout {
            Some(timeout) => request.with_run_timeout(timeout),
            None => request,
        }
    }

    pub(crate) fn push_run(&mut self, run: RunKey) {
        self.recent_runs.insert(0, run);
        self.recent_runs.truncate(RECENT_RUNS_LIMIT);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn schedule() -> Schedule {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        Schedule {
            schedule_id: "nightly".to_string(),
            trigger: Trigger::interval(Duration::from_secs(60)),
            workflow_type: "sequence".to_string(),
            input: json!({ "steps": ["a"] }),
            run_timeout: Some(Duration::from_secs(600)),
            status: ScheduleStatus::Active,
            pause_reason: None,
            next_fire_at: Some(now),
            last_fired_at: None,
            fire_count: 0,
            recent_runs: vec![],
            created_at: now,
            updated_at: now,
            version: 1,
        }
    }

    #[test]
    fn test_action_parsing_is_case_insensitive() {
        assert_eq!("pause".parse::<ScheduleAction>().unwrap(), ScheduleAction::Pause);
        assert_eq!("UnPause".parse::<ScheduleAction>().unwrap(), ScheduleAction::Unpause);
        assert_eq!(" CANCEL ".parse::<ScheduleAction>().unwrap(), ScheduleAction::Cancel);

        let err = "DELETE_TYPO".parse::<ScheduleAction>().unwrap_err();
        assert!(matches!(err, ScheduleError::InvalidAction(ref a) if a == "DELETE_TYPO"));
    }

    #[test]
    fn test_run_request_for_firing() {
        let schedule = schedule();
        let fire_at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
            + chrono::Duration::milliseconds(250);

        let request = schedule.run_request(fire_at);
        assert_eq!(request.workflow_id.as_deref(), Some("nightly-20240301T120000.250Z"));
        assert_eq!(request.schedule_id.as_deref(), Some("nightly"));
        assert_eq!(request.run_timeout, Some(Duration::from_secs(600)));
        assert_eq!(request.input, json!({ "steps": ["a"] }));
    }

    #[test]
    fn test_due_only_when_active() {
        let mut schedule = schedule();
        let now = schedule.created_at;
        assert!(schedule.is_due(now));
        assert!(!schedule.is_due(now - chrono::Duration::seconds(1)));

        schedule.status = ScheduleStatus::Paused;
        assert!(!schedule.is_due(now));
    }

    #[test]
    fn test_recent_runs_are_bounded() {
        let mut schedule = schedule();
        for i in 0..15 {
            schedule.push_run(RunKey::generate(format!("wf-{}", i)));
        }
        assert_eq!(schedule.recent_runs.len(), RECENT_RUNS_LIMIT);
        assert_eq!(schedule.recent_runs[0].workflow_id, "wf-14");
    }
}
