//! Run snapshot, incoming events and commands
//!
//! [`RunSnapshot`] is everything the state machine needs to decide the next
//! step of a run. It is derived purely from the event history, so a snapshot
//! rebuilt by replay is equal to the one produced live.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::activity::ActivityError;
use crate::queue::ActivityTask;
use crate::workflow::{ActivityOptions, RunInfo, RunKey, RunStatus, WorkflowError};

/// Status of one activity invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActivityStatus {
    Scheduled,
    Started,
    Completed,
    Failed,
    TimedOut,
    Cancelled,
}

impl ActivityStatus {
    /// Scheduled or started, i.e. the activity may still report a result
    pub fn is_in_flight(&self) -> bool {
        matches!(self, ActivityStatus::Scheduled | ActivityStatus::Started)
    }
}

/// One activity of a run, at its current attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityInvocation {
    pub activity_id: String,
    pub activity_type: String,
    pub input: serde_json::Value,
    pub options: ActivityOptions,
    pub attempt: u32,
    pub status: ActivityStatus,
    pub scheduled_at: DateTime<Utc>,
    pub not_before: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub worker_id: Option<String>,
    pub result: Option<serde_json::Value>,
    pub last_error: Option<ActivityError>,
}

impl ActivityInvocation {
    /// Queue payload for the current attempt
    pub fn task(&self, run: &RunKey) -> ActivityTask {
        ActivityTask {
            run: run.clone(),
            activity_id: self.activity_id.clone(),
            activity_type: self.activity_type.clone(),
            input: self.input.clone(),
            options: self.options.clone(),
            attempt: self.attempt,
        }
    }
}

/// A workflow timer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimerState {
    pub timer_id: String,
    pub fire_at: DateTime<Utc>,
    pub fired: bool,
}

/// Derived current state of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub key: RunKey,
    pub workflow_type: String,
    pub status: RunStatus,
    pub input: serde_json::Value,
    pub start_time: DateTime<Utc>,
    pub close_time: Option<DateTime<Utc>>,
    /// Run deadline, if the run was started with a timeout
    pub deadline: Option<DateTime<Utc>>,
    pub schedule_id: Option<String>,
    /// Sequence of the last event folded in
    pub last_sequence: u64,
    /// Serialized user workflow
    pub workflow_state: serde_json::Value,
    pub activities: BTreeMap<String, ActivityInvocation>,
    pub timers: BTreeMap<String, TimerState>,
    /// Set once cancellation has been requested
    pub cancel_reason: Option<String>,
    pub result: Option<serde_json::Value>,
    pub error: Option<WorkflowError>,
}

impl RunSnapshot {
    pub fn is_cancel_requested(&self) -> bool {
        self.cancel_reason.is_some()
    }

    /// Activities that can still report a result
    pub fn in_flight(&self) -> impl Iterator<Item = &ActivityInvocation> {
        self.activities.values().filter(|a| a.status.is_in_flight())
    }

    /// Number of in-flight activities
    pub fn activity_count(&self) -> usize {
        self.in_flight().count()
    }

    pub fn info(&self) -> RunInfo {
        RunInfo {
            key: self.key.clone(),
            workflow_type: self.workflow_type.clone(),
            status: self.status,
            start_time: self.start_time,
            close_time: self.close_time,
            schedule_id: self.schedule_id.clone(),
            last_sequence: self.last_sequence,
        }
    }

    /// Side effects the run is still waiting on
    ///
    /// Used to recover work whose dispatch was lost after its events were
    /// persisted. Timers and run timeouts delivered twice are absorbed by
    /// the state machine. Started activities are included too, so an
    /// attempt whose lease is still live can execute twice; only its first
    /// report is recorded.
    pub fn pending_commands(&self) -> Vec<Command> {
        if self.status.is_terminal() {
            return vec![];
        }

        let mut commands = Vec::new();
        for activity in self.in_flight() {
            commands.push(Command::ScheduleActivity {
                task: activity.task(&self.key),
                not_before: activity.not_before,
            });
            if self.is_cancel_requested() {
                commands.push(Command::CancelActivity {
                    run: self.key.clone(),
                    activity_id: activity.activity_id.clone(),
                });
            }
        }
        for timer in self.timers.values().filter(|t| !t.fired) {
            commands.push(Command::StartTimer {
                run: self.key.clone(),
                timer_id: timer.timer_id.clone(),
                fire_at: timer.fire_at,
            });
        }
        if let Some(deadline) = self.deadline {
            commands.push(Command::ScheduleRunTimeout {
                run: self.key.clone(),
                deadline,
            });
        }
        commands
    }
}

/// Side effect requested by the state machine
///
/// Commands are produced together with the events that justify them and
/// are carried out only after those events are durable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    /// Enqueue an activity attempt
    ScheduleActivity {
        task: ActivityTask,
        not_before: DateTime<Utc>,
    },

    /// Ask the worker running this activity to stop (advisory)
    CancelActivity { run: RunKey, activity_id: String },

    /// Enqueue a timer fire
    StartTimer {
        run: RunKey,
        timer_id: String,
        fire_at: DateTime<Utc>,
    },

    /// Enqueue the run deadline check
    ScheduleRunTimeout {
        run: RunKey,
        deadline: DateTime<Utc>,
    },

    /// The run reached a terminal status
    CloseRun { run: RunKey, status: RunStatus },
}

/// Something that happened to a run and must be decided on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IncomingEvent {
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
    ActivityFailed {
        activity_id: String,
        attempt: u32,
        error: ActivityError,
    },
    ActivityTimedOut { activity_id: String, attempt: u32 },
    TimerFired { timer_id: String },
    CancelRequested { reason: String },
    RunTimedOut,
}

impl IncomingEvent {
    pub fn name(&self) -> &'static str {
        match self {
            IncomingEvent::ActivityStarted { .. } => "activity_started",
            IncomingEvent::ActivityCompleted { .. } => "activity_completed",
            IncomingEvent::ActivityFailed { .. } => "activity_failed",
            IncomingEvent::ActivityTimedOut { .. } => "activity_timed_out",
            IncomingEvent::TimerFired { .. } => "timer_fired",
            IncomingEvent::CancelRequested { .. } => "cancel_requested",
            IncomingEvent::RunTimedOut => "run_timed_out",
        }
    }
}

/// Output of one state machine step
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    /// Events to append, numbered from `last_sequence + 1` of the input snapshot
    pub events: Vec<crate::workflow::EventRecord>,
    pub commands: Vec<Command>,
    /// Snapshot with `events` folded in
    pub snapshot: RunSnapshot,
}

impl Decision {
    /// Stale or duplicate input: nothing to write
    pub fn is_noop(&self) -> bool {
        self.events.is_empty()
    }
}
