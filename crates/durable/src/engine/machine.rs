//! Pure workflow state machine
//!
//! `advance(snapshot, incoming, now)` decides what happens next for a run:
//! which events to append, which commands to dispatch once they are durable,
//! and the snapshot with those events folded in. It performs no I/O. The same
//! `apply` fold is used live and on replay, which is what makes a replayed
//! snapshot equal to the live one.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::registry::{AnyWorkflow, RegistryError, WorkflowRegistry};
use super::state::{
    ActivityInvocation, ActivityStatus, Command, Decision, IncomingEvent, RunSnapshot, TimerState,
};
use crate::activity::ActivityError;
use crate::clock::after;
use crate::error::ErrorCategory;
use crate::reliability::jitter_seed;
use crate::workflow::{
    EventRecord, RunKey, RunStatus, WorkflowAction, WorkflowError, WorkflowEvent,
};

/// Error code of runs failed because the workflow emitted an invalid action
pub const INVALID_ACTION: &str = "INVALID_ACTION";

/// What happens to in-flight activities when a run is cancelled
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancellationPolicy {
    /// Started activities are asked to stop and the run is cancelled once
    /// each of them has reported
    #[default]
    Drain,

    /// Started activities are abandoned and the run is cancelled at once
    Abandon,
}

impl std::str::FromStr for CancellationPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "drain" => Ok(Self::Drain),
            "abandon" => Ok(Self::Abandon),
            other => Err(format!("unknown cancellation policy: {}", other)),
        }
    }
}

/// Errors from the state machine
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("run {run} is already {status}")]
    RunClosed { run: RunKey, status: RunStatus },

    /// The start request named an unknown type or carried bad input
    #[error("invalid start request: {0}")]
    InvalidStart(#[source] RegistryError),

    /// Stored workflow state could not be restored
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("failed to serialize workflow state: {0}")]
    State(#[from] serde_json::Error),

    #[error("corrupt history for run {run}: {message}")]
    CorruptHistory { run: RunKey, message: String },
}

impl EngineError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            EngineError::RunClosed { .. } => ErrorCategory::Conflict,
            EngineError::InvalidStart(_) => ErrorCategory::Validation,
            EngineError::Registry(_)
            | EngineError::State(_)
            | EngineError::CorruptHistory { .. } => ErrorCategory::Internal,
        }
    }

    fn corrupt(run: &RunKey, message: impl Into<String>) -> Self {
        EngineError::CorruptHistory {
            run: run.clone(),
            message: message.into(),
        }
    }
}

/// Parameters of a new run
#[derive(Debug, Clone)]
pub struct RunStart {
    pub key: RunKey,
    pub workflow_type: String,
    pub input: serde_json::Value,
    pub run_timeout: Option<Duration>,
    pub schedule_id: Option<String>,
}

/// The deterministic core of the engine
#[derive(Debug, Clone)]
pub struct StateMachine {
    registry: Arc<WorkflowRegistry>,
    cancellation: CancellationPolicy,
}

impl StateMachine {
    pub fn new(registry: Arc<WorkflowRegistry>) -> Self {
        Self {
            registry,
            cancellation: CancellationPolicy::default(),
        }
    }

    pub fn with_cancellation_policy(mut self, policy: CancellationPolicy) -> Self {
        self.cancellation = policy;
        self
    }

    pub fn registry(&self) -> &WorkflowRegistry {
        &self.registry
    }

    pub fn cancellation_policy(&self) -> CancellationPolicy {
        self.cancellation
    }

    /// Decide the first events of a new run
    pub fn start(&self, start: RunStart, now: DateTime<Utc>) -> Result<Decision, EngineError> {
        if !self.registry.contains(&start.workflow_type) {
            return Err(EngineError::InvalidStart(RegistryError::UnknownWorkflowType(
                start.workflow_type,
            )));
        }
        // Validate the input before anything is written
        self.registry
            .create(&start.workflow_type, start.input.clone())
            .map_err(EngineError::InvalidStart)?;

        let record = EventRecord::new(
            1,
            now,
            WorkflowEvent::WorkflowStarted {
                workflow_type: start.workflow_type,
                input: start.input,
                run_timeout_ms: start.run_timeout.map(|t| t.as_millis() as u64),
                schedule_id: start.schedule_id,
            },
        );
        let (snapshot, actions) = self.begin(&start.key, &record)?;

        let mut step = Step::new(self, snapshot, now);
        step.events.push(record);
        if let Some(deadline) = step.snapshot.deadline {
            step.commands.push(Command::ScheduleRunTimeout {
                run: step.snapshot.key.clone(),
                deadline,
            });
        }
        step.process_actions(actions)?;
        Ok(step.finish())
    }

    /// Decide how `incoming` changes the run
    ///
    /// Stale or duplicate input (an old attempt, a timer that already fired,
    /// a second cancellation) yields an empty decision.
    pub fn advance(
        &self,
        snapshot: &RunSnapshot,
        incoming: IncomingEvent,
        now: DateTime<Utc>,
    ) -> Result<Decision, EngineError> {
        if snapshot.status.is_terminal() {
            return Err(EngineError::RunClosed {
                run: snapshot.key.clone(),
                status: snapshot.status,
            });
        }

        let mut step = Step::new(self, snapshot.clone(), now);
        match incoming {
            IncomingEvent::ActivityStarted {
                activity_id,
                attempt,
                worker_id,
            } => {
                let current = step.current_attempt(&activity_id, attempt);
                if current.map(|a| a.status) == Some(ActivityStatus::Scheduled) {
                    step.record(WorkflowEvent::ActivityStarted {
                        activity_id,
                        attempt,
                        worker_id,
                    })?;
                }
            }

            IncomingEvent::ActivityCompleted {
                activity_id,
                attempt,
                result,
            } => {
                if step.current_attempt(&activity_id, attempt).is_some() {
                    let actions = step.record(WorkflowEvent::ActivityCompleted {
                        activity_id,
                        attempt,
                        result,
                    })?;
                    step.process_actions(actions)?;
                }
            }

            IncomingEvent::ActivityFailed {
                activity_id,
                attempt,
                error,
            } => {
                if let Some(current) = step.current_attempt(&activity_id, attempt).cloned() {
                    let will_retry = step.may_retry(&current, error.retryable, error.error_type.as_deref());
                    let actions = step.record(WorkflowEvent::ActivityFailed {
                        activity_id,
                        attempt,
                        error,
                        will_retry,
                    })?;
                    if will_retry {
                        step.schedule_retry(&current)?;
                    }
                    step.process_actions(actions)?;
                }
            }

            IncomingEvent::ActivityTimedOut {
                activity_id,
                attempt,
            } => {
                if let Some(current) = step.current_attempt(&activity_id, attempt).cloned() {
                    let will_retry = step.may_retry(&current, true, Some(ActivityError::TIMED_OUT));
                    let actions = step.record(WorkflowEvent::ActivityTimedOut {
                        activity_id,
                        attempt,
                        will_retry,
                    })?;
                    if will_retry {
                        step.schedule_retry(&current)?;
                    }
                    step.process_actions(actions)?;
                }
            }

            IncomingEvent::TimerFired { timer_id } => {
                let pending = step
                    .snapshot
                    .timers
                    .get(&timer_id)
                    .map_or(false, |t| !t.fired);
                if pending {
                    let actions = step.record(WorkflowEvent::TimerFired { timer_id })?;
                    step.process_actions(actions)?;
                }
            }

            IncomingEvent::CancelRequested { reason } => {
                if !step.snapshot.is_cancel_requested() {
                    step.record(WorkflowEvent::CancelRequested { reason })?;
                    if self.cancellation == CancellationPolicy::Drain {
                        let run = step.snapshot.key.clone();
                        let started: Vec<String> = step
                            .snapshot
                            .activities
                            .values()
                            .filter(|a| a.status == ActivityStatus::Started)
                            .map(|a| a.activity_id.clone())
                            .collect();
                        for activity_id in started {
                            step.commands.push(Command::CancelActivity {
                                run: run.clone(),
                                activity_id,
                            });
                        }
                    }
                }
            }

            IncomingEvent::RunTimedOut => {
                let due = step.snapshot.deadline.map_or(false, |d| now >= d);
                if due {
                    step.record(WorkflowEvent::WorkflowTimedOut)?;
                }
            }
        }

        if step.events.is_empty() {
            debug!(run = %snapshot.key, "stale or duplicate input, nothing to do");
            return Ok(Decision {
                events: vec![],
                commands: vec![],
                snapshot: snapshot.clone(),
            });
        }

        step.settle_cancellation()?;
        Ok(step.finish())
    }

    /// Rebuild a snapshot from a complete history
    pub fn replay(&self, run: &RunKey, history: &[EventRecord]) -> Result<RunSnapshot, EngineError> {
        let (first, rest) = history
            .split_first()
            .ok_or_else(|| EngineError::corrupt(run, "history is empty"))?;
        let (snapshot, _) = self.begin(run, first)?;
        self.resume(snapshot, rest)
    }

    /// Fold a history tail into a snapshot
    pub fn resume(
        &self,
        mut snapshot: RunSnapshot,
        tail: &[EventRecord],
    ) -> Result<RunSnapshot, EngineError> {
        for record in tail {
            self.apply(&mut snapshot, record)?;
        }
        Ok(snapshot)
    }

    /// Build the initial snapshot from the `STARTED` event
    fn begin(
        &self,
        run: &RunKey,
        record: &EventRecord,
    ) -> Result<(RunSnapshot, Vec<WorkflowAction>), EngineError> {
        let WorkflowEvent::WorkflowStarted {
            workflow_type,
            input,
            run_timeout_ms,
            schedule_id,
        } = &record.event
        else {
            return Err(EngineError::corrupt(
                run,
                format!("history must begin with STARTED, found {}", record.event.kind()),
            ));
        };
        if record.sequence != 1 {
            return Err(EngineError::corrupt(
                run,
                format!("STARTED has sequence {}", record.sequence),
            ));
        }

        let mut workflow = self.registry.create(workflow_type, input.clone())?;
        let actions = workflow.on_start();

        let snapshot = RunSnapshot {
            key: run.clone(),
            workflow_type: workflow_type.clone(),
            status: RunStatus::Running,
            input: input.clone(),
            start_time: record.timestamp,
            close_time: None,
            deadline: run_timeout_ms.map(|ms| after(record.timestamp, Duration::from_millis(ms))),
            schedule_id: schedule_id.clone(),
            last_sequence: 1,
            workflow_state: workflow.state()?,
            activities: Default::default(),
            timers: Default::default(),
            cancel_reason: None,
            result: None,
            error: None,
        };
        Ok((snapshot, actions))
    }

    /// Fold one event into the snapshot
    ///
    /// Returns the actions produced by the workflow handler the event
    /// triggers, if any. Replay discards them; they were already turned into
    /// the events that follow.
    pub fn apply(
        &self,
        snapshot: &mut RunSnapshot,
        record: &EventRecord,
    ) -> Result<Vec<WorkflowAction>, EngineError> {
        let run = snapshot.key.clone();
        if record.sequence != snapshot.last_sequence + 1 {
            return Err(EngineError::corrupt(
                &run,
                format!(
                    "expected sequence {}, found {}",
                    snapshot.last_sequence + 1,
                    record.sequence
                ),
            ));
        }
        if snapshot.status.is_terminal() {
            return Err(EngineError::corrupt(
                &run,
                format!("{} after terminal status", record.event.kind()),
            ));
        }
        snapshot.last_sequence = record.sequence;

        let at = record.timestamp;
        let actions = match &record.event {
            WorkflowEvent::WorkflowStarted { .. } => {
                return Err(EngineError::corrupt(&run, "duplicate STARTED"));
            }

            WorkflowEvent::ActivityScheduled {
                activity_id,
                activity_type,
                input,
                options,
                attempt,
                not_before,
            } => {
                let last_error = snapshot
                    .activities
                    .get(activity_id)
                    .and_then(|a| a.last_error.clone());
                snapshot.activities.insert(
                    activity_id.clone(),
                    ActivityInvocation {
                        activity_id: activity_id.clone(),
                        activity_type: activity_type.clone(),
                        input: input.clone(),
                        options: options.clone(),
                        attempt: *attempt,
                        status: ActivityStatus::Scheduled,
                        scheduled_at: at,
                        not_before: *not_before,
                        started_at: None,
                        worker_id: None,
                        result: None,
                        last_error,
                    },
                );
                vec![]
            }

            WorkflowEvent::ActivityStarted {
                activity_id,
                worker_id,
                ..
            } => {
                let activity = activity_mut(snapshot, activity_id)?;
                activity.status = ActivityStatus::Started;
                activity.started_at = Some(at);
                activity.worker_id = Some(worker_id.clone());
                vec![]
            }

            WorkflowEvent::ActivityCompleted {
                activity_id,
                result,
                ..
            } => {
                let activity = activity_mut(snapshot, activity_id)?;
                activity.status = ActivityStatus::Completed;
                activity.result = Some(result.clone());
                self.invoke(snapshot, |wf| {
                    wf.on_activity_completed(activity_id, result.clone())
                })?
            }

            WorkflowEvent::ActivityFailed {
                activity_id,
                error,
                will_retry,
                ..
            } => {
                let activity = activity_mut(snapshot, activity_id)?;
                activity.status = ActivityStatus::Failed;
                activity.last_error = Some(error.clone());
                if *will_retry {
                    vec![]
                } else {
                    self.invoke(snapshot, |wf| wf.on_activity_failed(activity_id, error))?
                }
            }

            WorkflowEvent::ActivityTimedOut {
                activity_id,
                will_retry,
                ..
            } => {
                let activity = activity_mut(snapshot, activity_id)?;
                let error = ActivityError::timed_out(activity.options.start_to_close_timeout);
                activity.status = ActivityStatus::TimedOut;
                activity.last_error = Some(error.clone());
                if *will_retry {
                    vec![]
                } else {
                    self.invoke(snapshot, |wf| wf.on_activity_failed(activity_id, &error))?
                }
            }

            WorkflowEvent::ActivityCancelled { activity_id, .. } => {
                activity_mut(snapshot, activity_id)?.status = ActivityStatus::Cancelled;
                vec![]
            }

            WorkflowEvent::TimerStarted { timer_id, fire_at } => {
                snapshot.timers.insert(
                    timer_id.clone(),
                    TimerState {
                        timer_id: timer_id.clone(),
                        fire_at: *fire_at,
                        fired: false,
                    },
                );
                vec![]
            }

            WorkflowEvent::TimerFired { timer_id } => {
                let timer = snapshot
                    .timers
                    .get_mut(timer_id)
                    .ok_or_else(|| EngineError::corrupt(&run, format!("unknown timer {}", timer_id)))?;
                timer.fired = true;
                self.invoke(snapshot, |wf| wf.on_timer_fired(timer_id))?
            }

            WorkflowEvent::CancelRequested { reason } => {
                snapshot.cancel_reason = Some(reason.clone());
                self.invoke(snapshot, |wf| {
                    wf.on_cancel_requested(reason);
                    vec![]
                })?
            }

            WorkflowEvent::WorkflowCompleted { result } => {
                snapshot.result = Some(result.clone());
                close(snapshot, RunStatus::Completed, at);
                vec![]
            }

            WorkflowEvent::WorkflowFailed { error } => {
                snapshot.error = Some(error.clone());
                close(snapshot, RunStatus::Failed, at);
                vec![]
            }

            WorkflowEvent::WorkflowCancelled { .. } => {
                close(snapshot, RunStatus::Cancelled, at);
                vec![]
            }

            WorkflowEvent::WorkflowTimedOut => {
                close(snapshot, RunStatus::TimedOut, at);
                vec![]
            }
        };

        Ok(actions)
    }

    /// Run a workflow handler against the state stored in the snapshot
    fn invoke<F>(&self, snapshot: &mut RunSnapshot, handler: F) -> Result<Vec<WorkflowAction>, EngineError>
    where
        F: FnOnce(&mut dyn AnyWorkflow) -> Vec<WorkflowAction>,
    {
        let mut workflow = self
            .registry
            .restore(&snapshot.workflow_type, snapshot.workflow_state.clone())?;
        let actions = handler(workflow.as_mut());
        snapshot.workflow_state = workflow.state()?;
        Ok(actions)
    }
}

fn activity_mut<'a>(
    snapshot: &'a mut RunSnapshot,
    activity_id: &str,
) -> Result<&'a mut ActivityInvocation, EngineError> {
    let run = snapshot.key.clone();
    snapshot
        .activities
        .get_mut(activity_id)
        .ok_or_else(|| EngineError::corrupt(&run, format!("unknown activity {}", activity_id)))
}

fn close(snapshot: &mut RunSnapshot, status: RunStatus, at: DateTime<Utc>) {
    snapshot.status = status;
    snapshot.close_time = Some(at);
}

/// Accumulates the events and commands of one decision
struct Step<'m> {
    machine: &'m StateMachine,
    snapshot: RunSnapshot,
    now: DateTime<Utc>,
    events: Vec<EventRecord>,
    commands: Vec<Command>,
}

impl<'m> Step<'m> {
    fn new(machine: &'m StateMachine, snapshot: RunSnapshot, now: DateTime<Utc>) -> Self {
        Self {
            machine,
            snapshot,
            now,
            events: Vec::new(),
            commands: Vec::new(),
        }
    }

    fn finish(self) -> Decision {
        Decision {
            events: self.events,
            commands: self.commands,
            snapshot: self.snapshot,
        }
    }

    /// The activity, if `attempt` is its current attempt and still in flight
    fn current_attempt(&self, activity_id: &str, attempt: u32) -> Option<&ActivityInvocation> {
        self.snapshot
            .activities
            .get(activity_id)
            .filter(|a| a.attempt == attempt && a.status.is_in_flight())
    }

    fn may_retry(&self, current: &ActivityInvocation, retryable: bool, error_type: Option<&str>) -> bool {
        let policy = &current.options.retry_policy;
        !self.snapshot.is_cancel_requested()
            && retryable
            && policy.should_retry(error_type)
            && policy.has_attempts_remaining(current.attempt)
    }

    fn schedule_retry(&mut self, current: &ActivityInvocation) -> Result<(), EngineError> {
        let attempt = current.attempt + 1;
        let seed = jitter_seed(&self.snapshot.key.run_id, &current.activity_id, attempt);
        let delay = current.options.retry_policy.delay_for_attempt(attempt, seed);
        self.record(WorkflowEvent::ActivityScheduled {
            activity_id: current.activity_id.clone(),
            activity_type: current.activity_type.clone(),
            input: current.input.clone(),
            options: current.options.clone(),
            attempt,
            not_before: after(self.now, delay),
        })?;
        Ok(())
    }

    /// Append an event, fold it in and derive its commands
    fn record(&mut self, event: WorkflowEvent) -> Result<Vec<WorkflowAction>, EngineError> {
        let record = EventRecord::new(self.snapshot.last_sequence + 1, self.now, event);
        let actions = self.machine.apply(&mut self.snapshot, &record)?;
        let run = self.snapshot.key.clone();

        match &record.event {
            WorkflowEvent::ActivityScheduled {
                activity_id,
                not_before,
                ..
            } => {
                if let Some(activity) = self.snapshot.activities.get(activity_id) {
                    self.commands.push(Command::ScheduleActivity {
                        task: activity.task(&run),
                        not_before: *not_before,
                    });
                }
            }
            WorkflowEvent::TimerStarted { timer_id, fire_at } => {
                self.commands.push(Command::StartTimer {
                    run: run.clone(),
                    timer_id: timer_id.clone(),
                    fire_at: *fire_at,
                });
            }
            WorkflowEvent::ActivityCancelled { activity_id, .. } => {
                self.commands.push(Command::CancelActivity {
                    run: run.clone(),
                    activity_id: activity_id.clone(),
                });
            }
            event if event.is_terminal() => {
                for activity in self.snapshot.in_flight() {
                    self.commands.push(Command::CancelActivity {
                        run: run.clone(),
                        activity_id: activity.activity_id.clone(),
                    });
                }
                self.commands.push(Command::CloseRun {
                    run: run.clone(),
                    status: self.snapshot.status,
                });
            }
            _ => {}
        }

        self.events.push(record);
        Ok(actions)
    }

    /// Turn workflow actions into events
    ///
    /// Actions are ignored once cancellation has been requested or the run
    /// has closed.
    fn process_actions(&mut self, actions: Vec<WorkflowAction>) -> Result<(), EngineError> {
        for action in actions {
            if self.snapshot.status.is_terminal() {
                break;
            }
            if self.snapshot.is_cancel_requested() {
                debug!(run = %self.snapshot.key, "ignoring workflow action after cancellation");
                break;
            }

            match action {
                WorkflowAction::ScheduleActivity {
                    activity_id,
                    activity_type,
                    input,
                    options,
                } => {
                    if self.snapshot.activities.contains_key(&activity_id) {
                        self.reject(format!("activity id {} is already in use", activity_id))?;
                        break;
                    }
                    self.record(WorkflowEvent::ActivityScheduled {
                        activity_id,
                        activity_type,
                        input,
                        options,
                        attempt: 1,
                        not_before: self.now,
                    })?;
                }

                WorkflowAction::StartTimer { timer_id, duration } => {
                    if self.snapshot.timers.contains_key(&timer_id) {
                        self.reject(format!("timer id {} is already in use", timer_id))?;
                        break;
                    }
                    self.record(WorkflowEvent::TimerStarted {
                        timer_id,
                        fire_at: after(self.now, duration),
                    })?;
                }

                WorkflowAction::CancelActivity { activity_id } => {
                    let in_flight = self
                        .snapshot
                        .activities
                        .get(&activity_id)
                        .map_or(false, |a| a.status.is_in_flight());
                    if in_flight {
                        self.record(WorkflowEvent::ActivityCancelled {
                            activity_id,
                            reason: "cancelled by workflow".to_string(),
                        })?;
                    }
                }

                WorkflowAction::CompleteWorkflow { result } => {
                    self.record(WorkflowEvent::WorkflowCompleted { result })?;
                }

                WorkflowAction::FailWorkflow { error } => {
                    self.record(WorkflowEvent::WorkflowFailed { error })?;
                }
            }
        }
        Ok(())
    }

    fn reject(&mut self, message: String) -> Result<(), EngineError> {
        debug!(run = %self.snapshot.key, %message, "workflow emitted an invalid action");
        self.record(WorkflowEvent::WorkflowFailed {
            error: WorkflowError::new(message).with_code(INVALID_ACTION),
        })?;
        Ok(())
    }

    /// Unwind a run whose cancellation was requested
    ///
    /// Activities that never started are dropped. Started ones are waited
    /// for under [`CancellationPolicy::Drain`] and dropped under
    /// [`CancellationPolicy::Abandon`]. The run is cancelled once nothing is
    /// in flight.
    fn settle_cancellation(&mut self) -> Result<(), EngineError> {
        let Some(reason) = self.snapshot.cancel_reason.clone() else {
            return Ok(());
        };
        if self.snapshot.status.is_terminal() {
            return Ok(());
        }

        let abandon = self.machine.cancellation == CancellationPolicy::Abandon;
        let dropped: Vec<String> = self
            .snapshot
            .in_flight()
            .filter(|a| abandon || a.status == ActivityStatus::Scheduled)
            .map(|a| a.activity_id.clone())
            .collect();
        for activity_id in dropped {
            self.record(WorkflowEvent::ActivityCancelled {
                activity_id,
                reason: reason.clone(),
            })?;
        }

        if self.snapshot.activity_count() == 0 {
            self.record(WorkflowEvent::WorkflowCancelled { reason })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin::{SequenceInput, SequenceWorkflow};
    use crate::reliability::RetryPolicy;
    use crate::workflow::Workflow;
    use chrono::TimeZone;
    use serde_json::json;

    fn machine() -> StateMachine {
        StateMachine::new(Arc::new(WorkflowRegistry::new().with::<SequenceWorkflow>()))
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
    }

    fn start_with(machine: &StateMachine, input: SequenceInput) -> Decision {
        machine
            .start(
                RunStart {
                    key: RunKey::generate("wf-1"),
                    workflow_type: SequenceWorkflow::TYPE.to_string(),
                    input: serde_json::to_value(input).unwrap(),
                    run_timeout: None,
                    schedule_id: None,
                },
                t0(),
            )
            .expect("start should succeed")
    }

    fn completed(activity_id: &str, attempt: u32) -> IncomingEvent {
        IncomingEvent::ActivityCompleted {
            activity_id: activity_id.to_string(),
            attempt,
            result: json!(activity_id),
        }
    }

    fn failed(activity_id: &str, attempt: u32, error: ActivityError) -> IncomingEvent {
        IncomingEvent::ActivityFailed {
            activity_id: activity_id.to_string(),
            attempt,
            error,
        }
    }

    fn kinds(decision: &Decision) -> Vec<&'static str> {
        decision.events.iter().map(|e| e.event.kind()).collect()
    }

    #[test]
    fn test_start_schedules_first_activity() {
        let decision = start_with(&machine(), SequenceInput::new(["a", "b"]));

        assert_eq!(kinds(&decision), vec!["STARTED", "ACTIVITY_SCHEDULED"]);
        assert_eq!(decision.events[0].sequence, 1);
        assert_eq!(decision.events[1].sequence, 2);
        assert!(matches!(
            &decision.commands[0],
            Command::ScheduleActivity { task, .. } if task.activity_id == "a" && task.attempt == 1
        ));
        assert_eq!(decision.snapshot.status, RunStatus::Running);
        assert_eq!(decision.snapshot.activity_count(), 1);
    }

    #[test]
    fn test_unknown_workflow_type_is_validation_error() {
        let err = machine()
            .start(
                RunStart {
                    key: RunKey::generate("wf-1"),
                    workflow_type: "nope".to_string(),
                    input: json!({}),
                    run_timeout: None,
                    schedule_id: None,
                },
                t0(),
            )
            .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Validation);
    }

    #[test]
    fn test_run_completes_after_last_activity() {
        let machine = machine();
        let started = start_with(&machine, SequenceInput::new(["a", "b"]));

        let d1 = machine.advance(&started.snapshot, completed("a", 1), t0()).unwrap();
        assert_eq!(kinds(&d1), vec!["ACTIVITY_COMPLETED", "ACTIVITY_SCHEDULED"]);

        let d2 = machine.advance(&d1.snapshot, completed("b", 1), t0()).unwrap();
        assert_eq!(kinds(&d2), vec!["ACTIVITY_COMPLETED", "COMPLETED"]);
        assert_eq!(d2.snapshot.status, RunStatus::Completed);
        assert_eq!(d2.snapshot.close_time, Some(t0()));
        assert!(d2
            .commands
            .iter()
            .any(|c| matches!(c, Command::CloseRun { status: RunStatus::Completed, .. })));
    }

    #[test]
    fn test_duplicate_completion_is_noop() {
        let machine = machine();
        let started = start_with(&machine, SequenceInput::new(["a", "b"]));
        let d1 = machine.advance(&started.snapshot, completed("a", 1), t0()).unwrap();

        let dup = machine.advance(&d1.snapshot, completed("a", 1), t0()).unwrap();
        assert!(dup.is_noop());
        assert_eq!(dup.snapshot, d1.snapshot);
    }

    #[test]
    fn test_terminal_run_rejects_input() {
        let machine = machine();
        let started = start_with(&machine, SequenceInput::new(["a"]));
        let done = machine.advance(&started.snapshot, completed("a", 1), t0()).unwrap();

        let err = machine
            .advance(&done.snapshot, completed("a", 1), t0())
            .unwrap_err();
        assert!(matches!(err, EngineError::RunClosed { status: RunStatus::Completed, .. }));
    }

    #[test]
    fn test_retryable_failure_schedules_next_attempt() {
        let machine = machine();
        let mut input = SequenceInput::new(["a"]);
        input.retry_interval_ms = Some(1000);
        let started = start_with(&machine, input);

        let decision = machine
            .advance(
                &started.snapshot,
                failed("a", 1, ActivityError::retryable("flaky")),
                t0(),
            )
            .unwrap();

        assert_eq!(kinds(&decision), vec!["ACTIVITY_FAILED", "ACTIVITY_SCHEDULED"]);
        let activity = &decision.snapshot.activities["a"];
        assert_eq!(activity.attempt, 2);
        assert_eq!(activity.not_before, t0() + chrono::Duration::seconds(1));
        assert_eq!(activity.last_error.as_ref().unwrap().message, "flaky");

        // the failed attempt can no longer report
        let stale = machine
            .advance(&decision.snapshot, completed("a", 1), t0())
            .unwrap();
        assert!(stale.is_noop());
    }

    #[test]
    fn test_non_retryable_failure_reaches_workflow() {
        let machine = machine();
        let started = start_with(&machine, SequenceInput::new(["a"]));

        let decision = machine
            .advance(
                &started.snapshot,
                failed("a", 1, ActivityError::non_retryable("bad input")),
                t0(),
            )
            .unwrap();

        assert_eq!(kinds(&decision), vec!["ACTIVITY_FAILED", "FAILED"]);
        assert_eq!(decision.snapshot.status, RunStatus::Failed);
        assert_eq!(
            decision.snapshot.error.as_ref().unwrap().code.as_deref(),
            Some("STEP_FAILED")
        );
    }

    #[test]
    fn test_non_retryable_error_type_in_policy() {
        let machine = machine();
        let started = start_with(&machine, SequenceInput::new(["a"]));

        let mut snapshot = started.snapshot.clone();
        let activity = snapshot.activities.get_mut("a").unwrap();
        activity.options.retry_policy = RetryPolicy::exponential().with_non_retryable_error("AUTH");

        let decision = machine
            .advance(
                &snapshot,
                failed("a", 1, ActivityError::retryable("denied").with_type("AUTH")),
                t0(),
            )
            .unwrap();
        assert_eq!(kinds(&decision), vec!["ACTIVITY_FAILED", "FAILED"]);
    }

    #[test]
    fn test_attempts_exhausted_after_timeouts() {
        let machine = machine();
        let mut input = SequenceInput::new(["a"]);
        input.max_attempts = Some(2);
        input.retry_interval_ms = Some(10);
        let started = start_with(&machine, input);

        let timed_out = |attempt| IncomingEvent::ActivityTimedOut {
            activity_id: "a".to_string(),
            attempt,
        };
        let d1 = machine.advance(&started.snapshot, timed_out(1), t0()).unwrap();
        assert_eq!(kinds(&d1), vec!["ACTIVITY_TIMED_OUT", "ACTIVITY_SCHEDULED"]);

        let d2 = machine.advance(&d1.snapshot, timed_out(2), t0()).unwrap();
        assert_eq!(kinds(&d2), vec!["ACTIVITY_TIMED_OUT", "FAILED"]);
        assert!(d2.snapshot.error.unwrap().message.contains("start-to-close"));
    }

    #[test]
    fn test_retry_delay_is_deterministic() {
        let machine = machine();
        let started = start_with(&machine, SequenceInput::new(["a"]));
        let input = failed("a", 1, ActivityError::retryable("flaky"));

        let first = machine.advance(&started.snapshot, input.clone(), t0()).unwrap();
        let second = machine.advance(&started.snapshot, input, t0()).unwrap();
        assert_eq!(first.events, second.events);
    }

    #[test]
    fn test_timer_fires_once() {
        let machine = machine();
        let mut input = SequenceInput::new(["a"]);
        input.delay_ms = Some(5000);
        let started = start_with(&machine, input);

        assert_eq!(kinds(&started), vec!["STARTED", "TIMER_STARTED"]);
        assert!(matches!(
            &started.commands[0],
            Command::StartTimer { fire_at, .. } if *fire_at == t0() + chrono::Duration::seconds(5)
        ));

        let fired = IncomingEvent::TimerFired {
            timer_id: SequenceWorkflow::DELAY_TIMER.to_string(),
        };
        let d1 = machine.advance(&started.snapshot, fired.clone(), t0()).unwrap();
        assert_eq!(kinds(&d1), vec!["TIMER_FIRED", "ACTIVITY_SCHEDULED"]);

        assert!(machine.advance(&d1.snapshot, fired, t0()).unwrap().is_noop());
    }

    #[test]
    fn test_cancel_drains_started_activities() {
        let machine = machine();
        let mut input = SequenceInput::new(["a", "b"]);
        input.parallel = true;
        let started = start_with(&machine, input);

        let running = machine
            .advance(
                &started.snapshot,
                IncomingEvent::ActivityStarted {
                    activity_id: "a".to_string(),
                    attempt: 1,
                    worker_id: "w1".to_string(),
                },
                t0(),
            )
            .unwrap();

        let cancel = machine
            .advance(
                &running.snapshot,
                IncomingEvent::CancelRequested {
                    reason: "stop".to_string(),
                },
                t0(),
            )
            .unwrap();
        // "b" never started and is dropped; "a" is asked to stop
        assert_eq!(kinds(&cancel), vec!["CANCEL_REQUESTED", "ACTIVITY_CANCELLED"]);
        assert_eq!(cancel.snapshot.status, RunStatus::Running);
        assert!(cancel.commands.iter().any(
            |c| matches!(c, Command::CancelActivity { activity_id, .. } if activity_id == "a")
        ));

        // a second request changes nothing
        let again = machine
            .advance(
                &cancel.snapshot,
                IncomingEvent::CancelRequested {
                    reason: "again".to_string(),
                },
                t0(),
            )
            .unwrap();
        assert!(again.is_noop());

        let drained = machine.advance(&cancel.snapshot, completed("a", 1), t0()).unwrap();
        assert_eq!(kinds(&drained), vec!["ACTIVITY_COMPLETED", "CANCELLED"]);
        assert_eq!(drained.snapshot.status, RunStatus::Cancelled);
    }

    #[test]
    fn test_cancel_with_abandon_policy_closes_immediately() {
        let machine = machine().with_cancellation_policy(CancellationPolicy::Abandon);
        let started = start_with(&machine, SequenceInput::new(["a"]));
        let running = machine
            .advance(
                &started.snapshot,
                IncomingEvent::ActivityStarted {
                    activity_id: "a".to_string(),
                    attempt: 1,
                    worker_id: "w1".to_string(),
                },
                t0(),
            )
            .unwrap();

        let cancel = machine
            .advance(
                &running.snapshot,
                IncomingEvent::CancelRequested {
                    reason: "stop".to_string(),
                },
                t0(),
            )
            .unwrap();
        assert_eq!(
            kinds(&cancel),
            vec!["CANCEL_REQUESTED", "ACTIVITY_CANCELLED", "CANCELLED"]
        );
    }

    #[test]
    fn test_failure_during_drain_is_not_retried() {
        let machine = machine();
        let started = start_with(&machine, SequenceInput::new(["a"]));
        let running = machine
            .advance(
                &started.snapshot,
                IncomingEvent::ActivityStarted {
                    activity_id: "a".to_string(),
                    attempt: 1,
                    worker_id: "w1".to_string(),
                },
                t0(),
            )
            .unwrap();
        let cancel = machine
            .advance(
                &running.snapshot,
                IncomingEvent::CancelRequested {
                    reason: "stop".to_string(),
                },
                t0(),
            )
            .unwrap();

        let decision = machine
            .advance(
                &cancel.snapshot,
                failed("a", 1, ActivityError::retryable("interrupted")),
                t0(),
            )
            .unwrap();
        // the workflow's fail action is ignored; the run ends as cancelled
        assert_eq!(kinds(&decision), vec!["ACTIVITY_FAILED", "CANCELLED"]);
    }

    #[test]
    fn test_run_timeout_only_after_deadline() {
        let machine = machine();
        let started = machine
            .start(
                RunStart {
                    key: RunKey::generate("wf-1"),
                    workflow_type: SequenceWorkflow::TYPE.to_string(),
                    input: json!({ "steps": ["a"] }),
                    run_timeout: Some(Duration::from_secs(60)),
                    schedule_id: None,
                },
                t0(),
            )
            .unwrap();
        assert!(started
            .commands
            .iter()
            .any(|c| matches!(c, Command::ScheduleRunTimeout { .. })));

        let early = machine
            .advance(&started.snapshot, IncomingEvent::RunTimedOut, t0())
            .unwrap();
        assert!(early.is_noop());

        let late = machine
            .advance(
                &started.snapshot,
                IncomingEvent::RunTimedOut,
                t0() + chrono::Duration::seconds(60),
            )
            .unwrap();
        assert_eq!(kinds(&late), vec!["TIMED_OUT"]);
        assert_eq!(late.snapshot.status, RunStatus::TimedOut);
    }

    #[test]
    fn test_duplicate_activity_id_fails_run() {
        let machine = machine();
        let started = start_with(&machine, SequenceInput::new(["a", "a"]));

        let decision = machine.advance(&started.snapshot, completed("a", 1), t0()).unwrap();
        assert_eq!(kinds(&decision), vec!["ACTIVITY_COMPLETED", "FAILED"]);
        assert_eq!(
            decision.snapshot.error.unwrap().code.as_deref(),
            Some(INVALID_ACTION)
        );
    }

    #[test]
    fn test_replay_matches_live_snapshot() {
        let machine = machine();
        let mut input = SequenceInput::new(["a", "b"]);
        input.retry_interval_ms = Some(100);
        let started = start_with(&machine, input);

        let mut history = started.events.clone();
        let mut snapshot = started.snapshot;
        for incoming in [
            failed("a", 1, ActivityError::retryable("flaky")),
            completed("a", 2),
            completed("b", 1),
        ] {
            let decision = machine.advance(&snapshot, incoming, t0()).unwrap();
            history.extend(decision.events);
            snapshot = decision.snapshot;
        }

        let replayed = machine.replay(&snapshot.key, &history).unwrap();
        assert_eq!(replayed, snapshot);
        assert_eq!(replayed.status, RunStatus::Completed);

        // resuming from a midpoint gives the same result
        let midpoint = machine.replay(&snapshot.key, &history[..3]).unwrap();
        let resumed = machine.resume(midpoint, &history[3..]).unwrap();
        assert_eq!(resumed, snapshot);
    }

    #[test]
    fn test_replay_rejects_gaps() {
        let machine = machine();
        let started = start_with(&machine, SequenceInput::new(["a"]));
        let mut history = started.events;
        history[1].sequence = 5;

        let err = machine.replay(&started.snapshot.key, &history).unwrap_err();
        assert!(matches!(err, EngineError::CorruptHistory { .. }));
    }

    #[test]
    fn test_pending_commands_cover_in_flight_work() {
        let machine = machine();
        let mut input = SequenceInput::new(["a", "b"]);
        input.parallel = true;
        let started = start_with(&machine, input);

        let pending = started.snapshot.pending_commands();
        assert_eq!(pending.len(), 2);
        assert!(pending
            .iter()
            .all(|c| matches!(c, Command::ScheduleActivity { .. })));
    }

    #[test]
    fn test_cancellation_policy_from_str() {
        assert_eq!("Drain".parse::<CancellationPolicy>().unwrap(), CancellationPolicy::Drain);
        assert_eq!("abandon".parse::<CancellationPolicy>().unwrap(), CancellationPolicy::Abandon);
        assert!("later".parse::<CancellationPolicy>().is_err());
    }
}
