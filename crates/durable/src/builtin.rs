//! Built-in workflow and activities
//!
//! [`SequenceWorkflow`] runs a list of steps as activities, one after the
//! other or all at once. Together with the [`EchoActivity`],
//! [`SleepActivity`] and [`FailActivity`] types it is enough to exercise
//! every engine path (retries, timers, timeouts, cancellation) without user
//! code.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::activity::{Activity, ActivityContext, ActivityError};
use crate::reliability::RetryPolicy;
use crate::workflow::{ActivityOptions, Workflow, WorkflowAction, WorkflowError};

fn default_activity_type() -> String {
    EchoActivity::TYPE.to_string()
}

/// Start input of [`SequenceWorkflow`]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SequenceInput {
    /// Step ids; each becomes one activity with the same id
    pub steps: Vec<String>,

    /// Activity type every step runs
    #[serde(default = "default_activity_type")]
    pub activity_type: String,

    /// Passed to every step as `payload`
    #[serde(default)]
    pub payload: Value,

    /// Schedule all steps at once instead of one by one
    #[serde(default)]
    pub parallel: bool,

    /// Record failed steps and keep going instead of failing the run
    #[serde(default)]
    pub continue_on_failure: bool,

    /// Wait this long on a timer before the first step
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,

    /// Fixed delay between attempts; exponential backoff when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_interval_ms: Option<u64>,

    /// Start-to-close timeout of each attempt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl SequenceInput {
    pub fn new<I, S>(steps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            steps: steps.into_iter().map(Into::into).collect(),
            activity_type: default_activity_type(),
            payload: Value::Null,
            parallel: false,
            continue_on_failure: false,
            delay_ms: None,
            max_attempts: None,
            retry_interval_ms: None,
            timeout_ms: None,
        }
    }

    fn activity_options(&self) -> ActivityOptions {
        let mut policy = match self.retry_interval_ms {
            Some(ms) => RetryPolicy::fixed(Duration::from_millis(ms), 3),
            None => RetryPolicy::exponential(),
        };
        if let Some(max_attempts) = self.max_attempts {
            policy = policy.with_max_attempts(max_attempts);
        }

        let mut options = ActivityOptions::default().with_retry(policy);
        if let Some(ms) = self.timeout_ms {
            options = options.with_start_to_close_timeout(Duration::from_millis(ms));
        }
        options
    }
}

/// Runs a list of steps as activities
///
/// Completes with `{"results": {step: output}, "failures": {step: message}}`
/// once every step has resolved. Unless `continue_on_failure` is set, the
/// first step that fails for good fails the run with code `STEP_FAILED`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SequenceWorkflow {
    input: SequenceInput,
    /// Index of the next step to schedule
    next: usize,
    outstanding: usize,
    results: BTreeMap<String, Value>,
    failures: BTreeMap<String, String>,
    cancel_reason: Option<String>,
}

impl SequenceWorkflow {
    pub const DELAY_TIMER: &'static str = "delay";

    fn schedule(&mut self, index: usize) -> WorkflowAction {
        let step = &self.input.steps[index];
        self.outstanding += 1;
        WorkflowAction::schedule_activity(
            step.clone(),
            self.input.activity_type.clone(),
            json!({ "step": step, "payload": self.input.payload }),
        )
        .with_options(self.input.activity_options())
    }

    fn dispatch(&mut self) -> Vec<WorkflowAction> {
        if self.input.steps.is_empty() {
            return vec![self.finish()];
        }

        if self.input.parallel {
            let actions = (0..self.input.steps.len()).map(|i| self.schedule(i)).collect();
            self.next = self.input.steps.len();
            actions
        } else {
            self.next = 1;
            vec![self.schedule(0)]
        }
    }

    fn advance(&mut self) -> Vec<WorkflowAction> {
        if self.outstanding > 0 {
            return vec![];
        }

        if self.next < self.input.steps.len() {
            let index = self.next;
            self.next += 1;
            vec![self.schedule(index)]
        } else {
            vec![self.finish()]
        }
    }

    fn finish(&self) -> WorkflowAction {
        WorkflowAction::complete(json!({
            "results": self.results,
            "failures": self.failures,
        }))
    }
}

impl Workflow for SequenceWorkflow {
    const TYPE: &'static str = "sequence";
    type Input = SequenceInput;

    fn new(input: Self::Input) -> Self {
        Self {
            input,
            next: 0,
            outstanding: 0,
            results: BTreeMap::new(),
            failures: BTreeMap::new(),
            cancel_reason: None,
        }
    }

    fn on_start(&mut self) -> Vec<WorkflowAction> {
        match self.input.delay_ms {
            Some(ms) => vec![WorkflowAction::timer(
                Self::DELAY_TIMER,
                Duration::from_millis(ms),
            )],
            None => self.dispatch(),
        }
    }

    fn on_activity_completed(&mut self, activity_id: &str, result: Value) -> Vec<WorkflowAction> {
        self.outstanding = self.outstanding.saturating_sub(1);
        self.results.insert(activity_id.to_string(), result);
        self.advance()
    }

    fn on_activity_failed(
        &mut self,
        activity_id: &str,
        error: &ActivityError,
    ) -> Vec<WorkflowAction> {
        self.outstanding = self.outstanding.saturating_sub(1);
        self.failures
            .insert(activity_id.to_string(), error.message.clone());

        if self.input.continue_on_failure {
            self.advance()
        } else {
            vec![WorkflowAction::fail(
                WorkflowError::new(format!("step {} failed: {}", activity_id, error.message))
                    .with_code("STEP_FAILED"),
            )]
        }
    }

    fn on_timer_fired(&mut self, timer_id: &str) -> Vec<WorkflowAction> {
        if timer_id == Self::DELAY_TIMER && self.next == 0 {
            self.dispatch()
        } else {
            vec![]
        }
    }

    fn on_cancel_requested(&mut self, reason: &str) {
        self.cancel_reason = Some(reason.to_string());
    }
}

/// Returns its input unchanged
pub struct EchoActivity;

#[async_trait]
impl Activity for EchoActivity {
    const TYPE: &'static str = "echo";
    type Input = Value;
    type Output = Value;

    async fn execute(&self, _ctx: &ActivityContext, input: Value) -> Result<Value, ActivityError> {
        Ok(input)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SleepInput {
    /// Defaults to one second
    #[serde(default)]
    pub ms: Option<u64>,
    #[serde(default)]
    pub payload: Value,
}

/// Sleeps, then returns `{"slept_ms": n}`; stops early when cancelled
pub struct SleepActivity;

#[async_trait]
impl Activity for SleepActivity {
    const TYPE: &'static str = "sleep";
    type Input = SleepInput;
    type Output = Value;

    async fn execute(
        &self,
        ctx: &ActivityContext,
        input: SleepInput,
    ) -> Result<Value, ActivityError> {
        let ms = input
            .ms
            .or_else(|| input.payload.get("ms").and_then(Value::as_u64))
            .unwrap_or(1000);

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(ms)) => Ok(json!({ "slept_ms": ms })),
            _ = ctx.cancelled() => Err(ActivityError::non_retryable("sleep cancelled").with_type("CANCELLED")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailInput {
    #[serde(default)]
    pub payload: Value,
}

/// Always fails
///
/// The payload may carry `message`, `retryable` (default true) and
/// `succeed_on_attempt`, which makes that attempt and later ones succeed.
pub struct FailActivity;

#[async_trait]
impl Activity for FailActivity {
    const TYPE: &'static str = "fail";
    type Input = FailInput;
    type Output = Value;

    async fn execute(&self, ctx: &ActivityContext, input: FailInput) -> Result<Value, ActivityError> {
        let payload = &input.payload;
        if let Some(succeed_on) = payload.get("succeed_on_attempt").and_then(Value::as_u64) {
            if u64::from(ctx.attempt) >= succeed_on {
                return Ok(json!({ "attempt": ctx.attempt }));
            }
        }

        let message = payload
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("requested failure")
            .to_string();
        let retryable = payload
            .get("retryable")
            .and_then(Value::as_bool)
            .unwrap_or(true);

        Err(if retryable {
            ActivityError::retryable(message)
        } else {
            ActivityError::non_retryable(message)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::RunKey;

    fn actions_ids(actions: &[WorkflowAction]) -> Vec<String> {
        actions
            .iter()
            .filter_map(|a| match a {
                WorkflowAction::ScheduleActivity { activity_id, .. } => Some(activity_id.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_sequential_steps() {
        let mut wf = SequenceWorkflow::new(SequenceInput::new(["a", "b"]));

        assert_eq!(actions_ids(&wf.on_start()), vec!["a"]);
        assert_eq!(actions_ids(&wf.on_activity_completed("a", json!(1))), vec!["b"]);

        let actions = wf.on_activity_completed("b", json!(2));
        match &actions[0] {
            WorkflowAction::CompleteWorkflow { result } => {
                assert_eq!(result["results"]["a"], json!(1));
                assert_eq!(result["results"]["b"], json!(2));
            }
            other => panic!("expected completion, got {:?}", other),
        }
    }

    #[test]
    fn test_parallel_waits_for_all() {
        let mut input = SequenceInput::new(["a", "b", "c"]);
        input.parallel = true;
        let mut wf = SequenceWorkflow::new(input);

        assert_eq!(actions_ids(&wf.on_start()), vec!["a", "b", "c"]);
        assert!(wf.on_activity_completed("b", json!(null)).is_empty());
        assert!(wf.on_activity_completed("a", json!(null)).is_empty());
        assert!(matches!(
            wf.on_activity_completed("c", json!(null))[0],
            WorkflowAction::CompleteWorkflow { .. }
        ));
    }

    #[test]
    fn test_failure_fails_run() {
        let mut wf = SequenceWorkflow::new(SequenceInput::new(["a", "b"]));
        wf.on_start();

        let actions = wf.on_activity_failed("a", &ActivityError::non_retryable("boom"));
        match &actions[0] {
            WorkflowAction::FailWorkflow { error } => {
                assert_eq!(error.code.as_deref(), Some("STEP_FAILED"));
                assert!(error.message.contains("boom"));
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[test]
    fn test_continue_on_failure() {
        let mut input = SequenceInput::new(["a", "b"]);
        input.continue_on_failure = true;
        let mut wf = SequenceWorkflow::new(input);
        wf.on_start();

        let actions = wf.on_activity_failed("a", &ActivityError::non_retryable("boom"));
        assert_eq!(actions_ids(&actions), vec!["b"]);
    }

    #[test]
    fn test_delay_timer_before_first_step() {
        let mut input = SequenceInput::new(["a"]);
        input.delay_ms = Some(500);
        let mut wf = SequenceWorkflow::new(input);

        assert!(matches!(
            wf.on_start()[0],
            WorkflowAction::StartTimer { ref timer_id, .. } if timer_id == SequenceWorkflow::DELAY_TIMER
        ));
        assert_eq!(
            actions_ids(&wf.on_timer_fired(SequenceWorkflow::DELAY_TIMER)),
            vec!["a"]
        );
    }

    #[test]
    fn test_empty_sequence_completes_immediately() {
        let mut wf = SequenceWorkflow::new(SequenceInput::new(Vec::<String>::new()));
        assert!(matches!(
            wf.on_start()[0],
            WorkflowAction::CompleteWorkflow { .. }
        ));
    }

    #[test]
    fn test_input_defaults() {
        let input: SequenceInput = serde_json::from_value(json!({ "steps": ["x"] })).unwrap();
        assert_eq!(input.activity_type, "echo");
        assert!(!input.parallel);
        assert_eq!(input.activity_options().retry_policy.max_attempts, 5);
    }

    #[tokio::test]
    async fn test_fail_activity_succeeds_on_attempt() {
        let ctx = ActivityContext::new(RunKey::generate("wf"), "a", 2, 3);
        let result = FailActivity
            .execute(
                &ctx,
                FailInput {
                    payload: json!({ "succeed_on_attempt": 2 }),
                },
            )
            .await;
        assert!(result.is_ok());

        let ctx = ActivityContext::new(RunKey::generate("wf"), "a", 1, 3);
        let err = FailActivity
            .execute(
                &ctx,
                FailInput {
                    payload: json!({ "succeed_on_attempt": 2, "retryable": false }),
                },
            )
            .await
            .unwrap_err();
        assert!(!err.retryable);
    }
}
