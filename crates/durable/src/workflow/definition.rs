//! Workflow trait definition

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::WorkflowAction;
use crate::activity::ActivityError;

/// Error a workflow fails with
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkflowError {
    pub message: String,

    /// Code for programmatic handling
    pub code: Option<String>,
}

impl WorkflowError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

impl std::fmt::Display for WorkflowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{}: {}", code, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for WorkflowError {}

/// A workflow is a deterministic state machine driven by events
///
/// Handlers run inside the engine's pure `advance` step and again on
/// every replay, so they must not perform I/O, read clocks, or draw random
/// numbers. All externally visible work goes through activities.
///
/// The workflow value itself is the run's user state. It is serialized into
/// the run snapshot after every handler call and restored before the next,
/// which is why the trait requires `Serialize + DeserializeOwned`.
///
/// # Example
///
/// ```ignore
/// use keel_durable::prelude::*;
///
/// #[derive(Serialize, Deserialize)]
/// struct OrderWorkflow {
///     order_id: String,
///     charged: bool,
/// }
///
/// impl Workflow for OrderWorkflow {
///     const TYPE: &'static str = "order";
///     type Input = OrderInput;
///
///     fn new(input: Self::Input) -> Self {
///         Self { order_id: input.order_id, charged: false }
///     }
///
///     fn on_start(&mut self) -> Vec<WorkflowAction> {
///         vec![WorkflowAction::schedule_activity(
///             "charge",
///             "charge_card",
///             json!({ "order_id": self.order_id }),
///         )]
///     }
///
///     fn on_activity_completed(&mut self, _id: &str, _result: Value) -> Vec<WorkflowAction> {
///         self.charged = true;
///         vec![WorkflowAction::complete(json!({ "charged": true }))]
///     }
///
///     fn on_activity_failed(&mut self, _id: &str, error: &ActivityError) -> Vec<WorkflowAction> {
///         vec![WorkflowAction::fail(WorkflowError::new(error.message.clone()))]
///     }
/// }
/// ```
pub trait Workflow: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Type tag used to look the workflow up in the registry
    const TYPE: &'static str;

    /// Input the run is started with
    type Input: Serialize + DeserializeOwned + Send;

    fn new(input: Self::Input) -> Self;

    /// Called once when the run starts
    fn on_start(&mut self) -> Vec<WorkflowAction>;

    fn on_activity_completed(
        &mut self,
        activity_id: &str,
        result: serde_json::Value,
    ) -> Vec<WorkflowAction>;

    /// Called when an activity fails for good (retries exhausted or the
    /// error was not retryable). Returning nothing keeps the run going;
    /// returning `FailWorkflow` ends it.
    fn on_activity_failed(&mut self, activity_id: &str, error: &ActivityError)
        -> Vec<WorkflowAction>;

    fn on_timer_fired(&mut self, timer_id: &str) -> Vec<WorkflowAction> {
        let _ = timer_id;
        vec![]
    }

    /// Called when cancellation is recorded. The run will end `CANCELLED`
    /// regardless; this hook only lets the workflow update its own state.
    fn on_cancel_requested(&mut self, reason: &str) {
        let _ = reason;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workflow_error_display() {
        let error = WorkflowError::new("something went wrong");
        assert_eq!(error.to_string(), "something went wrong");
    }

    #[test]
    fn test_workflow_error_with_code() {
        let error = WorkflowError::new("duplicate activity id").with_code("INVALID_ACTION");
        assert_eq!(error.code.as_deref(), Some("INVALID_ACTION"));
        assert_eq!(error.to_string(), "INVALID_ACTION: duplicate activity id");
    }
}
