//! Activity executor
//!
//! Maps activity type tags to handlers and runs one attempt at a time with
//! the attempt's start-to-close timeout. Handler panics and bad input are
//! turned into activity failures; they never take the worker down.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use serde_json::Value;
use tracing::{debug, warn};

use super::{Activity, ActivityContext, ActivityError};
use crate::error::panic_message;
use crate::queue::ActivityTask;

/// Error type of failures caused by input the activity cannot decode
pub const INVALID_INPUT: &str = "INVALID_INPUT";

/// Error type of tasks naming an activity type nobody registered
pub const UNKNOWN_ACTIVITY_TYPE: &str = "UNKNOWN_ACTIVITY_TYPE";

/// Error type of attempts whose handler panicked
pub const PANICKED: &str = "PANICKED";

/// How one attempt ended
#[derive(Debug, Clone, PartialEq)]
pub enum ActivityOutcome {
    Completed(Value),
    Failed(ActivityError),
    /// The attempt exceeded its start-to-close timeout
    TimedOut,
}

type Handler =
    Arc<dyn Fn(ActivityContext, Value) -> BoxFuture<'static, Result<Value, ActivityError>> + Send + Sync>;

/// Registry and runner of activity handlers
#[derive(Default)]
pub struct ActivityExecutor {
    handlers: HashMap<String, Handler>,
}

impl ActivityExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a typed activity
    pub fn register<A: Activity>(&mut self, activity: A) {
        let activity = Arc::new(activity);
        let handler: Handler = Arc::new(move |ctx: ActivityContext, input: Value| {
            let activity = Arc::clone(&activity);
            async move {
                let input: A::Input = serde_json::from_value(input).map_err(|e| {
                    ActivityError::non_retryable(format!("invalid input for {}: {}", A::TYPE, e))
                        .with_type(INVALID_INPUT)
                })?;
                let output = activity.execute(&ctx, input).await?;
                serde_json::to_value(output).map_err(|e| {
                    ActivityError::non_retryable(format!("failed to serialize output: {}", e))
                })
            }
            .boxed()
        });
        self.handlers.insert(A::TYPE.to_string(), handler);
    }

    /// Builder-style [`register`](Self::register)
    pub fn with<A: Activity>(mut self, activity: A) -> Self {
        self.register(activity);
        self
    }

    /// Register an untyped handler
    pub fn register_fn<F, Fut>(&mut self, activity_type: impl Into<String>, handler: F)
    where
        F: Fn(ActivityContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ActivityError>> + Send + 'static,
    {
        let handler: Handler =
            Arc::new(move |ctx: ActivityContext, input: Value| handler(ctx, input).boxed());
        self.handlers.insert(activity_type.into(), handler);
    }

    pub fn contains(&self, activity_type: &str) -> bool {
        self.handlers.contains_key(activity_type)
    }

    /// Registered type tags, sorted
    pub fn activity_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(|s| s.as_str()).collect();
        types.sort_unstable();
        types
    }

    /// Run one attempt of `task`
    ///
    /// On timeout the handler is aborted and its cancellation token tripped.
    pub async fn execute(&self, task: &ActivityTask, ctx: ActivityContext) -> ActivityOutcome {
        let Some(handler) = self.handlers.get(&task.activity_type) else {
            warn!(activity_type = %task.activity_type, "no handler registered");
            return ActivityOutcome::Failed(
                ActivityError::non_retryable(format!(
                    "no handler registered for activity type: {}",
                    task.activity_type
                ))
                .with_type(UNKNOWN_ACTIVITY_TYPE),
            );
        };

        let token = ctx.cancellation_token();
        let handle = tokio::spawn(handler(ctx, task.input.clone()));
        let abort = handle.abort_handle();
        let limit = task.options.start_to_close_timeout;

        match tokio::time::timeout(limit, handle).await {
            Ok(Ok(Ok(output))) => ActivityOutcome::Completed(output),
            Ok(Ok(Err(error))) => {
                debug!(activity_id = %task.activity_id, error = %error, "activity failed");
                ActivityOutcome::Failed(error)
            }
            Ok(Err(join_error)) if join_error.is_panic() => {
                let message = panic_message(join_error.into_panic());
                warn!(activity_id = %task.activity_id, %message, "activity panicked");
                ActivityOutcome::Failed(
                    ActivityError::retryable(format!("activity panicked: {}", message))
                        .with_type(PANICKED),
                )
            }
            Ok(Err(_)) => {
                ActivityOutcome::Failed(ActivityError::retryable("activity task was aborted"))
            }
            Err(_) => {
                warn!(
                    activity_id = %task.activity_id,
                    timeout_ms = limit.as_millis() as u64,
                    "activity timed out"
                );
                token.cancel();
                abort.abort();
                ActivityOutcome::TimedOut
            }
        }
    }
}

impl fmt::Debug for ActivityExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActivityExecutor")
            .field("activity_types", &self.activity_types())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin::{EchoActivity, SleepActivity};
    use crate::workflow::{ActivityOptions, RunKey};
    use serde_json::json;
    use std::time::Duration;

    fn task(activity_type: &str, input: Value) -> ActivityTask {
        ActivityTask {
            run: RunKey::generate("wf"),
            activity_id: "a".to_string(),
            activity_type: activity_type.to_string(),
            input,
            options: ActivityOptions::default(),
            attempt: 1,
        }
    }

    fn ctx(task: &ActivityTask) -> ActivityContext {
        ActivityContext::new(task.run.clone(), task.activity_id.clone(), task.attempt, 3)
    }

    #[tokio::test]
    async fn test_typed_activity() {
        let executor = ActivityExecutor::new().with(EchoActivity);
        let task = task("echo", json!({ "hello": "world" }));

        let outcome = executor.execute(&task, ctx(&task)).await;
        assert_eq!(outcome, ActivityOutcome::Completed(json!({ "hello": "world" })));
    }

    #[tokio::test]
    async fn test_unknown_type_is_not_retryable() {
        let executor = ActivityExecutor::new();
        let task = task("missing", json!(null));

        match executor.execute(&task, ctx(&task)).await {
            ActivityOutcome::Failed(error) => {
                assert!(!error.retryable);
                assert_eq!(error.error_type.as_deref(), Some(UNKNOWN_ACTIVITY_TYPE));
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_bad_input_is_not_retryable() {
        let executor = ActivityExecutor::new().with(SleepActivity);
        let task = task("sleep", json!({ "ms": "soon" }));

        match executor.execute(&task, ctx(&task)).await {
            ActivityOutcome::Failed(error) => {
                assert!(!error.retryable);
                assert_eq!(error.error_type.as_deref(), Some(INVALID_INPUT));
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_panic_becomes_retryable_failure() {
        let mut executor = ActivityExecutor::new();
        executor.register_fn("explode", |_ctx, _input| async move {
            if true {
                panic!("kaboom");
            }
            Ok(json!(null))
        });
        let task = task("explode", json!(null));

        match executor.execute(&task, ctx(&task)).await {
            ActivityOutcome::Failed(error) => {
                assert!(error.retryable);
                assert!(error.message.contains("kaboom"));
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_timeout_cancels_handler() {
        let executor = ActivityExecutor::new().with(SleepActivity);
        let mut task = task("sleep", json!({ "ms": 10_000 }));
        task.options = ActivityOptions::default().with_start_to_close_timeout(Duration::from_millis(20));
        let ctx = ctx(&task);
        let token = ctx.cancellation_token();

        assert_eq!(executor.execute(&task, ctx).await, ActivityOutcome::TimedOut);
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_activity_types_sorted() {
        let mut executor = ActivityExecutor::new().with(SleepActivity).with(EchoActivity);
        executor.register_fn("custom", |_ctx, input| async move { Ok(input) });
        assert_eq!(executor.activity_types(), vec!["custom", "echo", "sleep"]);
        assert!(format!("{:?}", executor).contains("custom"));
    }
}
