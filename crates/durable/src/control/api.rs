//! Control API
//!
//! The operations an operator surface (HTTP or otherwise) calls: start,
//! cancel and inspect runs, and manage schedules. Every operation returns
//! an explicit result whose error carries an [`ErrorCategory`]; panics
//! inside an operation are caught here and reported as internal errors.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

use super::{ControlConfig, RunDetails, RunSummary};
use crate::engine::{ExecutorError, StartRunRequest, WorkflowExecutor};
use crate::error::{panic_message, ErrorCategory};
use crate::persistence::{Pagination, RunFilter};
use crate::reliability::retry_transient;
use crate::schedule::{Schedule, ScheduleAction, ScheduleError, ScheduleManager, ScheduleRequest};
use crate::workflow::{RunInfo, RunKey};

/// Errors from control operations
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("{0}")]
    Validation(String),

    #[error("no matching run for workflow {workflow_id}")]
    RunNotFound { workflow_id: String },

    /// More than one open run and no run id to pick one
    #[error("workflow {workflow_id} has several open runs ({}); specify a run id", join_ids(.run_ids))]
    AmbiguousRun {
        workflow_id: String,
        run_ids: Vec<Uuid>,
    },

    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    /// Unexpected fault; the message never carries internal state
    #[error("internal error: {0}")]
    Internal(String),
}

impl ControlError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            ControlError::Validation(_) => ErrorCategory::Validation,
            ControlError::RunNotFound { .. } => ErrorCategory::NotFound,
            ControlError::AmbiguousRun { .. } => ErrorCategory::Conflict,
            ControlError::Executor(e) => e.category(),
            ControlError::Schedule(e) => e.category(),
            ControlError::Internal(_) => ErrorCategory::Internal,
        }
    }
}

fn join_ids(ids: &[Uuid]) -> String {
    ids.iter()
        .map(Uuid::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Entry point for operators
///
/// Holds the executor and schedule manager built once at startup.
pub struct ControlApi {
    executor: Arc<WorkflowExecutor>,
    schedules: Arc<ScheduleManager>,
    config: ControlConfig,
}

impl ControlApi {
    pub fn new(
        executor: Arc<WorkflowExecutor>,
        schedules: Arc<ScheduleManager>,
        config: ControlConfig,
    ) -> Self {
        Self {
            executor,
            schedules,
            config,
        }
    }

    pub fn executor(&self) -> &Arc<WorkflowExecutor> {
        &self.executor
    }

    pub fn schedules(&self) -> &Arc<ScheduleManager> {
        &self.schedules
    }

    pub fn config(&self) -> &ControlConfig {
        &self.config
    }

    /// Start a run
    #[instrument(skip(self, request), fields(workflow_type = %request.workflow_type))]
    pub async fn start_run(&self, request: StartRunRequest) -> Result<RunKey, ControlError> {
        self.guarded("start_run", async {
            if let Some(id) = &request.workflow_id {
                require("workflowId", id)?;
            }
            Ok(self.executor.start_run(request).await?)
        })
        .await
    }

    /// Request cancellation of a run
    ///
    /// Without `run_id` the workflow's open run is cancelled. Returns the
    /// workflow id.
    #[instrument(skip(self, reason))]
    pub async fn cancel_run(
        &self,
        workflow_id: &str,
        run_id: Option<Uuid>,
        reason: Option<String>,
    ) -> Result<String, ControlError> {
        self.guarded("cancel_run", async {
            require("workflowId", workflow_id)?;
            let run = match run_id {
                Some(run_id) => RunKey::new(workflow_id, run_id),
                None => single_open_run(workflow_id, self.open_runs(workflow_id).await?)?
                    .ok_or_else(|| ControlError::RunNotFound {
                        workflow_id: workflow_id.to_string(),
                    })?,
            };
            let reason = reason
                .filter(|r| !r.trim().is_empty())
                .unwrap_or_else(|| self.config.default_cancel_reason.clone());

            self.executor
                .cancel_run(&run, reason.clone())
                .await
                .map_err(|e| not_found_as_run(e, workflow_id))?;
            info!(run = %run, %reason, "run cancellation requested");
            Ok(workflow_id.to_string())
        })
        .await
    }

    /// Current state of a run
    ///
    /// Without `run_id` this is the open run, or else the most recent one.
    pub async fn query_run(
        &self,
        workflow_id: &str,
        run_id: Option<Uuid>,
    ) -> Result<RunDetails, ControlError> {
        self.guarded("query_run", async {
            require("workflowId", workflow_id)?;
            let run = match run_id {
                Some(run_id) => RunKey::new(workflow_id, run_id),
                None => match single_open_run(workflow_id, self.open_runs(workflow_id).await?)? {
                    Some(run) => run,
                    None => self.latest_run(workflow_id).await?,
                },
            };

            let snapshot = self
                .executor
                .load_state(&run)
                .await
                .map_err(|e| not_found_as_run(e, workflow_id))?;
            Ok(RunDetails::from(&snapshot))
        })
        .await
    }

    /// Open runs, oldest first, with their live activity counts
    ///
    /// The listing is a point-in-time view assembled run by run; a run that
    /// disappears while it is being assembled is left out.
    pub async fn list_running_runs(
        &self,
        max_results: Option<usize>,
    ) -> Result<Vec<RunSummary>, ControlError> {
        self.guarded("list_running_runs", async {
            let limit = match max_results {
                Some(0) => {
                    return Err(ControlError::Validation(
                        "maxResults must be greater than zero".to_string(),
                    ))
                }
                Some(n) => n.min(self.config.max_results_limit),
                None => self.config.default_max_results,
            };

            let store = self.executor.store();
            let retry = &self.executor.config().transient_retry;
            let filter = RunFilter::running();
            let runs = retry_transient(retry, "list_runs", || {
                store.list_runs(&filter, Pagination::first(limit))
            })
            .await
            .map_err(ExecutorError::from)?;

            let mut summaries = Vec::with_capacity(runs.len());
            for info in runs {
                match self.executor.load_state(&info.key).await {
                    Ok(snapshot) => summaries.push(RunSummary::from(&snapshot)),
                    Err(e) if e.is_run_gone() => {
                        debug!(run = %info.key, "run vanished while listing")
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            Ok(summaries)
        })
        .await
    }

    /// Create a schedule for a registered workflow type
    pub async fn create_schedule(&self, request: ScheduleRequest) -> Result<Schedule, ControlError> {
        self.guarded("create_schedule", async {
            if !self.executor.registry().contains(&request.workflow_type) {
                return Err(ControlError::Validation(format!(
                    "unknown workflow type: {}",
                    request.workflow_type
                )));
            }
            Ok(self.schedules.create(request).await?)
        })
        .await
    }

    /// Apply CANCEL, PAUSE or UNPAUSE (any case) to a schedule
    ///
    /// Returns the schedule id.
    #[instrument(skip(self, reason))]
    pub async fn schedule_action(
        &self,
        schedule_id: &str,
        action: &str,
        reason: Option<String>,
    ) -> Result<String, ControlError> {
        self.guarded("schedule_action", async {
            require("scheduleId", schedule_id)?;
            let action: ScheduleAction = action.parse()?;
            self.schedules.action(schedule_id, action, reason).await?;
            Ok(schedule_id.to_string())
        })
        .await
    }

    pub async fn describe_schedule(&self, schedule_id: &str) -> Result<Schedule, ControlError> {
        self.guarded("describe_schedule", async {
            Ok(self.schedules.describe(schedule_id).await?)
        })
        .await
    }

    pub async fn list_schedules(&self) -> Result<Vec<Schedule>, ControlError> {
        self.guarded("list_schedules", async { Ok(self.schedules.list().await?) })
            .await
    }

    async fn open_runs(&self, workflow_id: &str) -> Result<Vec<RunInfo>, ControlError> {
        let store = self.executor.store();
        let retry = &self.executor.config().transient_retry;
        retry_transient(retry, "find_open_runs", || store.find_open_runs(workflow_id))
            .await
            .map_err(|e| ExecutorError::from(e).into())
    }

    async fn latest_run(&self, workflow_id: &str) -> Result<RunKey, ControlError> {
        let store = self.executor.store();
        let retry = &self.executor.config().transient_retry;
        let runs = retry_transient(retry, "find_runs", || store.find_runs(workflow_id))
            .await
            .map_err(ExecutorError::from)?;
        runs.into_iter()
            .next()
            .map(|info| info.key)
            .ok_or_else(|| ControlError::RunNotFound {
                workflow_id: workflow_id.to_string(),
            })
    }

    /// Run `operation`, turning a panic into an internal error
    async fn guarded<T, F>(&self, operation: &'static str, fut: F) -> Result<T, ControlError>
    where
        F: Future<Output = Result<T, ControlError>>,
    {
        match AssertUnwindSafe(fut).catch_unwind().await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                debug!(operation, category = %e.category(), error = %e, "control operation failed");
                Err(e)
            }
            Err(panic) => {
                let message = panic_message(panic);
                error!(operation, %message, "control operation panicked");
                Err(ControlError::Internal(format!(
                    "unexpected failure in {}",
                    operation
                )))
            }
        }
    }
}

fn require(field: &str, value: &str) -> Result<(), ControlError> {
    if value.trim().is_empty() {
        return Err(ControlError::Validation(format!("{} is required", field)));
    }
    Ok(())
}

/// The one open run, if any
fn single_open_run(workflow_id: &str, open: Vec<RunInfo>) -> Result<Option<RunKey>, ControlError> {
    match open.len() {
        0 => Ok(None),
        1 => Ok(open.into_iter().next().map(|info| info.key)),
        _ => Err(ControlError::AmbiguousRun {
            workflow_id: workflow_id.to_string(),
            run_ids: open.into_iter().map(|info| info.key.run_id).collect(),
        }),
    }
}

/// Report a missing run in workflow terms
fn not_found_as_run(error: ExecutorError, workflow_id: &str) -> ControlError {
    if error.category() == ErrorCategory::NotFound {
        ControlError::RunNotFound {
            workflow_id: workflow_id.to_string(),
        }
    } else {
        error.into()
    }
}
