//! Workflow executor
//!
//! The `WorkflowExecutor` is the I/O shell around the [`StateMachine`]:
//! - Starting new runs
//! - Loading run state from a snapshot plus the history tail
//! - Appending decisions with optimistic concurrency, retrying on conflicts
//! - Dispatching commands to the task queue once their events are durable

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::machine::{CancellationPolicy, EngineError, RunStart, StateMachine};
use super::registry::WorkflowRegistry;
use super::state::{Command, IncomingEvent, RunSnapshot};
use crate::activity::ActivityOutcome;
use crate::clock::{self, Clock};
use crate::error::ErrorCategory;
use crate::persistence::{Pagination, RunFilter, StoreError, StoredSnapshot, WorkflowEventStore};
use crate::queue::{ActivityTask, QueueError, TaskQueue, WorkItem};
use crate::reliability::{retry_transient, TransientRetryConfig};
use crate::serde_millis;
use crate::workflow::{RunKey, RunStatus};

/// Configuration for the workflow executor
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Maximum events per run (for safety)
    pub max_events_per_run: u64,

    /// Save a snapshot once this many events were appended since the last one
    pub snapshot_interval: u64,

    /// Attempts at appending a decision before giving up on conflicts
    pub max_conflict_retries: u32,

    pub cancellation_policy: CancellationPolicy,

    /// Retries of transient store and queue failures
    pub transient_retry: TransientRetryConfig,

    /// How often commands whose dispatch failed are tried again
    pub redispatch_interval: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_events_per_run: 10_000,
            snapshot_interval: 50,
            max_conflict_retries: 8,
            cancellation_policy: CancellationPolicy::Drain,
            transient_retry: TransientRetryConfig::default(),
            redispatch_interval: Duration::from_secs(5),
        }
    }
}

impl ExecutorConfig {
    pub fn with_snapshot_interval(mut self, interval: u64) -> Self {
        self.snapshot_interval = interval;
        self
    }

    pub fn with_cancellation_policy(mut self, policy: CancellationPolicy) -> Self {
        self.cancellation_policy = policy;
        self
    }

    pub fn with_transient_retry(mut self, retry: TransientRetryConfig) -> Self {
        self.transient_retry = retry;
        self
    }

    pub fn with_redispatch_interval(mut self, interval: Duration) -> Self {
        self.redispatch_interval = interval;
        self
    }
}

/// Errors from executor operations
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    /// A workflow id has at most one open run
    #[error("workflow {workflow_id} already has an open run {run_id}")]
    RunAlreadyOpen { workflow_id: String, run_id: Uuid },

    #[error("run {run} has too many events ({count} > {limit})")]
    TooManyEvents { run: RunKey, count: u64, limit: u64 },

    /// Every append attempt lost a race
    #[error("gave up on run {run} after {attempts} sequence conflicts")]
    ConflictRetriesExhausted { run: RunKey, attempts: u32 },
}

impl ExecutorError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            ExecutorError::Store(e) => e.category(),
            ExecutorError::Queue(e) => e.category(),
            ExecutorError::Engine(e) => e.category(),
            ExecutorError::RunAlreadyOpen { .. } => ErrorCategory::Conflict,
            ExecutorError::TooManyEvents { .. } => ErrorCategory::Internal,
            ExecutorError::ConflictRetriesExhausted { .. } => ErrorCategory::Transient,
        }
    }

    /// The run is gone or closed; input for it can be dropped
    pub fn is_run_gone(&self) -> bool {
        matches!(
            self,
            ExecutorError::Engine(EngineError::RunClosed { .. })
                | ExecutorError::Store(StoreError::RunNotFound(_))
                | ExecutorError::Store(StoreError::RunTerminal { .. })
        )
    }
}

/// Request to start a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartRunRequest {
    /// Generated when absent
    pub workflow_id: Option<String>,
    pub workflow_type: String,
    pub input: serde_json::Value,
    #[serde(default, with = "serde_millis::option")]
    pub run_timeout: Option<Duration>,
    pub schedule_id: Option<String>,
}

impl StartRunRequest {
    pub fn new(workflow_type: impl Into<String>, input: serde_json::Value) -> Self {
        Self {
            workflow_id: None,
            workflow_type: workflow_type.into(),
            input,
            run_timeout: None,
            schedule_id: None,
        }
    }

    pub fn with_workflow_id(mut self, workflow_id: impl Into<String>) -> Self {
        self.workflow_id = Some(workflow_id.into());
        self
    }

    pub fn with_run_timeout(mut self, timeout: Duration) -> Self {
        self.run_timeout = Some(timeout);
        self
    }

    pub fn with_schedule_id(mut self, schedule_id: impl Into<String>) -> Self {
        self.schedule_id = Some(schedule_id.into());
        self
    }
}

/// Result of handling one incoming event
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessResult {
    /// Number of new events written (0 for stale or duplicate input)
    pub events_written: usize,

    /// Number of commands carried out
    pub commands_dispatched: usize,

    /// Run status after the decision
    pub status: RunStatus,
}

/// Workflow executor
///
/// Any number of executors may share a store and queue; concurrent
/// decisions for the same run are resolved by the store's sequence check.
///
/// # Example
///
/// ```ignore
/// use keel_durable::prelude::*;
///
/// let registry = WorkflowRegistry::new().with::<MyWorkflow>();
/// let executor = WorkflowExecutor::new(store, queue, registry, ExecutorConfig::default());
///
/// let run = executor
///     .start_run(StartRunRequest::new("my_workflow", json!({})))
///     .await?;
/// ```
pub struct WorkflowExecutor {
    store: Arc<dyn WorkflowEventStore>,
    queue: Arc<dyn TaskQueue>,
    machine: StateMachine,
    clock: Arc<dyn Clock>,
    /// Tokens of activities executing in this process
    cancellations: DashMap<(RunKey, String), CancellationToken>,
    /// Commands whose events are durable but whose dispatch failed
    undispatched: Mutex<Vec<Command>>,
    config: ExecutorConfig,
}

impl WorkflowExecutor {
    pub fn new(
        store: Arc<dyn WorkflowEventStore>,
        queue: Arc<dyn TaskQueue>,
        registry: WorkflowRegistry,
        config: ExecutorConfig,
    ) -> Self {
        for workflow_type in registry.workflow_types() {
            info!(workflow_type, "registered workflow type");
        }
        let machine = StateMachine::new(Arc::new(registry))
            .with_cancellation_policy(config.cancellation_policy);

        Self {
            store,
            queue,
            machine,
            clock: clock::system_clock(),
            cancellations: DashMap::new(),
            undispatched: Mutex::new(Vec::new()),
            config,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn store(&self) -> &Arc<dyn WorkflowEventStore> {
        &self.store
    }

    pub fn queue(&self) -> &Arc<dyn TaskQueue> {
        &self.queue
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Workflow types this executor can run
    pub fn registry(&self) -> &WorkflowRegistry {
        self.machine.registry()
    }

    /// Start a new run
    ///
    /// Persists `STARTED` together with whatever the workflow's `on_start`
    /// decided, then dispatches the resulting commands.
    #[instrument(skip(self, request), fields(workflow_type = %request.workflow_type))]
    pub async fn start_run(&self, request: StartRunRequest) -> Result<RunKey, ExecutorError> {
        let workflow_id = request
            .workflow_id
            .unwrap_or_else(|| Uuid::now_v7().to_string());

        let open = retry_transient(&self.config.transient_retry, "find_open_runs", || {
            self.store.find_open_runs(&workflow_id)
        })
        .await?;
        if let Some(run) = open.first() {
            return Err(ExecutorError::RunAlreadyOpen {
                workflow_id,
                run_id: run.key.run_id,
            });
        }

        let key = RunKey::generate(workflow_id);
        let decision = self.machine.start(
            RunStart {
                key: key.clone(),
                workflow_type: request.workflow_type,
                input: request.input,
                run_timeout: request.run_timeout,
                schedule_id: request.schedule_id,
            },
            self.clock.now(),
        )?;

        let info = decision.snapshot.info();
        let events = decision.events;
        let created = retry_transient(&self.config.transient_retry, "create_run", || {
            self.store.create_run(info.clone(), events.clone())
        })
        .await;
        match created {
            Ok(_) => {}
            Err(StoreError::OpenRunExists {
                workflow_id,
                run_id,
            }) => return Err(ExecutorError::RunAlreadyOpen { workflow_id, run_id }),
            Err(e) => return Err(e.into()),
        }

        info!(run = %key, status = %decision.snapshot.status, "run started");
        self.maybe_snapshot(0, &decision.snapshot).await;
        self.dispatch(decision.commands).await;
        Ok(key)
    }

    /// Feed one incoming event through the state machine
    ///
    /// Loads the run, decides, and appends; a lost append race reloads and
    /// decides again. Stale or duplicate input writes nothing.
    #[instrument(skip(self, incoming), fields(run = %run, incoming = incoming.name()))]
    pub async fn handle(
        &self,
        run: &RunKey,
        incoming: IncomingEvent,
    ) -> Result<ProcessResult, ExecutorError> {
        let attempts = self.config.max_conflict_retries.max(1);

        for attempt in 1..=attempts {
            let (snapshot, base) = self.load(run).await?;
            let decision = self
                .machine
                .advance(&snapshot, incoming.clone(), self.clock.now())?;

            if decision.is_noop() {
                return Ok(ProcessResult {
                    events_written: 0,
                    commands_dispatched: 0,
                    status: snapshot.status,
                });
            }

            let count = decision.snapshot.last_sequence;
            if count > self.config.max_events_per_run {
                return Err(ExecutorError::TooManyEvents {
                    run: run.clone(),
                    count,
                    limit: self.config.max_events_per_run,
                });
            }

            let events = decision.events;
            let appended = retry_transient(&self.config.transient_retry, "append_batch", || {
                self.store.append_batch(run, events.clone())
            })
            .await;

            match appended {
                Ok(_) => {
                    let status = decision.snapshot.status;
                    if status.is_terminal() {
                        info!(%status, "run closed");
                    }
                    self.maybe_snapshot(base, &decision.snapshot).await;
                    let commands_dispatched = self.dispatch(decision.commands).await;
                    return Ok(ProcessResult {
                        events_written: events.len(),
                        commands_dispatched,
                        status,
                    });
                }
                Err(StoreError::SequenceConflict { expected, actual }) => {
                    debug!(attempt, expected, actual, "lost append race, reloading run");
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }

        warn!(attempts, "giving up after repeated sequence conflicts");
        Err(ExecutorError::ConflictRetriesExhausted {
            run: run.clone(),
            attempts,
        })
    }

    /// Request cancellation of a run
    pub async fn cancel_run(
        &self,
        run: &RunKey,
        reason: impl Into<String>,
    ) -> Result<ProcessResult, ExecutorError> {
        self.handle(
            run,
            IncomingEvent::CancelRequested {
                reason: reason.into(),
            },
        )
        .await
    }

    /// Current state of a run, from the latest snapshot plus the history tail
    pub async fn load_state(&self, run: &RunKey) -> Result<RunSnapshot, ExecutorError> {
        Ok(self.load(run).await?.0)
    }

    /// Rebuild a run from its full history, ignoring snapshots
    pub async fn replay(&self, run: &RunKey) -> Result<RunSnapshot, ExecutorError> {
        let history = retry_transient(&self.config.transient_retry, "load_history", || {
            self.store.load_history(run)
        })
        .await?;
        Ok(self.machine.replay(run, &history)?)
    }

    /// Re-dispatch the pending work of every open run
    ///
    /// Meant for startup, to cover commands lost with a previous process.
    /// Started activities are enqueued again as well; if their original
    /// lease is still live the attempt may execute twice concurrently, and
    /// only the first report is recorded. Returns the number of commands
    /// dispatched.
    #[instrument(skip(self))]
    pub async fn recover(&self) -> Result<usize, ExecutorError> {
        let mut dispatched = 0;
        let mut page = Pagination::first(100);

        loop {
            let runs = self
                .store
                .list_runs(&RunFilter::running(), page)
                .await?;
            let fetched = runs.len();

            for info in runs {
                match self.load_state(&info.key).await {
                    Ok(snapshot) => {
                        dispatched += self.dispatch(snapshot.pending_commands()).await;
                    }
                    Err(e) if e.is_run_gone() => {}
                    Err(e) => {
                        error!(run = %info.key, error = %e, "failed to load run for recovery");
                    }
                }
            }

            if fetched < page.limit {
                break;
            }
            page.offset += page.limit;
        }

        info!(dispatched, "recovered pending work of open runs");
        Ok(dispatched)
    }

    /// Number of commands waiting for a successful dispatch
    pub fn undispatched_count(&self) -> usize {
        self.undispatched.lock().len()
    }

    /// Try again to dispatch commands whose earlier dispatch failed
    ///
    /// Commands that fail again stay buffered. Returns the number
    /// dispatched.
    pub async fn redispatch_failed(&self) -> usize {
        let commands = std::mem::take(&mut *self.undispatched.lock());
        if commands.is_empty() {
            return 0;
        }
        let total = commands.len();
        let dispatched = self.dispatch(commands).await;
        if dispatched > 0 {
            info!(dispatched, total, "redispatched commands after earlier failures");
        }
        dispatched
    }

    /// Retry failed dispatches on an interval until shutdown is signaled
    pub fn spawn_redispatcher(
        self: Arc<Self>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.redispatch_interval);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.redispatch_failed().await;
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("Redispatch loop: shutdown requested");
                        break;
                    }
                }
            }

            debug!("Redispatch loop exited");
        })
    }

    /// Record that a worker is about to execute `task`
    ///
    /// Returns `false` when the attempt is stale (superseded, already
    /// reported, cancelled, or the run closed) and must not execute.
    pub async fn begin_activity(
        &self,
        task: &ActivityTask,
        worker_id: &str,
    ) -> Result<bool, ExecutorError> {
        let snapshot = match self.load_state(&task.run).await {
            Ok(snapshot) => snapshot,
            Err(e) if e.is_run_gone() => return Ok(false),
            Err(e) => return Err(e),
        };
        if snapshot.status.is_terminal() {
            return Ok(false);
        }

        let current = snapshot
            .activities
            .get(&task.activity_id)
            .filter(|a| a.attempt == task.attempt && a.status.is_in_flight());
        if current.is_none() {
            return Ok(false);
        }

        match self
            .handle(
                &task.run,
                IncomingEvent::ActivityStarted {
                    activity_id: task.activity_id.clone(),
                    attempt: task.attempt,
                    worker_id: worker_id.to_string(),
                },
            )
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if e.is_run_gone() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Report the outcome of an activity attempt
    pub async fn complete_activity(
        &self,
        task: &ActivityTask,
        outcome: ActivityOutcome,
    ) -> Result<ProcessResult, ExecutorError> {
        let activity_id = task.activity_id.clone();
        let attempt = task.attempt;
        let incoming = match outcome {
            ActivityOutcome::Completed(result) => IncomingEvent::ActivityCompleted {
                activity_id,
                attempt,
                result,
            },
            ActivityOutcome::Failed(error) => IncomingEvent::ActivityFailed {
                activity_id,
                attempt,
                error,
            },
            ActivityOutcome::TimedOut => IncomingEvent::ActivityTimedOut {
                activity_id,
                attempt,
            },
        };
        self.handle(&task.run, incoming).await
    }

    /// Cancellation token for an activity executing in this process
    pub fn register_activity(&self, task: &ActivityTask) -> CancellationToken {
        let token = CancellationToken::new();
        self.cancellations
            .insert((task.run.clone(), task.activity_id.clone()), token.clone());
        token
    }

    pub fn release_activity(&self, task: &ActivityTask) {
        self.cancellations
            .remove(&(task.run.clone(), task.activity_id.clone()));
    }

    async fn load(&self, run: &RunKey) -> Result<(RunSnapshot, u64), ExecutorError> {
        let retry = &self.config.transient_retry;
        let stored = retry_transient(retry, "load_snapshot", || self.store.load_snapshot(run)).await;

        let base = match stored {
            Ok(stored) => match serde_json::from_value::<RunSnapshot>(stored.state) {
                Ok(snapshot) => Some(snapshot),
                Err(e) => {
                    warn!(run = %run, error = %e, "discarding unreadable snapshot");
                    None
                }
            },
            Err(StoreError::SnapshotNotFound(_)) => None,
            Err(e) => return Err(e.into()),
        };

        match base {
            Some(snapshot) => {
                let at = snapshot.last_sequence;
                let tail = retry_transient(retry, "load_history_after", || {
                    self.store.load_history_after(run, at)
                })
                .await?;
                Ok((self.machine.resume(snapshot, &tail)?, at))
            }
            None => {
                let history =
                    retry_transient(retry, "load_history", || self.store.load_history(run)).await?;
                Ok((self.machine.replay(run, &history)?, 0))
            }
        }
    }

    /// Save a snapshot if enough events were appended since `base`
    async fn maybe_snapshot(&self, base: u64, snapshot: &RunSnapshot) {
        let interval = self.config.snapshot_interval;
        if interval == 0 || snapshot.last_sequence - base < interval {
            return;
        }

        let state = match serde_json::to_value(snapshot) {
            Ok(state) => state,
            Err(e) => {
                warn!(run = %snapshot.key, error = %e, "failed to serialize snapshot");
                return;
            }
        };
        let stored = StoredSnapshot {
            sequence: snapshot.last_sequence,
            state,
            taken_at: self.clock.now(),
        };
        match self.store.save_snapshot(&snapshot.key, stored).await {
            Ok(()) => debug!(run = %snapshot.key, sequence = snapshot.last_sequence, "saved snapshot"),
            Err(e) => warn!(run = %snapshot.key, error = %e, "failed to save snapshot"),
        }
    }

    /// Carry out commands whose events are durable
    ///
    /// The events are already persisted, so failures are not returned: a
    /// command that cannot be dispatched is buffered and retried by
    /// [`redispatch_failed`](Self::redispatch_failed).
    async fn dispatch(&self, commands: Vec<Command>) -> usize {
        let mut dispatched = 0;
        for command in commands {
            let result = match command.clone() {
                Command::ScheduleActivity { task, not_before } => {
                    self.enqueue(WorkItem::Activity(task), not_before).await
                }
                Command::StartTimer {
                    run,
                    timer_id,
                    fire_at,
                } => self.enqueue(WorkItem::TimerFired { run, timer_id }, fire_at).await,
                Command::ScheduleRunTimeout { run, deadline } => {
                    self.enqueue(WorkItem::RunTimeout { run }, deadline).await
                }
                Command::CancelActivity { run, activity_id } => {
                    if let Some(token) = self.cancellations.get(&(run, activity_id)) {
                        token.cancel();
                    }
                    Ok(())
                }
                Command::CloseRun { run, status } => {
                    debug!(run = %run, %status, "run closed");
                    Ok(())
                }
            };

            match result {
                Ok(()) => dispatched += 1,
                Err(e) => {
                    error!(error = %e, "failed to dispatch command, will retry");
                    self.undispatched.lock().push(command);
                }
            }
        }
        dispatched
    }

    async fn enqueue(
        &self,
        item: WorkItem,
        not_before: chrono::DateTime<chrono::Utc>,
    ) -> Result<(), QueueError> {
        retry_transient(&self.config.transient_retry, "enqueue", || {
            self.queue.enqueue(item.clone(), not_before)
        })
        .await
        .map(|_| ())
    }
}
