//! Worker pool
//!
//! Leases work items from the task queue and feeds them to the engine:
//! activity attempts are executed and their outcome reported, due timers
//! and run deadlines become incoming events. Each item is acked once the
//! engine accepted its effect, so a crash before that point leaves the
//! lease to expire and the item to be redelivered.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};
use uuid::Uuid;

use super::poller::{PollerConfig, PollerError, QueuePoller};
use crate::activity::{ActivityContext, ActivityExecutor, HeartbeatPayload};
use crate::engine::{ExecutorError, IncomingEvent, WorkflowExecutor};
use crate::error::ErrorCategory;
use crate::queue::{ActivityTask, LeasedItem, QueueError, TaskQueue, WorkItem};
use crate::serde_millis;

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    /// Unique worker ID (generated if not provided)
    pub worker_id: String,

    /// Maximum items processed concurrently
    pub max_concurrency: usize,

    /// Lease taken on each dequeued item; renewed every third of it while
    /// an activity runs
    #[serde(with = "serde_millis")]
    pub lease_duration: Duration,

    pub poller: PollerConfig,

    /// Graceful shutdown timeout
    #[serde(with = "serde_millis")]
    pub shutdown_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::now_v7()),
            max_concurrency: 10,
            lease_duration: Duration::from_secs(30),
            poller: PollerConfig::default(),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl WorkerPoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    pub fn with_lease_duration(mut self, lease: Duration) -> Self {
        self.lease_duration = lease;
        self
    }

    pub fn with_poller(mut self, config: PollerConfig) -> Self {
        self.poller = config;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Worker pool status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPoolStatus {
    /// Polling and processing items
    Running,
    /// Finishing in-flight items, not leasing new ones
    Draining,
    Stopped,
}

/// Worker pool errors
#[derive(Debug, thiserror::Error)]
pub enum WorkerPoolError {
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("poller error: {0}")]
    Poller(#[from] PollerError),

    #[error("worker pool is already running")]
    AlreadyRunning,

    #[error("graceful shutdown timed out with {remaining} items in flight")]
    ShutdownTimeout { remaining: usize },
}

impl WorkerPoolError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            WorkerPoolError::Queue(e) | WorkerPoolError::Poller(PollerError::Queue(e)) => {
                e.category()
            }
            WorkerPoolError::Poller(PollerError::Shutdown) | WorkerPoolError::AlreadyRunning => {
                ErrorCategory::Conflict
            }
            WorkerPoolError::ShutdownTimeout { .. } => ErrorCategory::Internal,
        }
    }
}

/// Processes single leased items
#[derive(Clone)]
struct Worker {
    executor: Arc<WorkflowExecutor>,
    activities: Arc<ActivityExecutor>,
    worker_id: String,
    lease_duration: Duration,
}

impl Worker {
    fn queue(&self) -> &Arc<dyn TaskQueue> {
        self.executor.queue()
    }

    #[instrument(
        skip(self, leased),
        fields(kind = leased.item.kind(), run = %leased.item.run(), delivery = leased.delivery)
    )]
    async fn process(&self, leased: LeasedItem) {
        let result = match &leased.item {
            WorkItem::Activity(task) => self.run_activity(task, &leased).await,
            WorkItem::TimerFired { run, timer_id } => self
                .executor
                .handle(
                    run,
                    IncomingEvent::TimerFired {
                        timer_id: timer_id.clone(),
                    },
                )
                .await
                .map(|_| ()),
            WorkItem::RunTimeout { run } => self
                .executor
                .handle(run, IncomingEvent::RunTimedOut)
                .await
                .map(|_| ()),
        };
        self.settle(&leased, result).await;
    }

    async fn run_activity(
        &self,
        task: &ActivityTask,
        leased: &LeasedItem,
    ) -> Result<(), ExecutorError> {
        if !self.executor.begin_activity(task, &self.worker_id).await? {
            debug!(activity_id = %task.activity_id, attempt = task.attempt, "skipping stale attempt");
            return Ok(());
        }

        let token = self.executor.register_activity(task);
        let (heartbeat_tx, heartbeat_rx) = mpsc::channel(16);
        let ctx = ActivityContext::new(
            task.run.clone(),
            task.activity_id.clone(),
            task.attempt,
            task.options.retry_policy.max_attempts,
        )
        .with_delivery(leased.delivery)
        .with_cancellation(token)
        .with_heartbeat(heartbeat_tx);

        let done = CancellationToken::new();
        let keeper = tokio::spawn(keep_lease(
            Arc::clone(self.queue()),
            leased.clone(),
            self.lease_duration,
            heartbeat_rx,
            done.clone(),
        ));

        let outcome = self.activities.execute(task, ctx).await;
        done.cancel();
        if let Err(e) = keeper.await {
            warn!(error = %e, "lease keeper task failed");
        }
        self.executor.release_activity(task);

        self.executor.complete_activity(task, outcome).await?;
        Ok(())
    }

    /// Ack or nack depending on how processing went
    ///
    /// Transient failures leave the item to be redelivered after its lease
    /// expires. Input for a closed run is dropped. Anything else would fail
    /// again on redelivery, so it is logged and dropped too.
    async fn settle(&self, leased: &LeasedItem, result: Result<(), ExecutorError>) {
        let ack = match result {
            Ok(()) => true,
            Err(e) if e.is_run_gone() => {
                debug!(error = %e, "dropping item for closed run");
                true
            }
            Err(e) if e.category() == ErrorCategory::Transient => {
                warn!(error = %e, "transient failure, item will be redelivered");
                false
            }
            Err(e) => {
                error!(error = %e, "failed to process work item, dropping it");
                true
            }
        };

        let settled = if ack {
            self.queue().ack(leased).await
        } else {
            self.queue().nack(leased).await
        };
        match settled {
            Ok(()) => {}
            Err(QueueError::LeaseLost(item_id)) => {
                debug!(%item_id, "lease lost before settling, item was redelivered")
            }
            Err(e) => warn!(error = %e, "failed to settle work item"),
        }
    }
}

/// Renew the lease of `leased` until `done` is tripped
///
/// Renews every third of the lease duration and on every heartbeat. Stops
/// early once the lease is lost.
async fn keep_lease(
    queue: Arc<dyn TaskQueue>,
    leased: LeasedItem,
    lease_duration: Duration,
    mut heartbeats: mpsc::Receiver<HeartbeatPayload>,
    done: CancellationToken,
) {
    let period = (lease_duration / 3).max(Duration::from_millis(10));
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    let mut listening = true;

    loop {
        tokio::select! {
            biased;
            beat = heartbeats.recv(), if listening => {
                match beat {
                    Some(payload) => trace!(details = ?payload.details, "activity heartbeat"),
                    None => {
                        listening = false;
                        continue;
                    }
                }
            }
            _ = done.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match queue.extend_lease(&leased, lease_duration).await {
            Ok(expires_at) => trace!(item_id = %leased.item_id, %expires_at, "lease extended"),
            Err(QueueError::LeaseLost(item_id)) => {
                warn!(%item_id, "lease lost while activity was running");
                break;
            }
            Err(e) => warn!(error = %e, "failed to extend lease"),
        }
    }
}

/// Worker pool executing queued work with bounded concurrency
///
/// # Example
///
/// ```ignore
/// use keel_durable::worker::{WorkerPool, WorkerPoolConfig};
///
/// let activities = ActivityExecutor::new().with(EchoActivity);
/// let pool = WorkerPool::new(executor, Arc::new(activities), WorkerPoolConfig::new());
///
/// pool.start()?;
///
/// // ... later, graceful shutdown
/// pool.shutdown().await?;
/// ```
pub struct WorkerPool {
    worker: Worker,
    config: WorkerPoolConfig,
    shutdown_tx: watch::Sender<bool>,
    status: RwLock<WorkerPoolStatus>,
    active: Arc<Semaphore>,
    poll_handle: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(
        executor: Arc<WorkflowExecutor>,
        activities: Arc<ActivityExecutor>,
        config: WorkerPoolConfig,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            worker: Worker {
                executor,
                activities,
                worker_id: config.worker_id.clone(),
                lease_duration: config.lease_duration,
            },
            active: Arc::new(Semaphore::new(config.max_concurrency)),
            config,
            shutdown_tx,
            status: RwLock::new(WorkerPoolStatus::Stopped),
            poll_handle: Mutex::new(None),
        }
    }

    /// Start polling in the background
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub fn start(&self) -> Result<(), WorkerPoolError> {
        {
            let mut status = self.status.write();
            if *status != WorkerPoolStatus::Stopped {
                return Err(WorkerPoolError::AlreadyRunning);
            }
            *status = WorkerPoolStatus::Running;
        }

        info!(
            max_concurrency = self.config.max_concurrency,
            activity_types = ?self.worker.activities.activity_types(),
            "starting worker pool"
        );

        self.shutdown_tx.send_replace(false);
        self.start_poll_loop();
        Ok(())
    }

    /// Stop leasing and wait for in-flight items
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn shutdown(&self) -> Result<(), WorkerPoolError> {
        {
            let mut status = self.status.write();
            if *status == WorkerPoolStatus::Stopped {
                return Ok(());
            }
            *status = WorkerPoolStatus::Draining;
        }

        info!("initiating graceful shutdown");
        self.shutdown_tx.send_replace(true);

        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout;
        loop {
            let remaining = self.active_count();
            if remaining == 0 {
                debug!("all items settled");
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(remaining, "shutdown timeout reached");
                return Err(WorkerPoolError::ShutdownTimeout { remaining });
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let handle = self.poll_handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "poll loop ended abnormally");
            }
        }

        *self.status.write() = WorkerPoolStatus::Stopped;
        info!("worker pool stopped");
        Ok(())
    }

    pub fn status(&self) -> WorkerPoolStatus {
        *self.status.read()
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// Items currently being processed
    pub fn active_count(&self) -> usize {
        self.config
            .max_concurrency
            .saturating_sub(self.active.available_permits())
    }

    /// Lease and process one item inline
    ///
    /// Returns `false` when nothing was visible.
    pub async fn process_next(&self) -> Result<bool, WorkerPoolError> {
        match self.worker.queue().dequeue(self.config.lease_duration).await? {
            Some(leased) => {
                self.worker.process(leased).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Process items inline until none is visible; returns how many were processed
    pub async fn run_until_idle(&self) -> Result<usize, WorkerPoolError> {
        let mut processed = 0;
        while self.process_next().await? {
            processed += 1;
        }
        Ok(processed)
    }

    fn start_poll_loop(&self) {
        let worker = self.worker.clone();
        let active = Arc::clone(&self.active);
        let mut poller = QueuePoller::new(
            Arc::clone(self.worker.queue()),
            self.config.worker_id.clone(),
            self.config.lease_duration,
            self.config.poller.clone(),
            self.shutdown_tx.subscribe(),
        );

        let handle = tokio::spawn(async move {
            loop {
                if poller.is_shutdown() {
                    debug!("poll loop: shutdown requested");
                    break;
                }

                let available = active.available_permits();
                if available == 0 {
                    if poller.wait().await {
                        break;
                    }
                    continue;
                }

                let leased = match poller.poll(available).await {
                    Ok(leased) => leased,
                    Err(e) => {
                        error!(error = %e, "poll failed");
                        Vec::new()
                    }
                };
                let found = !leased.is_empty();

                for item in leased {
                    let Ok(permit) = Arc::clone(&active).acquire_owned().await else {
                        break;
                    };
                    let worker = worker.clone();
                    tokio::spawn(async move {
                        worker.process(item).await;
                        drop(permit);
                    });
                }

                if !found && poller.wait().await {
                    break;
                }
            }

            debug!("poll loop exited");
        });

        *self.poll_handle.lock() = Some(handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::Activity;
    use crate::builtin::{EchoActivity, FailActivity, SequenceInput, SequenceWorkflow};
    use crate::clock::{Clock, ManualClock};
    use crate::engine::{ExecutorConfig, StartRunRequest, WorkflowRegistry};
    use crate::persistence::InMemoryWorkflowEventStore;
    use crate::queue::InMemoryTaskQueue;
    use crate::reliability::TransientRetryConfig;
    use crate::workflow::{RunKey, RunStatus, Workflow};
    use serde_json::json;

    const LEASE: Duration = Duration::from_secs(30);

    struct Harness {
        pool: WorkerPool,
        executor: Arc<WorkflowExecutor>,
        store: Arc<InMemoryWorkflowEventStore>,
        queue: Arc<InMemoryTaskQueue>,
        clock: ManualClock,
    }

    fn harness() -> Harness {
        let clock = ManualClock::default();
        let store = Arc::new(InMemoryWorkflowEventStore::with_clock(Arc::new(clock.clone())));
        let queue = Arc::new(InMemoryTaskQueue::with_clock(Arc::new(clock.clone())));
        let executor = Arc::new(
            WorkflowExecutor::new(
                store.clone(),
                queue.clone(),
                WorkflowRegistry::new().with::<SequenceWorkflow>(),
                ExecutorConfig::default().with_transient_retry(TransientRetryConfig::disabled()),
            )
            .with_clock(Arc::new(clock.clone())),
        );
        let activities = ActivityExecutor::new().with(EchoActivity).with(FailActivity);
        let pool = WorkerPool::new(
            executor.clone(),
            Arc::new(activities),
            WorkerPoolConfig::new()
                .with_worker_id("worker-test")
                .with_lease_duration(LEASE),
        );
        Harness {
            pool,
            executor,
            store,
            queue,
            clock,
        }
    }

    async fn start(h: &Harness, input: SequenceInput) -> RunKey {
        h.executor
            .start_run(StartRunRequest::new(
                SequenceWorkflow::TYPE,
                serde_json::to_value(input).unwrap(),
            ))
            .await
            .unwrap()
    }

    #[test]
    fn test_default_config() {
        let config = WorkerPoolConfig::default();
        assert!(config.worker_id.starts_with("worker-"));
        assert_eq!(config.max_concurrency, 10);
        assert_eq!(config.lease_duration, Duration::from_secs(30));
        assert_eq!(WorkerPoolConfig::new().with_max_concurrency(0).max_concurrency, 1);
    }

    #[test_log::test(tokio::test)]
    async fn test_processes_run_to_completion() {
        let h = harness();
        let run = start(&h, SequenceInput::new(["a", "b"])).await;

        assert_eq!(h.pool.run_until_idle().await.unwrap(), 2);

        let state = h.executor.load_state(&run).await.unwrap();
        assert_eq!(state.status, RunStatus::Completed);
        assert_eq!(state.activities["b"].worker_id.as_deref(), Some("worker-test"));
        assert!(h.queue.is_empty());
    }

    #[tokio::test]
    async fn test_retry_waits_for_backoff() {
        let h = harness();
        let mut input = SequenceInput::new(["flaky"]);
        input.activity_type = FailActivity::TYPE.to_string();
        input.payload = json!({ "message": "boom", "succeed_on_attempt": 2 });
        input.retry_interval_ms = Some(5_000);
        let run = start(&h, input).await;

        assert_eq!(h.pool.run_until_idle().await.unwrap(), 1);
        let state = h.executor.load_state(&run).await.unwrap();
        assert_eq!(state.status, RunStatus::Running);
        assert_eq!(state.activities["flaky"].attempt, 2);

        // the retry is delayed by the policy interval
        assert!(!h.pool.process_next().await.unwrap());
        h.clock.advance(Duration::from_secs(5));
        assert_eq!(h.pool.run_until_idle().await.unwrap(), 1);

        let state = h.executor.load_state(&run).await.unwrap();
        assert_eq!(state.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn test_transient_failure_is_redelivered() {
        let h = harness();
        let run = start(&h, SequenceInput::new(["a"])).await;

        h.store.set_unavailable(true);
        assert!(h.pool.process_next().await.unwrap());
        h.store.set_unavailable(false);

        // nacked items come back once the lease runs out
        assert!(!h.pool.process_next().await.unwrap());
        h.clock.advance(LEASE);
        assert!(h.pool.process_next().await.unwrap());

        let state = h.executor.load_state(&run).await.unwrap();
        assert_eq!(state.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn test_items_for_closed_run_are_dropped() {
        let h = harness();
        let run = start(&h, SequenceInput::new(["a"])).await;
        h.executor.cancel_run(&run, "stop").await.unwrap();

        assert_eq!(h.pool.run_until_idle().await.unwrap(), 1);
        assert!(h.queue.is_empty());

        let state = h.executor.load_state(&run).await.unwrap();
        assert_eq!(state.status, RunStatus::Cancelled);
        assert!(state.activities["a"].started_at.is_none());
    }

    #[tokio::test]
    async fn test_heartbeat_extends_lease() {
        let h = harness();
        h.queue
            .enqueue(
                WorkItem::RunTimeout {
                    run: RunKey::generate("wf"),
                },
                h.clock.now(),
            )
            .await
            .unwrap();
        let leased = h.queue.dequeue(LEASE).await.unwrap().unwrap();

        let (tx, rx) = mpsc::channel(1);
        let done = CancellationToken::new();
        let keeper = tokio::spawn(keep_lease(
            h.queue.clone(),
            leased,
            LEASE,
            rx,
            done.clone(),
        ));

        h.clock.advance(Duration::from_secs(20));
        tx.send(HeartbeatPayload { details: None }).await.unwrap();
        done.cancel();
        keeper.await.unwrap();

        // extended to 20s + 30s, so still leased at 40s
        h.clock.advance(Duration::from_secs(20));
        assert!(h.queue.dequeue(LEASE).await.unwrap().is_none());
        h.clock.advance(Duration::from_secs(10));
        assert!(h.queue.dequeue(LEASE).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let store = Arc::new(InMemoryWorkflowEventStore::new());
        let queue = Arc::new(InMemoryTaskQueue::new());
        let executor = Arc::new(WorkflowExecutor::new(
            store,
            queue,
            WorkflowRegistry::new().with::<SequenceWorkflow>(),
            ExecutorConfig::default(),
        ));
        let pool = WorkerPool::new(
            executor.clone(),
            Arc::new(ActivityExecutor::new().with(EchoActivity)),
            WorkerPoolConfig::new().with_poller(
                PollerConfig::new().with_max_interval(Duration::from_millis(20)),
            ),
        );

        pool.start().unwrap();
        assert_eq!(pool.status(), WorkerPoolStatus::Running);
        assert!(matches!(pool.start(), Err(WorkerPoolError::AlreadyRunning)));

        let run = executor
            .start_run(StartRunRequest::new(
                SequenceWorkflow::TYPE,
                json!({ "steps": ["a", "b", "c"] }),
            ))
            .await
            .unwrap();

        let mut status = RunStatus::Running;
        for _ in 0..200 {
            status = executor.load_state(&run).await.unwrap().status;
            if status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(status, RunStatus::Completed);

        pool.shutdown().await.unwrap();
        assert_eq!(pool.status(), WorkerPoolStatus::Stopped);
        assert_eq!(pool.active_count(), 0);
    }
}
