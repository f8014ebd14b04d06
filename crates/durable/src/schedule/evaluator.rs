//! Background trigger evaluation
//!
//! Polls the schedule store for due schedules and starts one run per
//! firing. A firing is claimed with a compare-and-swap on the schedule's
//! next fire time before its run is started, so coordinators sharing a
//! store never fire the same time twice.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use super::{Schedule, ScheduleError, ScheduleStore};
use crate::clock::Clock;
use crate::engine::{ExecutorError, StartRunRequest, WorkflowExecutor};
use crate::serde_millis;
use crate::workflow::RunKey;

/// Starts runs on behalf of schedules
#[async_trait]
pub trait RunLauncher: Send + Sync + 'static {
    async fn launch(&self, request: StartRunRequest) -> Result<RunKey, ExecutorError>;
}

#[async_trait]
impl RunLauncher for WorkflowExecutor {
    async fn launch(&self, request: StartRunRequest) -> Result<RunKey, ExecutorError> {
        self.start_run(request).await
    }
}

/// Trigger evaluator configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TriggerEvaluatorConfig {
    /// How often to look for due schedules
    #[serde(with = "serde_millis")]
    pub poll_interval: Duration,

    /// Maximum schedules handled per pass
    pub batch_size: usize,

    /// Maximum missed firings of one schedule started per pass
    pub max_catch_up: u32,
}

impl Default for TriggerEvaluatorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            batch_size: 100,
            max_catch_up: 10,
        }
    }
}

impl TriggerEvaluatorConfig {
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    pub fn with_max_catch_up(mut self, max: u32) -> Self {
        self.max_catch_up = max.max(1);
        self
    }
}

/// Fires due schedules
pub struct TriggerEvaluator {
    store: Arc<dyn ScheduleStore>,
    launcher: Arc<dyn RunLauncher>,
    clock: Arc<dyn Clock>,
    config: TriggerEvaluatorConfig,
}

impl TriggerEvaluator {
    pub fn new(
        store: Arc<dyn ScheduleStore>,
        launcher: Arc<dyn RunLauncher>,
        clock: Arc<dyn Clock>,
        config: TriggerEvaluatorConfig,
    ) -> Self {
        Self {
            store,
            launcher,
            clock,
            config,
        }
    }

    /// One pass over due schedules; returns the number of runs started
    #[instrument(skip(self))]
    pub async fn evaluate_once(&self) -> Result<usize, ScheduleError> {
        let now = self.clock.now();
        let due = self.store.due(now, self.config.batch_size).await?;
        if due.is_empty() {
            return Ok(0);
        }
        debug!(count = due.len(), "found due schedules");

        let mut started = 0;
        for schedule in due {
            match self.fire(schedule, now).await {
                Ok(count) => started += count,
                Err(e) => error!(error = %e, "failed to fire schedule"),
            }
        }
        Ok(started)
    }

    /// Start every firing of `schedule` that is due at `now`, up to the catch-up limit
    async fn fire(
        &self,
        mut schedule: Schedule,
        now: DateTime<Utc>,
    ) -> Result<usize, ScheduleError> {
        let mut started = 0;

        for _ in 0..self.config.max_catch_up {
            let Some(fire_at) = schedule.next_fire_at.filter(|at| *at <= now) else {
                break;
            };
            let next = schedule.trigger.next_after(fire_at)?;

            if !self
                .store
                .claim_fire(&schedule.schedule_id, fire_at, next, now)
                .await?
            {
                debug!(schedule_id = %schedule.schedule_id, %fire_at, "firing claimed elsewhere");
                break;
            }
            schedule.next_fire_at = next;

            match self.launcher.launch(schedule.run_request(fire_at)).await {
                Ok(run) => {
                    info!(
                        schedule_id = %schedule.schedule_id,
                        run = %run,
                        %fire_at,
                        "schedule fired"
                    );
                    self.store.record_run(&schedule.schedule_id, run).await?;
                    started += 1;
                }
                Err(ExecutorError::RunAlreadyOpen { workflow_id, .. }) => {
                    debug!(%workflow_id, "run for this firing already started");
                }
                Err(e) => {
                    // the firing stays consumed; the schedule moves on
                    warn!(
                        schedule_id = %schedule.schedule_id,
                        %fire_at,
                        error = %e,
                        "failed to start scheduled run"
                    );
                }
            }
        }

        Ok(started)
    }

    /// Evaluate on an interval until shutdown is signaled
    pub fn spawn(self, mut shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                poll_interval_ms = self.config.poll_interval.as_millis() as u64,
                batch_size = self.config.batch_size,
                "trigger evaluator started"
            );
            let mut ticker = tokio::time::interval(self.config.poll_interval);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.evaluate_once().await {
                            error!(error = %e, "schedule evaluation failed");
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("trigger evaluator: shutdown requested");
                        break;
                    }
                }
            }

            debug!("trigger evaluator exited");
        })
    }
}
