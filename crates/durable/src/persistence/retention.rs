//! Retention of closed runs
//!
//! Closed runs are kept for a retention window so they can still be queried,
//! then deleted by a background sweep.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::{StoreError, WorkflowEventStore};
use crate::clock::Clock;
use crate::serde_millis;

/// Retention configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetentionConfig {
    /// How long a closed run is kept after its close time
    #[serde(with = "serde_millis")]
    pub retention: Duration,

    /// How often the sweep runs
    #[serde(with = "serde_millis")]
    pub sweep_interval: Duration,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(7 * 24 * 3600),
            sweep_interval: Duration::from_secs(3600),
        }
    }
}

impl RetentionConfig {
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }
}

/// Deletes closed runs older than the retention window
pub struct RetentionSweeper {
    store: Arc<dyn WorkflowEventStore>,
    clock: Arc<dyn Clock>,
    config: RetentionConfig,
}

impl RetentionSweeper {
    pub fn new(
        store: Arc<dyn WorkflowEventStore>,
        clock: Arc<dyn Clock>,
        config: RetentionConfig,
    ) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    /// Purge once; returns the number of runs deleted
    pub async fn sweep_once(&self) -> Result<usize, StoreError> {
        let retention = chrono::Duration::from_std(self.config.retention)
            .unwrap_or_else(|_| chrono::Duration::days(365 * 100));
        let cutoff = self
            .clock
            .now()
            .checked_sub_signed(retention)
            .unwrap_or(chrono::DateTime::<chrono::Utc>::MIN_UTC);
        let purged = self.store.purge_closed_runs(cutoff).await?;
        if purged > 0 {
            info!(purged, %cutoff, "purged closed runs past retention");
        }
        Ok(purged)
    }

    /// Sweep on an interval until shutdown is signaled
    pub fn spawn(self, mut shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.sweep_interval);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.sweep_once().await {
                            error!("Retention sweep failed: {}", e);
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("Retention loop: shutdown requested");
                        break;
                    }
                }
            }

            debug!("Retention loop exited");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::persistence::InMemoryWorkflowEventStore;
    use crate::workflow::{EventRecord, RunInfo, RunKey, RunStatus, WorkflowEvent};
    use serde_json::json;

    #[tokio::test]
    async fn test_sweep_respects_retention_window() {
        let clock = ManualClock::default();
        let store = Arc::new(InMemoryWorkflowEventStore::with_clock(Arc::new(clock.clone())));
        let key = RunKey::generate("short-lived");
        let now = clock.now();
        store
            .create_run(
                RunInfo {
                    key: key.clone(),
                    workflow_type: "noop".to_string(),
                    status: RunStatus::Running,
                    start_time: now,
                    close_time: None,
                    schedule_id: None,
                    last_sequence: 0,
                },
                vec![EventRecord::new(
                    1,
                    now,
                    WorkflowEvent::WorkflowStarted {
                        workflow_type: "noop".to_string(),
                        input: json!(null),
                        run_timeout_ms: None,
                        schedule_id: None,
                    },
                )],
            )
            .await
            .unwrap();
        store
            .append(&key, WorkflowEvent::WorkflowCompleted { result: json!(1) })
            .await
            .unwrap();

        let sweeper = RetentionSweeper::new(
            store.clone(),
            Arc::new(clock.clone()),
            RetentionConfig::default().with_retention(Duration::from_secs(60)),
        );

        clock.advance(Duration::from_secs(30));
        assert_eq!(sweeper.sweep_once().await.unwrap(), 0);

        clock.advance(Duration::from_secs(31));
        assert_eq!(sweeper.sweep_once().await.unwrap(), 1);
        assert_eq!(store.run_count(), 0);
    }
}
