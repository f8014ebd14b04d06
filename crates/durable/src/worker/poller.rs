//! Queue polling with exponential backoff
//!
//! Leases work items in batches and slows down while the queue is idle.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, instrument, trace};

use crate::queue::{LeasedItem, QueueError, TaskQueue};
use crate::serde_millis;

/// Polling configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PollerConfig {
    /// Poll interval while items keep arriving
    #[serde(with = "serde_millis")]
    pub min_interval: Duration,

    /// Poll interval ceiling while idle
    #[serde(with = "serde_millis")]
    pub max_interval: Duration,

    /// Backoff multiplier when nothing was leased
    pub backoff_multiplier: f64,

    /// Maximum items to lease per poll
    pub batch_size: usize,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(1),
            backoff_multiplier: 1.5,
            batch_size: 10,
        }
    }
}

impl PollerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier.max(1.0);
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }
}

/// Queue poller with adaptive backoff
///
/// Backs off exponentially while the queue is empty and drops back to the
/// minimum interval as soon as something is leased.
pub struct QueuePoller {
    queue: Arc<dyn TaskQueue>,
    worker_id: String,
    lease_duration: Duration,
    config: PollerConfig,
    current_interval: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl QueuePoller {
    pub fn new(
        queue: Arc<dyn TaskQueue>,
        worker_id: String,
        lease_duration: Duration,
        config: PollerConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            queue,
            worker_id,
            lease_duration,
            current_interval: config.min_interval,
            config,
            shutdown_rx,
        }
    }

    /// Lease up to `max_items` visible items
    ///
    /// Stops at the first empty dequeue. Returns nothing once shutdown was
    /// signaled.
    #[instrument(skip(self), fields(worker_id = %self.worker_id))]
    pub async fn poll(&mut self, max_items: usize) -> Result<Vec<LeasedItem>, PollerError> {
        if self.is_shutdown() {
            debug!("poller shutdown requested");
            return Ok(vec![]);
        }

        let batch_size = max_items.min(self.config.batch_size);
        let mut leased = Vec::with_capacity(batch_size);
        while leased.len() < batch_size {
            match self.queue.dequeue(self.lease_duration).await? {
                Some(item) => leased.push(item),
                None => break,
            }
        }

        if leased.is_empty() {
            self.increase_backoff();
            trace!(
                interval_ms = self.current_interval.as_millis() as u64,
                "queue idle, backing off"
            );
        } else {
            self.reset_backoff();
            debug!(count = leased.len(), "leased work items");
        }

        Ok(leased)
    }

    /// Sleep for the current backoff interval
    ///
    /// Returns `true` if shutdown was signaled while waiting.
    pub async fn wait(&mut self) -> bool {
        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::select! {
            _ = tokio::time::sleep(self.current_interval) => false,
            _ = shutdown_rx.changed() => {
                debug!("shutdown signal received during wait");
                true
            }
        }
    }

    pub fn current_interval(&self) -> Duration {
        self.current_interval
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    fn reset_backoff(&mut self) {
        self.current_interval = self.config.min_interval;
    }

    fn increase_backoff(&mut self) {
        let next = Duration::from_secs_f64(
            self.current_interval.as_secs_f64() * self.config.backoff_multiplier,
        );
        self.current_interval = next.min(self.config.max_interval);
    }
}

/// Poller errors
#[derive(Debug, thiserror::Error)]
pub enum PollerError {
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("worker is shutting down")]
    Shutdown,
}
