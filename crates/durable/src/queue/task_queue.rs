//! Task queue trait and errors

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{DeadLetter, LeasedItem, QueueStats, WorkItem};
use crate::error::ErrorCategory;
use crate::reliability::Transient;

/// Errors from task queue operations
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// Item was already acked, dead-lettered, or never existed
    #[error("queue item not found: {0}")]
    ItemNotFound(Uuid),

    /// The lease expired and the item was delivered to someone else
    #[error("lease lost for queue item {0}")]
    LeaseLost(Uuid),

    /// Backend temporarily unavailable
    #[error("queue unavailable: {0}")]
    Unavailable(String),
}

impl QueueError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            QueueError::ItemNotFound(_) => ErrorCategory::NotFound,
            QueueError::LeaseLost(_) => ErrorCategory::Conflict,
            QueueError::Unavailable(_) => ErrorCategory::Transient,
        }
    }
}

impl Transient for QueueError {
    fn is_transient(&self) -> bool {
        matches!(self, QueueError::Unavailable(_))
    }
}

/// Delivers ready work items with visibility timeouts
///
/// Every enqueued item is delivered at least once. A dequeued item stays
/// invisible for the lease duration; if it is not acked by then it becomes
/// visible again and is redelivered with a new lease. Ordering is
/// best-effort FIFO per partition.
#[async_trait]
pub trait TaskQueue: Send + Sync + 'static {
    /// Add an item that becomes visible at `not_before`
    async fn enqueue(&self, item: WorkItem, not_before: DateTime<Utc>) -> Result<Uuid, QueueError>;

    /// Lease the next visible item, if any
    async fn dequeue(&self, lease_duration: Duration) -> Result<Option<LeasedItem>, QueueError>;

    /// Remove a processed item
    async fn ack(&self, lease: &LeasedItem) -> Result<(), QueueError>;

    /// Give the item up; it is redelivered once the current lease expires
    async fn nack(&self, lease: &LeasedItem) -> Result<(), QueueError>;

    /// Push the lease expiry to `now + extension`
    async fn extend_lease(
        &self,
        lease: &LeasedItem,
        extension: Duration,
    ) -> Result<DateTime<Utc>, QueueError>;

    async fn stats(&self) -> Result<QueueStats, QueueError>;

    /// Items that exceeded the delivery limit
    async fn dead_letters(&self) -> Result<Vec<DeadLetter>, QueueError> {
        Ok(vec![])
    }
}
