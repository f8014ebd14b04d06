//! Work items carried by the task queue

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::workflow::{ActivityOptions, RunKey};

/// One attempt of an activity, as dispatched to workers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityTask {
    pub run: RunKey,
    pub activity_id: String,
    pub activity_type: String,
    pub input: serde_json::Value,
    pub options: ActivityOptions,
    pub attempt: u32,
}

/// Something that is ready to be worked on at or after its not-before time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkItem {
    /// Execute an activity attempt
    Activity(ActivityTask),

    /// A workflow timer is due
    TimerFired { run: RunKey, timer_id: String },

    /// A run's deadline has passed
    RunTimeout { run: RunKey },
}

impl WorkItem {
    pub fn run(&self) -> &RunKey {
        match self {
            WorkItem::Activity(task) => &task.run,
            WorkItem::TimerFired { run, .. } | WorkItem::RunTimeout { run } => run,
        }
    }

    /// Items of one run share a partition, so they are delivered roughly in order
    pub fn partition_key(&self) -> String {
        self.run().to_string()
    }

    pub fn kind(&self) -> &'static str {
        match self {
            WorkItem::Activity(_) => "activity",
            WorkItem::TimerFired { .. } => "timer_fired",
            WorkItem::RunTimeout { .. } => "run_timeout",
        }
    }
}

/// A dequeued item and the lease that grants exclusive processing
///
/// Every delivery carries a fresh `lease_id`; ack/nack/extend with an
/// outdated lease fail with `LeaseLost`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeasedItem {
    pub item_id: Uuid,
    pub lease_id: Uuid,
    pub item: WorkItem,
    /// 1 on first delivery, incremented on each redelivery
    pub delivery: u32,
    pub lease_expires_at: DateTime<Utc>,
    pub enqueued_at: DateTime<Utc>,
}

/// An item that exceeded the delivery limit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub item_id: Uuid,
    pub item: WorkItem,
    pub deliveries: u32,
    pub dead_at: DateTime<Utc>,
}

/// Point-in-time queue depth
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Visible now
    pub ready: usize,
    /// Waiting for their not-before time
    pub delayed: usize,
    /// Held by a live lease
    pub leased: usize,
    pub dead: usize,
}
