//! In-memory implementation of TaskQueue

use std::collections::{BTreeSet, HashMap};
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use super::task_queue::{QueueError, TaskQueue};
use super::{DeadLetter, LeasedItem, QueueStats, WorkItem};
use crate::clock::{self, Clock};

/// In-memory queue configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InMemoryTaskQueueConfig {
    /// Number of independently locked partitions
    pub partitions: usize,

    /// Dead-letter an item on its delivery after this many (None = never)
    pub max_deliveries: Option<u32>,
}

impl Default for InMemoryTaskQueueConfig {
    fn default() -> Self {
        Self {
            partitions: 8,
            max_deliveries: None,
        }
    }
}

impl InMemoryTaskQueueConfig {
    pub fn with_partitions(mut self, partitions: usize) -> Self {
        self.partitions = partitions.max(1);
        self
    }

    pub fn with_max_deliveries(mut self, max: u32) -> Self {
        self.max_deliveries = Some(max.max(1));
        self
    }
}

struct Entry {
    item: WorkItem,
    enqueued_at: DateTime<Utc>,
    /// Not-before time, or lease expiry while leased
    visible_at: DateTime<Utc>,
    seq: u64,
    deliveries: u32,
    lease_id: Option<Uuid>,
}

impl Entry {
    fn order_key(&self, id: Uuid) -> (DateTime<Utc>, u64, Uuid) {
        (self.visible_at, self.seq, id)
    }
}

/// One partition: entries plus their visibility order
///
/// Leased entries stay in `order` keyed by lease expiry, so an expired
/// lease surfaces at the head exactly like a not-before time passing.
#[derive(Default)]
struct Partition {
    entries: HashMap<Uuid, Entry>,
    order: BTreeSet<(DateTime<Utc>, u64, Uuid)>,
}

impl Partition {
    fn reposition(&mut self, id: Uuid, visible_at: DateTime<Utc>) {
        if let Some(entry) = self.entries.get_mut(&id) {
            self.order.remove(&entry.order_key(id));
            entry.visible_at = visible_at;
            self.order.insert(entry.order_key(id));
        }
    }

    fn remove(&mut self, id: Uuid) -> Option<Entry> {
        let entry = self.entries.remove(&id)?;
        self.order.remove(&entry.order_key(id));
        Some(entry)
    }

    fn owned_entry(&self, lease: &LeasedItem) -> Result<&Entry, QueueError> {
        let entry = self
            .entries
            .get(&lease.item_id)
            .ok_or(QueueError::ItemNotFound(lease.item_id))?;
        if entry.lease_id != Some(lease.lease_id) {
            return Err(QueueError::LeaseLost(lease.item_id));
        }
        Ok(entry)
    }
}

/// In-memory implementation of [`TaskQueue`]
///
/// Items are spread over partitions by run; each partition has its own
/// lock, and dequeue round-robins across partitions.
///
/// # Example
///
/// ```
/// use keel_durable::queue::InMemoryTaskQueue;
///
/// let queue = InMemoryTaskQueue::new();
/// ```
pub struct InMemoryTaskQueue {
    partitions: Vec<Mutex<Partition>>,
    dead: Mutex<Vec<DeadLetter>>,
    cursor: AtomicUsize,
    seq: AtomicU64,
    unavailable: AtomicBool,
    clock: Arc<dyn Clock>,
    config: InMemoryTaskQueueConfig,
}

impl InMemoryTaskQueue {
    pub fn new() -> Self {
        Self::with_config(InMemoryTaskQueueConfig::default(), clock::system_clock())
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self::with_config(InMemoryTaskQueueConfig::default(), clock)
    }

    pub fn with_config(config: InMemoryTaskQueueConfig, clock: Arc<dyn Clock>) -> Self {
        let partitions = (0..config.partitions.max(1))
            .map(|_| Mutex::new(Partition::default()))
            .collect();
        Self {
            partitions,
            dead: Mutex::new(Vec::new()),
            cursor: AtomicUsize::new(0),
            seq: AtomicU64::new(0),
            unavailable: AtomicBool::new(false),
            clock,
            config,
        }
    }

    /// Make every operation fail with `Unavailable` (fault injection)
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Total number of items not yet acked or dead-lettered
    pub fn len(&self) -> usize {
        self.partitions.iter().map(|p| p.lock().entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_available(&self) -> Result<(), QueueError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(QueueError::Unavailable("in-memory queue offline".to_string()));
        }
        Ok(())
    }

    fn partition_for(&self, item: &WorkItem) -> &Mutex<Partition> {
        let mut hasher = DefaultHasher::new();
        item.partition_key().hash(&mut hasher);
        let index = (hasher.finish() as usize) % self.partitions.len();
        &self.partitions[index]
    }

    /// Lease the head of one partition if it is visible
    fn lease_from(
        &self,
        partition: &Mutex<Partition>,
        now: DateTime<Utc>,
        lease_duration: Duration,
    ) -> Option<LeasedItem> {
        let mut partition = partition.lock();
        loop {
            let &(visible_at, _, id) = partition.order.iter().next()?;
            if visible_at > now {
                return None;
            }

            let deliveries = partition.entries.get(&id).map(|e| e.deliveries + 1)?;
            if let Some(max) = self.config.max_deliveries {
                if deliveries > max {
                    if let Some(entry) = partition.remove(id) {
                        warn!(item_id = %id, kind = entry.item.kind(), deliveries = entry.deliveries, "moving item to dead letters");
                        self.dead.lock().push(DeadLetter {
                            item_id: id,
                            item: entry.item,
                            deliveries: entry.deliveries,
                            dead_at: now,
                        });
                    }
                    continue;
                }
            }

            let lease_id = Uuid::now_v7();
            let expires_at = clock::after(now, lease_duration);
            partition.reposition(id, expires_at);
            let entry = partition.entries.get_mut(&id)?;
            entry.deliveries = deliveries;
            entry.lease_id = Some(lease_id);

            if deliveries > 1 {
                debug!(item_id = %id, deliveries, "redelivering item after lease expiry");
            }

            return Some(LeasedItem {
                item_id: id,
                lease_id,
                item: entry.item.clone(),
                delivery: deliveries,
                lease_expires_at: expires_at,
                enqueued_at: entry.enqueued_at,
            });
        }
    }
}

impl Default for InMemoryTaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskQueue for InMemoryTaskQueue {
    async fn enqueue(&self, item: WorkItem, not_before: DateTime<Utc>) -> Result<Uuid, QueueError> {
        self.check_available()?;
        let id = Uuid::now_v7();
        let entry = Entry {
            enqueued_at: self.clock.now(),
            visible_at: not_before,
            seq: self.seq.fetch_add(1, Ordering::SeqCst),
            deliveries: 0,
            lease_id: None,
            item,
        };

        let mut partition = self.partition_for(&entry.item).lock();
        partition.order.insert(entry.order_key(id));
        partition.entries.insert(id, entry);
        Ok(id)
    }

    async fn dequeue(&self, lease_duration: Duration) -> Result<Option<LeasedItem>, QueueError> {
        self.check_available()?;
        let now = self.clock.now();
        let count = self.partitions.len();
        let start = self.cursor.fetch_add(1, Ordering::Relaxed);

        for offset in 0..count {
            let partition = &self.partitions[(start + offset) % count];
            if let Some(leased) = self.lease_from(partition, now, lease_duration) {
                return Ok(Some(leased));
            }
        }
        Ok(None)
    }

    async fn ack(&self, lease: &LeasedItem) -> Result<(), QueueError> {
        self.check_available()?;
        let mut partition = self.partition_for(&lease.item).lock();
        partition.owned_entry(lease)?;
        partition.remove(lease.item_id);
        Ok(())
    }

    async fn nack(&self, lease: &LeasedItem) -> Result<(), QueueError> {
        self.check_available()?;
        let mut partition = self.partition_for(&lease.item).lock();
        partition.owned_entry(lease)?;
        if let Some(entry) = partition.entries.get_mut(&lease.item_id) {
            entry.lease_id = None;
        }
        Ok(())
    }

    async fn extend_lease(
        &self,
        lease: &LeasedItem,
        extension: Duration,
    ) -> Result<DateTime<Utc>, QueueError> {
        self.check_available()?;
        let mut partition = self.partition_for(&lease.item).lock();
        partition.owned_entry(lease)?;
        let expires_at = clock::after(self.clock.now(), extension);
        partition.reposition(lease.item_id, expires_at);
        Ok(expires_at)
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        self.check_available()?;
        let now = self.clock.now();
        let mut stats = QueueStats {
            dead: self.dead.lock().len(),
            ..QueueStats::default()
        };
        for partition in &self.partitions {
            for entry in partition.lock().entries.values() {
                match (entry.lease_id.is_some(), entry.visible_at > now) {
                    (true, true) => stats.leased += 1,
                    (false, true) => stats.delayed += 1,
                    _ => stats.ready += 1,
                }
            }
        }
        Ok(stats)
    }

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>, QueueError> {
        self.check_available()?;
        Ok(self.dead.lock().clone())
    }
}
