//! In-memory implementation of WorkflowEventStore

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use uuid::Uuid;

use super::store::*;
use crate::clock::{self, Clock};
use crate::workflow::{EventRecord, RunInfo, RunKey, WorkflowEvent};

/// Internal per-run state
struct RunEntry {
    info: RunInfo,
    events: Vec<EventRecord>,
    snapshot: Option<StoredSnapshot>,
}

impl RunEntry {
    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.info.status.is_terminal() {
            return Err(StoreError::RunTerminal {
                run: self.info.key.clone(),
                status: self.info.status,
            });
        }
        Ok(())
    }

    /// Push already validated records, closing the run on a terminal event
    fn push(&mut self, records: Vec<EventRecord>) -> u64 {
        for record in records {
            if let Some(status) = record.event.terminal_status() {
                self.info.status = status;
                self.info.close_time = Some(record.timestamp);
            }
            self.info.last_sequence = record.sequence;
            self.events.push(record);
        }
        self.info.last_sequence
    }
}

/// Checks that `records` continue a history ending at `last`
fn check_contiguous(last: u64, records: &[EventRecord]) -> Result<(), StoreError> {
    for (i, record) in records.iter().enumerate() {
        let expected = last + 1 + i as u64;
        if record.sequence != expected {
            return Err(StoreError::SequenceConflict {
                expected,
                actual: record.sequence,
            });
        }
    }
    Ok(())
}

/// In-memory implementation of [`WorkflowEventStore`]
///
/// Runs live in a sharded map, so appends to different runs do not contend
/// on a global lock; appends to the same run are serialized by the shard
/// entry lock. Intended for tests and single-process deployments.
///
/// # Example
///
/// ```
/// use keel_durable::InMemoryWorkflowEventStore;
///
/// let store = InMemoryWorkflowEventStore::new();
/// assert_eq!(store.run_count(), 0);
/// ```
pub struct InMemoryWorkflowEventStore {
    runs: DashMap<RunKey, RunEntry>,
    /// workflow_id -> run ids, oldest first
    by_workflow: DashMap<String, Vec<Uuid>>,
    unavailable: AtomicBool,
    clock: Arc<dyn Clock>,
}

impl InMemoryWorkflowEventStore {
    pub fn new() -> Self {
        Self::with_clock(clock::system_clock())
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            runs: DashMap::new(),
            by_workflow: DashMap::new(),
            unavailable: AtomicBool::new(false),
            clock,
        }
    }

    pub fn run_count(&self) -> usize {
        self.runs.len()
    }

    /// Make every operation fail with `Unavailable` (fault injection)
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("in-memory store offline".to_string()));
        }
        Ok(())
    }

    fn runs_of(&self, workflow_id: &str) -> Vec<RunInfo> {
        let ids = self
            .by_workflow
            .get(workflow_id)
            .map(|ids| ids.clone())
            .unwrap_or_default();
        ids.into_iter()
            .filter_map(|run_id| {
                self.runs
                    .get(&RunKey::new(workflow_id, run_id))
                    .map(|entry| entry.info.clone())
            })
            .collect()
    }
}

impl Default for InMemoryWorkflowEventStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkflowEventStore for InMemoryWorkflowEventStore {
    async fn create_run(&self, info: RunInfo, events: Vec<EventRecord>) -> Result<u64, StoreError> {
        self.check_available()?;
        check_contiguous(0, &events)?;

        let key = info.key.clone();
        // The workflow entry lock serializes run creation per workflow id
        let mut ids = self.by_workflow.entry(key.workflow_id.clone()).or_default();
        let open = ids.iter().find(|run_id| {
            self.runs
                .get(&RunKey::new(key.workflow_id.as_str(), **run_id))
                .is_some_and(|entry| entry.info.is_open())
        });
        if let Some(run_id) = open {
            return Err(StoreError::OpenRunExists {
                workflow_id: key.workflow_id.clone(),
                run_id: *run_id,
            });
        }

        let last = match self.runs.entry(key.clone()) {
            Entry::Occupied(_) => return Err(StoreError::RunAlreadyExists(key)),
            Entry::Vacant(slot) => {
                let mut entry = RunEntry {
                    info: RunInfo {
                        last_sequence: 0,
                        close_time: None,
                        ..info
                    },
                    events: Vec::with_capacity(events.len()),
                    snapshot: None,
                };
                let last = entry.push(events);
                slot.insert(entry);
                last
            }
        };

        ids.push(key.run_id);
        Ok(last)
    }

    async fn get_run(&self, run: &RunKey) -> Result<RunInfo, StoreError> {
        self.check_available()?;
        self.runs
            .get(run)
            .map(|entry| entry.info.clone())
            .ok_or_else(|| StoreError::RunNotFound(run.clone()))
    }

    async fn find_open_runs(&self, workflow_id: &str) -> Result<Vec<RunInfo>, StoreError> {
        self.check_available()?;
        Ok(self
            .runs_of(workflow_id)
            .into_iter()
            .filter(RunInfo::is_open)
            .collect())
    }

    async fn find_runs(&self, workflow_id: &str) -> Result<Vec<RunInfo>, StoreError> {
        self.check_available()?;
        let mut runs = self.runs_of(workflow_id);
        runs.reverse();
        Ok(runs)
    }

    async fn list_runs(
        &self,
        filter: &RunFilter,
        pagination: Pagination,
    ) -> Result<Vec<RunInfo>, StoreError> {
        self.check_available()?;
        let mut runs: Vec<RunInfo> = self
            .runs
            .iter()
            .filter(|entry| filter.matches(&entry.info))
            .map(|entry| entry.info.clone())
            .collect();
        runs.sort_by(|a, b| (a.start_time, &a.key).cmp(&(b.start_time, &b.key)));
        Ok(runs
            .into_iter()
            .skip(pagination.offset)
            .take(pagination.limit)
            .collect())
    }

    async fn purge_closed_runs(&self, closed_before: DateTime<Utc>) -> Result<usize, StoreError> {
        self.check_available()?;
        let expired: Vec<RunKey> = self
            .runs
            .iter()
            .filter(|entry| entry.info.close_time.is_some_and(|t| t < closed_before))
            .map(|entry| entry.key().clone())
            .collect();

        let mut purged = 0;
        for key in expired {
            if self.runs.remove(&key).is_some() {
                purged += 1;
                if let Some(mut ids) = self.by_workflow.get_mut(&key.workflow_id) {
                    ids.retain(|id| *id != key.run_id);
                }
                self.by_workflow
                    .remove_if(&key.workflow_id, |_, ids| ids.is_empty());
            }
        }
        Ok(purged)
    }

    async fn append(&self, run: &RunKey, event: WorkflowEvent) -> Result<u64, StoreError> {
        self.check_available()?;
        let mut entry = self
            .runs
            .get_mut(run)
            .ok_or_else(|| StoreError::RunNotFound(run.clone()))?;
        entry.ensure_open()?;

        let record = EventRecord::new(entry.info.last_sequence + 1, self.clock.now(), event);
        Ok(entry.push(vec![record]))
    }

    async fn append_batch(
        &self,
        run: &RunKey,
        events: Vec<EventRecord>,
    ) -> Result<u64, StoreError> {
        self.check_available()?;
        let mut entry = self
            .runs
            .get_mut(run)
            .ok_or_else(|| StoreError::RunNotFound(run.clone()))?;
        entry.ensure_open()?;
        check_contiguous(entry.info.last_sequence, &events)?;
        Ok(entry.push(events))
    }

    async fn load_history(&self, run: &RunKey) -> Result<Vec<EventRecord>, StoreError> {
        self.check_available()?;
        self.runs
            .get(run)
            .map(|entry| entry.events.clone())
            .ok_or_else(|| StoreError::RunNotFound(run.clone()))
    }

    async fn load_history_after(
        &self,
        run: &RunKey,
        after: u64,
    ) -> Result<Vec<EventRecord>, StoreError> {
        self.check_available()?;
        let entry = self
            .runs
            .get(run)
            .ok_or_else(|| StoreError::RunNotFound(run.clone()))?;
        // Sequence n lives at index n - 1.
        let start = (after as usize).min(entry.events.len());
        Ok(entry.events[start..].to_vec())
    }

    async fn save_snapshot(
        &self,
        run: &RunKey,
        snapshot: StoredSnapshot,
    ) -> Result<(), StoreError> {
        self.check_available()?;
        let mut entry = self
            .runs
            .get_mut(run)
            .ok_or_else(|| StoreError::RunNotFound(run.clone()))?;
        if snapshot.sequence > entry.info.last_sequence {
            return Err(StoreError::SequenceConflict {
                expected: entry.info.last_sequence,
                actual: snapshot.sequence,
            });
        }
        let newer = entry
            .snapshot
            .as_ref()
            .map_or(true, |current| current.sequence <= snapshot.sequence);
        if newer {
            entry.snapshot = Some(snapshot);
        }
        Ok(())
    }

    async fn load_snapshot(&self, run: &RunKey) -> Result<StoredSnapshot, StoreError> {
        self.check_available()?;
        let entry = self
            .runs
            .get(run)
            .ok_or_else(|| StoreError::RunNotFound(run.clone()))?;
        entry
            .snapshot
            .clone()
            .ok_or_else(|| StoreError::SnapshotNotFound(run.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{RunStatus, WorkflowError};
    use serde_json::json;
    use std::collections::HashSet;

    fn started(key: &RunKey) -> (RunInfo, Vec<EventRecord>) {
        let now = Utc::now();
        let info = RunInfo {
            key: key.clone(),
            workflow_type: "order".to_string(),
            status: RunStatus::Running,
            start_time: now,
            close_time: None,
            schedule_id: None,
            last_sequence: 0,
        };
        let events = vec![EventRecord::new(
            1,
            now,
            WorkflowEvent::WorkflowStarted {
                workflow_type: "order".to_string(),
                input: json!({}),
                run_timeout_ms: None,
                schedule_id: None,
            },
        )];
        (info, events)
    }

    async fn store_with_run() -> (InMemoryWorkflowEventStore, RunKey) {
        let store = InMemoryWorkflowEventStore::new();
        let key = RunKey::generate("order-1");
        let (info, events) = started(&key);
        store.create_run(info, events).await.unwrap();
        (store, key)
    }

    fn cancel_requested() -> WorkflowEvent {
        WorkflowEvent::CancelRequested {
            reason: "test".to_string(),
        }
    }

    #[tokio::test]
    async fn test_create_and_get_run() {
        let (store, key) = store_with_run().await;

        let info = store.get_run(&key).await.unwrap();
        assert_eq!(info.status, RunStatus::Running);
        assert_eq!(info.last_sequence, 1);

        let (info, events) = started(&key);
        assert!(matches!(
            store.create_run(info, events).await,
            Err(StoreError::OpenRunExists { .. })
        ));
    }

    #[tokio::test]
    async fn test_one_open_run_per_workflow_id() {
        let (store, key) = store_with_run().await;

        let second = RunKey::generate("order-1");
        let (info, events) = started(&second);
        let err = store.create_run(info, events).await.unwrap_err();
        assert!(matches!(err, StoreError::OpenRunExists { run_id, .. } if run_id == key.run_id));

        store
            .append(&key, WorkflowEvent::WorkflowCompleted { result: json!(null) })
            .await
            .unwrap();
        let (info, events) = started(&second);
        store.create_run(info, events).await.unwrap();

        let runs = store.find_runs("order-1").await.unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].key, second);
    }

    #[tokio::test]
    async fn test_append_assigns_next_sequence() {
        let (store, key) = store_with_run().await;

        assert_eq!(store.append(&key, cancel_requested()).await.unwrap(), 2);
        assert_eq!(store.append(&key, cancel_requested()).await.unwrap(), 3);

        let history = store.load_history(&key).await.unwrap();
        let sequences: Vec<u64> = history.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3]);
        assert_eq!(store.load_history_after(&key, 2).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_append_batch_rejects_stale_sequence() {
        let (store, key) = store_with_run().await;
        let now = Utc::now();

        store
            .append_batch(&key, vec![EventRecord::new(2, now, cancel_requested())])
            .await
            .unwrap();

        let result = store
            .append_batch(&key, vec![EventRecord::new(2, now, cancel_requested())])
            .await;
        assert!(matches!(
            result,
            Err(StoreError::SequenceConflict {
                expected: 3,
                actual: 2
            })
        ));
        assert_eq!(store.load_history(&key).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_terminal_event_closes_run() {
        let (store, key) = store_with_run().await;

        store
            .append(
                &key,
                WorkflowEvent::WorkflowFailed {
                    error: WorkflowError::new("boom"),
                },
            )
            .await
            .unwrap();

        let info = store.get_run(&key).await.unwrap();
        assert_eq!(info.status, RunStatus::Failed);
        assert!(info.close_time.is_some());
        assert!(store.find_open_runs("order-1").await.unwrap().is_empty());

        let err = store.append(&key, cancel_requested()).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::RunTerminal {
                status: RunStatus::Failed,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_concurrent_appends_are_gap_free() {
        let store = Arc::new(InMemoryWorkflowEventStore::new());
        let key = RunKey::generate("contended");
        let (info, events) = started(&key);
        store.create_run(info, events).await.unwrap();

        let mut handles = vec![];
        for _ in 0..16 {
            let store = Arc::clone(&store);
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                let mut assigned = vec![];
                for _ in 0..25 {
                    assigned.push(store.append(&key, cancel_requested()).await.unwrap());
                }
                assigned
            }));
        }

        let mut all = HashSet::new();
        for handle in handles {
            for seq in handle.await.unwrap() {
                assert!(all.insert(seq), "sequence {seq} assigned twice");
            }
        }

        let history = store.load_history(&key).await.unwrap();
        assert_eq!(history.len(), 401);
        for (i, record) in history.iter().enumerate() {
            assert_eq!(record.sequence, i as u64 + 1);
        }
    }

    #[tokio::test]
    async fn test_snapshot_roundtrip_and_not_found() {
        let (store, key) = store_with_run().await;

        assert!(matches!(
            store.load_snapshot(&key).await,
            Err(StoreError::SnapshotNotFound(_))
        ));

        let snapshot = StoredSnapshot {
            sequence: 1,
            state: json!({"k": 1}),
            taken_at: Utc::now(),
        };
        store.save_snapshot(&key, snapshot.clone()).await.unwrap();
        assert_eq!(store.load_snapshot(&key).await.unwrap(), snapshot);

        let ahead = StoredSnapshot {
            sequence: 9,
            ..snapshot
        };
        assert!(store.save_snapshot(&key, ahead).await.is_err());
    }

    #[tokio::test]
    async fn test_purge_closed_runs() {
        let (store, key) = store_with_run().await;
        store
            .append(&key, WorkflowEvent::WorkflowTimedOut)
            .await
            .unwrap();

        let open = RunKey::generate("order-2");
        let (info, events) = started(&open);
        store.create_run(info, events).await.unwrap();

        let purged = store
            .purge_closed_runs(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(purged, 1);
        assert!(matches!(
            store.get_run(&key).await,
            Err(StoreError::RunNotFound(_))
        ));
        assert!(store.get_run(&open).await.is_ok());
        assert!(store.find_runs("order-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_runs_filters_and_paginates() {
        let store = InMemoryWorkflowEventStore::new();
        for i in 0..5 {
            let key = RunKey::generate(format!("wf-{i}"));
            let (info, events) = started(&key);
            store.create_run(info, events).await.unwrap();
        }

        let page = store
            .list_runs(&RunFilter::running(), Pagination { offset: 1, limit: 2 })
            .await
            .unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].key.workflow_id, "wf-1");
    }

    #[tokio::test]
    async fn test_unavailable_store() {
        let (store, key) = store_with_run().await;
        store.set_unavailable(true);
        let err = store.get_run(&key).await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
        store.set_unavailable(false);
        assert!(store.get_run(&key).await.is_ok());
    }
}
