//! WorkflowEventStore trait definition

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ErrorCategory;
use crate::reliability::Transient;
use crate::workflow::{EventRecord, RunInfo, RunKey, RunStatus, WorkflowEvent};

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("run not found: {0}")]
    RunNotFound(RunKey),

    #[error("no snapshot stored for run {0}")]
    SnapshotNotFound(RunKey),

    #[error("run already exists: {0}")]
    RunAlreadyExists(RunKey),

    /// A workflow id has at most one open run
    #[error("workflow {workflow_id} already has an open run {run_id}")]
    OpenRunExists { workflow_id: String, run_id: uuid::Uuid },

    /// Appends to a closed run are rejected
    #[error("run {run} is already {status}")]
    RunTerminal { run: RunKey, status: RunStatus },

    /// Optimistic append lost a race (or sequences were not contiguous)
    #[error("sequence conflict: expected {expected}, got {actual}")]
    SequenceConflict { expected: u64, actual: u64 },

    /// Backend temporarily unavailable
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            StoreError::RunNotFound(_) | StoreError::SnapshotNotFound(_) => ErrorCategory::NotFound,
            StoreError::RunAlreadyExists(_)
            | StoreError::OpenRunExists { .. }
            | StoreError::RunTerminal { .. }
            | StoreError::SequenceConflict { .. } => ErrorCategory::Conflict,
            StoreError::Unavailable(_) => ErrorCategory::Transient,
            StoreError::Serialization(_) => ErrorCategory::Internal,
        }
    }
}

impl Transient for StoreError {
    fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Serialized run state plus the last sequence folded into it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredSnapshot {
    pub sequence: u64,
    pub state: serde_json::Value,
    pub taken_at: DateTime<Utc>,
}

/// Filter for listing runs
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunFilter {
    pub status: Option<RunStatus>,
    pub workflow_type: Option<String>,
    pub schedule_id: Option<String>,
}

impl RunFilter {
    /// Only runs that have not reached a terminal status
    pub fn running() -> Self {
        Self {
            status: Some(RunStatus::Running),
            ..Self::default()
        }
    }

    pub fn for_schedule(schedule_id: impl Into<String>) -> Self {
        Self {
            schedule_id: Some(schedule_id.into()),
            ..Self::default()
        }
    }

    pub fn matches(&self, info: &RunInfo) -> bool {
        self.status.map_or(true, |s| s == info.status)
            && self
                .workflow_type
                .as_ref()
                .map_or(true, |t| *t == info.workflow_type)
            && self
                .schedule_id
                .as_ref()
                .map_or(true, |s| info.schedule_id.as_ref() == Some(s))
    }
}

/// Pagination parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub offset: usize,
    pub limit: usize,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 100,
        }
    }
}

impl Pagination {
    pub fn first(limit: usize) -> Self {
        Self { offset: 0, limit }
    }
}

/// Store for run metadata, event histories and snapshots
///
/// # Guarantees
///
/// - Appends to one run are serialized; sequence numbers start at 1 and are
///   strictly increasing and gap-free.
/// - An event is visible to readers only once its append returned.
/// - Appending a terminal event closes the run in the same atomic step;
///   every later append fails with [`StoreError::RunTerminal`].
/// - Snapshots are an optimization: full replay of the history must
///   produce the same state.
#[async_trait]
pub trait WorkflowEventStore: Send + Sync + 'static {
    // =========================================================================
    // Runs
    // =========================================================================

    /// Create a run together with its first events (starting at sequence 1)
    ///
    /// Returns the sequence of the last event written.
    async fn create_run(&self, info: RunInfo, events: Vec<EventRecord>) -> Result<u64, StoreError>;

    async fn get_run(&self, run: &RunKey) -> Result<RunInfo, StoreError>;

    /// Open runs of one workflow id (normally zero or one)
    async fn find_open_runs(&self, workflow_id: &str) -> Result<Vec<RunInfo>, StoreError>;

    /// All runs of one workflow id, newest first
    async fn find_runs(&self, workflow_id: &str) -> Result<Vec<RunInfo>, StoreError>;

    /// Runs matching `filter`, oldest start first
    async fn list_runs(
        &self,
        filter: &RunFilter,
        pagination: Pagination,
    ) -> Result<Vec<RunInfo>, StoreError>;

    /// Delete closed runs whose close time is before `closed_before`
    async fn purge_closed_runs(&self, closed_before: DateTime<Utc>) -> Result<usize, StoreError>;

    // =========================================================================
    // Events
    // =========================================================================

    /// Append one event at the next sequence number
    async fn append(&self, run: &RunKey, event: WorkflowEvent) -> Result<u64, StoreError>;

    /// Append pre-numbered events atomically
    ///
    /// The first record must carry `last_sequence + 1` and the rest must be
    /// contiguous; otherwise nothing is written and
    /// [`StoreError::SequenceConflict`] is returned.
    async fn append_batch(&self, run: &RunKey, events: Vec<EventRecord>)
        -> Result<u64, StoreError>;

    async fn load_history(&self, run: &RunKey) -> Result<Vec<EventRecord>, StoreError>;

    /// Events with a sequence greater than `after`
    async fn load_history_after(
        &self,
        run: &RunKey,
        after: u64,
    ) -> Result<Vec<EventRecord>, StoreError> {
        let mut events = self.load_history(run).await?;
        events.retain(|e| e.sequence > after);
        Ok(events)
    }

    // =========================================================================
    // Snapshots
    // =========================================================================

    async fn save_snapshot(&self, run: &RunKey, snapshot: StoredSnapshot)
        -> Result<(), StoreError>;

    /// Latest snapshot, or [`StoreError::SnapshotNotFound`]
    async fn load_snapshot(&self, run: &RunKey) -> Result<StoredSnapshot, StoreError>;
}
