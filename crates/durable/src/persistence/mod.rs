//! Persistence layer for durable execution
//!
//! This module provides:
//! - [`WorkflowEventStore`] trait for run metadata, event history and snapshots
//! - [`InMemoryWorkflowEventStore`], sharded per run
//! - [`RetentionSweeper`] for deleting closed runs past their retention window

mod memory;
mod retention;
mod store;

pub use memory::InMemoryWorkflowEventStore;
pub use retention::{RetentionConfig, RetentionSweeper};
pub use store::{Pagination, RunFilter, StoreError, StoredSnapshot, WorkflowEventStore};
