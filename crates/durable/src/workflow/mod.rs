//! Workflow abstractions and types
//!
//! This module contains the core workflow primitives:
//! - [`Workflow`] trait for defining workflow state machines
//! - [`WorkflowAction`] enum for what a workflow asks the engine to do
//! - [`WorkflowEvent`] enum for persisted history
//! - [`RunKey`] / [`RunStatus`] / [`RunInfo`] for run identity and lifecycle

mod action;
mod definition;
mod event;
mod run;

pub use action::{ActivityOptions, WorkflowAction};
pub use definition::{Workflow, WorkflowError};
pub use event::{EventRecord, WorkflowEvent};
pub use run::{RunInfo, RunKey, RunStatus};
