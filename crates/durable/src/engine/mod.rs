//! Workflow execution engine
//!
//! The engine is split into a pure [`StateMachine`], which decides what
//! happens next for a run, and the [`WorkflowExecutor`], which loads runs,
//! persists decisions and dispatches their commands.

mod executor;
mod machine;
mod registry;
mod state;

pub use executor::{
    ExecutorConfig, ExecutorError, ProcessResult, StartRunRequest, WorkflowExecutor,
};
pub use machine::{CancellationPolicy, EngineError, RunStart, StateMachine, INVALID_ACTION};
pub use registry::{AnyWorkflow, RegistryError, WorkflowFactory, WorkflowRegistry};
pub use state::{
    ActivityInvocation, ActivityStatus, Command, Decision, IncomingEvent, RunSnapshot, TimerState,
};
