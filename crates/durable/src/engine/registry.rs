//! Workflow registry for type-erased workflow creation
//!
//! The registry maps workflow type tags to factories that build a workflow
//! from its start input, or restore it from the state serialized in a run
//! snapshot, without knowing the concrete type at runtime.

use std::collections::HashMap;
use std::fmt;

use serde_json::Value;

use crate::activity::ActivityError;
use crate::workflow::{Workflow, WorkflowAction};

/// Type-erased workflow interface
///
/// All inputs and state cross this boundary as JSON.
pub trait AnyWorkflow: Send + Sync {
    fn workflow_type(&self) -> &'static str;

    fn on_start(&mut self) -> Vec<WorkflowAction>;

    fn on_activity_completed(&mut self, activity_id: &str, result: Value) -> Vec<WorkflowAction>;

    fn on_activity_failed(&mut self, activity_id: &str, error: &ActivityError)
        -> Vec<WorkflowAction>;

    fn on_timer_fired(&mut self, timer_id: &str) -> Vec<WorkflowAction>;

    fn on_cancel_requested(&mut self, reason: &str);

    /// Current user state, stored in the run snapshot
    fn state(&self) -> Result<Value, serde_json::Error>;
}

/// Wrapper to implement AnyWorkflow for any Workflow
struct WorkflowWrapper<W: Workflow> {
    inner: W,
}

impl<W: Workflow> AnyWorkflow for WorkflowWrapper<W> {
    fn workflow_type(&self) -> &'static str {
        W::TYPE
    }

    fn on_start(&mut self) -> Vec<WorkflowAction> {
        self.inner.on_start()
    }

    fn on_activity_completed(&mut self, activity_id: &str, result: Value) -> Vec<WorkflowAction> {
        self.inner.on_activity_completed(activity_id, result)
    }

    fn on_activity_failed(
        &mut self,
        activity_id: &str,
        error: &ActivityError,
    ) -> Vec<WorkflowAction> {
        self.inner.on_activity_failed(activity_id, error)
    }

    fn on_timer_fired(&mut self, timer_id: &str) -> Vec<WorkflowAction> {
        self.inner.on_timer_fired(timer_id)
    }

    fn on_cancel_requested(&mut self, reason: &str) {
        self.inner.on_cancel_requested(reason)
    }

    fn state(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(&self.inner)
    }
}

type CreateFn = Box<dyn Fn(Value) -> Result<Box<dyn AnyWorkflow>, serde_json::Error> + Send + Sync>;

/// Builds workflows of one type from start input or from saved state
pub struct WorkflowFactory {
    create: CreateFn,
    restore: CreateFn,
}

/// Registry of workflow factories
#[derive(Default)]
pub struct WorkflowRegistry {
    factories: HashMap<String, WorkflowFactory>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a workflow type
    ///
    /// # Example
    ///
    /// ```ignore
    /// let mut registry = WorkflowRegistry::new();
    /// registry.register::<OrderWorkflow>();
    /// ```
    pub fn register<W: Workflow>(&mut self) {
        let factory = WorkflowFactory {
            create: Box::new(|input: Value| {
                let typed_input: W::Input = serde_json::from_value(input)?;
                Ok(Box::new(WorkflowWrapper {
                    inner: W::new(typed_input),
                }) as Box<dyn AnyWorkflow>)
            }),
            restore: Box::new(|state: Value| {
                let inner: W = serde_json::from_value(state)?;
                Ok(Box::new(WorkflowWrapper { inner }) as Box<dyn AnyWorkflow>)
            }),
        };

        self.factories.insert(W::TYPE.to_string(), factory);
    }

    /// Builder-style [`register`](Self::register)
    pub fn with<W: Workflow>(mut self) -> Self {
        self.register::<W>();
        self
    }

    pub fn contains(&self, workflow_type: &str) -> bool {
        self.factories.contains_key(workflow_type)
    }

    /// Create a fresh workflow from its start input
    pub fn create(
        &self,
        workflow_type: &str,
        input: Value,
    ) -> Result<Box<dyn AnyWorkflow>, RegistryError> {
        let factory = self.factory(workflow_type)?;
        (factory.create)(input).map_err(RegistryError::Deserialization)
    }

    /// Rebuild a workflow from state previously returned by [`AnyWorkflow::state`]
    pub fn restore(
        &self,
        workflow_type: &str,
        state: Value,
    ) -> Result<Box<dyn AnyWorkflow>, RegistryError> {
        let factory = self.factory(workflow_type)?;
        (factory.restore)(state).map_err(RegistryError::Deserialization)
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// Registered type tags, sorted
    pub fn workflow_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.factories.keys().map(|s| s.as_str()).collect();
        types.sort_unstable();
        types
    }

    fn factory(&self, workflow_type: &str) -> Result<&WorkflowFactory, RegistryError> {
        self.factories
            .get(workflow_type)
            .ok_or_else(|| RegistryError::UnknownWorkflowType(workflow_type.to_string()))
    }
}

impl fmt::Debug for WorkflowRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowRegistry")
            .field("workflow_types", &self.workflow_types())
            .finish()
    }
}

/// Errors from registry operations
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown workflow type: {0}")]
    UnknownWorkflowType(String),

    #[error("failed to deserialize workflow input or state: {0}")]
    Deserialization(#[source] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin::SequenceWorkflow;
    use serde_json::json;

    fn registry() -> WorkflowRegistry {
        WorkflowRegistry::new().with::<SequenceWorkflow>()
    }

    #[test]
    fn test_register_and_create() {
        let registry = registry();

        assert!(registry.contains(SequenceWorkflow::TYPE));
        assert!(!registry.contains("unknown"));

        let workflow = registry
            .create(SequenceWorkflow::TYPE, json!({ "steps": ["a"] }))
            .expect("should create workflow");
        assert_eq!(workflow.workflow_type(), SequenceWorkflow::TYPE);
    }

    #[test]
    fn test_unknown_workflow_type() {
        let result = WorkflowRegistry::new().create("unknown", json!({}));
        assert!(matches!(result, Err(RegistryError::UnknownWorkflowType(_))));
    }

    #[test]
    fn test_invalid_input() {
        let result = registry().create(SequenceWorkflow::TYPE, json!({ "steps": 3 }));
        assert!(matches!(result, Err(RegistryError::Deserialization(_))));
    }

    #[test]
    fn test_state_survives_restore() {
        let registry = registry();
        let mut workflow = registry
            .create(SequenceWorkflow::TYPE, json!({ "steps": ["a", "b"] }))
            .unwrap();
        workflow.on_start();
        workflow.on_activity_completed("a", json!("done-a"));

        let state = workflow.state().unwrap();
        let mut restored = registry.restore(SequenceWorkflow::TYPE, state.clone()).unwrap();
        assert_eq!(restored.state().unwrap(), state);

        let actions = restored.on_activity_completed("b", json!("done-b"));
        assert!(matches!(actions[0], WorkflowAction::CompleteWorkflow { .. }));
    }

    #[test]
    fn test_registry_debug() {
        let debug_str = format!("{:?}", registry());
        assert!(debug_str.contains(SequenceWorkflow::TYPE));
    }
}
