//! Tasks, work-unit registry and submittables
//!
//! A [`TaskDescriptor`] names its work unit by [`FunctionId`]. The closure
//! itself lives in a [`FunctionRegistry`], so work can be described by a
//! plain message and executed by any worker holding the registry.

use crate::config::ConfigHandle;
use crate::error::TaskError;
use crate::job::JobId;
use dashmap::DashMap;
use indexmap::IndexSet;
use jobflow_artifact::{DataArtifact, Value};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Task identifier
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaskId(pub String);

impl TaskId {
    /// Create new task id
    #[inline]
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Stable identifier of a registered work unit
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FunctionId(pub String);

impl FunctionId {
    /// Create new function id
    #[inline]
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for FunctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FunctionId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Resolved task: work unit plus declared inputs and outputs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    id: TaskId,
    function: FunctionId,
    inputs: Vec<DataArtifact>,
    outputs: Vec<DataArtifact>,
    skippable: bool,
}

impl TaskDescriptor {
    /// Create task without inputs or outputs
    #[must_use]
    pub fn new(id: impl Into<String>, function: impl Into<String>) -> Self {
        Self {
            id: TaskId::new(id),
            function: FunctionId::new(function),
            inputs: Vec::new(),
            outputs: Vec::new(),
            skippable: false,
        }
    }

    /// With ordered inputs
    #[must_use]
    pub fn with_inputs(mut self, inputs: Vec<DataArtifact>) -> Self {
        self.inputs = inputs;
        self
    }

    /// With ordered outputs
    #[must_use]
    pub fn with_outputs(mut self, outputs: Vec<DataArtifact>) -> Self {
        self.outputs = outputs;
        self
    }

    /// Mark as skippable when outputs are fresh
    #[must_use]
    pub fn skippable(mut self, skippable: bool) -> Self {
        self.skippable = skippable;
        self
    }

    /// Task id
    #[inline]
    #[must_use]
    pub fn id(&self) -> &TaskId {
        &self.id
    }

    /// Work unit id
    #[inline]
    #[must_use]
    pub fn function(&self) -> &FunctionId {
        &self.function
    }

    /// Ordered inputs
    #[inline]
    #[must_use]
    pub fn inputs(&self) -> &[DataArtifact] {
        &self.inputs
    }

    /// Ordered outputs
    #[inline]
    #[must_use]
    pub fn outputs(&self) -> &[DataArtifact] {
        &self.outputs
    }

    /// Whether the task may be skipped
    #[inline]
    #[must_use]
    pub fn is_skippable(&self) -> bool {
        self.skippable
    }
}

/// Execution context handed to a work unit
#[derive(Debug, Clone)]
pub struct TaskContext {
    job_id: JobId,
    task_id: TaskId,
    config: ConfigHandle,
}

impl TaskContext {
    /// Create context
    #[must_use]
    pub fn new(job_id: JobId, task_id: TaskId, config: ConfigHandle) -> Self {
        Self {
            job_id,
            task_id,
            config,
        }
    }

    /// Job being executed
    #[inline]
    #[must_use]
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Task being executed
    #[inline]
    #[must_use]
    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    /// Configuration visible to the work unit (guarded while it runs)
    #[inline]
    #[must_use]
    pub fn config(&self) -> &ConfigHandle {
        &self.config
    }
}

/// Registered work unit
pub type TaskFn = Arc<dyn Fn(&TaskContext, Vec<Value>) -> Result<Value, TaskError> + Send + Sync>;

/// Registry from [`FunctionId`] to work unit
///
/// Clones share the same table.
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    functions: Arc<DashMap<FunctionId, TaskFn>>,
}

impl FunctionRegistry {
    /// Create empty registry
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a work unit
    pub fn register<F>(&self, id: impl Into<String>, function: F) -> &Self
    where
        F: Fn(&TaskContext, Vec<Value>) -> Result<Value, TaskError> + Send + Sync + 'static,
    {
        self.functions
            .insert(FunctionId::new(id), Arc::new(function));
        self
    }

    /// Look up a work unit
    #[must_use]
    pub fn get(&self, id: &FunctionId) -> Option<TaskFn> {
        self.functions.get(id).map(|f| Arc::clone(f.value()))
    }

    /// Whether `id` is registered
    #[must_use]
    pub fn contains(&self, id: &FunctionId) -> bool {
        self.functions.contains_key(id)
    }

    /// Number of registered work units
    #[must_use]
    pub fn len(&self) -> usize {
        self.functions.len()
    }

    /// Whether nothing is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

impl fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("functions", &self.functions.len())
            .finish()
    }
}

/// Resolves task ids to descriptors
pub trait TaskCatalog: Send + Sync + fmt::Debug {
    /// Descriptor for `id`, if known
    fn resolve(&self, id: &TaskId) -> Option<TaskDescriptor>;
}

/// In-memory task catalog
#[derive(Debug, Default)]
pub struct InMemoryTaskCatalog {
    tasks: DashMap<TaskId, TaskDescriptor>,
}

impl InMemoryTaskCatalog {
    /// Create empty catalog
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) a task
    pub fn insert(&self, task: TaskDescriptor) {
        self.tasks.insert(task.id().clone(), task);
    }

    /// Number of tasks
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether the catalog is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

impl TaskCatalog for InMemoryTaskCatalog {
    fn resolve(&self, id: &TaskId) -> Option<TaskDescriptor> {
        self.tasks.get(id).map(|t| t.value().clone())
    }
}

impl FromIterator<TaskDescriptor> for InMemoryTaskCatalog {
    fn from_iter<T: IntoIterator<Item = TaskDescriptor>>(iter: T) -> Self {
        let catalog = Self::new();
        for task in iter {
            catalog.insert(task);
        }
        catalog
    }
}

/// Ordered list of tasks owned by one entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sequence {
    /// Owner id stamped on jobs
    pub id: String,
    /// Tasks in declaration order
    pub tasks: Vec<TaskId>,
}

impl Sequence {
    /// Create sequence
    #[must_use]
    pub fn new(id: impl Into<String>, tasks: Vec<TaskId>) -> Self {
        Self {
            id: id.into(),
            tasks,
        }
    }
}

/// Anything that can be submitted as one batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Submittable {
    /// Single task
    Task(TaskId),
    /// Ordered tasks
    Sequence(Sequence),
    /// Sequences plus tasks outside any sequence
    Scenario {
        /// Scenario id
        id: String,
        /// Sequences in declaration order
        sequences: Vec<Sequence>,
        /// Additional tasks, scheduled after the sequences
        tasks: Vec<TaskId>,
    },
}

impl Submittable {
    /// Scenario from sequences only
    #[must_use]
    pub fn scenario(id: impl Into<String>, sequences: Vec<Sequence>) -> Self {
        Self::Scenario {
            id: id.into(),
            sequences,
            tasks: Vec::new(),
        }
    }

    /// Id stamped on jobs as `submit_entity_id`
    #[must_use]
    pub fn entity_id(&self) -> String {
        match self {
            Self::Task(id) => id.to_string(),
            Self::Sequence(sequence) => sequence.id.clone(),
            Self::Scenario { id, .. } => id.clone(),
        }
    }

    /// Tasks in declaration order, each at most once
    #[must_use]
    pub fn task_ids(&self) -> Vec<TaskId> {
        let ids: IndexSet<TaskId> = match self {
            Self::Task(id) => std::iter::once(id.clone()).collect(),
            Self::Sequence(sequence) => sequence.tasks.iter().cloned().collect(),
            Self::Scenario {
                sequences, tasks, ..
            } => sequences
                .iter()
                .flat_map(|s| s.tasks.iter())
                .chain(tasks.iter())
                .cloned()
                .collect(),
        };
        ids.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobflow_artifact::Scope;
    use serde_json::json;

    fn ids(names: &[&str]) -> Vec<TaskId> {
        names.iter().map(|n| TaskId::from(*n)).collect()
    }

    #[test]
    fn scenario_dedups_shared_tasks_in_declaration_order() {
        let scenario = Submittable::scenario(
            "scenario_1",
            vec![
                Sequence::new("seq_a", ids(&["t1", "t2"])),
                Sequence::new("seq_b", ids(&["t1", "t3", "t2"])),
            ],
        );

        assert_eq!(scenario.task_ids(), ids(&["t1", "t2", "t3"]));
        assert_eq!(scenario.entity_id(), "scenario_1");
    }

    #[test]
    fn scenario_extra_tasks_follow_sequences() {
        let scenario = Submittable::Scenario {
            id: "s".to_string(),
            sequences: vec![Sequence::new("seq", ids(&["t1"]))],
            tasks: ids(&["t0", "t1"]),
        };
        assert_eq!(scenario.task_ids(), ids(&["t1", "t0"]));
    }

    #[test]
    fn single_task_entity_is_task_id() {
        let task = Submittable::Task(TaskId::from("t9"));
        assert_eq!(task.entity_id(), "t9");
        assert_eq!(task.task_ids(), ids(&["t9"]));
    }

    #[test]
    fn registry_lookup() {
        let registry = FunctionRegistry::new();
        registry.register("double", |_ctx, inputs| {
            let n = inputs[0].as_i64().unwrap_or_default();
            Ok(json!(n * 2))
        });

        let f = registry.get(&FunctionId::from("double")).unwrap();
        let ctx = TaskContext::new(JobId::new(), TaskId::from("t"), ConfigHandle::default());
        assert_eq!(f(&ctx, vec![json!(21)]).unwrap(), json!(42));
        assert!(registry.get(&FunctionId::from("missing")).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn catalog_resolves_descriptors() {
        let task = TaskDescriptor::new("t1", "double")
            .with_inputs(vec![DataArtifact::new("foo", Scope::Scenario)])
            .with_outputs(vec![DataArtifact::new("bar", Scope::Scenario)])
            .skippable(true);

        let catalog = InMemoryTaskCatalog::new();
        catalog.insert(task.clone());

        assert_eq!(catalog.resolve(&TaskId::from("t1")), Some(task));
        assert_eq!(catalog.resolve(&TaskId::from("t2")), None);
    }
}
