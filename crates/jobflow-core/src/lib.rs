//! jobflow core - job orchestration and dispatch
//!
//! Turns a graph of tasks connected through data artifacts into executed
//! work:
//! - Skips tasks whose outputs are still fresh
//! - Blocks jobs until their inputs are written
//! - Runs jobs inline or on a bounded worker pool
//! - Tracks job and submission status, abandoning dependents of failures
//!
//! # Example
//!
//! ```rust
//! use jobflow_core::prelude::*;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let foo = DataArtifact::new("foo", Scope::Scenario);
//! let bar = DataArtifact::new("bar", Scope::Scenario);
//!
//! let store = Arc::new(InMemoryArtifactStore::new());
//! store.write(&foo, json!(1), None)?;
//!
//! let functions = FunctionRegistry::new();
//! functions.register("double", |_ctx, inputs| {
//!     Ok(json!(inputs[0].as_i64().unwrap_or_default() * 2))
//! });
//!
//! let ctx = Arc::new(OrchestrationContext::new(store.clone(), functions));
//! let orchestrator = Orchestrator::new(&ExecutionConfig::inline(), ctx)?;
//!
//! let task = TaskDescriptor::new("t1", "double")
//!     .with_inputs(vec![foo])
//!     .with_outputs(vec![bar.clone()]);
//! let job = orchestrator.submit_task(task, SubmitOptions::new())?;
//!
//! assert!(job.is_completed());
//! assert_eq!(store.read(&bar)?, json!(2));
//! # Ok(())
//! # }
//! ```

#![warn(unreachable_pub)]
#![warn(missing_docs)]

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod job;
pub mod logging;
pub mod notification;
pub mod orchestrator;
pub mod resolver;
pub mod submission;
pub mod task;

pub use config::{
    ConfigGuard, ConfigHandle, ConfigProvider, ExecutionConfig, ExecutionMode, SharedConfig,
    DEFAULT_MAX_WORKERS,
};
pub use dispatcher::{
    build_dispatcher, Dispatcher, InlineDispatcher, PoolStats, PooledDispatcher, WorkOrder,
    WorkOutcome,
};
pub use error::{ConfigError, DispatchError, JobError, OrchestratorError, TaskError};
pub use job::{
    validate_transition, Failure, FailureKind, Job, JobId, JobStatus, Subscriber, SubmissionId,
};
pub use notification::{ChannelBus, JobEvent, NoopBus, NotificationBus};
pub use orchestrator::{DependencyGraph, OrchestrationContext, Orchestrator, SubmitOptions};
pub use resolver::{BlockingResolver, Decision};
pub use submission::{Submission, SubmissionStatus};
pub use task::{
    FunctionId, FunctionRegistry, InMemoryTaskCatalog, Sequence, Submittable, TaskCatalog,
    TaskContext, TaskDescriptor, TaskFn, TaskId,
};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for working with jobflow
    pub use crate::{
        ConfigHandle, ExecutionConfig, FunctionRegistry, InMemoryTaskCatalog, Job, JobStatus,
        OrchestrationContext, Orchestrator, Sequence, SubmissionStatus, SubmitOptions,
        Submittable, TaskContext, TaskDescriptor, TaskError, TaskId,
    };
    pub use jobflow_artifact::{ArtifactStore, DataArtifact, InMemoryArtifactStore, Scope, Value};
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
