//! Dispatchers: execute runnable jobs and report their outcome
//!
//! Both variants share the same contract. A job handed to `dispatch` is
//! `PENDING`; the dispatcher moves it to `RUNNING` through the context,
//! invokes its work unit with the materialized inputs and reports an
//! explicit `Result<Vec<Value>, Failure>` back. Output writes, unlocks and
//! the re-scan of blocked jobs happen in the context, never in a worker.

mod inline;
mod pooled;
mod worker;

pub use inline::InlineDispatcher;
pub use pooled::{PoolStats, PooledDispatcher};
pub use worker::{WorkOrder, WorkOutcome};

use crate::config::{ExecutionConfig, ExecutionMode};
use crate::error::DispatchError;
use crate::job::{Failure, FailureKind, Job};
use crate::orchestrator::OrchestrationContext;
use crate::task::{TaskContext, TaskFn};
use jobflow_artifact::Value;
use std::any::Any;
use std::fmt::Debug;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// Executes runnable jobs
pub trait Dispatcher: Send + Sync + Debug {
    /// Execution mode implemented
    fn mode(&self) -> ExecutionMode;

    /// Execute a `PENDING` job
    ///
    /// Inline dispatch returns once the job and everything it released are
    /// finished. Pooled dispatch returns immediately.
    ///
    /// # Errors
    /// `DispatchError::ShutDown` after [`shutdown`](Dispatcher::shutdown)
    fn dispatch(&self, job: Job) -> Result<(), DispatchError>;

    /// Jobs currently executing
    fn running_count(&self) -> usize;

    /// Whether `shutdown` was called
    fn is_shut_down(&self) -> bool;

    /// Stop accepting work; optionally wait for running jobs
    fn shutdown(&self, wait: bool);
}

/// Build the dispatcher selected by `config`
///
/// # Errors
/// - `DispatchError::ModeNotAvailable` for an unknown mode
/// - `DispatchError::InvalidWorkerCount` for a pool without workers
/// - `DispatchError::WorkerSpawn` if a pool thread cannot start
pub fn build_dispatcher(
    config: &ExecutionConfig,
    ctx: Arc<OrchestrationContext>,
) -> Result<Arc<dyn Dispatcher>, DispatchError> {
    match config.resolve_mode()? {
        ExecutionMode::Inline => Ok(Arc::new(InlineDispatcher::new(ctx))),
        ExecutionMode::Pooled => Ok(Arc::new(PooledDispatcher::new(ctx, config.max_workers)?)),
    }
}

/// Invoke a work unit under the config guard and shape its result
///
/// With one output the raw value is kept, arrays included. With more, the
/// result must be an array of exactly that many values.
pub(crate) fn invoke(
    function: &TaskFn,
    ctx: &TaskContext,
    inputs: Vec<Value>,
    output_count: usize,
) -> Result<Vec<Value>, Failure> {
    let result = {
        let _guard = ctx.config().guard();
        function(ctx, inputs)
    };

    let value = result.map_err(|err| Failure::from_task_error(&err))?;
    shape_outputs(value, output_count)
}

fn shape_outputs(value: Value, output_count: usize) -> Result<Vec<Value>, Failure> {
    match output_count {
        0 => Ok(Vec::new()),
        1 => Ok(vec![value]),
        expected => match value {
            Value::Array(values) if values.len() == expected => Ok(values),
            Value::Array(values) => Err(Failure::arity_mismatch(expected, Some(values.len()))),
            _ => Err(Failure::arity_mismatch(expected, None)),
        },
    }
}

/// Look up and invoke a work unit, turning a panic into a failure
pub(crate) fn invoke_catching(
    ctx: &OrchestrationContext,
    job: &Job,
    inputs: Vec<Value>,
) -> Result<Vec<Value>, Failure> {
    let task = job.task();
    let function = ctx.functions().get(task.function()).ok_or_else(|| {
        Failure::new(
            FailureKind::TaskExecution,
            format!("work unit {} is not registered", task.function()),
        )
    })?;
    let task_ctx = TaskContext::new(job.id(), task.id().clone(), ctx.config().clone());

    panic::catch_unwind(AssertUnwindSafe(|| {
        invoke(&function, &task_ctx, inputs, task.outputs().len())
    }))
    .unwrap_or_else(|payload| Err(Failure::panicked(&panic_message(payload.as_ref()))))
}

/// Best-effort text of a panic payload
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigHandle;
    use crate::error::TaskError;
    use crate::job::JobId;
    use crate::task::TaskId;
    use serde_json::json;

    fn ctx() -> TaskContext {
        TaskContext::new(JobId::new(), TaskId::from("t"), ConfigHandle::default())
    }

    fn unit<F>(function: F) -> TaskFn
    where
        F: Fn(&TaskContext, Vec<Value>) -> Result<Value, TaskError> + Send + Sync + 'static,
    {
        Arc::new(function)
    }

    fn returning(value: Value) -> TaskFn {
        unit(move |_, _| Ok(value.clone()))
    }

    #[test]
    fn single_output_keeps_arrays_whole() {
        let out = invoke(&returning(json!([1, 2])), &ctx(), vec![], 1).unwrap();
        assert_eq!(out, vec![json!([1, 2])]);
    }

    #[test]
    fn multiple_outputs_are_unpacked() {
        let out = invoke(&returning(json!([1, "a"])), &ctx(), vec![], 2).unwrap();
        assert_eq!(out, vec![json!(1), json!("a")]);
    }

    #[test]
    fn arity_mismatch() {
        let err = invoke(&returning(json!([1, 2, 3])), &ctx(), vec![], 2).unwrap_err();
        assert_eq!(err.kind, FailureKind::OutputArityMismatch);

        let err = invoke(&returning(json!(7)), &ctx(), vec![], 2).unwrap_err();
        assert_eq!(err.kind, FailureKind::OutputArityMismatch);
    }

    #[test]
    fn zero_outputs_discard_result() {
        assert!(invoke(&returning(json!(1)), &ctx(), vec![], 0)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn guard_is_engaged_only_during_invocation() {
        let task_ctx = ctx();
        let function = unit(|ctx, _| {
            assert!(ctx.config().is_guarded());
            ctx.config().set_property("k", "v")?;
            Ok(json!(null))
        });

        let err = invoke(&function, &task_ctx, vec![], 0).unwrap_err();
        assert_eq!(err.kind, FailureKind::ConfigurationMutationBlocked);
        assert!(!task_ctx.config().is_guarded());
    }

    #[test]
    fn task_error_becomes_failure() {
        let function = unit(|_, _| Err(TaskError::failed("boom")));
        let err = invoke(&function, &ctx(), vec![], 1).unwrap_err();
        assert_eq!(err.kind, FailureKind::TaskExecution);
        assert!(err.message.contains("boom"));
    }

    #[test]
    fn panic_payload_text() {
        let payload = panic::catch_unwind(|| panic!("exploded")).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "exploded");

        let payload = panic::catch_unwind(|| panic!("code {}", 7)).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "code 7");
    }
}
