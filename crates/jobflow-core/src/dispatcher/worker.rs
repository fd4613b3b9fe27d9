//! Pool worker and its messages
//!
//! A worker owns nothing shared with the coordinator except the function
//! registry. Each order is self-contained: the function id, the
//! materialized inputs, the number of outputs and a configuration snapshot
//! the worker rebuilds and guards on its own.

use super::{invoke, panic_message};
use crate::config::ConfigHandle;
use crate::job::{Failure, FailureKind, JobId};
use crate::task::{FunctionId, FunctionRegistry, TaskContext, TaskId};
use crossbeam::channel::{Receiver, Sender};
use jobflow_artifact::Value;
use serde::{Deserialize, Serialize};
use std::panic::{self, AssertUnwindSafe};

/// Work sent to a pool worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkOrder {
    /// Job being executed
    pub job_id: JobId,
    /// Task of the job
    pub task_id: TaskId,
    /// Work unit to invoke
    pub function: FunctionId,
    /// Materialized input values, in declaration order
    pub inputs: Vec<Value>,
    /// Number of declared outputs
    pub output_count: usize,
    /// Serialized configuration
    pub config_snapshot: String,
}

/// Result sent back by a pool worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkOutcome {
    /// Job the outcome belongs to
    pub job_id: JobId,
    /// Worker index
    pub worker: usize,
    /// Output values or failure
    pub result: Result<Vec<Value>, Failure>,
    /// Worker terminated after sending this outcome
    pub lost: bool,
}

/// Run orders until the order channel closes
///
/// A panicking work unit takes its worker down: the outcome is reported as
/// `WorkerProcessLost` and the loop exits.
pub(crate) fn worker_loop(
    worker: usize,
    functions: FunctionRegistry,
    orders: Receiver<WorkOrder>,
    outcomes: Sender<WorkOutcome>,
) {
    tracing::debug!(worker, "worker started");

    for order in orders.iter() {
        let job_id = order.job_id;
        let (result, lost) =
            match panic::catch_unwind(AssertUnwindSafe(|| execute_order(&functions, order))) {
                Ok(result) => (result, false),
                Err(payload) => {
                    let detail = panic_message(payload.as_ref());
                    tracing::error!(worker, %job_id, %detail, "worker lost");
                    (Err(Failure::worker_lost(worker, &detail)), true)
                }
            };

        let outcome = WorkOutcome {
            job_id,
            worker,
            result,
            lost,
        };
        if outcomes.send(outcome).is_err() || lost {
            break;
        }
    }

    tracing::debug!(worker, "worker stopped");
}

fn execute_order(functions: &FunctionRegistry, order: WorkOrder) -> Result<Vec<Value>, Failure> {
    let config = ConfigHandle::from_snapshot(&order.config_snapshot)
        .map_err(|err| Failure::new(FailureKind::TaskExecution, err.to_string()))?;
    let function = functions.get(&order.function).ok_or_else(|| {
        Failure::new(
            FailureKind::TaskExecution,
            format!("work unit {} is not registered", order.function),
        )
    })?;

    let ctx = TaskContext::new(order.job_id, order.task_id, config);
    invoke(&function, &ctx, order.inputs, order.output_count)
}
