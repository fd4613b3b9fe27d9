//! Error types for jobflow
//!
//! Task-level failures never surface here: they are absorbed into job state
//! as a [`Failure`](crate::job::Failure). These enums cover:
//! - Malformed submissions (unknown tasks, cycles)
//! - Illegal cancellation and state transitions
//! - Dispatcher construction and shutdown
//! - Configuration mutation while work is running

use crate::job::{FailureKind, JobId, JobStatus, SubmissionId};
use crate::task::{FunctionId, TaskId};
use jobflow_artifact::StoreError;

/// Main orchestrator error type
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// Task id unknown to the catalog
    #[error("unknown task: {0}")]
    UnknownTask(TaskId),

    /// Task references a function that was never registered
    #[error("task {task} references unregistered function {function}")]
    UnknownFunction {
        /// Offending task
        task: TaskId,
        /// Missing function
        function: FunctionId,
    },

    /// Declared data dependencies form a cycle
    #[error("cyclic dependency through task {0}")]
    CyclicDependency(TaskId),

    /// Cancel requested for a job that already started or finished
    #[error("cannot cancel job {job_id} in status {status}")]
    InvalidCancel {
        /// Job that was targeted
        job_id: JobId,
        /// Its status at the time of the request
        status: JobStatus,
    },

    /// Job not known to this orchestrator
    #[error("unknown job: {0}")]
    UnknownJob(JobId),

    /// Submission not known to this orchestrator
    #[error("unknown submission: {0}")]
    UnknownSubmission(SubmissionId),

    /// Cleanup requested while jobs are still live
    #[error("submission {0} still has unfinished jobs")]
    SubmissionNotFinished(SubmissionId),

    /// Dispatcher failure
    #[error("dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    /// Artifact store failure outside of a job
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Dispatcher errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    /// Configured execution mode is not known
    #[error("execution mode not available: {0}")]
    ModeNotAvailable(String),

    /// Pooled mode configured without workers
    #[error("invalid worker count: {0}")]
    InvalidWorkerCount(usize),

    /// Dispatcher no longer accepts work
    #[error("dispatcher is shut down")]
    ShutDown,

    /// OS refused to start a worker
    #[error("failed to spawn worker: {0}")]
    WorkerSpawn(String),
}

/// Errors raised by task work units
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    /// Work unit reported a failure
    #[error("task failed: {0}")]
    Failed(String),

    /// Work unit tried to mutate guarded configuration
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Any other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TaskError {
    /// Create failure from message
    #[inline]
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    /// Classification recorded on the job
    #[must_use]
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::Config(ConfigError::MutationBlocked { .. }) => {
                FailureKind::ConfigurationMutationBlocked
            }
            _ => FailureKind::TaskExecution,
        }
    }

    /// Error cause chain, outermost first
    #[must_use]
    pub fn trace(&self) -> Vec<String> {
        match self {
            Self::Other(err) => err.chain().map(ToString::to_string).collect(),
            other => vec![other.to_string()],
        }
    }
}

/// Job state machine errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum JobError {
    /// Transition outside the allowed table
    #[error("illegal job transition {from} -> {to}")]
    IllegalTransition {
        /// Current status
        from: JobStatus,
        /// Requested status
        to: JobStatus,
    },
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Mutation attempted while dispatched work is running
    #[error("configuration is locked while jobs run; refused to update {key}")]
    MutationBlocked {
        /// Key the caller tried to change
        key: String,
    },

    /// Invalid TOML document
    #[error("invalid configuration: {0}")]
    Parse(String),

    /// Snapshot could not be serialized
    #[error("configuration snapshot failed: {0}")]
    Serialize(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_error_classification() {
        let blocked = TaskError::from(ConfigError::MutationBlocked {
            key: "mode".to_string(),
        });
        assert_eq!(blocked.failure_kind(), FailureKind::ConfigurationMutationBlocked);
        assert_eq!(
            TaskError::failed("boom").failure_kind(),
            FailureKind::TaskExecution
        );
    }

    #[test]
    fn task_error_trace_follows_anyhow_chain() {
        let err = anyhow::anyhow!("disk full").context("writing report");
        let trace = TaskError::from(err).trace();

        assert_eq!(trace, vec!["writing report".to_string(), "disk full".to_string()]);
    }

    #[test]
    fn error_display() {
        let err = DispatchError::ModeNotAvailable("cluster".to_string());
        assert!(err.to_string().contains("cluster"));

        let err = OrchestratorError::from(err);
        assert!(err.to_string().starts_with("dispatch error"));
    }
}
