//! Job status notifications
//!
//! The bus is fire-and-forget: a failing bus never changes a job's status.

use crate::job::{Job, JobId, JobStatus, SubmissionId};
use crate::task::TaskId;
use chrono::{DateTime, Utc};
use crossbeam::channel::{self, Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::panic::{self, AssertUnwindSafe};

/// Status change of one job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobEvent {
    /// Job
    pub job_id: JobId,
    /// Owning submission
    pub submit_id: SubmissionId,
    /// Task the job executes
    pub task_id: TaskId,
    /// Status entered
    pub status: JobStatus,
    /// When the event was recorded
    pub at: DateTime<Utc>,
}

impl JobEvent {
    /// Event for `job` entering `status`
    #[must_use]
    pub fn new(job: &Job, status: JobStatus) -> Self {
        Self {
            job_id: job.id(),
            submit_id: job.submit_id(),
            task_id: job.task().id().clone(),
            status,
            at: Utc::now(),
        }
    }
}

/// Receives every job status change
pub trait NotificationBus: Send + Sync + Debug {
    /// Publish an event
    fn publish(&self, event: &JobEvent);
}

/// Publish, logging and discarding a panicking bus
pub(crate) fn publish_guarded(bus: &dyn NotificationBus, event: &JobEvent) {
    if panic::catch_unwind(AssertUnwindSafe(|| bus.publish(event))).is_err() {
        tracing::warn!(job_id = %event.job_id, status = %event.status, "notification bus panicked");
    }
}

/// Drops every event
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopBus;

impl NotificationBus for NoopBus {
    fn publish(&self, _event: &JobEvent) {}
}

/// Forwards events to a channel
#[derive(Debug, Clone)]
pub struct ChannelBus {
    tx: Sender<JobEvent>,
}

impl ChannelBus {
    /// Bus plus the receiving end
    #[must_use]
    pub fn new() -> (Self, Receiver<JobEvent>) {
        let (tx, rx) = channel::unbounded();
        (Self { tx }, rx)
    }
}

impl NotificationBus for ChannelBus {
    fn publish(&self, event: &JobEvent) {
        // Receiver gone is fine
        let _ = self.tx.send(event.clone());
    }
}
