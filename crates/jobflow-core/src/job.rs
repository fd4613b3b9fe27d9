//! Jobs and the job state machine
//!
//! ```text
//! CREATED -> SKIPPED | BLOCKED | PENDING | CANCELED
//! BLOCKED -> PENDING | CANCELED | ABANDONED
//! PENDING -> RUNNING | CANCELED | ABANDONED
//! RUNNING -> COMPLETED | FAILED
//! ```
//!
//! SKIPPED, COMPLETED, FAILED, CANCELED and ABANDONED are terminal and never
//! left.

use crate::error::{JobError, TaskError};
use crate::task::TaskDescriptor;
use chrono::{DateTime, Utc};
use jobflow_artifact::StoreError;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use ulid::Ulid;

/// Unique job identifier (ULID for sortability)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobId(pub Ulid);

impl JobId {
    /// Generate new job id
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "JOB_{}", self.0)
    }
}

/// Unique submission identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubmissionId(pub Ulid);

impl SubmissionId {
    /// Generate new submission id
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for SubmissionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubmissionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SUBMISSION_{}", self.0)
    }
}

/// Job status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Created, not yet resolved
    Created,
    /// Waiting on inputs (or on output locks held by other jobs)
    Blocked,
    /// Runnable, waiting for a dispatcher slot
    Pending,
    /// Work unit executing
    Running,
    /// Finished, outputs written
    Completed,
    /// Work unit or output write failed
    Failed,
    /// Canceled before it started
    Canceled,
    /// Outputs were fresh; work unit not invoked
    Skipped,
    /// Upstream job failed or was canceled
    Abandoned,
}

impl JobStatus {
    /// Every status
    pub const ALL: [JobStatus; 9] = [
        JobStatus::Created,
        JobStatus::Blocked,
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Canceled,
        JobStatus::Skipped,
        JobStatus::Abandoned,
    ];

    /// Whether the status is final
    #[inline]
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Canceled | Self::Skipped | Self::Abandoned
        )
    }

    /// Statuses reachable in one step
    #[must_use]
    pub fn allowed_transitions(self) -> &'static [JobStatus] {
        use JobStatus::*;
        match self {
            Created => &[Skipped, Blocked, Pending, Canceled],
            Blocked => &[Pending, Canceled, Abandoned],
            Pending => &[Running, Canceled, Abandoned],
            Running => &[Completed, Failed],
            Completed | Failed | Canceled | Skipped | Abandoned => &[],
        }
    }

    /// Whether subscribers hear about entering this status
    #[inline]
    #[must_use]
    pub const fn notifies_subscribers(self) -> bool {
        self.is_terminal() || matches!(self, Self::Running)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "CREATED",
            Self::Blocked => "BLOCKED",
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Canceled => "CANCELED",
            Self::Skipped => "SKIPPED",
            Self::Abandoned => "ABANDONED",
        };
        f.write_str(name)
    }
}

/// Validates a state transition
///
/// # Errors
/// `JobError::IllegalTransition` if `to` is not reachable from `from`
pub fn validate_transition(from: JobStatus, to: JobStatus) -> Result<(), JobError> {
    if from.allowed_transitions().contains(&to) {
        Ok(())
    } else {
        Err(JobError::IllegalTransition { from, to })
    }
}

/// Failure classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    /// Work unit returned an error or panicked
    TaskExecution,
    /// Result shape did not match the declared outputs
    OutputArityMismatch,
    /// Work unit tried to mutate configuration
    ConfigurationMutationBlocked,
    /// Pool worker died while running the job
    WorkerProcessLost,
    /// Reading inputs or writing outputs failed
    Storage,
}

/// Failure detail recorded on a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    /// Classification
    pub kind: FailureKind,
    /// Human-readable summary
    pub message: String,
    /// Cause chain, outermost first
    pub trace: Vec<String>,
}

impl Failure {
    /// Create failure with a single-line trace
    #[must_use]
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            kind,
            trace: vec![message.clone()],
            message,
        }
    }

    /// Replace trace
    #[must_use]
    pub fn with_trace(mut self, trace: Vec<String>) -> Self {
        self.trace = trace;
        self
    }

    /// From a work-unit error
    #[must_use]
    pub fn from_task_error(err: &TaskError) -> Self {
        Self {
            kind: err.failure_kind(),
            message: err.to_string(),
            trace: err.trace(),
        }
    }

    /// Result shape did not match `expected` outputs
    #[must_use]
    pub fn arity_mismatch(expected: usize, actual: Option<usize>) -> Self {
        let message = match actual {
            Some(actual) => {
                format!("expected a sequence of {expected} values, got {actual}")
            }
            None => format!("expected a sequence of {expected} values, got a scalar"),
        };
        Self::new(FailureKind::OutputArityMismatch, message)
    }

    /// Worker died; synthetic trace
    #[must_use]
    pub fn worker_lost(worker: usize, detail: &str) -> Self {
        Self::new(
            FailureKind::WorkerProcessLost,
            format!("worker {worker} terminated while running the job"),
        )
        .with_trace(vec![
            format!("worker {worker} terminated while running the job"),
            detail.to_string(),
        ])
    }

    /// Work unit panicked on the coordinator thread
    #[must_use]
    pub fn panicked(detail: &str) -> Self {
        Self::new(
            FailureKind::TaskExecution,
            format!("work unit panicked: {detail}"),
        )
    }

    /// Store error while reading inputs or writing outputs
    #[must_use]
    pub fn storage(err: &StoreError) -> Self {
        Self::new(FailureKind::Storage, err.to_string())
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

/// Callback invoked when a job starts running or finishes
pub type Subscriber = Arc<dyn Fn(&Job) + Send + Sync>;

#[derive(Debug)]
struct JobState {
    status: JobStatus,
    failure: Option<Failure>,
    history: Vec<JobStatus>,
}

struct JobInner {
    id: JobId,
    task: TaskDescriptor,
    submit_id: SubmissionId,
    submit_entity_id: String,
    creation_time: DateTime<Utc>,
    subscribers: Mutex<Vec<Subscriber>>,
    state: Mutex<JobState>,
    finished: Condvar,
    notify: Notify,
}

/// One execution attempt of a task
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Job {
    inner: Arc<JobInner>,
}

impl Job {
    /// Create job in `CREATED`
    #[must_use]
    pub fn new(
        task: TaskDescriptor,
        submit_id: SubmissionId,
        submit_entity_id: impl Into<String>,
    ) -> Self {
        Self {
            inner: Arc::new(JobInner {
                id: JobId::new(),
                task,
                submit_id,
                submit_entity_id: submit_entity_id.into(),
                creation_time: Utc::now(),
                subscribers: Mutex::new(Vec::new()),
                state: Mutex::new(JobState {
                    status: JobStatus::Created,
                    failure: None,
                    history: vec![JobStatus::Created],
                }),
                finished: Condvar::new(),
                notify: Notify::new(),
            }),
        }
    }

    /// Job id
    #[inline]
    #[must_use]
    pub fn id(&self) -> JobId {
        self.inner.id
    }

    /// Task being executed
    #[inline]
    #[must_use]
    pub fn task(&self) -> &TaskDescriptor {
        &self.inner.task
    }

    /// Owning submission
    #[inline]
    #[must_use]
    pub fn submit_id(&self) -> SubmissionId {
        self.inner.submit_id
    }

    /// Submittable that produced the job
    #[inline]
    #[must_use]
    pub fn submit_entity_id(&self) -> &str {
        &self.inner.submit_entity_id
    }

    /// Creation time
    #[inline]
    #[must_use]
    pub fn creation_time(&self) -> DateTime<Utc> {
        self.inner.creation_time
    }

    /// Current status
    #[must_use]
    pub fn status(&self) -> JobStatus {
        self.inner.state.lock().status
    }

    /// Failure detail, if failed
    #[must_use]
    pub fn failure(&self) -> Option<Failure> {
        self.inner.state.lock().failure.clone()
    }

    /// Every status entered, starting with `CREATED`
    #[must_use]
    pub fn history(&self) -> Vec<JobStatus> {
        self.inner.state.lock().history.clone()
    }

    /// Add a status callback
    pub fn subscribe<F>(&self, callback: F)
    where
        F: Fn(&Job) + Send + Sync + 'static,
    {
        self.add_subscriber(Arc::new(callback));
    }

    /// Add a shared status callback
    pub fn add_subscriber(&self, subscriber: Subscriber) {
        self.inner.subscribers.lock().push(subscriber);
    }

    /// Move to `status`
    ///
    /// Returns `Ok(false)` without doing anything if the job is already
    /// terminal or already in `status`. Entering `RUNNING` or a terminal
    /// status runs every subscriber before returning.
    ///
    /// # Errors
    /// `JobError::IllegalTransition` for edges outside the state machine
    pub fn update_status(
        &self,
        status: JobStatus,
        failure: Option<Failure>,
    ) -> Result<bool, JobError> {
        let applied = self.apply_status(status, failure)?;
        if applied {
            self.notify_subscribers(status);
        }
        Ok(applied)
    }

    /// State change and waiter wake-up, without running subscribers
    pub(crate) fn apply_status(
        &self,
        status: JobStatus,
        failure: Option<Failure>,
    ) -> Result<bool, JobError> {
        let mut state = self.inner.state.lock();
        if state.status.is_terminal() || state.status == status {
            return Ok(false);
        }
        validate_transition(state.status, status)?;

        state.status = status;
        state.history.push(status);
        if failure.is_some() {
            state.failure = failure;
        }
        drop(state);

        if status.is_terminal() {
            self.inner.finished.notify_all();
            self.inner.notify.notify_waiters();
        }
        Ok(true)
    }

    /// Run subscribers for a transition into `status`
    ///
    /// A panicking subscriber is logged and skipped.
    pub(crate) fn notify_subscribers(&self, status: JobStatus) {
        if !status.notifies_subscribers() {
            return;
        }

        let subscribers = self.inner.subscribers.lock().clone();
        for subscriber in subscribers {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| subscriber(self)));
            if outcome.is_err() {
                tracing::warn!(job_id = %self.id(), %status, "job subscriber panicked");
            }
        }
    }

    /// Block until the job is terminal or `timeout` elapses
    ///
    /// Returns whether the job finished. Never cancels the job.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.inner.state.lock();

        while !state.status.is_terminal() {
            match deadline {
                Some(deadline) => {
                    if self
                        .inner
                        .finished
                        .wait_until(&mut state, deadline)
                        .timed_out()
                    {
                        return state.status.is_terminal();
                    }
                }
                None => self.inner.finished.wait(&mut state),
            }
        }
        true
    }

    /// Await the job reaching a terminal status, or `timeout`
    ///
    /// Returns whether the job finished. Must run inside a tokio runtime
    /// when a timeout is given.
    pub async fn wait_async(&self, timeout: Option<Duration>) -> bool {
        let finished = async {
            loop {
                let notified = self.inner.notify.notified();
                if self.is_finished() {
                    return;
                }
                notified.await;
            }
        };

        match timeout {
            Some(timeout) => tokio::time::timeout(timeout, finished).await.is_ok(),
            None => {
                finished.await;
                true
            }
        }
    }

    /// Terminal status reached
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.status().is_terminal()
    }

    /// `COMPLETED`
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.status() == JobStatus::Completed
    }

    /// `FAILED`
    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.status() == JobStatus::Failed
    }

    /// `BLOCKED`
    #[must_use]
    pub fn is_blocked(&self) -> bool {
        self.status() == JobStatus::Blocked
    }

    /// `SKIPPED`
    #[must_use]
    pub fn is_skipped(&self) -> bool {
        self.status() == JobStatus::Skipped
    }

    /// `ABANDONED`
    #[must_use]
    pub fn is_abandoned(&self) -> bool {
        self.status() == JobStatus::Abandoned
    }

    /// `PENDING`
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.status() == JobStatus::Pending
    }

    /// `RUNNING`
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.status() == JobStatus::Running
    }

    /// `CANCELED`
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        self.status() == JobStatus::Canceled
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.inner.id)
            .field("task", self.inner.task.id())
            .field("submit_id", &self.inner.submit_id)
            .field("status", &self.status())
            .finish()
    }
}

impl PartialEq for Job {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Job {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn job() -> Job {
        Job::new(
            TaskDescriptor::new("t1", "noop"),
            SubmissionId::new(),
            "scenario",
        )
    }

    #[test]
    fn new_job_is_created() {
        let job = job();
        assert_eq!(job.status(), JobStatus::Created);
        assert_eq!(job.history(), vec![JobStatus::Created]);
        assert!(job.id().to_string().starts_with("JOB_"));
        assert!(job.submit_id().to_string().starts_with("SUBMISSION_"));
    }

    #[test]
    fn happy_path() {
        let job = job();
        assert!(job.update_status(JobStatus::Pending, None).unwrap());
        assert!(job.update_status(JobStatus::Running, None).unwrap());
        assert!(job.update_status(JobStatus::Completed, None).unwrap());

        assert!(job.is_completed());
        assert!(job.is_finished());
        assert_eq!(
            job.history(),
            vec![
                JobStatus::Created,
                JobStatus::Pending,
                JobStatus::Running,
                JobStatus::Completed
            ]
        );
    }

    #[test]
    fn terminal_is_never_left() {
        let job = job();
        job.update_status(JobStatus::Skipped, None).unwrap();

        assert!(!job.update_status(JobStatus::Pending, None).unwrap());
        assert!(!job.update_status(JobStatus::Failed, None).unwrap());
        assert!(job.is_skipped());
    }

    #[test]
    fn illegal_transition_rejected() {
        let job = job();
        let err = job.update_status(JobStatus::Completed, None).unwrap_err();
        assert_eq!(
            err,
            JobError::IllegalTransition {
                from: JobStatus::Created,
                to: JobStatus::Completed
            }
        );
        assert_eq!(job.status(), JobStatus::Created);
    }

    #[test]
    fn failure_is_recorded() {
        let job = job();
        job.update_status(JobStatus::Pending, None).unwrap();
        job.update_status(JobStatus::Running, None).unwrap();
        job.update_status(
            JobStatus::Failed,
            Some(Failure::new(FailureKind::TaskExecution, "boom")),
        )
        .unwrap();

        let failure = job.failure().unwrap();
        assert_eq!(failure.kind, FailureKind::TaskExecution);
        assert_eq!(failure.trace, vec!["boom".to_string()]);
    }

    #[test]
    fn subscribers_fire_on_running_and_terminal_only() {
        let job = job();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        job.subscribe(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        job.update_status(JobStatus::Blocked, None).unwrap();
        job.update_status(JobStatus::Pending, None).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        job.update_status(JobStatus::Running, None).unwrap();
        job.update_status(JobStatus::Completed, None).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn panicking_subscriber_does_not_affect_status() {
        let job = job();
        job.subscribe(|_| panic!("subscriber bug"));
        job.update_status(JobStatus::Canceled, None).unwrap();
        assert!(job.is_canceled());
    }

    #[test]
    fn wait_times_out_without_cancelling() {
        let job = job();
        job.update_status(JobStatus::Pending, None).unwrap();

        assert!(!job.wait(Some(Duration::from_millis(20))));
        assert!(job.is_pending());
    }

    #[test]
    fn wait_wakes_on_completion() {
        let job = job();
        job.update_status(JobStatus::Pending, None).unwrap();
        job.update_status(JobStatus::Running, None).unwrap();

        let worker = job.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            worker.update_status(JobStatus::Completed, None).unwrap();
        });

        assert!(job.wait(Some(Duration::from_secs(5))));
        handle.join().unwrap();
    }

    #[tokio::test]
    async fn wait_async_wakes_on_completion() {
        let job = job();
        job.update_status(JobStatus::Pending, None).unwrap();

        let worker = job.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            worker.update_status(JobStatus::Canceled, None).unwrap();
        });

        assert!(job.wait_async(Some(Duration::from_secs(5))).await);
        assert!(job.is_canceled());
    }

    #[tokio::test]
    async fn wait_async_times_out() {
        let job = job();
        assert!(!job.wait_async(Some(Duration::from_millis(10))).await);
    }
}
