//! Orchestrator: submission, cancellation and status propagation
//!
//! The orchestrator validates what it is given, creates the submission in
//! the shared [`OrchestrationContext`] and hands runnable jobs to the
//! dispatcher selected by the execution configuration. Jobs released later
//! (by a completed upstream job) are dispatched by the dispatcher itself.

pub mod context;
pub mod graph;

pub use context::OrchestrationContext;
pub use graph::DependencyGraph;

use crate::config::{ConfigProvider, ExecutionMode};
use crate::dispatcher::{build_dispatcher, Dispatcher};
use crate::error::{DispatchError, OrchestratorError};
use crate::job::{Job, JobId, Subscriber, SubmissionId};
use crate::submission::{Submission, SubmissionStatus};
use crate::task::{Submittable, TaskDescriptor};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Options for one submit call
#[derive(Clone, Default)]
pub struct SubmitOptions {
    /// Subscribers attached to every created job
    pub callbacks: Vec<Subscriber>,
    /// Run even when outputs are fresh
    pub force: bool,
    /// Block until every job is finished (or `timeout`)
    pub wait: bool,
    /// Upper bound on the wait
    pub timeout: Option<Duration>,
}

impl SubmitOptions {
    /// Default options: no callbacks, no force, no wait
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a subscriber
    #[must_use]
    pub fn with_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Job) + Send + Sync + 'static,
    {
        self.callbacks.push(Arc::new(callback));
        self
    }

    /// Bypass the skip check
    #[must_use]
    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Wait for the jobs before returning
    #[must_use]
    pub fn wait(mut self, wait: bool) -> Self {
        self.wait = wait;
        self
    }

    /// Wait at most `timeout`
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl fmt::Debug for SubmitOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubmitOptions")
            .field("callbacks", &self.callbacks.len())
            .field("force", &self.force)
            .field("wait", &self.wait)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Job orchestrator
#[derive(Debug)]
pub struct Orchestrator {
    ctx: Arc<OrchestrationContext>,
    dispatcher: Arc<dyn Dispatcher>,
}

impl Orchestrator {
    /// Create orchestrator, reading the execution section once
    ///
    /// # Errors
    /// - `DispatchError::ModeNotAvailable` for an unknown mode
    /// - `DispatchError::InvalidWorkerCount` for a pool without workers
    /// - `DispatchError::WorkerSpawn` if the pool cannot start
    pub fn new(
        config: &dyn ConfigProvider,
        ctx: Arc<OrchestrationContext>,
    ) -> Result<Self, DispatchError> {
        let execution = config.execution();
        let dispatcher = build_dispatcher(&execution, Arc::clone(&ctx))?;

        tracing::info!(
            mode = %dispatcher.mode(),
            max_workers = execution.max_workers,
            "orchestrator ready"
        );
        Ok(Self { ctx, dispatcher })
    }

    /// Create orchestrator from the context's own configuration
    ///
    /// # Errors
    /// See [`Orchestrator::new`]
    pub fn from_context(ctx: Arc<OrchestrationContext>) -> Result<Self, DispatchError> {
        let config = ctx.config().clone();
        Self::new(&config, ctx)
    }

    /// Create orchestrator over an already built dispatcher
    #[must_use]
    pub fn with_dispatcher(ctx: Arc<OrchestrationContext>, dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self { ctx, dispatcher }
    }

    /// Shared context
    #[inline]
    #[must_use]
    pub fn context(&self) -> &Arc<OrchestrationContext> {
        &self.ctx
    }

    /// Active execution mode
    #[inline]
    #[must_use]
    pub fn mode(&self) -> ExecutionMode {
        self.dispatcher.mode()
    }

    /// Jobs currently executing
    #[must_use]
    pub fn running_count(&self) -> usize {
        self.dispatcher.running_count()
    }

    /// Submit one task in its own submission
    ///
    /// # Errors
    /// - `OrchestratorError::UnknownFunction` if the work unit is not registered
    /// - `OrchestratorError::CyclicDependency` if the task reads its own output
    /// - `OrchestratorError::Dispatch` after shutdown
    pub fn submit_task(
        &self,
        task: TaskDescriptor,
        options: SubmitOptions,
    ) -> Result<Job, OrchestratorError> {
        let task_id = task.id().clone();
        let entity_id = task_id.to_string();
        self.submit_resolved(&entity_id, vec![task], &options)?
            .pop()
            .ok_or(OrchestratorError::UnknownTask(task_id))
    }

    /// Submit a task, sequence or scenario
    ///
    /// Tasks shared by several sequences are scheduled once. Dispatch is
    /// attempted in declaration order.
    ///
    /// # Errors
    /// - `OrchestratorError::UnknownTask` for ids the catalog cannot resolve
    /// - `OrchestratorError::UnknownFunction` if a work unit is not registered
    /// - `OrchestratorError::CyclicDependency` for cyclic data dependencies
    /// - `OrchestratorError::Dispatch` after shutdown
    pub fn submit(
        &self,
        submittable: &Submittable,
        options: SubmitOptions,
    ) -> Result<Vec<Job>, OrchestratorError> {
        let tasks = submittable
            .task_ids()
            .into_iter()
            .map(|id| {
                self.ctx
                    .catalog()
                    .resolve(&id)
                    .ok_or(OrchestratorError::UnknownTask(id))
            })
            .collect::<Result<Vec<_>, _>>()?;

        self.submit_resolved(&submittable.entity_id(), tasks, &options)
    }

    fn submit_resolved(
        &self,
        entity_id: &str,
        tasks: Vec<TaskDescriptor>,
        options: &SubmitOptions,
    ) -> Result<Vec<Job>, OrchestratorError> {
        if self.dispatcher.is_shut_down() {
            return Err(DispatchError::ShutDown.into());
        }
        self.validate(&tasks)?;

        let created =
            self.ctx
                .create_submission(entity_id, tasks, &options.callbacks, options.force)?;
        self.dispatch_all(created.runnable);

        if options.wait {
            let finished = wait_all(&created.jobs, options.timeout);
            if !finished {
                tracing::debug!(entity_id, "submit wait timed out");
            }
        }
        Ok(created.jobs)
    }

    fn validate(&self, tasks: &[TaskDescriptor]) -> Result<(), OrchestratorError> {
        for task in tasks {
            if !self.ctx.functions().contains(task.function()) {
                return Err(OrchestratorError::UnknownFunction {
                    task: task.id().clone(),
                    function: task.function().clone(),
                });
            }
        }
        DependencyGraph::build(tasks).check_acyclic(tasks)
    }

    /// Hand jobs to the dispatcher; a rejected job is canceled
    fn dispatch_all(&self, jobs: Vec<Job>) {
        let mut queue: VecDeque<Job> = jobs.into();
        while let Some(job) = queue.pop_front() {
            let Err(err) = self.dispatcher.dispatch(job.clone()) else {
                continue;
            };
            tracing::warn!(job_id = %job.id(), error = %err, "dispatch rejected; canceling job");
            match self.ctx.cancel(job.id()) {
                Ok(released) => queue.extend(released),
                Err(err) => tracing::debug!(job_id = %job.id(), error = %err, "cancel after rejection failed"),
            }
        }
    }

    /// Release what a finished job held and dispatch what it unblocked
    ///
    /// Dispatchers do this on their own; call it for jobs finished outside
    /// a dispatcher.
    pub fn on_job_finished(&self, job: &Job) {
        let released = self.ctx.on_job_finished(job);
        self.dispatch_all(released);
    }

    /// Re-evaluate blocked jobs after artifacts were written directly
    pub fn rescan_blocked(&self) {
        let released = self.ctx.rescan_blocked();
        self.dispatch_all(released);
    }

    /// Cancel a job that has not started
    ///
    /// # Errors
    /// - `OrchestratorError::UnknownJob` for an unknown id
    /// - `OrchestratorError::InvalidCancel` once the job runs or is finished
    pub fn cancel(&self, job: &Job) -> Result<(), OrchestratorError> {
        let released = self.ctx.cancel(job.id())?;
        self.dispatch_all(released);
        Ok(())
    }

    /// Cancel every not-started job of a submission
    ///
    /// Returns the canceled job ids. Running jobs finish normally.
    ///
    /// # Errors
    /// `OrchestratorError::UnknownSubmission` for an unknown id
    pub fn cancel_submission(&self, id: SubmissionId) -> Result<Vec<JobId>, OrchestratorError> {
        let (canceled, released) = self.ctx.cancel_submission(id)?;
        tracing::info!(submit_id = %id, canceled = canceled.len(), "submission canceled");
        self.dispatch_all(released);
        Ok(canceled)
    }

    /// Blocked jobs in registration order
    #[must_use]
    pub fn blocked_jobs(&self) -> Vec<Job> {
        self.ctx.blocked_jobs()
    }

    /// Whether `job` is waiting in the blocked registry
    #[must_use]
    pub fn is_blocked(&self, job: &Job) -> bool {
        self.ctx.is_blocked(job.id())
    }

    /// Job by id
    #[must_use]
    pub fn job(&self, id: JobId) -> Option<Job> {
        self.ctx.job(id)
    }

    /// Submission by id
    #[must_use]
    pub fn submission(&self, id: SubmissionId) -> Option<Submission> {
        self.ctx.submission(id)
    }

    /// Stored submission status
    #[must_use]
    pub fn submission_status(&self, id: SubmissionId) -> Option<SubmissionStatus> {
        self.ctx.submission_status(id)
    }

    /// Wait until every job of a submission is finished
    ///
    /// Returns `Ok(false)` if `timeout` elapsed first. Nothing is canceled.
    ///
    /// # Errors
    /// `OrchestratorError::UnknownSubmission` for an unknown id
    pub fn wait_for_submission(
        &self,
        id: SubmissionId,
        timeout: Option<Duration>,
    ) -> Result<bool, OrchestratorError> {
        let jobs = self
            .ctx
            .submission_jobs(id)
            .ok_or(OrchestratorError::UnknownSubmission(id))?;
        Ok(wait_all(&jobs, timeout))
    }

    /// Drop a finished submission and its jobs
    ///
    /// # Errors
    /// - `OrchestratorError::UnknownSubmission` for an unknown id
    /// - `OrchestratorError::SubmissionNotFinished` while any job is live
    pub fn remove_submission(&self, id: SubmissionId) -> Result<Submission, OrchestratorError> {
        self.ctx.remove_submission(id)
    }

    /// Stop accepting work
    ///
    /// Queued jobs are canceled; running jobs finish. With `wait`, returns
    /// once the workers have stopped.
    pub fn shutdown(&self, wait: bool) {
        self.dispatcher.shutdown(wait);
    }
}

fn wait_all(jobs: &[Job], timeout: Option<Duration>) -> bool {
    let deadline = timeout.map(|t| Instant::now() + t);
    jobs.iter().all(|job| {
        let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
        job.wait(remaining)
    })
}
