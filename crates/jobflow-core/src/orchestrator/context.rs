//! Orchestration context: the shared state every dispatcher works against
//!
//! One `parking_lot::Mutex` guards every registry. Output writes, status
//! transitions, unlocks and the blocked-registry re-scan that follows a write
//! all happen under it, so no job observes a half-written upstream output.
//! Subscribers and the notification bus run after the lock is released.

use crate::config::ConfigHandle;
use crate::error::OrchestratorError;
use crate::job::{Failure, Job, JobId, JobStatus, Subscriber, SubmissionId};
use crate::notification::{publish_guarded, JobEvent, NoopBus, NotificationBus};
use crate::resolver::{BlockingResolver, Decision};
use crate::submission::{Submission, SubmissionStatus};
use crate::task::{FunctionRegistry, InMemoryTaskCatalog, TaskCatalog, TaskDescriptor};
use chrono::Utc;
use indexmap::{IndexMap, IndexSet};
use jobflow_artifact::{ArtifactId, ArtifactStore, DataArtifact, StoreError, Value};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

#[derive(Debug, Default)]
struct Registries {
    jobs: HashMap<JobId, Job>,
    submissions: IndexMap<SubmissionId, Submission>,
    /// Blocked jobs and what they wait on, in registration order
    blocked: IndexMap<JobId, BTreeSet<ArtifactId>>,
    /// Reverse index of `blocked`
    waiters: HashMap<ArtifactId, IndexSet<JobId>>,
    in_flight: IndexSet<JobId>,
}

impl Registries {
    fn register_blocked(&mut self, job_id: JobId, waiting: BTreeSet<ArtifactId>) {
        for artifact in &waiting {
            self.waiters
                .entry(artifact.clone())
                .or_default()
                .insert(job_id);
        }
        self.blocked.insert(job_id, waiting);
    }

    fn unregister_blocked(&mut self, job_id: JobId) -> bool {
        let Some(waiting) = self.blocked.shift_remove(&job_id) else {
            return false;
        };
        for artifact in waiting {
            if let Some(ids) = self.waiters.get_mut(&artifact) {
                ids.shift_remove(&job_id);
                if ids.is_empty() {
                    self.waiters.remove(&artifact);
                }
            }
        }
        true
    }

    fn submission_jobs(&self, id: SubmissionId) -> Vec<Job> {
        self.submissions
            .get(&id)
            .map(|s| {
                s.job_ids()
                    .iter()
                    .filter_map(|id| self.jobs.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn refresh_submission(&mut self, id: SubmissionId) {
        let Self {
            jobs, submissions, ..
        } = self;
        let Some(submission) = submissions.get_mut(&id) else {
            return;
        };

        let status = SubmissionStatus::aggregate(
            submission
                .job_ids()
                .iter()
                .filter_map(|id| jobs.get(id))
                .map(Job::status),
        );
        if submission.set_status(status) {
            tracing::debug!(submit_id = %id, %status, "submission status changed");
        }
    }
}

/// Status changes to announce once the registries lock is released
#[derive(Default)]
struct Effects {
    transitions: Vec<(Job, JobStatus)>,
}

impl Effects {
    fn fire(self, bus: &dyn NotificationBus) {
        for (job, status) in self.transitions {
            job.notify_subscribers(status);
            publish_guarded(bus, &JobEvent::new(&job, status));
        }
    }
}

/// Apply a transition under the registries lock
fn transition(
    reg: &mut Registries,
    job: &Job,
    status: JobStatus,
    failure: Option<Failure>,
    effects: &mut Effects,
) -> bool {
    match job.apply_status(status, failure) {
        Ok(true) => {
            log_transition(job, status);
            effects.transitions.push((job.clone(), status));
            reg.refresh_submission(job.submit_id());
            true
        }
        Ok(false) => false,
        Err(err) => {
            tracing::error!(job_id = %job.id(), error = %err, "rejected job transition");
            false
        }
    }
}

const fn is_cancelable(status: JobStatus) -> bool {
    matches!(
        status,
        JobStatus::Created | JobStatus::Pending | JobStatus::Blocked
    )
}

fn log_transition(job: &Job, status: JobStatus) {
    let job_id = job.id();
    let submit_id = job.submit_id();
    let task_id = job.task().id();
    match status {
        JobStatus::Created => {}
        JobStatus::Pending => tracing::debug!(%job_id, %submit_id, %task_id, "job pending"),
        JobStatus::Blocked => tracing::info!(%job_id, %submit_id, %task_id, "job blocked"),
        JobStatus::Skipped => tracing::info!(%job_id, %submit_id, %task_id, "job skipped"),
        JobStatus::Running => tracing::info!(%job_id, %submit_id, %task_id, "job dispatched"),
        JobStatus::Completed => tracing::info!(%job_id, %submit_id, %task_id, "job completed"),
        JobStatus::Failed => {
            let failure = job.failure().map(|f| f.to_string()).unwrap_or_default();
            tracing::warn!(%job_id, %submit_id, %task_id, %failure, "job failed");
        }
        JobStatus::Canceled => tracing::info!(%job_id, %submit_id, %task_id, "job canceled"),
        JobStatus::Abandoned => tracing::info!(%job_id, %submit_id, %task_id, "job abandoned"),
    }
}

/// A freshly created submission
#[derive(Debug)]
pub(crate) struct CreatedSubmission {
    pub(crate) jobs: Vec<Job>,
    /// Jobs left `PENDING`, in declaration order
    pub(crate) runnable: Vec<Job>,
}

/// Shared orchestration state
///
/// Built once and shared via `Arc` between the orchestrator and its
/// dispatcher.
#[derive(Debug)]
pub struct OrchestrationContext {
    store: Arc<dyn ArtifactStore>,
    functions: FunctionRegistry,
    catalog: Arc<dyn TaskCatalog>,
    config: ConfigHandle,
    bus: Arc<dyn NotificationBus>,
    registries: Mutex<Registries>,
}

impl OrchestrationContext {
    /// Create context with an empty catalog, default config and no bus
    #[must_use]
    pub fn new(store: Arc<dyn ArtifactStore>, functions: FunctionRegistry) -> Self {
        Self {
            store,
            functions,
            catalog: Arc::new(InMemoryTaskCatalog::new()),
            config: ConfigHandle::default(),
            bus: Arc::new(NoopBus),
            registries: Mutex::new(Registries::default()),
        }
    }

    /// With task catalog
    #[must_use]
    pub fn with_catalog(mut self, catalog: Arc<dyn TaskCatalog>) -> Self {
        self.catalog = catalog;
        self
    }

    /// With shared configuration
    #[must_use]
    pub fn with_config(mut self, config: ConfigHandle) -> Self {
        self.config = config;
        self
    }

    /// With notification bus
    #[must_use]
    pub fn with_bus(mut self, bus: Arc<dyn NotificationBus>) -> Self {
        self.bus = bus;
        self
    }

    /// Artifact store
    #[inline]
    #[must_use]
    pub fn store(&self) -> &Arc<dyn ArtifactStore> {
        &self.store
    }

    /// Work-unit registry
    #[inline]
    #[must_use]
    pub fn functions(&self) -> &FunctionRegistry {
        &self.functions
    }

    /// Task catalog
    #[inline]
    #[must_use]
    pub fn catalog(&self) -> &Arc<dyn TaskCatalog> {
        &self.catalog
    }

    /// Shared configuration
    #[inline]
    #[must_use]
    pub fn config(&self) -> &ConfigHandle {
        &self.config
    }

    /// Create a submission and its jobs atomically
    ///
    /// Skip decisions see artifact state before any output of this
    /// submission is locked. Every other job then locks its outputs, so a
    /// downstream job in the same submission blocks on its upstream. A
    /// storage failure while locking rolls the whole submission back.
    pub(crate) fn create_submission(
        &self,
        entity_id: &str,
        tasks: Vec<TaskDescriptor>,
        callbacks: &[Subscriber],
        force: bool,
    ) -> Result<CreatedSubmission, OrchestratorError> {
        let submit_id = SubmissionId::new();
        let jobs: Vec<Job> = tasks
            .into_iter()
            .map(|task| {
                let job = Job::new(task, submit_id, entity_id);
                for callback in callbacks {
                    job.add_subscriber(Arc::clone(callback));
                }
                job
            })
            .collect();

        let mut effects = Effects::default();
        let mut runnable = Vec::new();
        {
            let mut reg = self.registries.lock();
            let store = self.store.as_ref();
            let now = Utc::now();

            let skip: Vec<bool> = jobs
                .iter()
                .map(|job| {
                    BlockingResolver::decide(job.task(), store, force, now) == Decision::Skip
                })
                .collect();

            let mut conflicts = vec![BTreeSet::new(); jobs.len()];
            let mut locked: Vec<&Job> = Vec::new();
            for (idx, job) in jobs.iter().enumerate() {
                if skip[idx] {
                    continue;
                }
                match self.lock_outputs(job) {
                    Ok(held) => {
                        if held.is_empty() {
                            locked.push(job);
                        }
                        conflicts[idx] = held;
                    }
                    Err(err) => {
                        for job in locked {
                            self.unlock_outputs(job);
                        }
                        tracing::error!(%submit_id, error = %err, "submission rolled back");
                        return Err(err.into());
                    }
                }
            }

            for job in &jobs {
                reg.jobs.insert(job.id(), job.clone());
            }
            reg.submissions.insert(
                submit_id,
                Submission::new(
                    submit_id,
                    entity_id.to_string(),
                    jobs.iter().map(Job::id).collect(),
                ),
            );
            tracing::info!(%submit_id, entity_id, jobs = jobs.len(), "submission created");

            let mut skipped_outputs = Vec::new();
            for (idx, job) in jobs.iter().enumerate() {
                tracing::debug!(job_id = %job.id(), task_id = %job.task().id(), "job created");

                if skip[idx] {
                    transition(&mut reg, job, JobStatus::Skipped, None, &mut effects);
                    skipped_outputs.extend(job.task().outputs().iter().map(|a| a.id().clone()));
                    continue;
                }

                let mut waiting =
                    BlockingResolver::waiting_on(job.task(), store, &job.id().to_string());
                waiting.append(&mut conflicts[idx]);

                if waiting.is_empty() {
                    transition(&mut reg, job, JobStatus::Pending, None, &mut effects);
                    runnable.push(job.clone());
                } else {
                    tracing::debug!(job_id = %job.id(), waiting = ?waiting, "registering blocked job");
                    transition(&mut reg, job, JobStatus::Blocked, None, &mut effects);
                    reg.register_blocked(job.id(), waiting);
                }
            }

            runnable.extend(self.rescan_locked(&mut reg, &skipped_outputs, &mut effects));
            reg.refresh_submission(submit_id);
        }

        effects.fire(self.bus.as_ref());
        Ok(CreatedSubmission { jobs, runnable })
    }

    /// Move a `PENDING` job to `RUNNING` and materialize its inputs
    ///
    /// `None` if the job is no longer pending (canceled or abandoned while
    /// queued).
    pub(crate) fn start_job(&self, job: &Job) -> Option<Result<Vec<Value>, Failure>> {
        let mut effects = Effects::default();
        let started = {
            let mut reg = self.registries.lock();
            if job.status() != JobStatus::Pending
                || !transition(&mut reg, job, JobStatus::Running, None, &mut effects)
            {
                return None;
            }
            reg.in_flight.insert(job.id());

            job.task()
                .inputs()
                .iter()
                .map(|input| self.store.read(input))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|err| Failure::storage(&err))
        };
        effects.fire(self.bus.as_ref());
        Some(started)
    }

    /// Record the outcome of a `RUNNING` job
    ///
    /// Writes the outputs (stopping at the first storage error), completes or
    /// fails the job and runs [`on_job_finished`](Self::on_job_finished), all
    /// in one critical section. Returns the jobs released for dispatch.
    pub(crate) fn finish_job(&self, job: &Job, outcome: Result<Vec<Value>, Failure>) -> Vec<Job> {
        let mut effects = Effects::default();
        let runnable = {
            let mut reg = self.registries.lock();
            if job.status() != JobStatus::Running {
                tracing::warn!(job_id = %job.id(), status = %job.status(), "outcome for a job that is not running");
                return Vec::new();
            }

            let (status, failure) = match outcome.and_then(|values| self.write_outputs(job, values))
            {
                Ok(()) => (JobStatus::Completed, None),
                Err(failure) => (JobStatus::Failed, Some(failure)),
            };
            transition(&mut reg, job, status, failure, &mut effects);
            self.job_finished_locked(&mut reg, job, &mut effects)
        };
        effects.fire(self.bus.as_ref());
        runnable
    }

    /// Release everything a terminal job held
    ///
    /// Unlocks its outputs, abandons dependents of a failed or canceled job
    /// and re-scans blocked jobs waiting on the released artifacts. Returns
    /// the jobs now `PENDING`. Calling it twice for the same job is harmless.
    pub fn on_job_finished(&self, job: &Job) -> Vec<Job> {
        if !job.is_finished() {
            tracing::warn!(job_id = %job.id(), status = %job.status(), "job is not finished");
            return Vec::new();
        }

        let mut effects = Effects::default();
        let runnable = {
            let mut reg = self.registries.lock();
            self.job_finished_locked(&mut reg, job, &mut effects)
        };
        effects.fire(self.bus.as_ref());
        runnable
    }

    /// Cancel a job that has not started
    ///
    /// # Errors
    /// - `OrchestratorError::UnknownJob` for an unknown id
    /// - `OrchestratorError::InvalidCancel` once the job runs or is finished
    pub fn cancel(&self, job_id: JobId) -> Result<Vec<Job>, OrchestratorError> {
        let mut effects = Effects::default();
        let runnable = {
            let mut reg = self.registries.lock();
            let job = reg
                .jobs
                .get(&job_id)
                .cloned()
                .ok_or(OrchestratorError::UnknownJob(job_id))?;
            self.cancel_locked(&mut reg, &job, &mut effects)?
        };
        effects.fire(self.bus.as_ref());
        Ok(runnable)
    }

    /// Cancel every job of a submission that has not started
    ///
    /// Running jobs are left to finish. Returns the canceled ids and the
    /// jobs released for dispatch.
    ///
    /// # Errors
    /// `OrchestratorError::UnknownSubmission` for an unknown id
    pub fn cancel_submission(
        &self,
        id: SubmissionId,
    ) -> Result<(Vec<JobId>, Vec<Job>), OrchestratorError> {
        let mut effects = Effects::default();
        let mut canceled = Vec::new();
        let mut runnable = Vec::new();
        {
            let mut reg = self.registries.lock();
            if !reg.submissions.contains_key(&id) {
                return Err(OrchestratorError::UnknownSubmission(id));
            }

            // A cancel can release a sibling; repeat until none is left
            loop {
                let targets: Vec<Job> = reg
                    .submission_jobs(id)
                    .into_iter()
                    .filter(|job| is_cancelable(job.status()))
                    .collect();
                if targets.is_empty() {
                    break;
                }
                for job in targets {
                    if is_cancelable(job.status()) {
                        runnable.extend(self.cancel_locked(&mut reg, &job, &mut effects)?);
                        canceled.push(job.id());
                    }
                }
            }
        }
        effects.fire(self.bus.as_ref());

        runnable.retain(Job::is_pending);
        Ok((canceled, runnable))
    }

    /// Re-evaluate every blocked job
    ///
    /// For artifacts written outside the orchestrator. Returns the jobs now
    /// `PENDING`.
    pub fn rescan_blocked(&self) -> Vec<Job> {
        let mut effects = Effects::default();
        let runnable = {
            let mut reg = self.registries.lock();
            let ids: Vec<JobId> = reg.blocked.keys().copied().collect();
            self.release_ready(&mut reg, ids, &mut effects)
        };
        effects.fire(self.bus.as_ref());
        runnable
    }

    /// Remove a finished submission and its jobs
    ///
    /// # Errors
    /// - `OrchestratorError::UnknownSubmission` for an unknown id
    /// - `OrchestratorError::SubmissionNotFinished` while any job is live
    pub fn remove_submission(&self, id: SubmissionId) -> Result<Submission, OrchestratorError> {
        let mut reg = self.registries.lock();
        let jobs = reg.submission_jobs(id);
        if !reg.submissions.contains_key(&id) {
            return Err(OrchestratorError::UnknownSubmission(id));
        }
        if !jobs.iter().all(Job::is_finished) {
            return Err(OrchestratorError::SubmissionNotFinished(id));
        }

        for job in &jobs {
            reg.jobs.remove(&job.id());
        }
        tracing::debug!(submit_id = %id, "submission removed");
        reg.submissions
            .shift_remove(&id)
            .ok_or(OrchestratorError::UnknownSubmission(id))
    }

    /// Job by id
    #[must_use]
    pub fn job(&self, id: JobId) -> Option<Job> {
        self.registries.lock().jobs.get(&id).cloned()
    }

    /// Jobs of a submission in declaration order
    #[must_use]
    pub fn submission_jobs(&self, id: SubmissionId) -> Option<Vec<Job>> {
        let reg = self.registries.lock();
        reg.submissions
            .contains_key(&id)
            .then(|| reg.submission_jobs(id))
    }

    /// Submission by id
    #[must_use]
    pub fn submission(&self, id: SubmissionId) -> Option<Submission> {
        self.registries.lock().submissions.get(&id).cloned()
    }

    /// Stored status of a submission
    #[must_use]
    pub fn submission_status(&self, id: SubmissionId) -> Option<SubmissionStatus> {
        self.registries
            .lock()
            .submissions
            .get(&id)
            .map(Submission::status)
    }

    /// Blocked jobs in registration order
    #[must_use]
    pub fn blocked_jobs(&self) -> Vec<Job> {
        let reg = self.registries.lock();
        reg.blocked
            .keys()
            .filter_map(|id| reg.jobs.get(id).cloned())
            .collect()
    }

    /// Whether `id` is in the blocked registry
    #[must_use]
    pub fn is_blocked(&self, id: JobId) -> bool {
        self.registries.lock().blocked.contains_key(&id)
    }

    /// Artifacts a blocked job waits on
    #[must_use]
    pub fn waiting_on(&self, id: JobId) -> Option<BTreeSet<ArtifactId>> {
        self.registries.lock().blocked.get(&id).cloned()
    }

    /// Jobs started and not yet finished
    #[must_use]
    pub fn in_flight(&self) -> Vec<JobId> {
        self.registries.lock().in_flight.iter().copied().collect()
    }

    fn cancel_locked(
        &self,
        reg: &mut Registries,
        job: &Job,
        effects: &mut Effects,
    ) -> Result<Vec<Job>, OrchestratorError> {
        let status = job.status();
        if !is_cancelable(status) {
            return Err(OrchestratorError::InvalidCancel {
                job_id: job.id(),
                status,
            });
        }

        transition(reg, job, JobStatus::Canceled, None, effects);
        Ok(self.job_finished_locked(reg, job, effects))
    }

    fn job_finished_locked(
        &self,
        reg: &mut Registries,
        job: &Job,
        effects: &mut Effects,
    ) -> Vec<Job> {
        reg.in_flight.shift_remove(&job.id());
        reg.unregister_blocked(job.id());

        let mut released: IndexSet<ArtifactId> = self.unlock_outputs(job).into_iter().collect();
        if matches!(job.status(), JobStatus::Failed | JobStatus::Canceled) {
            for abandoned in self.abandon_dependents(reg, job, effects) {
                released.extend(self.unlock_outputs(&abandoned));
            }
        }

        let released: Vec<ArtifactId> = released.into_iter().collect();
        self.rescan_locked(reg, &released, effects)
    }

    /// Abandon not-started jobs of the same submission downstream of `job`
    fn abandon_dependents(
        &self,
        reg: &mut Registries,
        job: &Job,
        effects: &mut Effects,
    ) -> Vec<Job> {
        let candidates = reg.submission_jobs(job.submit_id());
        let mut frontier: Vec<ArtifactId> =
            job.task().outputs().iter().map(|a| a.id().clone()).collect();
        let mut seen: HashSet<ArtifactId> = frontier.iter().cloned().collect();
        let mut visited: HashSet<JobId> = HashSet::from([job.id()]);
        let mut abandoned = Vec::new();

        while let Some(artifact) = frontier.pop() {
            for candidate in &candidates {
                if visited.contains(&candidate.id())
                    || !candidate.task().inputs().iter().any(|i| *i.id() == artifact)
                {
                    continue;
                }
                visited.insert(candidate.id());

                if matches!(candidate.status(), JobStatus::Blocked | JobStatus::Pending) {
                    reg.unregister_blocked(candidate.id());
                    if transition(reg, candidate, JobStatus::Abandoned, None, effects) {
                        abandoned.push(candidate.clone());
                    }
                }

                for output in candidate.task().outputs() {
                    if seen.insert(output.id().clone()) {
                        frontier.push(output.id().clone());
                    }
                }
            }
        }
        abandoned
    }

    /// Re-scan jobs waiting on `artifacts`, in registration order
    fn rescan_locked(
        &self,
        reg: &mut Registries,
        artifacts: &[ArtifactId],
        effects: &mut Effects,
    ) -> Vec<Job> {
        let mut ids: Vec<JobId> = artifacts
            .iter()
            .filter_map(|artifact| reg.waiters.get(artifact))
            .flat_map(|ids| ids.iter().copied())
            .collect::<IndexSet<_>>()
            .into_iter()
            .collect();
        ids.sort_by_key(|id| reg.blocked.get_index_of(id).unwrap_or(usize::MAX));

        self.release_ready(reg, ids, effects)
    }

    fn release_ready(
        &self,
        reg: &mut Registries,
        ids: Vec<JobId>,
        effects: &mut Effects,
    ) -> Vec<Job> {
        let mut runnable = Vec::new();

        for id in ids {
            reg.unregister_blocked(id);
            let Some(job) = reg.jobs.get(&id).cloned() else {
                continue;
            };
            if job.status() != JobStatus::Blocked {
                continue;
            }

            let mut waiting =
                BlockingResolver::waiting_on(job.task(), self.store.as_ref(), &id.to_string());
            if waiting.is_empty() {
                waiting = match self.lock_outputs(&job) {
                    Ok(conflicts) => conflicts,
                    Err(err) => {
                        tracing::warn!(job_id = %id, error = %err, "output lock failed; job stays blocked");
                        job.task().outputs().iter().map(|a| a.id().clone()).collect()
                    }
                };
            }

            if waiting.is_empty() {
                tracing::info!(job_id = %id, "job released");
                if transition(reg, &job, JobStatus::Pending, None, effects) {
                    runnable.push(job);
                }
            } else {
                reg.register_blocked(id, waiting);
            }
        }
        runnable
    }

    /// Lock every output for `job`, all or nothing
    ///
    /// Returns the artifacts held by other jobs; when non-empty, nothing is
    /// left locked.
    fn lock_outputs(&self, job: &Job) -> Result<BTreeSet<ArtifactId>, StoreError> {
        let editor = job.id().to_string();
        let mut taken = Vec::new();
        let mut conflicts = BTreeSet::new();

        for output in job.task().outputs() {
            match self.store.set_edit_in_progress(output, true, &editor) {
                Ok(()) => taken.push(output),
                Err(StoreError::Locked { artifact, .. }) => {
                    conflicts.insert(artifact);
                }
                Err(err) => {
                    self.release(&taken, &editor);
                    return Err(err);
                }
            }
        }

        if !conflicts.is_empty() {
            self.release(&taken, &editor);
        }
        Ok(conflicts)
    }

    /// Unlock whatever `job` still holds; returns its output ids
    fn unlock_outputs(&self, job: &Job) -> Vec<ArtifactId> {
        let editor = job.id().to_string();
        let outputs: Vec<_> = job.task().outputs().iter().collect();
        self.release(&outputs, &editor);
        outputs.iter().map(|a| a.id().clone()).collect()
    }

    fn release(&self, artifacts: &[&DataArtifact], editor: &str) {
        for artifact in artifacts {
            // Held by someone else: not ours to release
            if self.store.metadata(artifact).editor.as_deref() != Some(editor) {
                continue;
            }
            if let Err(err) = self.store.set_edit_in_progress(artifact, false, editor) {
                tracing::warn!(artifact = %artifact.id(), error = %err, "failed to release output lock");
            }
        }
    }

    fn write_outputs(&self, job: &Job, values: Vec<Value>) -> Result<(), Failure> {
        let editor = job.id().to_string();
        for (output, value) in job.task().outputs().iter().zip(values) {
            self.store
                .write(output, value, Some(&editor))
                .map_err(|err| Failure::storage(&err))?;
        }
        Ok(())
    }
}
