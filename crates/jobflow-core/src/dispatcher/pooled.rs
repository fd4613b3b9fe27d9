//! Pooled dispatcher: bounded worker threads plus a reaper
//!
//! Slots are reserved under the pool lock before a job leaves `PENDING`, so
//! at most `max_workers` jobs are ever `RUNNING`. The reaper thread receives
//! outcomes, lets the context write outputs and release blocked jobs, then
//! refills free slots from the pending queue.

use super::worker::{worker_loop, WorkOrder, WorkOutcome};
use super::Dispatcher;
use crate::config::ExecutionMode;
use crate::error::DispatchError;
use crate::job::{Failure, FailureKind, Job, JobId};
use crate::orchestrator::OrchestrationContext;
use crossbeam::channel::{self, Receiver, Sender};
use jobflow_artifact::Value;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Pool statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Configured pool size
    pub max_workers: usize,
    /// Live worker threads
    pub workers: usize,
    /// Jobs occupying a slot
    pub running: usize,
    /// Pending jobs waiting for a slot
    pub queued: usize,
    /// Orders sent to workers
    pub dispatched: usize,
    /// Workers lost and respawned
    pub workers_lost: usize,
}

#[derive(Debug, Default)]
struct PoolState {
    queue: VecDeque<Job>,
    running: HashMap<JobId, Job>,
    workers: Vec<(usize, JoinHandle<()>)>,
    next_worker: usize,
    dispatched: usize,
    workers_lost: usize,
    shut_down: bool,
}

#[derive(Debug)]
struct PoolShared {
    ctx: Arc<OrchestrationContext>,
    max_workers: usize,
    state: Mutex<PoolState>,
    order_tx: Mutex<Option<Sender<WorkOrder>>>,
    order_rx: Receiver<WorkOrder>,
    outcome_tx: Mutex<Option<Sender<WorkOutcome>>>,
}

impl PoolShared {
    fn spawn_worker(&self) -> Result<(), DispatchError> {
        let Some(outcomes) = self.outcome_tx.lock().clone() else {
            return Err(DispatchError::ShutDown);
        };
        let mut state = self.state.lock();
        let index = state.next_worker;
        let functions = self.ctx.functions().clone();
        let orders = self.order_rx.clone();

        let handle = thread::Builder::new()
            .name(format!("jobflow-worker-{index}"))
            .spawn(move || worker_loop(index, functions, orders, outcomes))
            .map_err(|e| DispatchError::WorkerSpawn(e.to_string()))?;

        state.next_worker += 1;
        state.workers.push((index, handle));
        Ok(())
    }

    /// Queue jobs, or cancel them once shut down
    fn enqueue(&self, jobs: Vec<Job>) {
        let mut pending: VecDeque<Job> = jobs.into();
        while let Some(job) = pending.pop_front() {
            {
                let mut state = self.state.lock();
                if !state.shut_down {
                    state.queue.push_back(job);
                    continue;
                }
            }
            pending.extend(self.cancel_queued(&job));
        }
    }

    fn cancel_queued(&self, job: &Job) -> Vec<Job> {
        match self.ctx.cancel(job.id()) {
            Ok(released) => released,
            Err(err) => {
                tracing::debug!(job_id = %job.id(), error = %err, "queued job not canceled");
                Vec::new()
            }
        }
    }

    /// Start queued jobs while slots are free
    fn fill_slots(&self) {
        loop {
            let job = {
                let mut state = self.state.lock();
                if state.shut_down || state.running.len() >= self.max_workers {
                    return;
                }
                let Some(job) = state.queue.pop_front() else {
                    return;
                };
                state.running.insert(job.id(), job.clone());
                job
            };

            let started = self.ctx.start_job(&job);
            let released = match started {
                None => Vec::new(),
                Some(Ok(inputs)) => match self.send_order(&job, inputs) {
                    Ok(()) => continue,
                    Err(failure) => self.ctx.finish_job(&job, Err(failure)),
                },
                Some(Err(failure)) => self.ctx.finish_job(&job, Err(failure)),
            };

            self.state.lock().running.remove(&job.id());
            self.enqueue(released);
        }
    }

    fn send_order(&self, job: &Job, inputs: Vec<Value>) -> Result<(), Failure> {
        let task = job.task();
        let config_snapshot = self
            .ctx
            .config()
            .snapshot()
            .map_err(|err| Failure::new(FailureKind::TaskExecution, err.to_string()))?;

        let order = WorkOrder {
            job_id: job.id(),
            task_id: task.id().clone(),
            function: task.function().clone(),
            inputs,
            output_count: task.outputs().len(),
            config_snapshot,
        };

        let sent = self
            .order_tx
            .lock()
            .as_ref()
            .map(|tx| tx.send(order).is_ok())
            .unwrap_or(false);
        if !sent {
            return Err(Failure::new(
                FailureKind::WorkerProcessLost,
                "worker pool is shut down",
            ));
        }

        self.state.lock().dispatched += 1;
        tracing::debug!(job_id = %job.id(), "order sent to pool");
        Ok(())
    }

    fn handle_outcome(&self, outcome: WorkOutcome) {
        if outcome.lost {
            let shut_down = {
                let mut state = self.state.lock();
                state.workers_lost += 1;
                // A lost worker exits right after reporting; drop its handle
                state.workers.retain(|(index, _)| *index != outcome.worker);
                state.shut_down
            };
            if !shut_down {
                if let Err(err) = self.spawn_worker() {
                    tracing::error!(error = %err, "failed to replace lost worker");
                }
            }
        }

        let job = self.state.lock().running.get(&outcome.job_id).cloned();
        let Some(job) = job else {
            tracing::warn!(job_id = %outcome.job_id, "outcome for unknown job");
            return;
        };

        let released = self.ctx.finish_job(&job, outcome.result);
        self.state.lock().running.remove(&job.id());
        self.enqueue(released);
    }
}

fn reaper_loop(shared: Arc<PoolShared>, outcomes: Receiver<WorkOutcome>) {
    tracing::debug!("reaper started");
    for outcome in outcomes.iter() {
        shared.handle_outcome(outcome);
        shared.fill_slots();
    }
    tracing::debug!("reaper stopped");
}

/// Dispatcher running jobs on `max_workers` worker threads
#[derive(Debug)]
pub struct PooledDispatcher {
    shared: Arc<PoolShared>,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl PooledDispatcher {
    /// Start `max_workers` workers and the reaper
    ///
    /// # Errors
    /// - `DispatchError::InvalidWorkerCount` if `max_workers` is 0
    /// - `DispatchError::WorkerSpawn` if a thread cannot start
    pub fn new(ctx: Arc<OrchestrationContext>, max_workers: usize) -> Result<Self, DispatchError> {
        if max_workers == 0 {
            return Err(DispatchError::InvalidWorkerCount(max_workers));
        }

        let (order_tx, order_rx) = channel::unbounded();
        let (outcome_tx, outcome_rx) = channel::unbounded();
        let shared = Arc::new(PoolShared {
            ctx,
            max_workers,
            state: Mutex::new(PoolState::default()),
            order_tx: Mutex::new(Some(order_tx)),
            order_rx,
            outcome_tx: Mutex::new(Some(outcome_tx)),
        });

        for _ in 0..max_workers {
            shared.spawn_worker()?;
        }

        let reaper_shared = Arc::clone(&shared);
        let reaper = thread::Builder::new()
            .name("jobflow-reaper".to_string())
            .spawn(move || reaper_loop(reaper_shared, outcome_rx))
            .map_err(|e| DispatchError::WorkerSpawn(e.to_string()))?;

        tracing::info!(max_workers, "worker pool started");
        Ok(Self {
            shared,
            reaper: Mutex::new(Some(reaper)),
        })
    }

    /// Current pool statistics
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let state = self.shared.state.lock();
        PoolStats {
            max_workers: self.shared.max_workers,
            workers: state.workers.len(),
            running: state.running.len(),
            queued: state.queue.len(),
            dispatched: state.dispatched,
            workers_lost: state.workers_lost,
        }
    }
}

impl Dispatcher for PooledDispatcher {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Pooled
    }

    fn dispatch(&self, job: Job) -> Result<(), DispatchError> {
        {
            let mut state = self.shared.state.lock();
            if state.shut_down {
                return Err(DispatchError::ShutDown);
            }
            state.queue.push_back(job);
        }
        self.shared.fill_slots();
        Ok(())
    }

    fn running_count(&self) -> usize {
        self.shared.state.lock().running.len()
    }

    fn is_shut_down(&self) -> bool {
        self.shared.state.lock().shut_down
    }

    fn shutdown(&self, wait: bool) {
        let queued: Vec<Job> = {
            let mut state = self.shared.state.lock();
            if state.shut_down {
                return;
            }
            state.shut_down = true;
            state.queue.drain(..).collect()
        };

        for job in &queued {
            let released = self.shared.cancel_queued(job);
            self.shared.enqueue(released);
        }

        // Closing the order channel stops workers once it is drained; the
        // reaper stops once the last worker drops its outcome sender.
        self.shared.order_tx.lock().take();
        self.shared.outcome_tx.lock().take();
        tracing::info!(canceled = queued.len(), "worker pool shutting down");

        if !wait {
            return;
        }

        let workers: Vec<JoinHandle<()>> = self
            .shared
            .state
            .lock()
            .workers
            .drain(..)
            .map(|(_, handle)| handle)
            .collect();
        let reaper = self.reaper.lock().take();
        let current = thread::current().id();

        for handle in workers.into_iter().chain(reaper) {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                tracing::warn!("pool thread panicked");
            }
        }
    }
}

impl Drop for PooledDispatcher {
    fn drop(&mut self) {
        self.shutdown(false);
    }
}
