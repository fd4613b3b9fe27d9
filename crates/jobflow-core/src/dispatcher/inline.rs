//! Inline dispatcher: runs jobs on the calling thread

use super::{invoke_catching, Dispatcher};
use crate::config::ExecutionMode;
use crate::error::DispatchError;
use crate::job::Job;
use crate::logging::job_span;
use crate::orchestrator::OrchestrationContext;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Synchronous dispatcher
///
/// `dispatch` returns once the job has finished and every job it released
/// has been run. Released jobs are drained through a queue, so long chains
/// do not grow the stack.
#[derive(Debug)]
pub struct InlineDispatcher {
    ctx: Arc<OrchestrationContext>,
    running: AtomicUsize,
    shut_down: AtomicBool,
}

impl InlineDispatcher {
    /// Create dispatcher over `ctx`
    #[must_use]
    pub fn new(ctx: Arc<OrchestrationContext>) -> Self {
        Self {
            ctx,
            running: AtomicUsize::new(0),
            shut_down: AtomicBool::new(false),
        }
    }

    fn execute(&self, job: &Job) -> Vec<Job> {
        let span = job_span(job);
        let _entered = span.enter();

        let Some(started) = self.ctx.start_job(job) else {
            tracing::debug!("job no longer pending; skipping");
            return Vec::new();
        };

        self.running.fetch_add(1, Ordering::SeqCst);
        let outcome = started.and_then(|inputs| invoke_catching(&self.ctx, job, inputs));
        self.running.fetch_sub(1, Ordering::SeqCst);

        self.ctx.finish_job(job, outcome)
    }
}

impl Dispatcher for InlineDispatcher {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Inline
    }

    fn dispatch(&self, job: Job) -> Result<(), DispatchError> {
        if self.is_shut_down() {
            return Err(DispatchError::ShutDown);
        }

        let mut queue = VecDeque::from([job]);
        while let Some(job) = queue.pop_front() {
            queue.extend(self.execute(&job));
        }
        Ok(())
    }

    fn running_count(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    fn shutdown(&self, _wait: bool) {
        if !self.shut_down.swap(true, Ordering::SeqCst) {
            tracing::info!("inline dispatcher shut down");
        }
    }
}
