//! Testing utilities for the jobflow workspace
//!
//! Shared work units, the foo/bar/baz scenario, recording subscribers and a
//! gate for holding pool workers.

#![allow(missing_docs)]
#![allow(clippy::missing_panics_doc)]

use jobflow_artifact::{ArtifactStore, DataArtifact, InMemoryArtifactStore, Scope, Value};
use jobflow_core::{
    ExecutionConfig, FunctionRegistry, InMemoryTaskCatalog, Job, JobId, JobStatus,
    OrchestrationContext, Orchestrator, Sequence, Submittable, Subscriber, TaskDescriptor,
    TaskError, TaskId,
};
use parking_lot::{Condvar, Mutex};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Initialize test logging (call once per test module)
pub fn init_test_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("jobflow=debug")),
        )
        .with_test_writer()
        .try_init();
}

pub fn artifact(id: &str) -> DataArtifact {
    DataArtifact::new(id, Scope::Scenario)
}

fn int(inputs: &[Value], idx: usize) -> Result<i64, TaskError> {
    inputs
        .get(idx)
        .and_then(Value::as_i64)
        .ok_or_else(|| TaskError::failed(format!("input {idx} is not an integer")))
}

/// Registry with the work units used across tests
///
/// - `double`, `triple`: first input times 2 or 3
/// - `pair`: `[x, x + 1]`
/// - `constant`: `42`
/// - `noop`: `null`
/// - `fail`: task error
/// - `panic`: panics
/// - `mutate_config`: tries to set a configuration property
/// - `read_region`: returns the `region` property
pub fn functions() -> FunctionRegistry {
    let registry = FunctionRegistry::new();
    registry
        .register("double", |_ctx, inputs| Ok(json!(int(&inputs, 0)? * 2)))
        .register("triple", |_ctx, inputs| Ok(json!(int(&inputs, 0)? * 3)))
        .register("pair", |_ctx, inputs| {
            let x = int(&inputs, 0)?;
            Ok(json!([x, x + 1]))
        })
        .register("constant", |_ctx, _inputs| Ok(json!(42)))
        .register("noop", |_ctx, _inputs| Ok(Value::Null))
        .register("fail", |_ctx, _inputs| Err(TaskError::failed("boom")))
        .register("panic", |_ctx, _inputs| panic!("work unit crashed"))
        .register("mutate_config", |ctx, _inputs| {
            ctx.config().set_property("region", "us")?;
            Ok(Value::Null)
        })
        .register("read_region", |ctx, _inputs| {
            Ok(json!(ctx.config().property("region")))
        });
    registry
}

/// Context over `store` and `functions` with a default config
pub fn context(
    store: &Arc<InMemoryArtifactStore>,
    functions: FunctionRegistry,
) -> Arc<OrchestrationContext> {
    Arc::new(OrchestrationContext::new(store.clone(), functions))
}

pub fn inline_orchestrator(ctx: Arc<OrchestrationContext>) -> Orchestrator {
    Orchestrator::new(&ExecutionConfig::inline(), ctx).expect("inline orchestrator")
}

pub fn pooled_orchestrator(ctx: Arc<OrchestrationContext>, max_workers: usize) -> Orchestrator {
    Orchestrator::new(&ExecutionConfig::pooled(max_workers), ctx).expect("pooled orchestrator")
}

/// `foo = 1; t1: bar = foo * 2; t2: baz = bar * 3`
pub struct FooBarBaz {
    pub store: Arc<InMemoryArtifactStore>,
    pub foo: DataArtifact,
    pub bar: DataArtifact,
    pub baz: DataArtifact,
    pub t1: TaskDescriptor,
    pub t2: TaskDescriptor,
}

impl FooBarBaz {
    pub fn new() -> Self {
        let store = Arc::new(InMemoryArtifactStore::new());
        let foo = artifact("foo");
        let bar = artifact("bar");
        let baz = artifact("baz");
        store.write(&foo, json!(1), None).expect("seed foo");

        let t1 = TaskDescriptor::new("t1", "double")
            .with_inputs(vec![foo.clone()])
            .with_outputs(vec![bar.clone()]);
        let t2 = TaskDescriptor::new("t2", "triple")
            .with_inputs(vec![bar.clone()])
            .with_outputs(vec![baz.clone()]);

        Self {
            store,
            foo,
            bar,
            baz,
            t1,
            t2,
        }
    }

    /// Catalog holding `t1` and `t2`
    pub fn catalog(&self) -> Arc<InMemoryTaskCatalog> {
        Arc::new([self.t1.clone(), self.t2.clone()].into_iter().collect())
    }

    /// Scenario with one sequence `[t1, t2]`
    pub fn scenario(&self) -> Submittable {
        Submittable::scenario(
            "scenario",
            vec![Sequence::new(
                "sequence",
                vec![TaskId::from("t1"), TaskId::from("t2")],
            )],
        )
    }

    /// Context with the catalog and `functions`
    pub fn context(&self, functions: FunctionRegistry) -> Arc<OrchestrationContext> {
        Arc::new(
            OrchestrationContext::new(self.store.clone(), functions).with_catalog(self.catalog()),
        )
    }

    pub fn read(&self, artifact: &DataArtifact) -> Option<Value> {
        self.store.read(artifact).ok()
    }
}

impl Default for FooBarBaz {
    fn default() -> Self {
        Self::new()
    }
}

/// Subscriber recording every notification it receives
#[derive(Debug, Clone, Default)]
pub struct Recorder {
    events: Arc<Mutex<Vec<(JobId, JobStatus)>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscriber(&self) -> Subscriber {
        let events = Arc::clone(&self.events);
        Arc::new(move |job: &Job| events.lock().push((job.id(), job.status())))
    }

    pub fn events(&self) -> Vec<(JobId, JobStatus)> {
        self.events.lock().clone()
    }

    pub fn statuses_for(&self, id: JobId) -> Vec<JobStatus> {
        self.events
            .lock()
            .iter()
            .filter(|(job, _)| *job == id)
            .map(|(_, status)| *status)
            .collect()
    }
}

/// Gate holding work units until opened
#[derive(Debug, Default)]
pub struct Gate {
    open: Mutex<bool>,
    cond: Condvar,
}

impl Gate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn open(&self) {
        *self.open.lock() = true;
        self.cond.notify_all();
    }

    /// Wait until opened; gives up after `timeout` so a broken test cannot hang
    pub fn wait(&self, timeout: Duration) {
        let mut open = self.open.lock();
        if !*open {
            let _ = self.cond.wait_while_for(&mut open, |open| !*open, timeout);
        }
    }
}

/// Tracks how many work units run at once
#[derive(Debug, Default)]
pub struct ConcurrencyProbe {
    current: AtomicUsize,
    max: AtomicUsize,
    calls: AtomicUsize,
}

impl ConcurrencyProbe {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn enter(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
    }

    pub fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn max(&self) -> usize {
        self.max.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

/// Register `gated`: waits on `gate` while tracked by `probe`, returns 1
pub fn register_gated(functions: &FunctionRegistry, gate: Arc<Gate>, probe: Arc<ConcurrencyProbe>) {
    functions.register("gated", move |_ctx, _inputs| {
        probe.enter();
        gate.wait(Duration::from_secs(10));
        probe.exit();
        Ok(json!(1))
    });
}

/// Register `counted`: counts invocations, returns the count
pub fn register_counted(functions: &FunctionRegistry, probe: Arc<ConcurrencyProbe>) {
    functions.register("counted", move |_ctx, _inputs| {
        probe.enter();
        probe.exit();
        Ok(json!(probe.calls()))
    });
}
