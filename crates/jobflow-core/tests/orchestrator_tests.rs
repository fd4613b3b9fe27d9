use jobflow_artifact::{ArtifactStore, InMemoryArtifactStore};
use jobflow_core::{
    ChannelBus, ConfigHandle, DispatchError, ExecutionConfig, FailureKind, InMemoryTaskCatalog,
    JobStatus, OrchestrationContext, Orchestrator, OrchestratorError, Sequence, SubmissionStatus,
    SubmitOptions, Submittable, TaskDescriptor, TaskId,
};
use jobflow_test_utils::{
    artifact, context, functions, init_test_logging, inline_orchestrator, register_counted,
    ConcurrencyProbe, FooBarBaz, Recorder,
};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

#[test]
fn test_scenario_chain_completes() {
    init_test_logging();
    let fixture = FooBarBaz::new();
    let orchestrator = inline_orchestrator(fixture.context(functions()));
    let recorder = Recorder::new();

    let mut options = SubmitOptions::new();
    options.callbacks.push(recorder.subscriber());
    let jobs = orchestrator.submit(&fixture.scenario(), options).unwrap();

    assert_eq!(jobs.len(), 2);
    let (j1, j2) = (&jobs[0], &jobs[1]);
    assert!(j1.is_completed());
    assert!(j2.is_completed());
    assert_eq!(
        j2.history(),
        vec![
            JobStatus::Created,
            JobStatus::Blocked,
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Completed
        ]
    );

    assert_eq!(fixture.read(&fixture.bar), Some(json!(2)));
    assert_eq!(fixture.read(&fixture.baz), Some(json!(6)));
    assert_eq!(
        orchestrator.submission_status(j1.submit_id()),
        Some(SubmissionStatus::Completed)
    );
    assert_eq!(j1.submit_entity_id(), "scenario");

    // t2 only started after t1 completed
    let events = recorder.events();
    let t1_done = events
        .iter()
        .position(|e| *e == (j1.id(), JobStatus::Completed))
        .unwrap();
    let t2_running = events
        .iter()
        .position(|e| *e == (j2.id(), JobStatus::Running))
        .unwrap();
    assert!(t1_done < t2_running);
    assert!(orchestrator.blocked_jobs().is_empty());
}

#[test]
fn test_shared_tasks_scheduled_once() {
    let fixture = FooBarBaz::new();
    let orchestrator = inline_orchestrator(fixture.context(functions()));
    let scenario = Submittable::scenario(
        "scenario",
        vec![
            Sequence::new("first", vec![TaskId::from("t1")]),
            Sequence::new("second", vec![TaskId::from("t1"), TaskId::from("t2")]),
        ],
    );

    let jobs = orchestrator.submit(&scenario, SubmitOptions::new()).unwrap();
    let tasks: Vec<&str> = jobs.iter().map(|j| j.task().id().0.as_str()).collect();
    assert_eq!(tasks, vec!["t1", "t2"]);
}

#[test]
fn test_fresh_skippable_task_is_skipped() {
    let fixture = FooBarBaz::new();
    let probe = ConcurrencyProbe::new();
    let registry = functions();
    register_counted(&registry, probe.clone());
    let orchestrator = inline_orchestrator(context(&fixture.store, registry));

    fixture.store.write(&fixture.bar, json!(99), None).unwrap();
    let task = TaskDescriptor::new("t1", "counted")
        .with_inputs(vec![fixture.foo.clone()])
        .with_outputs(vec![fixture.bar.clone()])
        .skippable(true);

    let job = orchestrator
        .submit_task(task.clone(), SubmitOptions::new())
        .unwrap();
    assert!(job.is_skipped());
    assert_eq!(probe.calls(), 0);
    assert_eq!(fixture.read(&fixture.bar), Some(json!(99)));
    assert_eq!(
        orchestrator.submission_status(job.submit_id()),
        Some(SubmissionStatus::Completed)
    );

    // force bypasses the skip
    let job = orchestrator
        .submit_task(task, SubmitOptions::new().force(true))
        .unwrap();
    assert!(job.is_completed());
    assert_eq!(probe.calls(), 1);
}

#[test]
fn test_stale_output_is_recomputed() {
    let fixture = FooBarBaz::new();
    let orchestrator = inline_orchestrator(context(&fixture.store, functions()));
    let bar = artifact("bar").with_validity(Duration::from_secs(60));
    fixture
        .store
        .write_at(&bar, json!(0), chrono::Utc::now() - chrono::Duration::hours(1))
        .unwrap();

    let task = TaskDescriptor::new("t1", "double")
        .with_inputs(vec![fixture.foo.clone()])
        .with_outputs(vec![bar.clone()])
        .skippable(true);
    let job = orchestrator.submit_task(task, SubmitOptions::new()).unwrap();

    assert!(job.is_completed());
    assert_eq!(fixture.read(&bar), Some(json!(2)));
}

#[test]
fn test_zero_output_task_is_never_skipped() {
    let store = Arc::new(InMemoryArtifactStore::new());
    let probe = ConcurrencyProbe::new();
    let registry = functions();
    register_counted(&registry, probe.clone());
    let orchestrator = inline_orchestrator(context(&store, registry));

    for _ in 0..2 {
        let task = TaskDescriptor::new("report", "counted").skippable(true);
        let job = orchestrator.submit_task(task, SubmitOptions::new()).unwrap();
        assert!(job.is_completed());
    }
    assert_eq!(probe.calls(), 2);
}

#[test]
fn test_zero_output_task_waits_for_inputs() {
    let fixture = FooBarBaz::new();
    let probe = ConcurrencyProbe::new();
    let registry = functions();
    register_counted(&registry, probe.clone());
    let sink = TaskDescriptor::new("sink", "counted").with_inputs(vec![fixture.bar.clone()]);
    let catalog: InMemoryTaskCatalog = [sink, fixture.t1.clone()].into_iter().collect();
    let ctx = Arc::new(
        OrchestrationContext::new(fixture.store.clone(), registry).with_catalog(Arc::new(catalog)),
    );
    let orchestrator = inline_orchestrator(ctx);

    // Declared before its upstream: must still wait for bar
    let submittable = Submittable::Sequence(Sequence::new(
        "report",
        vec![TaskId::from("sink"), TaskId::from("t1")],
    ));
    let jobs = orchestrator.submit(&submittable, SubmitOptions::new()).unwrap();

    assert!(jobs.iter().all(|j| j.is_completed()));
    assert_eq!(
        jobs[0].history(),
        vec![
            JobStatus::Created,
            JobStatus::Blocked,
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Completed
        ]
    );
    assert_eq!(probe.calls(), 1);
}

#[test]
fn test_zero_output_task_blocked_by_edit() {
    let fixture = FooBarBaz::new();
    let orchestrator = inline_orchestrator(context(&fixture.store, functions()));
    fixture.store.write(&fixture.bar, json!(100), None).unwrap();
    fixture
        .store
        .set_edit_in_progress(&fixture.bar, true, "external")
        .unwrap();

    let sink = TaskDescriptor::new("sink", "noop").with_inputs(vec![fixture.bar.clone()]);
    let job = orchestrator.submit_task(sink, SubmitOptions::new()).unwrap();
    assert!(job.is_blocked());
    assert!(orchestrator.is_blocked(&job));

    fixture
        .store
        .write(&fixture.bar, json!(1), Some("external"))
        .unwrap();
    orchestrator.rescan_blocked();
    assert!(job.is_completed());
}

#[test]
fn test_input_being_edited_blocks_until_released() {
    let fixture = FooBarBaz::new();
    let orchestrator = inline_orchestrator(context(&fixture.store, functions()));
    fixture
        .store
        .set_edit_in_progress(&fixture.foo, true, "external")
        .unwrap();

    let job = orchestrator
        .submit_task(fixture.t1.clone(), SubmitOptions::new())
        .unwrap();
    assert!(job.is_blocked());
    assert!(orchestrator.is_blocked(&job));
    assert_eq!(orchestrator.blocked_jobs(), vec![job.clone()]);
    assert_eq!(
        orchestrator.submission_status(job.submit_id()),
        Some(SubmissionStatus::Blocked)
    );

    // Nothing changes until the writer finishes
    orchestrator.rescan_blocked();
    assert!(job.is_blocked());

    fixture
        .store
        .write(&fixture.foo, json!(5), Some("external"))
        .unwrap();
    orchestrator.rescan_blocked();

    assert!(job.is_completed());
    assert!(!orchestrator.is_blocked(&job));
    assert_eq!(fixture.read(&fixture.bar), Some(json!(10)));
}

#[test]
fn test_failure_abandons_transitive_dependents() {
    let fixture = FooBarBaz::new();
    let qux = artifact("qux");
    let report = artifact("report");
    let catalog: InMemoryTaskCatalog = [
        TaskDescriptor::new("t1", "fail")
            .with_inputs(vec![fixture.foo.clone()])
            .with_outputs(vec![fixture.bar.clone()]),
        fixture.t2.clone(),
        TaskDescriptor::new("t3", "double")
            .with_inputs(vec![fixture.baz.clone()])
            .with_outputs(vec![report.clone()]),
        TaskDescriptor::new("t4", "double")
            .with_inputs(vec![fixture.foo.clone()])
            .with_outputs(vec![qux.clone()]),
    ]
    .into_iter()
    .collect();
    let ctx = Arc::new(
        OrchestrationContext::new(fixture.store.clone(), functions())
            .with_catalog(Arc::new(catalog)),
    );
    let orchestrator = inline_orchestrator(ctx);

    let submittable = Submittable::Sequence(Sequence::new(
        "pipeline",
        ["t1", "t2", "t3", "t4"].map(TaskId::from).to_vec(),
    ));
    let jobs = orchestrator.submit(&submittable, SubmitOptions::new()).unwrap();
    let statuses: Vec<JobStatus> = jobs.iter().map(|j| j.status()).collect();

    assert_eq!(
        statuses,
        vec![
            JobStatus::Failed,
            JobStatus::Abandoned,
            JobStatus::Abandoned,
            JobStatus::Completed
        ]
    );
    let failure = jobs[0].failure().unwrap();
    assert_eq!(failure.kind, FailureKind::TaskExecution);
    assert!(failure.message.contains("boom"));

    assert_eq!(fixture.read(&fixture.bar), None);
    assert_eq!(fixture.read(&report), None);
    assert_eq!(fixture.read(&qux), Some(json!(2)));
    for output in [&fixture.bar, &fixture.baz, &report] {
        assert!(!fixture.store.metadata(output).edit_in_progress);
    }

    assert_eq!(
        orchestrator.submission_status(jobs[0].submit_id()),
        Some(SubmissionStatus::Failed)
    );
    assert!(orchestrator.blocked_jobs().is_empty());
}

#[test]
fn test_two_submits_are_disjoint() {
    let fixture = FooBarBaz::new();
    let orchestrator = inline_orchestrator(fixture.context(functions()));

    let first = orchestrator
        .submit(&fixture.scenario(), SubmitOptions::new())
        .unwrap();
    let second = orchestrator
        .submit(&fixture.scenario(), SubmitOptions::new())
        .unwrap();

    assert_ne!(first[0].submit_id(), second[0].submit_id());
    let first_ids: HashSet<_> = first.iter().map(|j| j.id()).collect();
    assert!(second.iter().all(|j| !first_ids.contains(&j.id())));
    assert!(second.iter().all(|j| j.is_completed()));
}

#[test]
fn test_output_arity() {
    let store = Arc::new(InMemoryArtifactStore::new());
    let orchestrator = inline_orchestrator(context(&store, functions()));
    let seed = artifact("seed");
    let (x, y) = (artifact("x"), artifact("y"));
    store.write(&seed, json!(1), None).unwrap();

    // Scalar for two outputs: nothing written
    let task = TaskDescriptor::new("split", "constant").with_outputs(vec![x.clone(), y.clone()]);
    let job = orchestrator.submit_task(task, SubmitOptions::new()).unwrap();
    assert!(job.is_failed());
    assert_eq!(job.failure().unwrap().kind, FailureKind::OutputArityMismatch);
    assert!(store.read(&x).is_err());
    assert!(store.read(&y).is_err());
    assert!(!store.metadata(&x).edit_in_progress);

    // Matching sequence is unpacked
    let task = TaskDescriptor::new("split", "pair")
        .with_inputs(vec![seed.clone()])
        .with_outputs(vec![x.clone(), y.clone()]);
    assert!(orchestrator
        .submit_task(task, SubmitOptions::new())
        .unwrap()
        .is_completed());
    assert_eq!(store.read(&x).unwrap(), json!(1));
    assert_eq!(store.read(&y).unwrap(), json!(2));

    // A single output keeps the sequence whole
    let whole = artifact("whole");
    let task = TaskDescriptor::new("keep", "pair")
        .with_inputs(vec![seed])
        .with_outputs(vec![whole.clone()]);
    orchestrator.submit_task(task, SubmitOptions::new()).unwrap();
    assert_eq!(store.read(&whole).unwrap(), json!([1, 2]));
}

#[test]
fn test_config_mutation_from_work_unit_fails_job() {
    let store = Arc::new(InMemoryArtifactStore::new());
    let config = ConfigHandle::default();
    config.set_property("region", "eu").unwrap();
    let ctx = Arc::new(OrchestrationContext::new(store, functions()).with_config(config.clone()));
    let orchestrator = inline_orchestrator(ctx);

    let job = orchestrator
        .submit_task(
            TaskDescriptor::new("mutate", "mutate_config"),
            SubmitOptions::new(),
        )
        .unwrap();

    assert!(job.is_failed());
    assert_eq!(
        job.failure().unwrap().kind,
        FailureKind::ConfigurationMutationBlocked
    );
    assert_eq!(config.property("region").as_deref(), Some("eu"));

    // Guard is released once the job is done
    assert!(!config.is_guarded());
    config.set_property("region", "us").unwrap();
}

#[test]
fn test_cancel() {
    let fixture = FooBarBaz::new();
    let orchestrator = inline_orchestrator(fixture.context(functions()));
    fixture
        .store
        .set_edit_in_progress(&fixture.foo, true, "external")
        .unwrap();

    let jobs = orchestrator
        .submit(&fixture.scenario(), SubmitOptions::new())
        .unwrap();
    assert!(jobs.iter().all(|j| j.is_blocked()));

    orchestrator.cancel(&jobs[0]).unwrap();
    assert!(jobs[0].is_canceled());
    assert!(jobs[1].is_abandoned());
    assert!(!fixture.store.metadata(&fixture.bar).edit_in_progress);
    assert!(!fixture.store.metadata(&fixture.baz).edit_in_progress);
    assert!(orchestrator.blocked_jobs().is_empty());
    assert_eq!(
        orchestrator.submission_status(jobs[0].submit_id()),
        Some(SubmissionStatus::Canceled)
    );

    let err = orchestrator.cancel(&jobs[0]).unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::InvalidCancel {
            status: JobStatus::Canceled,
            ..
        }
    ));
}

#[test]
fn test_cancel_finished_job_rejected() {
    let fixture = FooBarBaz::new();
    let orchestrator = inline_orchestrator(context(&fixture.store, functions()));
    let job = orchestrator
        .submit_task(fixture.t1.clone(), SubmitOptions::new())
        .unwrap();

    assert!(matches!(
        orchestrator.cancel(&job),
        Err(OrchestratorError::InvalidCancel {
            status: JobStatus::Completed,
            ..
        })
    ));
    assert!(job.is_completed());
}

#[test]
fn test_cancel_submission() {
    let fixture = FooBarBaz::new();
    let orchestrator = inline_orchestrator(fixture.context(functions()));
    fixture
        .store
        .set_edit_in_progress(&fixture.foo, true, "external")
        .unwrap();

    let jobs = orchestrator
        .submit(&fixture.scenario(), SubmitOptions::new())
        .unwrap();
    let canceled = orchestrator.cancel_submission(jobs[0].submit_id()).unwrap();

    assert_eq!(canceled, vec![jobs[0].id()]);
    assert!(jobs[1].is_abandoned());
    assert!(jobs.iter().all(|j| j.is_finished()));
}

#[test]
fn test_malformed_submissions_rejected() {
    let fixture = FooBarBaz::new();
    let orchestrator = inline_orchestrator(fixture.context(functions()));

    let err = orchestrator
        .submit(&Submittable::Task(TaskId::from("nope")), SubmitOptions::new())
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::UnknownTask(ref id) if id.0 == "nope"));

    let err = orchestrator
        .submit_task(TaskDescriptor::new("t", "unregistered"), SubmitOptions::new())
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::UnknownFunction { .. }));

    let x = artifact("x");
    let err = orchestrator
        .submit_task(
            TaskDescriptor::new("loop", "double")
                .with_inputs(vec![x.clone()])
                .with_outputs(vec![x]),
            SubmitOptions::new(),
        )
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::CyclicDependency(_)));

    // Rejected submissions leave nothing behind
    assert!(orchestrator.blocked_jobs().is_empty());
    assert!(!fixture.store.metadata(&artifact("x")).edit_in_progress);
}

#[test]
fn test_subscribers_and_bus() {
    let fixture = FooBarBaz::new();
    let (bus, events) = ChannelBus::new();
    let ctx = Arc::new(
        OrchestrationContext::new(fixture.store.clone(), functions()).with_bus(Arc::new(bus)),
    );
    let orchestrator = inline_orchestrator(ctx);
    let recorder = Recorder::new();

    // A panicking subscriber must not disturb the others
    let mut options = SubmitOptions::new().with_callback(|_job| panic!("subscriber bug"));
    options.callbacks.push(recorder.subscriber());

    let job = orchestrator
        .submit_task(fixture.t1.clone(), options)
        .unwrap();

    assert!(job.is_completed());
    assert_eq!(
        recorder.statuses_for(job.id()),
        vec![JobStatus::Running, JobStatus::Completed]
    );

    let published: Vec<JobStatus> = events.try_iter().map(|e| e.status).collect();
    assert_eq!(
        published,
        vec![JobStatus::Pending, JobStatus::Running, JobStatus::Completed]
    );
}

#[test]
fn test_remove_submission() {
    let fixture = FooBarBaz::new();
    let orchestrator = inline_orchestrator(fixture.context(functions()));
    fixture
        .store
        .set_edit_in_progress(&fixture.foo, true, "external")
        .unwrap();

    let blocked = orchestrator
        .submit_task(fixture.t1.clone(), SubmitOptions::new())
        .unwrap();
    assert!(matches!(
        orchestrator.remove_submission(blocked.submit_id()),
        Err(OrchestratorError::SubmissionNotFinished(_))
    ));

    orchestrator.cancel(&blocked).unwrap();
    let removed = orchestrator.remove_submission(blocked.submit_id()).unwrap();
    assert_eq!(removed.job_ids(), &[blocked.id()]);
    assert!(orchestrator.job(blocked.id()).is_none());
    assert!(orchestrator.submission(blocked.submit_id()).is_none());
}

#[test]
fn test_invalid_execution_config_is_fatal() {
    let store = Arc::new(InMemoryArtifactStore::new());
    let ctx = context(&store, functions());

    let config = ExecutionConfig {
        mode: "cluster".to_string(),
        max_workers: 2,
    };
    assert_eq!(
        Orchestrator::new(&config, ctx.clone()).unwrap_err(),
        DispatchError::ModeNotAvailable("cluster".to_string())
    );
    assert_eq!(
        Orchestrator::new(&ExecutionConfig::pooled(0), ctx).unwrap_err(),
        DispatchError::InvalidWorkerCount(0)
    );
}

#[test]
fn test_shutdown_rejects_new_work() {
    let fixture = FooBarBaz::new();
    let orchestrator = inline_orchestrator(context(&fixture.store, functions()));
    orchestrator.shutdown(true);

    let err = orchestrator
        .submit_task(fixture.t1.clone(), SubmitOptions::new())
        .unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::Dispatch(DispatchError::ShutDown)
    ));
}
