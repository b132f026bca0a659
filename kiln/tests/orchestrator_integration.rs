//! Integration tests for the kiln orchestrator.
//!
//! Exercises the job state machine against scripted fake gateways:
//! lifecycle transitions, teardown invariants, abort delivery, wait
//! timeouts and result observation.

use std::sync::Arc;
use std::time::Duration;

use kiln::config::TimeoutPolicy;
use kiln::gateway::ResultBatch;
use kiln::{
    Error, JobEventPayload, JobId, JobState, Orchestrator, ResultCursor,
};
use kiln_testkit::{
    fast_orchestrator_config, local_spec, sphere_model_source, three_targets, DeployBehavior,
    FakeDeployer, FakeProvisioner, ProvisionBehavior,
};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

fn build_orchestrator(provisioner: &FakeProvisioner, deployer: &FakeDeployer) -> Orchestrator {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();

    Orchestrator::builder()
        .with_config(fast_orchestrator_config())
        .with_provisioner(Arc::new(provisioner.clone()))
        .with_deployer(Arc::new(deployer.clone()))
        .build()
        .expect("orchestrator should build")
}

async fn load_sphere(orchestrator: &Orchestrator) {
    orchestrator
        .load_model("sphere", sphere_model_source(), false)
        .await
        .expect("model should load");
}

#[tokio::test]
async fn test_submit_then_poll_reports_created_and_empty() {
    let provisioner = FakeProvisioner::new();
    let deployer = FakeDeployer::new();
    let orchestrator = build_orchestrator(&provisioner, &deployer);
    load_sphere(&orchestrator).await;

    let job_id = orchestrator.submit("sphere", local_spec()).await.unwrap();
    let snapshot = orchestrator.poll(&job_id).await.unwrap();

    assert_eq!(snapshot.state, JobState::Created);
    assert!(snapshot.targets.is_empty());
    assert!(snapshot.failure.is_none());
    assert_eq!(provisioner.acquire_count(), 0, "submit must not provision");
}

#[tokio::test]
async fn test_unknown_job_id_fails_everywhere_without_mutation() {
    let provisioner = FakeProvisioner::new();
    let deployer = FakeDeployer::new();
    let orchestrator = build_orchestrator(&provisioner, &deployer);

    let ghost = JobId::new();
    let mut cursor = ResultCursor::new();

    assert!(matches!(
        orchestrator.start(&ghost).await.unwrap_err(),
        Error::JobNotFound(_)
    ));
    assert!(matches!(
        orchestrator.abort(&ghost).await.unwrap_err(),
        Error::JobNotFound(_)
    ));
    assert!(matches!(
        orchestrator.poll(&ghost).await.unwrap_err(),
        Error::JobNotFound(_)
    ));
    assert!(matches!(
        orchestrator.await_result(&ghost, Some(WAIT)).await.unwrap_err(),
        Error::JobNotFound(_)
    ));
    assert!(matches!(
        orchestrator
            .has_new_results(&mut cursor, Some(&ghost))
            .await
            .unwrap_err(),
        Error::JobNotFound(_)
    ));

    assert!(orchestrator.job_ids().await.is_empty());
    assert_eq!(provisioner.acquire_count(), 0);
    assert_eq!(deployer.deploy_count(), 0);
}

#[tokio::test]
async fn test_submit_unknown_model_fails() {
    let provisioner = FakeProvisioner::new();
    let deployer = FakeDeployer::new();
    let orchestrator = build_orchestrator(&provisioner, &deployer);

    let err = orchestrator
        .submit("ackley", local_spec())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ModelNotFound(name) if name == "ackley"));
    assert!(orchestrator.job_ids().await.is_empty());
}

#[tokio::test]
async fn test_invalid_config_allocates_no_job() {
    let provisioner = FakeProvisioner::new();
    let deployer = FakeDeployer::new();
    let orchestrator = build_orchestrator(&provisioner, &deployer);
    load_sphere(&orchestrator).await;

    let mut spec = local_spec();
    spec.anneal.thread_count = -1;

    let err = orchestrator.submit("sphere", spec).await.unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
    assert!(orchestrator.job_ids().await.is_empty());
}

#[tokio::test]
async fn test_start_is_not_idempotent() {
    let provisioner = FakeProvisioner::new();
    let deployer = FakeDeployer::new();
    let orchestrator = build_orchestrator(&provisioner, &deployer);
    load_sphere(&orchestrator).await;

    let job_id = orchestrator.submit("sphere", local_spec()).await.unwrap();
    orchestrator.start(&job_id).await.unwrap();

    let snapshot = orchestrator
        .await_result(&job_id, Some(WAIT))
        .await
        .unwrap();
    assert_eq!(snapshot.state, JobState::Completed);

    let err = orchestrator.start(&job_id).await.unwrap_err();
    assert!(matches!(err, Error::InvalidState { .. }));

    // The failed restart leaves the first outcome untouched.
    let snapshot = orchestrator.poll(&job_id).await.unwrap();
    assert_eq!(snapshot.state, JobState::Completed);
}

#[tokio::test]
async fn test_local_run_completes_with_reported_targets() {
    let provisioner = FakeProvisioner::new();
    let deployer = FakeDeployer::new();
    deployer.set_batch(ResultBatch {
        targets: three_targets(),
        complete: true,
    });
    let orchestrator = build_orchestrator(&provisioner, &deployer);
    load_sphere(&orchestrator).await;

    let mut spec = local_spec();
    spec.anneal.max_steps = 12_000;
    spec.anneal.thread_count = 8;

    let job_id = orchestrator.submit("sphere", spec).await.unwrap();
    orchestrator.start(&job_id).await.unwrap();

    let snapshot = orchestrator
        .await_result(&job_id, Some(WAIT))
        .await
        .unwrap();

    assert_eq!(snapshot.state, JobState::Completed);
    assert_eq!(snapshot.targets, three_targets());
    assert_eq!(snapshot.best_target().unwrap().score, 0.0125);

    provisioner.assert_all_released();
    assert!(snapshot.orphaned_backends.is_empty());
}

#[tokio::test]
async fn test_partial_deployment_failure_releases_every_backend() {
    let provisioner = FakeProvisioner::new();
    let deployer = FakeDeployer::with_behavior(DeployBehavior::FailAfter { successes: 1 });
    let orchestrator = build_orchestrator(&provisioner, &deployer);
    load_sphere(&orchestrator).await;

    let mut spec = local_spec();
    spec.execution.worker_count = 2;

    let job_id = orchestrator.submit("sphere", spec).await.unwrap();
    orchestrator.start(&job_id).await.unwrap();

    let snapshot = orchestrator
        .await_result(&job_id, Some(WAIT))
        .await
        .unwrap();

    assert_eq!(snapshot.state, JobState::Failed);
    assert!(snapshot.failure.unwrap().contains("deployment"));

    // Both backends were provisioned; one was even deployed
    // successfully. All of them must be torn down anyway.
    assert_eq!(provisioner.acquire_count(), 2);
    assert_eq!(provisioner.release_count(), 2);
    provisioner.assert_all_released();
}

#[tokio::test]
async fn test_permanent_provisioning_failure_fails_job() {
    let provisioner = FakeProvisioner::with_behavior(ProvisionBehavior::Fail { transient: false });
    let deployer = FakeDeployer::new();
    let orchestrator = build_orchestrator(&provisioner, &deployer);
    load_sphere(&orchestrator).await;

    let job_id = orchestrator.submit("sphere", local_spec()).await.unwrap();
    orchestrator.start(&job_id).await.unwrap();

    let snapshot = orchestrator
        .await_result(&job_id, Some(WAIT))
        .await
        .unwrap();

    assert_eq!(snapshot.state, JobState::Failed);
    assert!(snapshot.failure.unwrap().contains("provisioning"));
    assert_eq!(deployer.deploy_count(), 0);
}

#[tokio::test]
async fn test_transient_provisioning_failures_are_retried() {
    let provisioner =
        FakeProvisioner::with_behavior(ProvisionBehavior::FlakyThenSucceed { failures: 2 });
    let deployer = FakeDeployer::new();
    let orchestrator = build_orchestrator(&provisioner, &deployer);
    load_sphere(&orchestrator).await;

    let job_id = orchestrator.submit("sphere", local_spec()).await.unwrap();
    orchestrator.start(&job_id).await.unwrap();

    let snapshot = orchestrator
        .await_result(&job_id, Some(WAIT))
        .await
        .unwrap();

    // Two transient failures fit inside the three-attempt budget.
    assert_eq!(snapshot.state, JobState::Completed);
    provisioner.assert_all_released();
}

#[tokio::test]
async fn test_transient_deployment_failures_are_retried() {
    let provisioner = FakeProvisioner::new();
    let deployer = FakeDeployer::with_behavior(DeployBehavior::FlakyThenSucceed { failures: 2 });
    deployer.set_batch(ResultBatch {
        targets: three_targets(),
        complete: true,
    });
    let orchestrator = build_orchestrator(&provisioner, &deployer);
    load_sphere(&orchestrator).await;

    let job_id = orchestrator.submit("sphere", local_spec()).await.unwrap();
    orchestrator.start(&job_id).await.unwrap();

    let snapshot = orchestrator
        .await_result(&job_id, Some(WAIT))
        .await
        .unwrap();

    assert_eq!(snapshot.state, JobState::Completed);
    assert_eq!(snapshot.targets, three_targets());
    provisioner.assert_all_released();
}

#[tokio::test]
async fn test_transient_failures_beyond_budget_fail_job() {
    let provisioner =
        FakeProvisioner::with_behavior(ProvisionBehavior::FlakyThenSucceed { failures: 10 });
    let deployer = FakeDeployer::new();
    let orchestrator = build_orchestrator(&provisioner, &deployer);
    load_sphere(&orchestrator).await;

    let job_id = orchestrator.submit("sphere", local_spec()).await.unwrap();
    orchestrator.start(&job_id).await.unwrap();

    let snapshot = orchestrator
        .await_result(&job_id, Some(WAIT))
        .await
        .unwrap();

    assert_eq!(snapshot.state, JobState::Failed);
}

#[tokio::test]
async fn test_await_result_timeout_leaves_state_untouched() {
    let provisioner = FakeProvisioner::new();
    let deployer = FakeDeployer::new();
    // Never completes: the job stays in Running.
    deployer.set_batch(ResultBatch {
        targets: Vec::new(),
        complete: false,
    });
    let orchestrator = build_orchestrator(&provisioner, &deployer);
    load_sphere(&orchestrator).await;

    let job_id = orchestrator.submit("sphere", local_spec()).await.unwrap();
    orchestrator.start(&job_id).await.unwrap();

    // Wait until the job settles in Running before the timed wait.
    let settled = tokio::time::Instant::now() + WAIT;
    loop {
        let snapshot = orchestrator.poll(&job_id).await.unwrap();
        if snapshot.state == JobState::Running {
            break;
        }
        assert!(
            tokio::time::Instant::now() < settled,
            "job never reached Running, stuck in {}",
            snapshot.state
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let err = orchestrator
        .await_result(&job_id, Some(Duration::from_millis(100)))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::WaitTimeout(_)));

    let snapshot = orchestrator.poll(&job_id).await.unwrap();
    assert_eq!(snapshot.state, JobState::Running);
    assert!(snapshot.failure.is_none());

    orchestrator.abort(&job_id).await.unwrap();
    let snapshot = orchestrator
        .await_result(&job_id, Some(WAIT))
        .await
        .unwrap();
    assert_eq!(snapshot.state, JobState::Aborted);
}

#[tokio::test]
async fn test_concurrent_aborts_are_safe() {
    let provisioner = FakeProvisioner::with_behavior(ProvisionBehavior::Hang);
    let deployer = FakeDeployer::new();
    let orchestrator = Arc::new(build_orchestrator(&provisioner, &deployer));
    load_sphere(&orchestrator).await;

    let job_id = orchestrator.submit("sphere", local_spec()).await.unwrap();
    orchestrator.start(&job_id).await.unwrap();

    let aborts: Vec<_> = (0..4)
        .map(|_| {
            let orchestrator = Arc::clone(&orchestrator);
            tokio::spawn(async move { orchestrator.abort(&job_id).await })
        })
        .collect();

    for result in futures::future::join_all(aborts).await {
        result.expect("abort task panicked").expect("abort failed");
    }

    let snapshot = orchestrator
        .await_result(&job_id, Some(WAIT))
        .await
        .unwrap();
    assert_eq!(snapshot.state, JobState::Aborted);

    // Aborting again once terminal stays a no-op.
    orchestrator.abort(&job_id).await.unwrap();
}

#[tokio::test]
async fn test_abort_lands_while_blocked_in_provisioning() {
    let provisioner = FakeProvisioner::with_behavior(ProvisionBehavior::Hang);
    let deployer = FakeDeployer::new();
    let orchestrator = build_orchestrator(&provisioner, &deployer);
    load_sphere(&orchestrator).await;

    let job_id = orchestrator.submit("sphere", local_spec()).await.unwrap();
    orchestrator.start(&job_id).await.unwrap();

    // Give the driver time to enter the hanging acquire call.
    tokio::time::sleep(Duration::from_millis(50)).await;
    orchestrator.abort(&job_id).await.unwrap();

    let snapshot = timeout(WAIT, orchestrator.await_result(&job_id, None))
        .await
        .expect("abort should not wait for the hanging gateway call")
        .unwrap();
    assert_eq!(snapshot.state, JobState::Aborted);
}

#[tokio::test]
async fn test_abort_of_created_job_finishes_directly() {
    let provisioner = FakeProvisioner::new();
    let deployer = FakeDeployer::new();
    let orchestrator = build_orchestrator(&provisioner, &deployer);
    load_sphere(&orchestrator).await;

    let job_id = orchestrator.submit("sphere", local_spec()).await.unwrap();
    orchestrator.abort(&job_id).await.unwrap();

    let snapshot = orchestrator.poll(&job_id).await.unwrap();
    assert_eq!(snapshot.state, JobState::Aborted);

    // A started abort is final: start now reports the illegal state.
    assert!(matches!(
        orchestrator.start(&job_id).await.unwrap_err(),
        Error::InvalidState { .. }
    ));
}

#[tokio::test]
async fn test_failed_release_is_escalated_as_orphan() {
    let provisioner = FakeProvisioner::new();
    provisioner.set_release_fails(true);
    let deployer = FakeDeployer::new();
    let orchestrator = build_orchestrator(&provisioner, &deployer);
    load_sphere(&orchestrator).await;

    let mut events = orchestrator.subscribe_events();

    let mut spec = local_spec();
    spec.execution.worker_count = 2;

    let job_id = orchestrator.submit("sphere", spec).await.unwrap();
    orchestrator.start(&job_id).await.unwrap();

    let snapshot = orchestrator
        .await_result(&job_id, Some(WAIT))
        .await
        .unwrap();
    assert_eq!(snapshot.state, JobState::Completed);

    // The release attempts happen after the terminal transition; wait
    // for both orphan escalations on the event bus.
    let mut orphaned = 0;
    while orphaned < 2 {
        let event = timeout(WAIT, events.recv())
            .await
            .expect("expected orphan events")
            .expect("event bus closed");
        if matches!(event.payload, JobEventPayload::BackendOrphaned { .. }) {
            orphaned += 1;
        }
    }

    let snapshot = orchestrator.poll(&job_id).await.unwrap();
    assert_eq!(snapshot.orphaned_backends.len(), 2);
}

#[tokio::test]
async fn test_provisioning_timeout_fails_job() {
    let provisioner = FakeProvisioner::with_behavior(ProvisionBehavior::Hang);
    let deployer = FakeDeployer::new();
    let orchestrator = build_orchestrator(&provisioner, &deployer);
    load_sphere(&orchestrator).await;

    let mut spec = local_spec();
    spec.execution.timeouts.provision_ms = 50;

    let job_id = orchestrator.submit("sphere", spec).await.unwrap();
    orchestrator.start(&job_id).await.unwrap();

    let snapshot = orchestrator
        .await_result(&job_id, Some(WAIT))
        .await
        .unwrap();
    assert_eq!(snapshot.state, JobState::Failed);
    assert!(snapshot.failure.unwrap().contains("provisioning"));
}

#[tokio::test]
async fn test_optimization_timeout_fails_job_with_teardown() {
    let provisioner = FakeProvisioner::new();
    let deployer = FakeDeployer::new();
    deployer.set_batch(ResultBatch {
        targets: Vec::new(),
        complete: false,
    });
    let orchestrator = build_orchestrator(&provisioner, &deployer);
    load_sphere(&orchestrator).await;

    let mut spec = local_spec();
    spec.execution.timeouts.optimization = TimeoutPolicy::After { ms: 100 };

    let job_id = orchestrator.submit("sphere", spec).await.unwrap();
    orchestrator.start(&job_id).await.unwrap();

    let snapshot = orchestrator
        .await_result(&job_id, Some(WAIT))
        .await
        .unwrap();
    assert_eq!(snapshot.state, JobState::Failed);
    assert!(snapshot.failure.unwrap().contains("optimization"));
    provisioner.assert_all_released();
}

#[tokio::test]
async fn test_has_new_results_tracks_per_caller_cursor() {
    let provisioner = FakeProvisioner::new();
    let deployer = FakeDeployer::new();
    deployer.set_batch(ResultBatch {
        targets: three_targets(),
        complete: true,
    });
    let orchestrator = build_orchestrator(&provisioner, &deployer);
    load_sphere(&orchestrator).await;

    let mut cursor = ResultCursor::new();
    assert!(!orchestrator
        .has_new_results(&mut cursor, None)
        .await
        .unwrap());

    let job_id = orchestrator.submit("sphere", local_spec()).await.unwrap();
    orchestrator.start(&job_id).await.unwrap();
    orchestrator
        .await_result(&job_id, Some(WAIT))
        .await
        .unwrap();

    assert!(orchestrator
        .has_new_results(&mut cursor, Some(&job_id))
        .await
        .unwrap());
    assert!(!orchestrator
        .has_new_results(&mut cursor, Some(&job_id))
        .await
        .unwrap());

    // A different caller context has its own watermark.
    let mut other = ResultCursor::new();
    assert!(orchestrator
        .has_new_results(&mut other, None)
        .await
        .unwrap());
}

#[tokio::test]
async fn test_dry_run_touches_no_gateways() {
    let provisioner = FakeProvisioner::new();
    let deployer = FakeDeployer::new();
    let orchestrator = build_orchestrator(&provisioner, &deployer);
    load_sphere(&orchestrator).await;

    orchestrator.dry_run("sphere", &local_spec()).await.unwrap();

    assert!(orchestrator.job_ids().await.is_empty());
    assert_eq!(provisioner.acquire_count(), 0);
    assert_eq!(deployer.deploy_count(), 0);

    let mut bad = local_spec();
    bad.anneal.max_steps = -1;
    assert!(matches!(
        orchestrator.dry_run("sphere", &bad).await.unwrap_err(),
        Error::Validation(_)
    ));
}

#[tokio::test]
async fn test_model_unloaded_between_submit_and_start_fails_job() {
    let provisioner = FakeProvisioner::new();
    let deployer = FakeDeployer::new();
    let orchestrator = build_orchestrator(&provisioner, &deployer);
    load_sphere(&orchestrator).await;

    let job_id = orchestrator.submit("sphere", local_spec()).await.unwrap();
    orchestrator.unload_model("sphere").await;

    // start itself succeeds; the failure is absorbed into job state.
    orchestrator.start(&job_id).await.unwrap();

    let snapshot = orchestrator
        .await_result(&job_id, Some(WAIT))
        .await
        .unwrap();
    assert_eq!(snapshot.state, JobState::Failed);
    assert!(snapshot.failure.unwrap().contains("no longer loaded"));
    assert_eq!(provisioner.acquire_count(), 0);
}

#[tokio::test]
async fn test_jobs_progress_independently() {
    let provisioner = FakeProvisioner::new();
    let deployer = FakeDeployer::new();
    deployer.set_batch(ResultBatch {
        targets: three_targets(),
        complete: true,
    });
    let orchestrator = build_orchestrator(&provisioner, &deployer);
    load_sphere(&orchestrator).await;

    // One job is stuck behind a hanging gateway...
    provisioner.set_behavior(ProvisionBehavior::Hang);
    let stuck = orchestrator.submit("sphere", local_spec()).await.unwrap();
    orchestrator.start(&stuck).await.unwrap();

    // Let the stuck driver enter its hanging acquire call before the
    // gateway is scripted back to success.
    tokio::time::sleep(Duration::from_millis(50)).await;

    // ...while another provisions and completes unhindered.
    provisioner.set_behavior(ProvisionBehavior::Succeed);
    let fast = orchestrator.submit("sphere", local_spec()).await.unwrap();
    orchestrator.start(&fast).await.unwrap();

    let snapshot = orchestrator.await_result(&fast, Some(WAIT)).await.unwrap();
    assert_eq!(snapshot.state, JobState::Completed);

    let snapshot = orchestrator.poll(&stuck).await.unwrap();
    assert_eq!(snapshot.state, JobState::Provisioning);

    orchestrator.abort(&stuck).await.unwrap();
    orchestrator
        .await_result(&stuck, Some(WAIT))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_lifecycle_events_are_published_in_order() {
    let provisioner = FakeProvisioner::new();
    let deployer = FakeDeployer::new();
    let orchestrator = build_orchestrator(&provisioner, &deployer);
    load_sphere(&orchestrator).await;

    let mut events = orchestrator.subscribe_events();

    let job_id = orchestrator.submit("sphere", local_spec()).await.unwrap();
    orchestrator.start(&job_id).await.unwrap();
    orchestrator
        .await_result(&job_id, Some(WAIT))
        .await
        .unwrap();

    let mut states = Vec::new();
    loop {
        let event = timeout(WAIT, events.recv())
            .await
            .expect("expected lifecycle events")
            .expect("event bus closed");
        match event.payload {
            JobEventPayload::StateChanged { to, .. } => {
                states.push(to);
                if to.is_terminal() {
                    break;
                }
            }
            _ => {}
        }
    }

    assert_eq!(
        states,
        vec![
            JobState::Provisioning,
            JobState::Deploying,
            JobState::Running,
            JobState::Completed,
        ]
    );
}

#[tokio::test]
async fn test_shutdown_aborts_inflight_jobs_and_releases_backends() {
    let provisioner = FakeProvisioner::new();
    let deployer = FakeDeployer::new();
    deployer.set_batch(ResultBatch {
        targets: Vec::new(),
        complete: false,
    });
    let orchestrator = build_orchestrator(&provisioner, &deployer);
    load_sphere(&orchestrator).await;

    let running = orchestrator.submit("sphere", local_spec()).await.unwrap();
    orchestrator.start(&running).await.unwrap();
    let idle = orchestrator.submit("sphere", local_spec()).await.unwrap();

    // Let the running job reach its polling loop.
    orchestrator
        .await_result(&running, Some(Duration::from_millis(200)))
        .await
        .unwrap_err();

    timeout(WAIT, orchestrator.shutdown())
        .await
        .expect("shutdown should finish promptly")
        .unwrap();

    let snapshot = orchestrator.poll(&running).await.unwrap();
    assert_eq!(snapshot.state, JobState::Aborted);
    let snapshot = orchestrator.poll(&idle).await.unwrap();
    assert_eq!(snapshot.state, JobState::Aborted);

    provisioner.assert_all_released();
}
