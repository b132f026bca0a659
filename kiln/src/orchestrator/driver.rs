use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tracing::Instrument;

use crate::config::{
    ExecutionMode, ExecutionTarget, GatewayTimeouts, JobSpec, ResultPersistence,
};
use crate::error::Error;
use crate::events::{JobEvent, JobEventPayload, JobEventSink};
use crate::gateway::{
    attempts_exhausted, compute_retry_delay, BackendHandle, BackendRole,
    DeploymentGateway, DeploymentHandle, DeploymentPayload, GatewayRetryConfig,
    ProvisioningGateway, SizingHints,
};
use crate::job::{JobId, JobState, Target};
use crate::model::Model;
use crate::telemetry;

use super::{JobSlot, OrchestratorConfig};

/// Token for delivering cooperative cancellation to a job's driver.
///
/// `abort` cancels the token; the driver observes it between and during
/// gateway calls via `select!`, so cancellation lands even while a
/// provisioning or deployment call is in flight.
#[derive(Clone, Debug)]
pub struct CancelToken {
    inner: Arc<CancelTokenInner>,
}

#[derive(Debug)]
struct CancelTokenInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    /// Create a new cancel token.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CancelTokenInner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Signal cancellation.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Check if cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Wait until cancelled.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        self.inner.notify.notified().await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Why the pipeline stopped short of completion.
enum PhaseError {
    Cancelled,
    Failed(Error),
}

/// Drive one job from `Provisioning` to a terminal state.
///
/// Runs on the job's own task so that a blocked gateway call for this
/// job never stalls another job's progress. Every failure path releases
/// every backend that was ever acquired.
pub(crate) async fn drive(
    slot: Arc<JobSlot>,
    model: Model,
    spec: JobSpec,
    provisioner: Arc<dyn ProvisioningGateway>,
    deployer: Arc<dyn DeploymentGateway>,
    events: Arc<dyn JobEventSink>,
    config: OrchestratorConfig,
) {
    let (job_id, mode) = {
        let record = slot.record.lock().await;
        (record.id, record.mode)
    };

    let mut acquired: Vec<BackendHandle> = Vec::new();
    let outcome = run_pipeline(
        &slot,
        job_id,
        mode,
        &model,
        &spec,
        provisioner.as_ref(),
        deployer.as_ref(),
        events.as_ref(),
        &config,
        &mut acquired,
    )
    .await;

    {
        let mut record = slot.record.lock().await;
        match &outcome {
            Ok(()) => {
                slot.transition(&mut record, JobState::Completed, events.as_ref());
            }
            Err(PhaseError::Cancelled) => {
                slot.transition(&mut record, JobState::Aborted, events.as_ref());
            }
            Err(PhaseError::Failed(err)) => {
                record.failure = Some(err.to_string());
                slot.transition(&mut record, JobState::Failed, events.as_ref());
            }
        }
    }

    // Teardown runs on every path, including success and abort. It is
    // not cancellable: leaving a provisioned backend behind costs money.
    release_fleet(&slot, job_id, provisioner.as_ref(), &acquired, events.as_ref()).await;

    if outcome.is_ok() {
        persist_results(&slot, &spec).await;
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_pipeline(
    slot: &Arc<JobSlot>,
    job_id: JobId,
    mode: ExecutionMode,
    model: &Model,
    spec: &JobSpec,
    provisioner: &dyn ProvisioningGateway,
    deployer: &dyn DeploymentGateway,
    events: &dyn JobEventSink,
    config: &OrchestratorConfig,
    acquired: &mut Vec<BackendHandle>,
) -> Result<(), PhaseError> {
    let cancel = slot.cancel.clone();
    if cancel.is_cancelled() {
        return Err(PhaseError::Cancelled);
    }

    let timeouts = &spec.execution.timeouts;
    let hints = sizing_hints(spec);
    let worker_count = spec.execution.worker_count as usize;

    for _ in 0..worker_count {
        let handle = acquire_with_retry(
            job_id,
            mode,
            &hints,
            timeouts,
            provisioner,
            &config.retry,
            &cancel,
        )
        .instrument(telemetry::provision_span(job_id.to_string(), mode.as_str()))
        .await?;

        {
            let mut record = slot.record.lock().await;
            record.backends.push(handle.id);
        }
        acquired.push(handle);
    }

    advance(slot, JobState::Deploying, events).await?;

    let payload = DeploymentPayload {
        job_id,
        model: model.clone(),
        anneal: spec.anneal.clone(),
    };
    let mut deployments = Vec::with_capacity(acquired.len());
    for backend in acquired.iter() {
        let deployment = deploy_with_retry(
            job_id,
            backend,
            &payload,
            timeouts,
            deployer,
            &config.retry,
            &cancel,
        )
        .instrument(telemetry::deploy_span(job_id.to_string(), acquired.len()))
        .await?;
        deployments.push(deployment);
    }

    advance(slot, JobState::Running, events).await?;

    collect_results(
        slot,
        job_id,
        &deployments,
        deployer,
        events,
        config,
        timeouts,
        &cancel,
    )
    .instrument(telemetry::run_span(job_id.to_string()))
    .await
}

/// Apply a transition, treating a refused transition (the job went
/// terminal under us, which only abort can cause) as cancellation.
async fn advance(
    slot: &Arc<JobSlot>,
    to: JobState,
    events: &dyn JobEventSink,
) -> Result<(), PhaseError> {
    let mut record = slot.record.lock().await;
    if slot.transition(&mut record, to, events) {
        Ok(())
    } else {
        Err(PhaseError::Cancelled)
    }
}

fn sizing_hints(spec: &JobSpec) -> SizingHints {
    match &spec.execution.target {
        ExecutionTarget::LocalDocker => SizingHints::worker(),
        ExecutionTarget::Cloud {
            region,
            worker_instance_type,
            ..
        } => SizingHints {
            role: BackendRole::Worker,
            instance_type: Some(worker_instance_type.clone()),
            region: Some(region.clone()),
        },
    }
}

/// Acquire one backend, retrying transient failures with exponential
/// backoff up to the configured attempt budget.
async fn acquire_with_retry(
    job_id: JobId,
    mode: ExecutionMode,
    hints: &SizingHints,
    timeouts: &GatewayTimeouts,
    provisioner: &dyn ProvisioningGateway,
    retry: &GatewayRetryConfig,
    cancel: &CancelToken,
) -> Result<BackendHandle, PhaseError> {
    let mut attempts: u16 = 0;
    loop {
        attempts += 1;
        let started = Instant::now();
        let attempt =
            tokio::time::timeout(timeouts.provision(), provisioner.acquire(mode, hints, timeouts));

        let result = tokio::select! {
            _ = cancel.cancelled() => return Err(PhaseError::Cancelled),
            result = attempt => result,
        };

        match result {
            Err(_) => {
                return Err(PhaseError::Failed(Error::LifecycleTimeout {
                    phase: "provisioning",
                    limit_ms: timeouts.provision_ms,
                }));
            }
            Ok(Ok(handle)) => {
                telemetry::record_backend_acquired(
                    job_id.to_string(),
                    mode.as_str(),
                    started.elapsed().as_secs_f64(),
                );
                return Ok(handle);
            }
            Ok(Err(err))
                if err.is_transient() && !attempts_exhausted(attempts, retry.max_attempts) =>
            {
                let delay = compute_retry_delay(attempts, retry);
                tracing::warn!(
                    job_id = %job_id,
                    attempt = attempts,
                    "transient provisioning failure, retrying in {delay:?}: {err}"
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Err(PhaseError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Ok(Err(err)) => return Err(PhaseError::Failed(err)),
        }
    }
}

/// Deploy the payload to one backend, retrying transient failures with
/// exponential backoff up to the configured attempt budget.
async fn deploy_with_retry(
    job_id: JobId,
    backend: &BackendHandle,
    payload: &DeploymentPayload,
    timeouts: &GatewayTimeouts,
    deployer: &dyn DeploymentGateway,
    retry: &GatewayRetryConfig,
    cancel: &CancelToken,
) -> Result<DeploymentHandle, PhaseError> {
    let mut attempts: u16 = 0;
    loop {
        attempts += 1;
        match deploy_backend(backend, payload, timeouts, deployer, cancel).await {
            Err(PhaseError::Failed(err))
                if err.is_transient() && !attempts_exhausted(attempts, retry.max_attempts) =>
            {
                let delay = compute_retry_delay(attempts, retry);
                tracing::warn!(
                    job_id = %job_id,
                    backend = %backend.id,
                    attempt = attempts,
                    "transient deployment failure, retrying in {delay:?}: {err}"
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Err(PhaseError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            result => return result,
        }
    }
}

async fn deploy_backend(
    backend: &BackendHandle,
    payload: &DeploymentPayload,
    timeouts: &GatewayTimeouts,
    deployer: &dyn DeploymentGateway,
    cancel: &CancelToken,
) -> Result<DeploymentHandle, PhaseError> {
    let deploy = async {
        match timeouts.deploy.as_duration() {
            Some(limit) => {
                match tokio::time::timeout(limit, deployer.deploy(backend, payload)).await {
                    Ok(result) => result,
                    Err(_) => Err(Error::LifecycleTimeout {
                        phase: "deployment",
                        limit_ms: limit.as_millis() as u64,
                    }),
                }
            }
            None => deployer.deploy(backend, payload).await,
        }
    };

    tokio::select! {
        _ = cancel.cancelled() => Err(PhaseError::Cancelled),
        result = deploy => result.map_err(PhaseError::Failed),
    }
}

/// Poll every deployment for results until all report completion, the
/// optimization limit elapses, or the job is aborted.
#[allow(clippy::too_many_arguments)]
async fn collect_results(
    slot: &Arc<JobSlot>,
    job_id: JobId,
    deployments: &[DeploymentHandle],
    deployer: &dyn DeploymentGateway,
    events: &dyn JobEventSink,
    config: &OrchestratorConfig,
    timeouts: &GatewayTimeouts,
    cancel: &CancelToken,
) -> Result<(), PhaseError> {
    let poll_interval = Duration::from_millis(config.result_poll_interval_ms);
    let (deadline, limit_ms) = match timeouts.optimization.as_duration() {
        Some(limit) => (
            Some(tokio::time::Instant::now() + limit),
            limit.as_millis() as u64,
        ),
        None => (None, 0),
    };

    let mut seen = vec![0usize; deployments.len()];
    let mut complete = vec![false; deployments.len()];

    loop {
        let round = fetch_round(
            slot,
            job_id,
            deployments,
            deployer,
            events,
            &mut seen,
            &mut complete,
        );
        tokio::select! {
            _ = cancel.cancelled() => return Err(PhaseError::Cancelled),
            result = round => result?,
        }

        if complete.iter().all(|done| *done) {
            return Ok(());
        }

        tokio::select! {
            _ = cancel.cancelled() => return Err(PhaseError::Cancelled),
            _ = until(deadline) => {
                return Err(PhaseError::Failed(Error::LifecycleTimeout {
                    phase: "optimization",
                    limit_ms,
                }));
            }
            _ = tokio::time::sleep(poll_interval) => {}
        }
    }
}

async fn until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn fetch_round(
    slot: &Arc<JobSlot>,
    job_id: JobId,
    deployments: &[DeploymentHandle],
    deployer: &dyn DeploymentGateway,
    events: &dyn JobEventSink,
    seen: &mut [usize],
    complete: &mut [bool],
) -> Result<(), PhaseError> {
    for (worker, deployment) in deployments.iter().enumerate() {
        if complete[worker] {
            continue;
        }

        let batch = deployer
            .fetch_results(deployment)
            .await
            .map_err(PhaseError::Failed)?;

        if batch.targets.len() > seen[worker] {
            let fresh: Vec<Target> = batch.targets[seen[worker]..]
                .iter()
                .cloned()
                .map(|mut target| {
                    target.worker = worker;
                    target
                })
                .collect();
            seen[worker] = batch.targets.len();

            let appended = fresh.len();
            let total = {
                let mut record = slot.record.lock().await;
                record.targets.extend(fresh);
                record.targets.len()
            };
            events.publish(JobEvent::new(
                job_id,
                JobEventPayload::ResultsAppended { appended, total },
            ));
        }

        if batch.complete {
            complete[worker] = true;
        }
    }
    Ok(())
}

/// Release every backend ever acquired for the job.
///
/// A failed release marks the backend orphaned on the job record and
/// escalates loudly: the instance may still be running and incurring
/// cost.
async fn release_fleet(
    slot: &Arc<JobSlot>,
    job_id: JobId,
    provisioner: &dyn ProvisioningGateway,
    acquired: &[BackendHandle],
    events: &dyn JobEventSink,
) {
    for handle in acquired {
        match provisioner.release(handle).await {
            Ok(()) => {
                telemetry::record_backend_released(job_id.to_string(), handle.id.to_string());
            }
            Err(err) => {
                telemetry::record_backend_orphaned(
                    job_id.to_string(),
                    handle.id.to_string(),
                    err.to_string(),
                );
                let mut record = slot.record.lock().await;
                record.orphaned.push(handle.id);
                events.publish(JobEvent::new(
                    job_id,
                    JobEventPayload::BackendOrphaned { backend: handle.id },
                ));
            }
        }
    }
}

/// Write completed results to the configured output directory.
///
/// Best effort; a write failure is logged but never fails the job.
async fn persist_results(slot: &Arc<JobSlot>, spec: &JobSpec) {
    if spec.results.persistence == ResultPersistence::None {
        return;
    }
    let Some(dir) = spec.results.output_dir.as_ref() else {
        tracing::warn!(
            job_name = %spec.job_name,
            "result persistence requested but no output_dir configured"
        );
        return;
    };

    let snapshot = {
        let record = slot.record.lock().await;
        record.snapshot()
    };

    let json = match spec.results.persistence {
        ResultPersistence::Best => serde_json::to_string_pretty(&snapshot.best_target()),
        _ => serde_json::to_string_pretty(&snapshot.targets),
    };

    let path = dir.join(format!("{}-{}.json", spec.job_name, snapshot.job_id));
    match json {
        Ok(json) => {
            if let Err(err) = tokio::fs::write(&path, json).await {
                tracing::warn!(path = %path.display(), "could not write result file: {err}");
            } else {
                tracing::info!(path = %path.display(), "results written");
            }
        }
        Err(err) => tracing::warn!("could not serialize results: {err}"),
    }
}
