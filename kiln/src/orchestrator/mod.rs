/// Orchestrator builder for explicit dependency wiring.
pub mod builder;
/// Per-job driver task: provisioning, deployment and result collection.
pub mod driver;

pub use builder::OrchestratorBuilder;
pub use driver::CancelToken;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;

use crate::config::JobSpec;
use crate::error::{Error, Result};
use crate::events::{JobEvent, JobEventPayload, JobEventSink};
use crate::gateway::{DeploymentGateway, GatewayRetryConfig, ProvisioningGateway};
use crate::job::{Job, JobId, JobState, ResultCursor, ResultSnapshot};
use crate::model::{ModelRegistry, ModelSource};
use crate::telemetry;

/// Configuration for the orchestrator.
#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    /// Retry policy for transient gateway failures.
    pub retry: GatewayRetryConfig,
    /// Interval between result fetches while a job is running, in
    /// milliseconds.
    pub result_poll_interval_ms: u64,
    /// Event bus capacity when the builder is not given one.
    pub event_capacity: usize,
    /// Grace period for driver tasks during shutdown, in milliseconds.
    pub shutdown_grace_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            retry: GatewayRetryConfig::default(),
            result_poll_interval_ms: 500,
            event_capacity: 256,
            shutdown_grace_ms: 30_000,
        }
    }
}

/// One entry in the job registry.
///
/// The record mutex serializes all mutations for this job; the watch
/// channel lets `await_result` suspend without holding it.
pub(crate) struct JobSlot {
    pub(crate) record: Mutex<Job>,
    pub(crate) state_tx: watch::Sender<JobState>,
    pub(crate) cancel: CancelToken,
    pub(crate) driver: Mutex<Option<JoinHandle<()>>>,
}

impl JobSlot {
    fn new(job: Job) -> Self {
        let (state_tx, _) = watch::channel(job.state);
        Self {
            record: Mutex::new(job),
            state_tx,
            cancel: CancelToken::new(),
            driver: Mutex::new(None),
        }
    }

    /// Apply a state transition unless the job is already terminal.
    ///
    /// Returns whether the transition was applied. The caller must hold
    /// the record lock; state, watch channel and event publication stay
    /// consistent because they all happen under it.
    pub(crate) fn transition(
        &self,
        record: &mut Job,
        to: JobState,
        events: &dyn JobEventSink,
    ) -> bool {
        if record.state.is_terminal() {
            return false;
        }
        let from = record.state;
        record.state = to;
        self.state_tx.send_replace(to);
        events.publish(JobEvent::new(
            record.id,
            JobEventPayload::StateChanged { from, to },
        ));
        tracing::info!(job_id = %record.id, from = %from, to = %to, "job state changed");
        if to.is_terminal() {
            telemetry::record_job_finished(record.id.to_string(), to.as_str());
        }
        true
    }
}

/// The job orchestration and lifecycle manager.
///
/// Owns the job registry and the model registry, drives each job's
/// state machine on its own task, and answers synchronous and blocking
/// result queries. Constructed explicitly (see [`OrchestratorBuilder`])
/// and passed by reference; there is no process-wide accessor.
pub struct Orchestrator {
    config: OrchestratorConfig,
    models: Mutex<ModelRegistry>,
    jobs: Mutex<HashMap<JobId, Arc<JobSlot>>>,
    provisioner: Arc<dyn ProvisioningGateway>,
    deployer: Arc<dyn DeploymentGateway>,
    events: Arc<dyn JobEventSink>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let job_count = self
            .jobs
            .try_lock()
            .map(|jobs| jobs.len())
            .unwrap_or_default();
        f.debug_struct("Orchestrator")
            .field("config", &self.config)
            .field("job_count", &job_count)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Create an orchestrator from its collaborators.
    pub fn new(
        config: OrchestratorConfig,
        provisioner: Arc<dyn ProvisioningGateway>,
        deployer: Arc<dyn DeploymentGateway>,
        events: Arc<dyn JobEventSink>,
    ) -> Self {
        Self {
            config,
            models: Mutex::new(ModelRegistry::new()),
            jobs: Mutex::new(HashMap::new()),
            provisioner,
            deployer,
            events,
        }
    }

    /// Start building an orchestrator.
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::new()
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Subscribe to job lifecycle events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    /// Validate and load a model into the registry.
    pub async fn load_model(
        &self,
        name: impl Into<String>,
        source: ModelSource,
        skip_typecheck: bool,
    ) -> Result<()> {
        let mut models = self.models.lock().await;
        models.load(name, source, skip_typecheck)?;
        Ok(())
    }

    /// Remove a model. Idempotent.
    pub async fn unload_model(&self, name: &str) {
        let mut models = self.models.lock().await;
        models.unload(name);
    }

    pub async fn model_names(&self) -> Vec<String> {
        let models = self.models.lock().await;
        models.names()
    }

    /// Run submit-time validation without allocating a job or touching
    /// any gateway.
    pub async fn dry_run(&self, model_name: &str, spec: &JobSpec) -> Result<()> {
        {
            let models = self.models.lock().await;
            models.get(model_name)?;
        }
        spec.validate()
    }

    /// Validate and register a new job in `Created`.
    ///
    /// Does not provision anything; that is `start`'s responsibility.
    /// Validation failures never mutate registry state.
    pub async fn submit(&self, model_name: &str, spec: JobSpec) -> Result<JobId> {
        {
            let models = self.models.lock().await;
            models.get(model_name)?;
        }
        spec.validate()?;

        let job = Job::new(model_name, spec);
        let job_id = job.id;
        let mode = job.mode;
        let slot = Arc::new(JobSlot::new(job));
        self.jobs.lock().await.insert(job_id, slot);

        telemetry::record_job_submitted(model_name, mode.as_str());
        self.events.publish(JobEvent::new(
            job_id,
            JobEventPayload::Submitted {
                model: model_name.to_string(),
            },
        ));
        Ok(job_id)
    }

    /// Begin executing a job. Legal only from `Created`.
    ///
    /// Transitions to `Provisioning` synchronously and hands the job to
    /// its own driver task. Gateway failures past this point are
    /// absorbed into the job's state machine and surface through
    /// `poll`/`await_result`, never through `start` itself.
    pub async fn start(&self, job_id: &JobId) -> Result<()> {
        let slot = self.slot(job_id).await?;

        let (model, spec) = {
            let mut record = slot.record.lock().await;
            if record.state != JobState::Created {
                return Err(Error::InvalidState {
                    job_id: *job_id,
                    state: record.state,
                    operation: "start",
                });
            }
            slot.transition(&mut record, JobState::Provisioning, self.events.as_ref());

            let model = {
                let models = self.models.lock().await;
                models.get(&record.model_name).ok().cloned()
            };
            (model, record.spec.clone())
        };

        let Some(model) = model else {
            // The model was unloaded between submit and start. Absorbed
            // into the state machine like any other execution failure.
            self.fail_unstarted(&slot, "is no longer loaded").await;
            return Ok(());
        };

        let handle = tokio::spawn(driver::drive(
            Arc::clone(&slot),
            model,
            spec,
            Arc::clone(&self.provisioner),
            Arc::clone(&self.deployer),
            Arc::clone(&self.events),
            self.config.clone(),
        ));
        *slot.driver.lock().await = Some(handle);
        Ok(())
    }

    /// Request teardown and abort a job.
    ///
    /// Legal from any non-terminal state; a no-op once terminal, so
    /// repeated and concurrent calls are safe. Effective even while the
    /// driver is blocked inside a gateway call.
    pub async fn abort(&self, job_id: &JobId) -> Result<()> {
        let slot = self.slot(job_id).await?;
        let mut record = slot.record.lock().await;
        if record.state.is_terminal() {
            return Ok(());
        }
        if record.state == JobState::Created {
            // No driver task exists yet; finish directly.
            slot.transition(&mut record, JobState::Aborted, self.events.as_ref());
            return Ok(());
        }
        slot.cancel.cancel();
        Ok(())
    }

    /// Non-blocking consistent snapshot of a job.
    pub async fn poll(&self, job_id: &JobId) -> Result<ResultSnapshot> {
        let slot = self.slot(job_id).await?;
        let record = slot.record.lock().await;
        Ok(record.snapshot())
    }

    /// Block the calling context until the job reaches a terminal state
    /// or `timeout` elapses.
    ///
    /// Suspends on the job's state channel; no lock is held while
    /// waiting, so other callers and other jobs proceed. A timeout
    /// returns [`Error::WaitTimeout`] and mutates nothing.
    pub async fn await_result(
        &self,
        job_id: &JobId,
        timeout: Option<Duration>,
    ) -> Result<ResultSnapshot> {
        let slot = self.slot(job_id).await?;

        let mut state_rx = slot.state_tx.subscribe();
        let wait = async move {
            loop {
                if state_rx.borrow_and_update().is_terminal() {
                    break;
                }
                if state_rx.changed().await.is_err() {
                    break;
                }
            }
        };

        match timeout {
            None => wait.await,
            Some(limit) => {
                if tokio::time::timeout(limit, wait).await.is_err() {
                    return Err(Error::WaitTimeout(limit));
                }
            }
        }

        let record = slot.record.lock().await;
        Ok(record.snapshot())
    }

    /// Whether the referenced job (or, if unspecified, any job) has
    /// produced results since this cursor last observed it.
    pub async fn has_new_results(
        &self,
        cursor: &mut ResultCursor,
        job_id: Option<&JobId>,
    ) -> Result<bool> {
        match job_id {
            Some(job_id) => {
                let slot = self.slot(job_id).await?;
                let record = slot.record.lock().await;
                Ok(cursor.observe(record.id, record.targets.len()))
            }
            None => {
                let slots: Vec<Arc<JobSlot>> =
                    self.jobs.lock().await.values().cloned().collect();
                let mut fresh = false;
                for slot in slots {
                    let record = slot.record.lock().await;
                    fresh |= cursor.observe(record.id, record.targets.len());
                }
                Ok(fresh)
            }
        }
    }

    /// Identifiers of every job ever submitted to this orchestrator.
    pub async fn job_ids(&self) -> Vec<JobId> {
        self.jobs.lock().await.keys().copied().collect()
    }

    /// Gracefully shut down: abort all non-terminal jobs and wait for
    /// their driver tasks to finish teardown.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        tracing::info!("initiating orchestrator shutdown");

        let slots: Vec<(JobId, Arc<JobSlot>)> = self
            .jobs
            .lock()
            .await
            .iter()
            .map(|(id, slot)| (*id, Arc::clone(slot)))
            .collect();

        for (_, slot) in &slots {
            let mut record = slot.record.lock().await;
            if record.state.is_terminal() {
                continue;
            }
            if record.state == JobState::Created {
                slot.transition(&mut record, JobState::Aborted, self.events.as_ref());
            } else {
                slot.cancel.cancel();
            }
        }

        let grace = Duration::from_millis(self.config.shutdown_grace_ms);
        for (job_id, slot) in slots {
            let handle = slot.driver.lock().await.take();
            if let Some(handle) = handle {
                match tokio::time::timeout(grace, handle).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        tracing::warn!(job_id = %job_id, "driver task failed: {e:?}")
                    }
                    Err(_) => {
                        tracing::warn!(job_id = %job_id, "driver task timed out during shutdown")
                    }
                }
            }
        }

        tracing::info!("orchestrator shutdown complete");
        Ok(())
    }

    async fn slot(&self, job_id: &JobId) -> Result<Arc<JobSlot>> {
        let jobs = self.jobs.lock().await;
        jobs.get(job_id)
            .cloned()
            .ok_or(Error::JobNotFound(*job_id))
    }

    async fn fail_unstarted(&self, slot: &Arc<JobSlot>, reason: &str) {
        let mut record = slot.record.lock().await;
        if slot.cancel.is_cancelled() {
            slot.transition(&mut record, JobState::Aborted, self.events.as_ref());
        } else {
            record.failure = Some(format!(
                "model `{}` {reason}",
                record.model_name
            ));
            slot.transition(&mut record, JobState::Failed, self.events.as_ref());
        }
    }
}
