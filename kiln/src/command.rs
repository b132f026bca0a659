use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::config::JobSpec;
use crate::error::Result;
use crate::job::{JobId, ResultCursor, ResultSnapshot};
use crate::model::ModelSource;
use crate::orchestrator::Orchestrator;

/// A parsed interactive command.
#[derive(Clone, Debug)]
pub enum Command {
    /// Load a model definition from a JSON file.
    Load { path: PathBuf },
    /// Mutate one field of the staged job configuration.
    Set { key: String, value: String },
    /// Start a previously submitted job, or submit the staged
    /// configuration and start the resulting job.
    Start { job_id: Option<JobId> },
    /// Abort a job.
    Abort { job_id: JobId },
    /// Query a job's state and results.
    Get {
        job_id: JobId,
        /// Block until the job is terminal or `wait` elapses.
        blocking: bool,
        wait: Option<Duration>,
    },
    /// Validate the staged model and configuration without provisioning
    /// anything.
    DryRun,
}

/// Success flag plus a human-readable message.
#[derive(Clone, Debug)]
pub struct CommandOutcome {
    pub success: bool,
    pub message: String,
}

impl CommandOutcome {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

/// Routes interactive commands to the orchestrator.
///
/// Holds the configuration being staged between `set` calls, the name
/// of the most recently loaded model, and this caller's result cursor.
/// Deliberately thin: all state machine logic lives in the
/// orchestrator.
pub struct CommandDispatcher {
    orchestrator: Arc<Orchestrator>,
    spec: JobSpec,
    staged_model: Option<String>,
    last_job: Option<JobId>,
    cursor: ResultCursor,
}

impl CommandDispatcher {
    pub fn new(orchestrator: Arc<Orchestrator>, spec: JobSpec) -> Self {
        Self {
            orchestrator,
            spec,
            staged_model: None,
            last_job: None,
            cursor: ResultCursor::new(),
        }
    }

    /// The configuration that `start` would submit.
    pub fn staged_spec(&self) -> &JobSpec {
        &self.spec
    }

    /// The job most recently started through this dispatcher.
    pub fn last_job(&self) -> Option<JobId> {
        self.last_job
    }

    /// Whether the given job (or any job) produced results since this
    /// dispatcher last looked.
    pub async fn has_new_results(&mut self, job_id: Option<&JobId>) -> Result<bool> {
        self.orchestrator
            .has_new_results(&mut self.cursor, job_id)
            .await
    }

    pub async fn dispatch(&mut self, command: Command) -> CommandOutcome {
        match command {
            Command::Load { path } => self.handle_load(path).await,
            Command::Set { key, value } => self.handle_set(&key, &value),
            Command::Start { job_id } => self.handle_start(job_id).await,
            Command::Abort { job_id } => self.handle_abort(job_id).await,
            Command::Get {
                job_id,
                blocking,
                wait,
            } => self.handle_get(job_id, blocking, wait).await,
            Command::DryRun => self.handle_dry_run().await,
        }
    }

    async fn handle_load(&mut self, path: PathBuf) -> CommandOutcome {
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(err) => {
                return CommandOutcome::failed(format!(
                    "could not read model file {}: {err}",
                    path.display()
                ));
            }
        };
        let source: ModelSource = match serde_json::from_str(&raw) {
            Ok(source) => source,
            Err(err) => {
                return CommandOutcome::failed(format!(
                    "could not parse model file {}: {err}",
                    path.display()
                ));
            }
        };

        let name = source.name.clone();
        match self
            .orchestrator
            .load_model(name.clone(), source, self.spec.model.skip_typecheck)
            .await
        {
            Ok(()) => {
                self.staged_model = Some(name.clone());
                CommandOutcome::ok(format!("model `{name}` loaded"))
            }
            Err(err) => CommandOutcome::failed(err.to_string()),
        }
    }

    fn handle_set(&mut self, key: &str, value: &str) -> CommandOutcome {
        match apply_set(&mut self.spec, key, value) {
            Ok(()) => CommandOutcome::ok(format!("{key} = {value}")),
            Err(message) => CommandOutcome::failed(message),
        }
    }

    async fn handle_start(&mut self, job_id: Option<JobId>) -> CommandOutcome {
        let job_id = match job_id {
            Some(job_id) => job_id,
            None => {
                let Some(model) = self.staged_model.clone() else {
                    return CommandOutcome::failed(
                        "no model loaded; run `load <path>` first",
                    );
                };
                match self.orchestrator.submit(&model, self.spec.clone()).await {
                    Ok(job_id) => job_id,
                    Err(err) => return CommandOutcome::failed(err.to_string()),
                }
            }
        };

        match self.orchestrator.start(&job_id).await {
            Ok(()) => {
                self.last_job = Some(job_id);
                CommandOutcome::ok(format!("job {job_id} started"))
            }
            Err(err) => CommandOutcome::failed(err.to_string()),
        }
    }

    async fn handle_abort(&mut self, job_id: JobId) -> CommandOutcome {
        match self.orchestrator.abort(&job_id).await {
            Ok(()) => CommandOutcome::ok(format!("abort requested for job {job_id}")),
            Err(err) => CommandOutcome::failed(err.to_string()),
        }
    }

    async fn handle_get(
        &mut self,
        job_id: JobId,
        blocking: bool,
        wait: Option<Duration>,
    ) -> CommandOutcome {
        let snapshot = if blocking {
            self.orchestrator.await_result(&job_id, wait).await
        } else {
            self.orchestrator.poll(&job_id).await
        };

        match snapshot {
            Ok(snapshot) => {
                self.cursor.observe(snapshot.job_id, snapshot.targets.len());
                CommandOutcome::ok(describe_snapshot(&snapshot))
            }
            Err(err) => CommandOutcome::failed(err.to_string()),
        }
    }

    async fn handle_dry_run(&mut self) -> CommandOutcome {
        let Some(model) = self.staged_model.clone() else {
            return CommandOutcome::failed("no model loaded; run `load <path>` first");
        };
        match self.orchestrator.dry_run(&model, &self.spec).await {
            Ok(()) => CommandOutcome::ok(format!(
                "model `{model}` and configuration are valid"
            )),
            Err(err) => CommandOutcome::failed(err.to_string()),
        }
    }
}

fn describe_snapshot(snapshot: &ResultSnapshot) -> String {
    let mut message = format!(
        "job {} is {}; {} target(s)",
        snapshot.job_id,
        snapshot.state,
        snapshot.targets.len()
    );
    if let Some(best) = snapshot.best_target() {
        message.push_str(&format!(", best score {}", best.score));
    }
    if let Some(failure) = &snapshot.failure {
        message.push_str(&format!("; failure: {failure}"));
    }
    if !snapshot.orphaned_backends.is_empty() {
        message.push_str(&format!(
            "; WARNING: {} backend(s) could not be released and may still incur cost",
            snapshot.orphaned_backends.len()
        ));
    }
    message
}

/// Apply one `set <key> <value>` mutation to a staged configuration.
fn apply_set(spec: &mut JobSpec, key: &str, value: &str) -> std::result::Result<(), String> {
    fn parse<T: std::str::FromStr>(key: &str, value: &str) -> std::result::Result<T, String> {
        value
            .parse::<T>()
            .map_err(|_| format!("invalid value `{value}` for {key}"))
    }

    match key {
        "job_name" => {
            spec.job_name = value.to_string();
        }
        "anneal.thread_count" => {
            spec.anneal.thread_count = parse(key, value)?;
        }
        "anneal.initial_temperature" => {
            spec.anneal.initial_temperature = parse(key, value)?;
        }
        "anneal.seed" => {
            spec.anneal.seed = Some(parse(key, value)?);
        }
        "anneal.max_steps" => {
            spec.anneal.max_steps = parse(key, value)?;
        }
        "model.skip_typecheck" => {
            spec.model.skip_typecheck = parse(key, value)?;
        }
        "execution.worker_count" => {
            spec.execution.worker_count = parse(key, value)?;
        }
        "debug.force_local_simulator" => {
            spec.debug.force_local_simulator = parse(key, value)?;
        }
        _ => return Err(format!("unknown configuration key `{key}`")),
    }
    Ok(())
}
