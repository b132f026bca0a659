use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Full configuration surface for one optimization job.
///
/// Parsed from the user's configuration by an external collaborator and
/// handed to the orchestrator as a structured object. Validation is
/// shared by `submit` and `dry_run`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobSpec {
    /// Human-readable job name, used for log context and result files.
    pub job_name: String,
    /// What to do with results once a job completes.
    #[serde(default)]
    pub results: ResultPolicy,
    /// Model loading options.
    #[serde(default)]
    pub model: ModelOptions,
    /// Annealing parameters shipped to every backend.
    pub anneal: AnnealConfig,
    /// Debug switches.
    #[serde(default)]
    pub debug: DebugFlags,
    /// Where and how to execute.
    #[serde(default)]
    pub execution: ExecutionPolicy,
}

impl Default for JobSpec {
    fn default() -> Self {
        Self {
            job_name: "kiln-job".to_string(),
            results: ResultPolicy::default(),
            model: ModelOptions::default(),
            anneal: AnnealConfig::default(),
            debug: DebugFlags::default(),
            execution: ExecutionPolicy::default(),
        }
    }
}

impl JobSpec {
    /// Validate the whole surface. Returns the first problem found.
    pub fn validate(&self) -> Result<()> {
        self.anneal.validate()?;
        self.execution.validate()?;
        Ok(())
    }

    /// Resolve the effective execution mode for a job.
    ///
    /// The debug simulator switch overrides the execution target.
    pub fn execution_mode(&self) -> ExecutionMode {
        if self.debug.force_local_simulator {
            return ExecutionMode::Local;
        }
        match self.execution.target {
            ExecutionTarget::LocalDocker => ExecutionMode::Local,
            ExecutionTarget::Cloud { .. } => ExecutionMode::Remote,
        }
    }
}

/// How a job's backends are obtained.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Containerized simulator on the local host.
    Local,
    /// Provisioned cloud instances.
    Remote,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::Local => "local",
            ExecutionMode::Remote => "remote",
        }
    }
}

/// Result persistence behavior after a job completes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResultPolicy {
    pub persistence: ResultPersistence,
    /// Directory for result files. Required when persistence is not
    /// `None`; ignored otherwise.
    pub output_dir: Option<PathBuf>,
}

impl Default for ResultPolicy {
    fn default() -> Self {
        Self {
            persistence: ResultPersistence::None,
            output_dir: None,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultPersistence {
    /// Persist only the best-scored target.
    Best,
    /// Persist every reported target.
    All,
    /// Keep results in memory only.
    None,
}

/// Model loading options.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ModelOptions {
    /// Skip capability validation at load time. Structural loading
    /// only; runtime failures then surface during execution.
    #[serde(default)]
    pub skip_typecheck: bool,
}

/// Annealing parameters for one run.
///
/// `thread_count` and `max_steps` are signed so that out-of-range user
/// input reaches validation instead of failing at parse time.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AnnealConfig {
    /// Worker threads per backend.
    pub thread_count: i64,
    /// Starting temperature of the cooling schedule.
    pub initial_temperature: f64,
    /// Seed for the backend RNG. Absent means the backend seeds itself.
    #[serde(default)]
    pub seed: Option<u64>,
    /// Annealing step budget. Must be positive; "run until aborted" is
    /// expressed through the optimization timeout, never through steps.
    pub max_steps: i64,
}

impl Default for AnnealConfig {
    fn default() -> Self {
        Self {
            thread_count: 1,
            initial_temperature: 1000.0,
            seed: None,
            max_steps: 10_000,
        }
    }
}

impl AnnealConfig {
    pub fn validate(&self) -> Result<()> {
        if self.thread_count < 1 {
            return Err(Error::validation(format!(
                "thread_count must be at least 1, got {}",
                self.thread_count
            )));
        }
        if !self.initial_temperature.is_finite() {
            return Err(Error::validation(format!(
                "initial_temperature must be finite, got {}",
                self.initial_temperature
            )));
        }
        if self.max_steps < 1 {
            return Err(Error::validation(format!(
                "max_steps must be at least 1, got {}",
                self.max_steps
            )));
        }
        Ok(())
    }
}

/// Debug switches.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DebugFlags {
    /// Run against the local GPU simulator regardless of the configured
    /// execution target.
    #[serde(default)]
    pub force_local_simulator: bool,
}

/// Remote-execution policy: target platform, fleet sizing and lifecycle
/// limits.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutionPolicy {
    pub target: ExecutionTarget,
    /// Number of worker backends to provision.
    pub worker_count: i64,
    pub timeouts: GatewayTimeouts,
}

impl Default for ExecutionPolicy {
    fn default() -> Self {
        Self {
            target: ExecutionTarget::LocalDocker,
            worker_count: 1,
            timeouts: GatewayTimeouts::default(),
        }
    }
}

impl ExecutionPolicy {
    pub fn validate(&self) -> Result<()> {
        if self.worker_count < 1 {
            return Err(Error::validation(format!(
                "worker_count must be at least 1, got {}",
                self.worker_count
            )));
        }
        self.timeouts.validate()
    }
}

/// Where backends come from.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionTarget {
    /// Docker containers on the local host.
    LocalDocker,
    /// A named cloud platform.
    Cloud {
        platform: CloudPlatform,
        region: String,
        worker_instance_type: String,
        /// Sizing for the message-broker role. Whether the platform
        /// actually needs a broker is a gateway concern.
        broker_instance_type: String,
    },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloudPlatform {
    Aws,
}

impl CloudPlatform {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloudPlatform::Aws => "aws",
        }
    }
}

/// Independent lifecycle limits for one job.
///
/// Provisioning and startup are always finite to bound cost exposure;
/// deployment and the optimization itself may be unbounded.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GatewayTimeouts {
    /// Limit for acquiring a single backend, in milliseconds.
    pub provision_ms: u64,
    /// Limit for a backend to come up after acquisition, in
    /// milliseconds.
    pub startup_ms: u64,
    /// Limit for pushing the payload to a single backend.
    pub deploy: TimeoutPolicy,
    /// Limit for the optimization run as a whole.
    pub optimization: TimeoutPolicy,
}

impl Default for GatewayTimeouts {
    fn default() -> Self {
        Self {
            provision_ms: 300_000,
            startup_ms: 120_000,
            deploy: TimeoutPolicy::After { ms: 120_000 },
            optimization: TimeoutPolicy::Unbounded,
        }
    }
}

impl GatewayTimeouts {
    pub fn validate(&self) -> Result<()> {
        if self.provision_ms == 0 {
            return Err(Error::validation(
                "provision_ms must be a positive, finite limit",
            ));
        }
        if self.startup_ms == 0 {
            return Err(Error::validation(
                "startup_ms must be a positive, finite limit",
            ));
        }
        if matches!(self.deploy, TimeoutPolicy::After { ms: 0 })
            || matches!(self.optimization, TimeoutPolicy::After { ms: 0 })
        {
            return Err(Error::validation(
                "a zero timeout is not a valid way to express \"unbounded\"",
            ));
        }
        Ok(())
    }

    pub fn provision(&self) -> Duration {
        Duration::from_millis(self.provision_ms)
    }

    pub fn startup(&self) -> Duration {
        Duration::from_millis(self.startup_ms)
    }
}

/// A lifecycle limit that is either a finite duration or explicitly
/// unbounded. No numeric sentinel.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum TimeoutPolicy {
    Unbounded,
    After { ms: u64 },
}

impl TimeoutPolicy {
    /// The finite limit, or `None` when unbounded.
    pub fn as_duration(&self) -> Option<Duration> {
        match self {
            TimeoutPolicy::Unbounded => None,
            TimeoutPolicy::After { ms } => Some(Duration::from_millis(*ms)),
        }
    }

    pub fn is_unbounded(&self) -> bool {
        matches!(self, TimeoutPolicy::Unbounded)
    }
}
