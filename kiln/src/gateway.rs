use std::fmt::Display;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::{AnnealConfig, ExecutionMode, GatewayTimeouts};
use crate::error::Result;
use crate::job::{JobId, Target};
use crate::model::Model;

/// Unique identifier for a provisioned backend.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct BackendId(pub Uuid);

impl Default for BackendId {
    fn default() -> Self {
        Self::new()
    }
}

impl BackendId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Display for BackendId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Role a backend plays in a job's fleet.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendRole {
    Worker,
    Broker,
}

impl BackendRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendRole::Worker => "worker",
            BackendRole::Broker => "broker",
        }
    }
}

/// Opaque reference to a provisioned execution backend.
///
/// Address fields stay absent while the backend is still coming up;
/// `release` must accept such partially-initialized handles.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackendHandle {
    pub id: BackendId,
    pub role: BackendRole,
    pub public_ip: Option<String>,
    pub port: Option<u16>,
}

impl BackendHandle {
    pub fn new(role: BackendRole) -> Self {
        Self {
            id: BackendId::new(),
            role,
            public_ip: None,
            port: None,
        }
    }
}

/// Instance sizing passed to the provisioning gateway.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SizingHints {
    pub role: BackendRole,
    /// Provider instance type, when targeting a cloud platform.
    pub instance_type: Option<String>,
    pub region: Option<String>,
}

impl SizingHints {
    pub fn worker() -> Self {
        Self {
            role: BackendRole::Worker,
            instance_type: None,
            region: None,
        }
    }
}

/// The runnable payload pushed onto a provisioned backend.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeploymentPayload {
    pub job_id: JobId,
    pub model: Model,
    pub anneal: AnnealConfig,
}

/// Opaque reference to a payload deployed on a backend.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeploymentHandle {
    pub id: Uuid,
    pub backend: BackendId,
}

impl DeploymentHandle {
    pub fn new(backend: BackendId) -> Self {
        Self {
            id: Uuid::now_v7(),
            backend,
        }
    }
}

/// Results reported by one deployment.
///
/// `targets` is the cumulative ordered sequence observed so far;
/// `complete` marks the final batch.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ResultBatch {
    pub targets: Vec<Target>,
    pub complete: bool,
}

/// Obtains and tears down execution backends.
///
/// `acquire` returns one backend per call; the orchestrator loops over
/// the configured worker count. Implementations must make in-flight
/// calls safe to drop (cooperative cancellation), since abort has to be
/// deliverable while a job is blocked here.
#[async_trait]
pub trait ProvisioningGateway: Send + Sync {
    /// Provision a single backend.
    async fn acquire(
        &self,
        mode: ExecutionMode,
        hints: &SizingHints,
        timeouts: &GatewayTimeouts,
    ) -> Result<BackendHandle>;

    /// Tear down a backend. Must be idempotent and safe to call on
    /// partially-initialized handles.
    async fn release(&self, handle: &BackendHandle) -> Result<()>;
}

/// Pushes the runnable payload to provisioned backends and reads
/// results back.
#[async_trait]
pub trait DeploymentGateway: Send + Sync {
    /// Deploy the payload onto a backend and start it.
    async fn deploy(
        &self,
        backend: &BackendHandle,
        payload: &DeploymentPayload,
    ) -> Result<DeploymentHandle>;

    /// Fetch the deployment's results, partial or final.
    async fn fetch_results(
        &self,
        deployment: &DeploymentHandle,
    ) -> Result<ResultBatch>;
}

/// Retry and backoff configuration for transient gateway failures.
#[derive(Clone, Debug)]
pub struct GatewayRetryConfig {
    /// Maximum acquisition attempts per backend before the job fails.
    pub max_attempts: u16,
    /// Base delay in milliseconds for exponential backoff.
    pub base_delay_ms: u64,
    /// Maximum backoff delay in milliseconds.
    pub max_backoff_ms: u64,
}

impl Default for GatewayRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            max_backoff_ms: 30_000,
        }
    }
}

/// Computes the delay before retrying a failed gateway call.
///
/// Formula: delay = min(base_delay * 2^(attempt-1), max_backoff)
pub fn compute_retry_delay(attempt: u16, config: &GatewayRetryConfig) -> Duration {
    if attempt == 0 {
        return Duration::from_millis(0);
    }

    let exp = (attempt.saturating_sub(1)) as u32;
    let scaled = (config.base_delay_ms as f64) * 2f64.powi(exp as i32);
    let capped = scaled.min(config.max_backoff_ms as f64);

    Duration::from_millis(capped.max(0.0) as u64)
}

/// Whether the attempt budget is exhausted.
pub fn attempts_exhausted(attempts: u16, max_attempts: u16) -> bool {
    attempts >= max_attempts
}
