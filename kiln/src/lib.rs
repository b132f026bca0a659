//! Kiln - Cloud-based, GPU-accelerated simulated annealing orchestration.
//!
//! A foundational crate for coordinating distributed simulated-annealing
//! runs: it owns job identity, dispatches work to local or cloud execution
//! backends through narrow gateway traits, and answers synchronous and
//! blocking result queries while serializing access to shared job state.
//!
//! # Core Concepts
//!
//! - **Model**: A named, validated optimization target held by the
//!   [`ModelRegistry`]. Models resolve their capability set at load time;
//!   jobs refer to them by name.
//!
//! - **Job**: One submitted optimization run with its own configuration,
//!   lifecycle state and accumulated [`Target`] results. Jobs are owned by
//!   the orchestrator and observed through [`ResultSnapshot`] copies.
//!
//! - **Gateways**: The [`ProvisioningGateway`] and [`DeploymentGateway`]
//!   traits abstract acquiring backends and pushing the runnable payload
//!   onto them. Cloud- or docker-specific implementations live outside
//!   this crate.
//!
//! - **Orchestrator**: The [`orchestrator::Orchestrator`] drives each
//!   job's state machine on its own task, guarantees that every acquired
//!   backend is released, and exposes `submit`/`start`/`abort`/`poll`/
//!   `await_result`.
//!
//! - **Events**: Job lifecycle events fan out over the [`InProcEventBus`]
//!   for reactive UIs and observability.
//!
//! # Feature Flags
//!
//! - `metrics` - Prometheus metrics support
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use kiln::orchestrator::Orchestrator;
//!
//! let orchestrator = Orchestrator::builder()
//!     .with_provisioner(Arc::new(my_provisioner))
//!     .with_deployer(Arc::new(my_deployer))
//!     .build()?;
//!
//! orchestrator.load_model("sphere", source, false).await?;
//! let job_id = orchestrator.submit("sphere", spec).await?;
//! orchestrator.start(&job_id).await?;
//! let snapshot = orchestrator.await_result(&job_id, None).await?;
//! ```

/// Interactive command routing.
///
/// The `command` module provides the thin [`CommandDispatcher`] that
/// routes `load`/`set`/`start`/`abort`/`get`/`dryrun` commands to the
/// orchestrator and renders human-readable outcomes.
pub mod command;

/// Configuration structures for jobs and execution policy.
///
/// The `config` module defines the structured configuration surface:
/// [`JobSpec`], [`AnnealConfig`], [`ExecutionPolicy`] and the
/// [`TimeoutPolicy`] type that expresses "unbounded" without a numeric
/// sentinel.
pub mod config;

/// Error taxonomy.
///
/// The `error` module defines [`Error`] covering validation, lookup,
/// state-machine, gateway and timeout failures, plus the crate-wide
/// [`Result`] alias.
pub mod error;

/// Job lifecycle event publishing.
///
/// The `events` module provides [`JobEvent`], the [`JobEventSink`]
/// trait and the broadcast-based [`InProcEventBus`].
pub mod events;

/// Gateway traits for provisioning and deployment.
///
/// The `gateway` module defines [`ProvisioningGateway`] and
/// [`DeploymentGateway`], the handle and payload types they exchange,
/// and retry backoff helpers for transient failures.
pub mod gateway;

/// Core job definitions.
///
/// The `job` module defines [`JobId`], [`JobState`], [`Job`],
/// [`Target`], [`ResultSnapshot`] and the per-caller [`ResultCursor`].
pub mod job;

#[cfg(feature = "metrics")]
/// Prometheus metrics, enabled by the `metrics` feature.
pub mod metrics;

/// Model registry and model capability types.
///
/// The `model` module defines [`Model`], [`ModelSource`], the
/// [`ModelFunction`] capability set and the [`ModelRegistry`].
pub mod model;

/// The job orchestration and lifecycle manager.
///
/// The `orchestrator` module provides [`orchestrator::Orchestrator`],
/// its builder, configuration and the per-job cancel token.
pub mod orchestrator;

/// Tracing span and record helpers.
pub mod telemetry;

pub use command::{Command, CommandDispatcher, CommandOutcome};
pub use config::{
    AnnealConfig, CloudPlatform, DebugFlags, ExecutionMode, ExecutionPolicy, ExecutionTarget,
    GatewayTimeouts, JobSpec, ModelOptions, ResultPersistence, ResultPolicy, TimeoutPolicy,
};
pub use error::{Error, Result};
pub use events::{InProcEventBus, JobEvent, JobEventPayload, JobEventSink};
pub use gateway::{
    BackendHandle, BackendId, BackendRole, DeploymentGateway, DeploymentHandle,
    DeploymentPayload, GatewayRetryConfig, ProvisioningGateway, ResultBatch, SizingHints,
};
pub use job::{Job, JobId, JobState, ResultCursor, ResultSnapshot, Target};
pub use model::{Model, ModelFunction, ModelRegistry, ModelSource, Precision, RandomDistribution};
pub use orchestrator::{CancelToken, Orchestrator, OrchestratorBuilder, OrchestratorConfig};
