use std::sync::Arc;

use crate::events::{InProcEventBus, JobEventSink};
use crate::gateway::{DeploymentGateway, ProvisioningGateway};

use super::{Orchestrator, OrchestratorConfig};

/// Builder for constructing an [`Orchestrator`] with explicit
/// dependencies.
///
/// Both gateways are required; the event bus defaults to an in-process
/// broadcast bus sized by the configuration.
///
/// # Example
///
/// ```ignore
/// use kiln::orchestrator::Orchestrator;
///
/// let orchestrator = Orchestrator::builder()
///     .with_provisioner(provisioner)
///     .with_deployer(deployer)
///     .build()?;
/// ```
pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    provisioner: Option<Arc<dyn ProvisioningGateway>>,
    deployer: Option<Arc<dyn DeploymentGateway>>,
    events: Option<Arc<dyn JobEventSink>>,
}

impl std::fmt::Debug for OrchestratorBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchestratorBuilder")
            .field("config", &self.config)
            .field("provisioner_set", &self.provisioner.is_some())
            .field("deployer_set", &self.deployer.is_some())
            .field("events_set", &self.events.is_some())
            .finish()
    }
}

impl Default for OrchestratorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl OrchestratorBuilder {
    pub fn new() -> Self {
        Self {
            config: OrchestratorConfig::default(),
            provisioner: None,
            deployer: None,
            events: None,
        }
    }

    /// Override the default orchestrator configuration.
    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the provisioning gateway.
    pub fn with_provisioner(mut self, provisioner: Arc<dyn ProvisioningGateway>) -> Self {
        self.provisioner = Some(provisioner);
        self
    }

    /// Set the deployment gateway.
    pub fn with_deployer(mut self, deployer: Arc<dyn DeploymentGateway>) -> Self {
        self.deployer = Some(deployer);
        self
    }

    /// Set the event sink. Defaults to an [`InProcEventBus`].
    pub fn with_events(mut self, events: Arc<dyn JobEventSink>) -> Self {
        self.events = Some(events);
        self
    }

    /// Validate that all required dependencies are present and build
    /// the orchestrator.
    pub fn build(self) -> anyhow::Result<Orchestrator> {
        let provisioner = self
            .provisioner
            .ok_or_else(|| anyhow::anyhow!("provisioning gateway is required"))?;
        let deployer = self
            .deployer
            .ok_or_else(|| anyhow::anyhow!("deployment gateway is required"))?;
        let events = self
            .events
            .unwrap_or_else(|| Arc::new(InProcEventBus::new(self.config.event_capacity)));

        Ok(Orchestrator::new(self.config, provisioner, deployer, events))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use crate::config::{ExecutionMode, GatewayTimeouts};
    use crate::error::Result;
    use crate::gateway::{
        BackendHandle, BackendRole, DeploymentHandle, DeploymentPayload, ResultBatch, SizingHints,
    };

    struct NoopProvisioner;

    #[async_trait]
    impl ProvisioningGateway for NoopProvisioner {
        async fn acquire(
            &self,
            _mode: ExecutionMode,
            _hints: &SizingHints,
            _timeouts: &GatewayTimeouts,
        ) -> Result<BackendHandle> {
            Ok(BackendHandle::new(BackendRole::Worker))
        }

        async fn release(&self, _handle: &BackendHandle) -> Result<()> {
            Ok(())
        }
    }

    struct NoopDeployer;

    #[async_trait]
    impl DeploymentGateway for NoopDeployer {
        async fn deploy(
            &self,
            backend: &BackendHandle,
            _payload: &DeploymentPayload,
        ) -> Result<DeploymentHandle> {
            Ok(DeploymentHandle::new(backend.id))
        }

        async fn fetch_results(&self, _deployment: &DeploymentHandle) -> Result<ResultBatch> {
            Ok(ResultBatch::default())
        }
    }

    #[test]
    fn test_build_requires_gateways() {
        assert!(OrchestratorBuilder::new().build().is_err());

        assert!(OrchestratorBuilder::new()
            .with_provisioner(Arc::new(NoopProvisioner))
            .build()
            .is_err());

        assert!(OrchestratorBuilder::new()
            .with_provisioner(Arc::new(NoopProvisioner))
            .with_deployer(Arc::new(NoopDeployer))
            .build()
            .is_ok());
    }

    #[test]
    fn test_builder_debug_flags() {
        let builder = OrchestratorBuilder::new().with_deployer(Arc::new(NoopDeployer));
        let s = format!("{:?}", builder);
        assert!(s.contains("provisioner_set: false"));
        assert!(s.contains("deployer_set: true"));
    }
}
