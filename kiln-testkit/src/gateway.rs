use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use kiln::config::{ExecutionMode, GatewayTimeouts};
use kiln::error::{Error, Result};
use kiln::gateway::{
    BackendHandle, BackendId, DeploymentGateway, DeploymentHandle, DeploymentPayload,
    ProvisioningGateway, ResultBatch, SizingHints,
};

/// Scripted behavior for [`FakeProvisioner::acquire`].
#[derive(Clone, Copy, Debug)]
pub enum ProvisionBehavior {
    /// Every acquisition succeeds instantly.
    Succeed,
    /// Every acquisition fails.
    Fail { transient: bool },
    /// Fail transiently this many times, then succeed.
    FlakyThenSucceed { failures: u16 },
    /// Never return; exercises abort while blocked in a gateway call.
    Hang,
}

/// Recording fake for the provisioning gateway.
///
/// Records every handle it ever returned and every release call, so
/// tests can assert the teardown invariant: release is invoked at least
/// once for every handle returned by acquire.
#[derive(Clone)]
pub struct FakeProvisioner {
    behavior: Arc<Mutex<ProvisionBehavior>>,
    release_fails: Arc<Mutex<bool>>,
    acquired: Arc<Mutex<Vec<BackendHandle>>>,
    released: Arc<Mutex<Vec<BackendId>>>,
}

impl FakeProvisioner {
    pub fn new() -> Self {
        Self::with_behavior(ProvisionBehavior::Succeed)
    }

    pub fn with_behavior(behavior: ProvisionBehavior) -> Self {
        Self {
            behavior: Arc::new(Mutex::new(behavior)),
            release_fails: Arc::new(Mutex::new(false)),
            acquired: Arc::new(Mutex::new(Vec::new())),
            released: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn set_behavior(&self, behavior: ProvisionBehavior) {
        *self.behavior.lock() = behavior;
    }

    /// Make every subsequent release call fail, orphaning backends.
    pub fn set_release_fails(&self, fails: bool) {
        *self.release_fails.lock() = fails;
    }

    /// Every handle ever returned by `acquire`.
    pub fn acquired(&self) -> Vec<BackendHandle> {
        self.acquired.lock().clone()
    }

    pub fn acquire_count(&self) -> usize {
        self.acquired.lock().len()
    }

    /// Every backend id `release` was called with.
    pub fn released(&self) -> Vec<BackendId> {
        self.released.lock().clone()
    }

    pub fn release_count(&self) -> usize {
        self.released.lock().len()
    }

    /// Assert that release was invoked at least once for every handle
    /// ever returned by acquire.
    pub fn assert_all_released(&self) {
        let acquired = self.acquired.lock();
        let released = self.released.lock();
        for handle in acquired.iter() {
            assert!(
                released.contains(&handle.id),
                "backend {} was acquired but never released",
                handle.id
            );
        }
    }
}

impl Default for FakeProvisioner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProvisioningGateway for FakeProvisioner {
    async fn acquire(
        &self,
        _mode: ExecutionMode,
        hints: &SizingHints,
        _timeouts: &GatewayTimeouts,
    ) -> Result<BackendHandle> {
        let behavior = *self.behavior.lock();
        match behavior {
            ProvisionBehavior::Succeed => {}
            ProvisionBehavior::Fail { transient } => {
                return Err(Error::Provisioning {
                    message: "scripted provisioning failure".to_string(),
                    transient,
                });
            }
            ProvisionBehavior::FlakyThenSucceed { failures } => {
                if failures > 0 {
                    *self.behavior.lock() = ProvisionBehavior::FlakyThenSucceed {
                        failures: failures - 1,
                    };
                    return Err(Error::Provisioning {
                        message: "scripted transient failure".to_string(),
                        transient: true,
                    });
                }
            }
            ProvisionBehavior::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                return Err(Error::Provisioning {
                    message: "hang elapsed".to_string(),
                    transient: false,
                });
            }
        }

        let mut handle = BackendHandle::new(hints.role);
        handle.public_ip = Some("127.0.0.1".to_string());
        handle.port = Some(5555);
        self.acquired.lock().push(handle.clone());
        Ok(handle)
    }

    async fn release(&self, handle: &BackendHandle) -> Result<()> {
        self.released.lock().push(handle.id);
        if *self.release_fails.lock() {
            return Err(Error::Provisioning {
                message: "scripted release failure".to_string(),
                transient: false,
            });
        }
        Ok(())
    }
}

/// Scripted behavior for [`FakeDeployer::deploy`].
#[derive(Clone, Copy, Debug)]
pub enum DeployBehavior {
    /// Every deployment succeeds.
    Succeed,
    /// Every deployment fails.
    Fail,
    /// The first `successes` deployments succeed, the rest fail.
    /// Exercises partial-deployment teardown.
    FailAfter { successes: usize },
    /// Fail transiently this many times, then succeed.
    FlakyThenSucceed { failures: u16 },
}

/// Recording fake for the deployment gateway.
///
/// `fetch_results` serves whatever [`ResultBatch`] the test scripted;
/// the default is an empty, complete batch so a started job finishes
/// immediately.
#[derive(Clone)]
pub struct FakeDeployer {
    behavior: Arc<Mutex<DeployBehavior>>,
    batch: Arc<Mutex<ResultBatch>>,
    deployed: Arc<Mutex<Vec<BackendId>>>,
    fetches: Arc<Mutex<usize>>,
}

impl FakeDeployer {
    pub fn new() -> Self {
        Self::with_behavior(DeployBehavior::Succeed)
    }

    pub fn with_behavior(behavior: DeployBehavior) -> Self {
        Self {
            behavior: Arc::new(Mutex::new(behavior)),
            batch: Arc::new(Mutex::new(ResultBatch {
                targets: Vec::new(),
                complete: true,
            })),
            deployed: Arc::new(Mutex::new(Vec::new())),
            fetches: Arc::new(Mutex::new(0)),
        }
    }

    pub fn set_behavior(&self, behavior: DeployBehavior) {
        *self.behavior.lock() = behavior;
    }

    /// Script the batch every deployment reports from now on.
    pub fn set_batch(&self, batch: ResultBatch) {
        *self.batch.lock() = batch;
    }

    /// Backends that were successfully deployed to.
    pub fn deployed(&self) -> Vec<BackendId> {
        self.deployed.lock().clone()
    }

    pub fn deploy_count(&self) -> usize {
        self.deployed.lock().len()
    }

    pub fn fetch_count(&self) -> usize {
        *self.fetches.lock()
    }
}

impl Default for FakeDeployer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeploymentGateway for FakeDeployer {
    async fn deploy(
        &self,
        backend: &BackendHandle,
        _payload: &DeploymentPayload,
    ) -> Result<DeploymentHandle> {
        let behavior = *self.behavior.lock();
        let allowed = match behavior {
            DeployBehavior::Succeed => true,
            DeployBehavior::Fail => false,
            DeployBehavior::FailAfter { successes } => self.deployed.lock().len() < successes,
            DeployBehavior::FlakyThenSucceed { failures } => {
                if failures > 0 {
                    *self.behavior.lock() = DeployBehavior::FlakyThenSucceed {
                        failures: failures - 1,
                    };
                    return Err(Error::Deployment {
                        message: "scripted transient failure".to_string(),
                        transient: true,
                    });
                }
                true
            }
        };

        if !allowed {
            return Err(Error::Deployment {
                message: "scripted deployment failure".to_string(),
                transient: false,
            });
        }

        self.deployed.lock().push(backend.id);
        Ok(DeploymentHandle::new(backend.id))
    }

    async fn fetch_results(&self, _deployment: &DeploymentHandle) -> Result<ResultBatch> {
        *self.fetches.lock() += 1;
        Ok(self.batch.lock().clone())
    }
}
