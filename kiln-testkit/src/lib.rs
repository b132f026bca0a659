//! Test fixtures for kiln orchestration.
//!
//! Provides recording fake gateways ([`FakeProvisioner`],
//! [`FakeDeployer`]) whose behavior can be scripted per test, plus
//! canned model sources and job configurations.

pub mod fixtures;
pub mod gateway;

pub use fixtures::*;
pub use gateway::*;
