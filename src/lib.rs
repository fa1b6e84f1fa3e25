//! Core library for the `gha-runner` ephemeral runner tool.
//!
//! The crate provisions short-lived cloud instances, registers each one as a
//! GitHub Actions self-hosted runner with a unique label, and tears both
//! sides down again once the workflow is done. Orchestration is written
//! against two capability traits, [`CloudProvider`] and [`RunnerRegistry`];
//! [`ScalewayProvider`] and [`GitHubRegistry`] are the production
//! implementations.
//!
//! The `start` path ([`Provisioner`]) produces an [`InstanceLabelMapping`]
//! that the `stop` path ([`Deprovisioner`]) consumes.

pub mod bootstrap;
pub mod config;
pub mod deprovision;
pub mod github;
pub mod label;
pub mod mapping;
pub mod outputs;
pub mod poll;
pub mod provider;
pub mod provision;
pub mod registry;
pub mod scaleway;
pub mod script;
pub mod test_support;

pub use bootstrap::{BootstrapParams, StartupPayload};
pub use config::{ConfigError, RunnerConfig, ScalewayConfig};
pub use deprovision::{Deprovisioner, TeardownReport};
pub use github::{GitHubError, GitHubRegistry};
pub use label::{LabelAllocator, RunnerLabel};
pub use mapping::{InstanceLabelMapping, MappingError};
pub use outputs::{ActionOutputs, OutputError, OutputTarget};
pub use poll::PollSchedule;
pub use provider::{
    CloudProvider, InstanceAddress, InstanceFailure, InstanceId, InstanceRequest, InstanceState,
    ProvisionedInstance,
};
pub use provision::{ProvisionError, ProvisionOutcome, Provisioner, RunnerSetup};
pub use registry::{RegistrationToken, RunnerRegistry};
pub use scaleway::{ScalewayBackendError, ScalewayProvider};
