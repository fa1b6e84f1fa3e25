//! Scaleway Instances implementation of [`CloudProvider`].
//!
//! Servers are created stopped so the bootstrap script can be written to the
//! `cloud-init` user-data key before the first boot; the provisioner powers
//! them on afterwards. Every server of a batch carries the `gha-runner` tag
//! and a batch tag, so an interrupted `start` can still be traced.

mod error;
mod lifecycle;
mod types;
mod user_data;

use std::collections::BTreeMap;

use scaleway_rs::ScalewayApi;
use uuid::Uuid;

use crate::bootstrap::StartupPayload;
use crate::config::ScalewayConfig;
use crate::poll::PollSchedule;
use crate::provider::{
    CloudProvider, CreateError, InstanceAddress, InstanceId, InstanceRequest, PowerOnError,
    ProviderFuture, ProvisionedInstance, ProvisioningTimeoutError, TerminationError,
};

pub use error::ScalewayBackendError;

pub(crate) const SCALEWAY_INSTANCE_API_BASE: &str = "https://api.scaleway.com/instance/v1";
pub(crate) const SCALEWAY_BLOCK_API_BASE: &str = "https://api.scaleway.com/block/v1";

/// Tag carried by every server this crate creates.
pub const RUNNER_TAG: &str = "gha-runner";

/// Prefix of the per-batch tag.
pub const BATCH_TAG_PREFIX: &str = "gha-runner-batch-";

/// Provider that manages runner servers through the Scaleway Instances API.
#[derive(Clone)]
pub struct ScalewayProvider {
    api: ScalewayApi,
    secret_key: String,
    project_id: String,
    organisation_id: Option<String>,
    zone: String,
    api_base: String,
    block_api_base: String,
    batch_tag: String,
}

impl ScalewayProvider {
    /// Constructs a provider from configuration.
    ///
    /// Every operation targets `default_zone`, which is also the only zone
    /// `create_instances` accepts.
    ///
    /// # Errors
    ///
    /// Returns [`ScalewayBackendError::Config`] when the credentials or zone
    /// are missing.
    pub fn new(config: &ScalewayConfig) -> Result<Self, ScalewayBackendError> {
        config.validate_credentials()?;
        Ok(Self {
            api: ScalewayApi::new(&config.secret_key),
            secret_key: config.secret_key.clone(),
            project_id: config.default_project_id.clone(),
            organisation_id: config.default_organization_id.clone(),
            zone: config.default_zone.clone(),
            api_base: SCALEWAY_INSTANCE_API_BASE.to_owned(),
            block_api_base: SCALEWAY_BLOCK_API_BASE.to_owned(),
            batch_tag: format!("{BATCH_TAG_PREFIX}{}", Uuid::new_v4().simple()),
        })
    }

    /// Sends raw HTTP calls, Instance and Block Storage alike, to
    /// `api_base` instead of the public endpoints.
    #[must_use]
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_owned();
        self.block_api_base.clone_from(&self.api_base);
        self
    }

    /// Tag shared by every server created through this provider value.
    #[must_use]
    pub fn batch_tag(&self) -> &str {
        &self.batch_tag
    }

    /// Zone every operation targets.
    #[must_use]
    pub fn zone(&self) -> &str {
        &self.zone
    }
}

impl CloudProvider for ScalewayProvider {
    type Error = ScalewayBackendError;

    fn create_instances<'a>(
        &'a self,
        request: &'a InstanceRequest,
    ) -> ProviderFuture<'a, Vec<ProvisionedInstance>, CreateError<Self::Error>> {
        Box::pin(async move { self.create_batch(request).await })
    }

    fn attach_startup_payload<'a>(
        &'a self,
        instance_id: &'a InstanceId,
        payload: &'a StartupPayload,
    ) -> ProviderFuture<'a, (), Self::Error> {
        Box::pin(async move { self.set_user_data(instance_id, payload).await })
    }

    fn power_on<'a>(
        &'a self,
        instance_ids: &'a [InstanceId],
    ) -> ProviderFuture<'a, Vec<InstanceId>, PowerOnError> {
        Box::pin(async move { self.power_on_all(instance_ids).await })
    }

    fn wait_until_running<'a>(
        &'a self,
        instance_ids: &'a [InstanceId],
        schedule: PollSchedule,
    ) -> ProviderFuture<'a, BTreeMap<InstanceId, InstanceAddress>, ProvisioningTimeoutError> {
        Box::pin(async move {
            lifecycle::poll_until_running(instance_ids, schedule, || {
                self.fetch_servers(instance_ids)
            })
            .await
        })
    }

    fn terminate<'a>(
        &'a self,
        instance_ids: &'a [InstanceId],
    ) -> ProviderFuture<'a, Vec<InstanceId>, TerminationError> {
        Box::pin(async move { self.terminate_all(instance_ids).await })
    }

    fn wait_until_terminated<'a>(
        &'a self,
        instance_ids: &'a [InstanceId],
        schedule: PollSchedule,
    ) -> ProviderFuture<'a, (), TerminationError> {
        Box::pin(async move {
            lifecycle::poll_until_gone(instance_ids, schedule, || {
                self.fetch_servers(instance_ids)
            })
            .await
        })
    }
}
