//! Server creation helpers for the Scaleway backend.
//!
//! Scaleway servers must receive cloud-init user-data before first boot. The
//! creation request sets `stopped: true` so the bootstrap payload can be
//! written once the label is known, and the server is only powered on
//! afterwards.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::bootstrap::StartupPayload;
use crate::provider::{
    CreateError, InstanceId, InstanceRequest, InstanceState, PartialProvisionError,
    ProvisionedInstance,
};
use crate::scaleway::user_data::{CLOUD_INIT_USER_DATA_KEY, user_data_url};
use crate::scaleway::{RUNNER_TAG, ScalewayBackendError, ScalewayProvider};

use super::AttachedVolume;

#[derive(Serialize)]
struct CreateServerRequest<'a> {
    name: String,
    commercial_type: &'a str,
    image: &'a str,
    project: &'a str,
    routed_ip_enabled: bool,
    dynamic_ip_required: bool,
    tags: &'a [String],
    stopped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    security_group: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    organization: Option<&'a str>,
}

#[derive(Deserialize)]
struct CreateServerResponse {
    server: CreatedServer,
}

#[derive(Deserialize)]
struct CreatedServer {
    id: String,
    /// Keyed by attachment index.
    #[serde(default)]
    volumes: BTreeMap<String, CreatedVolume>,
}

#[derive(Deserialize)]
struct CreatedVolume {
    id: String,
    #[serde(default)]
    volume_type: String,
}

impl CreatedServer {
    fn into_parts(self) -> (String, Vec<AttachedVolume>) {
        let mut volumes: Vec<AttachedVolume> = self
            .volumes
            .into_values()
            .map(|volume| AttachedVolume {
                id: volume.id,
                volume_type: volume.volume_type,
            })
            .collect();
        volumes.sort_by(|left, right| left.id.cmp(&right.id));
        (self.id, volumes)
    }
}

#[derive(Serialize)]
struct CreatePrivateNicRequest<'a> {
    private_network_id: &'a str,
}

impl ScalewayProvider {
    fn is_instance_type_error(
        api_err: &scaleway_rs::ScalewayApiError,
        request: &InstanceRequest,
    ) -> bool {
        matches!(api_err.resource.as_deref(), Some("commercial_type"))
            || api_err
                .resource_id
                .as_deref()
                .is_some_and(|id| id == request.instance_type)
    }

    /// Rejects requests this backend cannot honour before any API call.
    pub(in crate::scaleway) fn check_request(
        &self,
        request: &InstanceRequest,
    ) -> Result<(), ScalewayBackendError> {
        request.validate()?;
        if request.zone != self.zone {
            return Err(ScalewayBackendError::Validation(format!(
                "zone {} differs from the configured zone {}",
                request.zone, self.zone
            )));
        }
        if request.instance_role.is_some() {
            return Err(ScalewayBackendError::Unsupported {
                field: "instance_role",
                reason: "Scaleway instances cannot assume an identity role",
            });
        }
        Ok(())
    }

    pub(in crate::scaleway) fn instance_tags(&self, request: &InstanceRequest) -> Vec<String> {
        let mut tags = vec![
            String::from(RUNNER_TAG),
            String::from("ephemeral"),
            self.batch_tag.clone(),
        ];
        tags.extend(
            request
                .tags
                .iter()
                .map(|tag| format!("{}={}", tag.key, tag.value)),
        );
        tags
    }

    /// Creates `request.count` stopped servers one at a time.
    ///
    /// The first failure stops the batch. Nothing created means the whole
    /// request was rejected; otherwise the created servers are returned as a
    /// partial batch.
    pub(in crate::scaleway) async fn create_batch(
        &self,
        request: &InstanceRequest,
    ) -> Result<Vec<ProvisionedInstance>, CreateError<ScalewayBackendError>> {
        self.check_request(request).map_err(CreateError::Rejected)?;
        let image_id = self
            .resolve_image_id(request)
            .await
            .map_err(CreateError::Rejected)?;
        let tags = self.instance_tags(request);

        let mut created = Vec::new();
        for slot in 0..request.count {
            match self.create_runner_server(request, &image_id, &tags).await {
                Ok(instance) => created.push(instance),
                Err(err) if created.is_empty() => return Err(CreateError::Rejected(err)),
                Err(err) => {
                    warn!(slot, error = %err, "server creation failed; stopping batch");
                    let mut failures = vec![format!("slot {slot}: {err}")];
                    failures.extend(
                        (slot + 1..request.count)
                            .map(|rest| format!("slot {rest}: not attempted after an earlier failure")),
                    );
                    return Err(CreateError::Partial(PartialProvisionError {
                        created,
                        failures,
                    }));
                }
            }
        }
        Ok(created)
    }

    async fn create_runner_server(
        &self,
        request: &InstanceRequest,
        image_id: &str,
        tags: &[String],
    ) -> Result<ProvisionedInstance, ScalewayBackendError> {
        let (server_id, volumes) = self.create_server_stopped(request, image_id, tags).await?;
        info!(instance_id = %server_id, volumes = volumes.len(), "created stopped server");

        if let Some(network_id) = request.subnet_id.as_deref()
            && let Err(err) = self.attach_private_network(&server_id, network_id).await
        {
            match self.delete_server_and_volumes(&server_id, &volumes).await {
                Ok(()) => return Err(err),
                // The server is gone; only volumes leaked.
                Err(cleanup_err @ ScalewayBackendError::VolumeCleanup { .. }) => {
                    warn!(
                        instance_id = %server_id,
                        error = %err,
                        cleanup_error = %cleanup_err,
                        "private network attach failed and volumes were left behind"
                    );
                    return Err(err);
                }
                // The server cannot be removed, so it stays in the batch and
                // is tracked like any other instance.
                Err(delete_err) => {
                    warn!(
                        instance_id = %server_id,
                        error = %err,
                        cleanup_error = %delete_err,
                        "private network attach failed and the server could not be deleted"
                    );
                }
            }
        }

        Ok(ProvisionedInstance::new(server_id, InstanceState::Pending))
    }

    async fn create_server_stopped(
        &self,
        request: &InstanceRequest,
        image_id: &str,
        tags: &[String],
    ) -> Result<(String, Vec<AttachedVolume>), ScalewayBackendError> {
        let url = format!("{}/zones/{}/servers", self.api_base, self.zone);
        let payload = CreateServerRequest {
            name: format!("{RUNNER_TAG}-{}", Uuid::new_v4().simple()),
            commercial_type: &request.instance_type,
            image: image_id,
            project: &self.project_id,
            routed_ip_enabled: true,
            dynamic_ip_required: true,
            tags,
            stopped: true,
            security_group: request.security_group_id.as_deref(),
            organization: self.organisation_id.as_deref(),
        };

        let response = super::HTTP_CLIENT
            .post(&url)
            .header("X-Auth-Token", &self.secret_key)
            .json(&payload)
            .send()
            .await
            .map_err(ScalewayBackendError::provider)?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(ScalewayBackendError::provider)?;

        if status.is_success() {
            let parsed: CreateServerResponse =
                serde_json::from_slice(&body).map_err(ScalewayBackendError::provider)?;
            return Ok(parsed.server.into_parts());
        }

        if let Ok(api_err) = serde_json::from_slice::<scaleway_rs::ScalewayApiError>(&body)
            && Self::is_instance_type_error(&api_err, request)
        {
            return Err(ScalewayBackendError::InstanceTypeUnavailable {
                instance_type: request.instance_type.clone(),
                zone: self.zone.clone(),
            });
        }

        Err(ScalewayBackendError::Provider {
            message: String::from_utf8_lossy(&body).into_owned(),
        })
    }

    async fn attach_private_network(
        &self,
        server_id: &str,
        network_id: &str,
    ) -> Result<(), ScalewayBackendError> {
        let url = format!(
            "{}/zones/{}/servers/{server_id}/private_nics",
            self.api_base, self.zone
        );
        let response = super::HTTP_CLIENT
            .post(&url)
            .header("X-Auth-Token", &self.secret_key)
            .json(&CreatePrivateNicRequest {
                private_network_id: network_id,
            })
            .send()
            .await
            .map_err(ScalewayBackendError::provider)?;

        if response.status().is_success() {
            return Ok(());
        }
        let message = response.text().await.unwrap_or_default();
        Err(ScalewayBackendError::PrivateNetworkAttachFailed {
            network_id: network_id.to_owned(),
            instance_id: server_id.to_owned(),
            message,
        })
    }

    /// Writes the bootstrap script to the server's `cloud-init` user-data.
    pub(in crate::scaleway) async fn set_user_data(
        &self,
        instance_id: &InstanceId,
        payload: &StartupPayload,
    ) -> Result<(), ScalewayBackendError> {
        let url = user_data_url(
            &self.api_base,
            &self.zone,
            instance_id.as_str(),
            CLOUD_INIT_USER_DATA_KEY,
        );
        let response = super::HTTP_CLIENT
            .patch(&url)
            .header("X-Auth-Token", &self.secret_key)
            .header(reqwest::header::CONTENT_TYPE, "text/plain")
            .body(payload.as_bytes().to_vec())
            .send()
            .await
            .map_err(ScalewayBackendError::provider)?;

        if response.status().is_success() {
            return Ok(());
        }
        let message = response.text().await.unwrap_or_default();
        Err(ScalewayBackendError::UserDataRejected {
            instance_id: instance_id.to_string(),
            message,
        })
    }
}
