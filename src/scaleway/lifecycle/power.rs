//! Power-on and termination for the Scaleway backend.
//!
//! Actions and deletions go through raw HTTP so the status code is visible:
//! a 404 during teardown means the resource is already gone.

use reqwest::StatusCode;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::provider::{InstanceFailure, InstanceId, PowerOnError, TerminationError};
use crate::scaleway::{ScalewayBackendError, ScalewayProvider};

use super::wait::Listing;
use super::{AttachedVolume, ServerSnapshot};

/// How a server that still exists should be removed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(in crate::scaleway) enum Removal {
    /// Use the `terminate` action, which also deletes the volumes.
    Terminate,
    /// Delete the server record, then each of its volumes.
    Delete,
}

pub(in crate::scaleway) fn removal_for(server: &ServerSnapshot) -> Removal {
    if server.allows("terminate") {
        Removal::Terminate
    } else {
        Removal::Delete
    }
}

#[derive(Serialize)]
struct ServerActionRequest<'a> {
    action: &'a str,
}

/// Whether a 404 answer counts as success.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Missing {
    Fails,
    IsGone,
}

impl ScalewayProvider {
    pub(in crate::scaleway) async fn power_on_all(
        &self,
        ids: &[InstanceId],
    ) -> Result<Vec<InstanceId>, PowerOnError> {
        let mut started = Vec::with_capacity(ids.len());
        let mut failures = Vec::new();
        for id in ids {
            match self.server_action(id.as_str(), "poweron", Missing::Fails).await {
                Ok(()) => {
                    debug!(instance_id = %id, "power-on requested");
                    started.push(id.clone());
                }
                Err(err) => failures.push(InstanceFailure::new(id.clone(), err.to_string())),
            }
        }
        if failures.is_empty() {
            Ok(started)
        } else {
            Err(PowerOnError { started, failures })
        }
    }

    pub(in crate::scaleway) async fn terminate_all(
        &self,
        ids: &[InstanceId],
    ) -> Result<Vec<InstanceId>, TerminationError> {
        match self.fetch_servers(ids).await {
            Ok(listing) => self.terminate_listed(ids, &listing).await,
            Err(err) => Err(TerminationError {
                terminated: Vec::new(),
                failures: ids
                    .iter()
                    .map(|id| InstanceFailure::new(id.clone(), err.to_string()))
                    .collect(),
            }),
        }
    }

    /// Removes every server in `ids` according to `listing`; servers the
    /// listing does not show count as terminated.
    pub(in crate::scaleway) async fn terminate_listed(
        &self,
        ids: &[InstanceId],
        listing: &Listing,
    ) -> Result<Vec<InstanceId>, TerminationError> {
        let mut terminated = Vec::with_capacity(ids.len());
        let mut failures = Vec::new();
        for id in ids {
            match self.remove_server(id, listing.get(id.as_str())).await {
                Ok(()) => terminated.push(id.clone()),
                Err(err) => failures.push(InstanceFailure::new(id.clone(), err.to_string())),
            }
        }
        info!(
            terminated = terminated.len(),
            failed = failures.len(),
            "termination requested"
        );
        if failures.is_empty() {
            Ok(terminated)
        } else {
            Err(TerminationError {
                terminated,
                failures,
            })
        }
    }

    /// Removes a server as last seen in a listing; `None` means it is gone.
    async fn remove_server(
        &self,
        id: &InstanceId,
        server: Option<&ServerSnapshot>,
    ) -> Result<(), ScalewayBackendError> {
        let Some(server) = server else {
            debug!(instance_id = %id, "server already gone");
            return Ok(());
        };
        match removal_for(server) {
            Removal::Terminate => {
                self.server_action(id.as_str(), "terminate", Missing::IsGone)
                    .await
            }
            Removal::Delete => {
                self.delete_server_and_volumes(id.as_str(), &server.volumes)
                    .await
            }
        }
    }

    /// Deletes a server that cannot be terminated, then its volumes, which
    /// a plain deletion leaves behind.
    pub(in crate::scaleway) async fn delete_server_and_volumes(
        &self,
        server_id: &str,
        volumes: &[AttachedVolume],
    ) -> Result<(), ScalewayBackendError> {
        let url = format!("{}/zones/{}/servers/{server_id}", self.api_base, self.zone);
        let request = super::HTTP_CLIENT
            .delete(&url)
            .header("X-Auth-Token", &self.secret_key);
        send_checked(request, Missing::IsGone).await?;
        debug!(instance_id = server_id, volumes = volumes.len(), "server deleted");

        let mut failures = Vec::new();
        for volume in volumes {
            if let Err(err) = self.delete_volume(volume).await {
                warn!(
                    instance_id = server_id,
                    volume_id = %volume.id,
                    error = %err,
                    "volume left behind"
                );
                failures.push(format!("{}: {err}", volume.id));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(ScalewayBackendError::VolumeCleanup {
                instance_id: server_id.to_owned(),
                volumes: failures.join("; "),
            })
        }
    }

    /// Block Storage volumes live behind their own API.
    pub(in crate::scaleway) fn volume_url(&self, volume: &AttachedVolume) -> String {
        let base = if volume.is_block_storage() {
            &self.block_api_base
        } else {
            &self.api_base
        };
        format!("{base}/zones/{}/volumes/{}", self.zone, volume.id)
    }

    async fn delete_volume(&self, volume: &AttachedVolume) -> Result<(), ScalewayBackendError> {
        let request = super::HTTP_CLIENT
            .delete(self.volume_url(volume))
            .header("X-Auth-Token", &self.secret_key);
        send_checked(request, Missing::IsGone).await
    }

    async fn server_action(
        &self,
        server_id: &str,
        action: &str,
        missing: Missing,
    ) -> Result<(), ScalewayBackendError> {
        let url = format!(
            "{}/zones/{}/servers/{server_id}/action",
            self.api_base, self.zone
        );
        let request = super::HTTP_CLIENT
            .post(&url)
            .header("X-Auth-Token", &self.secret_key)
            .json(&ServerActionRequest { action });
        send_checked(request, missing).await
    }
}

async fn send_checked(
    request: reqwest::RequestBuilder,
    missing: Missing,
) -> Result<(), ScalewayBackendError> {
    let response = request
        .send()
        .await
        .map_err(ScalewayBackendError::provider)?;
    let status = response.status();
    if status.is_success() || (status == StatusCode::NOT_FOUND && missing == Missing::IsGone) {
        return Ok(());
    }
    let body = response.text().await.unwrap_or_default();
    Err(ScalewayBackendError::Provider {
        message: format!("HTTP {status}: {body}"),
    })
}
