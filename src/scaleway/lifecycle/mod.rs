//! Instance lifecycle helpers for the Scaleway backend.

use std::sync::LazyLock;
use std::time::Duration;

mod create;
mod image;
mod power;
mod wait;

use crate::scaleway::types::{Action, ServerState};

pub(super) use wait::{poll_until_gone, poll_until_running};

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Servers requested per listing call; matches the page size asked for.
const LIST_PAGE_SIZE: usize = 100;

static HTTP_CLIENT: LazyLock<reqwest::Client> = LazyLock::new(|| {
    reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
});

/// Volume type managed by the Block Storage API rather than the Instance API.
const BLOCK_VOLUME_TYPE: &str = "sbs_volume";

/// Volume attached to a server.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct AttachedVolume {
    pub(crate) id: String,
    pub(crate) volume_type: String,
}

impl AttachedVolume {
    pub(crate) fn is_block_storage(&self) -> bool {
        self.volume_type == BLOCK_VOLUME_TYPE
    }
}

/// Slim view of a server as returned by the listing endpoint.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct ServerSnapshot {
    pub(crate) id: String,
    pub(crate) state: ServerState,
    pub(crate) allowed_actions: Vec<Action>,
    pub(crate) public_ip: Option<String>,
    /// Sorted by volume id.
    pub(crate) volumes: Vec<AttachedVolume>,
}

impl ServerSnapshot {
    pub(crate) fn allows(&self, action: &str) -> bool {
        self.allowed_actions
            .iter()
            .any(|allowed| allowed.as_str() == action)
    }
}

impl From<scaleway_rs::ScalewayInstance> for ServerSnapshot {
    fn from(server: scaleway_rs::ScalewayInstance) -> Self {
        let mut volumes: Vec<AttachedVolume> = server
            .volumes
            .volumes
            .into_values()
            .map(|volume| AttachedVolume {
                id: volume.id,
                volume_type: volume.volume_type,
            })
            .collect();
        volumes.sort_by(|left, right| left.id.cmp(&right.id));
        Self {
            id: server.id,
            state: server.state.into(),
            allowed_actions: server
                .allowed_actions
                .into_iter()
                .map(Action::from)
                .collect(),
            public_ip: server.public_ip.map(|ip| ip.address),
            volumes,
        }
    }
}
