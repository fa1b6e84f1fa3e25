//! Cloud-init user-data helpers for the Scaleway backend.
//!
//! Scaleway exposes instance user-data as a per-server key/value store. When
//! the key is set to `cloud-init`, the value is consumed by cloud-init on the
//! instance's first boot. A plain shell script is a valid cloud-init payload.

/// Reserved user-data key that Scaleway recognises for cloud-init payloads.
pub(crate) const CLOUD_INIT_USER_DATA_KEY: &str = "cloud-init";

pub(crate) fn user_data_url(api_base: &str, zone: &str, server_id: &str, key: &str) -> String {
    format!("{api_base}/zones/{zone}/servers/{server_id}/user_data/{key}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scaleway::SCALEWAY_INSTANCE_API_BASE;

    #[test]
    fn builds_user_data_url() {
        let url = user_data_url(
            SCALEWAY_INSTANCE_API_BASE,
            "fr-par-1",
            "server-123",
            CLOUD_INIT_USER_DATA_KEY,
        );
        assert_eq!(
            url,
            "https://api.scaleway.com/instance/v1/zones/fr-par-1/servers/server-123/user_data/cloud-init"
        );
    }
}
