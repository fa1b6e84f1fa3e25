//! Error types for the Scaleway backend.

use crate::config::ConfigError;
use crate::provider::BackendError;
use scaleway_rs::ScalewayError;
use thiserror::Error;

/// Errors raised by the Scaleway backend.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ScalewayBackendError {
    /// Raised when the high-level configuration is incomplete.
    #[error("configuration error: {0}")]
    Config(String),
    /// Raised when a request is missing a required field.
    #[error("invalid instance request: {0}")]
    Validation(String),
    /// Raised when a request uses a setting Scaleway has no equivalent for.
    #[error("{field} is not supported by the Scaleway backend: {reason}")]
    Unsupported {
        /// Request field that cannot be honoured.
        field: &'static str,
        /// Why the field cannot be honoured.
        reason: &'static str,
    },
    /// Raised when the requested image label cannot be resolved.
    #[error("image '{label}' (arch {arch}) not found in zone {zone}")]
    ImageNotFound {
        /// Image label passed by the caller.
        label: String,
        /// Architecture requested by the caller.
        arch: String,
        /// Zone used for the lookup.
        zone: String,
    },
    /// Raised when the server type is not available in the selected zone.
    #[error("instance type '{instance_type}' not available in zone {zone}")]
    InstanceTypeUnavailable {
        /// Requested commercial type.
        instance_type: String,
        /// Target zone.
        zone: String,
    },
    /// Raised when a private network cannot be attached to a new server.
    #[error("failed to attach private network {network_id} to instance {instance_id}: {message}")]
    PrivateNetworkAttachFailed {
        /// Private network identifier.
        network_id: String,
        /// Instance identifier.
        instance_id: String,
        /// Error message from the provider.
        message: String,
    },
    /// Raised when user-data cannot be written to a server.
    #[error("failed to set user data on instance {instance_id}: {message}")]
    UserDataRejected {
        /// Instance identifier.
        instance_id: String,
        /// Error message from the provider.
        message: String,
    },
    /// Raised when a deleted server left volumes that could not be removed.
    #[error("failed to delete volumes of instance {instance_id}: {volumes}")]
    VolumeCleanup {
        /// Instance identifier.
        instance_id: String,
        /// Each volume that survived, with the reason.
        volumes: String,
    },
    /// Wrapper for provider level failures.
    #[error("provider error: {message}")]
    Provider {
        /// Message returned by the provider SDK.
        message: String,
    },
}

impl ScalewayBackendError {
    pub(crate) fn provider(err: impl std::fmt::Display) -> Self {
        Self::Provider {
            message: err.to_string(),
        }
    }
}

impl From<ScalewayError> for ScalewayBackendError {
    fn from(value: ScalewayError) -> Self {
        Self::provider(value)
    }
}

impl From<BackendError> for ScalewayBackendError {
    fn from(value: BackendError) -> Self {
        match value {
            BackendError::Validation(field) => Self::Validation(field),
        }
    }
}

impl From<ConfigError> for ScalewayBackendError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value.to_string())
    }
}
