//! Error types for the GitHub runner registry.

use thiserror::Error;

/// Errors raised while talking to the GitHub REST API.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum GitHubError {
    /// The token was rejected or lacks the administration scope.
    #[error("GitHub rejected the credentials for {endpoint} (HTTP {status})")]
    Auth {
        /// Endpoint that refused the request.
        endpoint: String,
        /// HTTP status code, 401 or 403.
        status: u16,
    },
    /// Any other non-success HTTP status.
    #[error("GitHub API call to {endpoint} failed with HTTP {status}: {message}")]
    Http {
        /// Endpoint that failed.
        endpoint: String,
        /// HTTP status code.
        status: u16,
        /// Response body.
        message: String,
    },
    /// The request never produced a response.
    #[error("GitHub API request failed: {0}")]
    Transport(String),
    /// The response body did not have the expected shape.
    #[error("unexpected GitHub API response: {0}")]
    Decode(String),
    /// No runner release asset matches the platform and architecture.
    #[error("no runner release asset for {platform}-{architecture}")]
    ReleaseNotFound {
        /// Platform segment, for example `linux`.
        platform: String,
        /// Architecture segment, for example `x64`.
        architecture: String,
    },
    /// The client was constructed with an unusable setting.
    #[error("GitHub client configuration error: {0}")]
    Config(String),
}

impl GitHubError {
    pub(crate) fn transport(err: impl std::fmt::Display) -> Self {
        Self::Transport(err.to_string())
    }

    pub(crate) fn decode(err: impl std::fmt::Display) -> Self {
        Self::Decode(err.to_string())
    }
}
