//! Runner registry abstraction for the CI platform side of the lifecycle.

use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::pin::Pin;

use thiserror::Error;

use crate::label::RunnerLabel;
use crate::poll::PollSchedule;
use crate::provider::join_failures;

/// Short-lived credential that lets a runner agent register itself.
///
/// The value is only reachable through [`RegistrationToken::secret`]; it has
/// no `Display` impl and its `Debug` output is redacted.
#[derive(Clone, Eq, PartialEq)]
pub struct RegistrationToken(String);

impl RegistrationToken {
    /// Wraps a token returned by the registry.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the raw token for embedding in a bootstrap payload.
    #[must_use]
    pub const fn secret(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Debug for RegistrationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RegistrationToken(<redacted>)")
    }
}

/// Failure attributed to a single runner label.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LabelFailure {
    /// Label the failure applies to.
    pub label: RunnerLabel,
    /// Human-readable cause.
    pub cause: String,
}

impl LabelFailure {
    /// Creates a failure record.
    #[must_use]
    pub fn new(label: impl Into<RunnerLabel>, cause: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            cause: cause.into(),
        }
    }
}

impl fmt::Display for LabelFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.label, self.cause)
    }
}

/// Raised when some runners could not be removed.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("failed to remove runners: {}", join_failures(.failures))]
pub struct RunnerRemovalError {
    /// Labels whose runners were removed or were already absent.
    pub removed: Vec<RunnerLabel>,
    /// Labels whose runners remain registered.
    pub failures: Vec<LabelFailure>,
}

/// Future returned by registry operations.
pub type RegistryFuture<'a, T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'a>>;

/// Future returned by [`RunnerRegistry::wait_until_online`], which has no
/// failure mode of its own.
pub type OnlineFuture<'a> = Pin<Box<dyn Future<Output = BTreeSet<RunnerLabel>> + Send + 'a>>;

/// Capability interface implemented by CI platforms.
pub trait RunnerRegistry {
    /// Registry specific error type.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Issues a fresh registration token for the configured repository.
    fn issue_registration_token(&self) -> RegistryFuture<'_, RegistrationToken, Self::Error>;

    /// Polls the runner listing and returns the labels observed online before
    /// the schedule ran out. Partial results are not an error.
    fn wait_until_online<'a>(
        &'a self,
        labels: &'a [RunnerLabel],
        schedule: PollSchedule,
    ) -> OnlineFuture<'a>;

    /// Removes every runner carrying one of `labels`. A label without a
    /// registered runner counts as removed.
    fn remove_runners<'a>(
        &'a self,
        labels: &'a [RunnerLabel],
    ) -> RegistryFuture<'a, Vec<RunnerLabel>, RunnerRemovalError>;

    /// Resolves the download URL of the newest runner agent for a platform
    /// (for example `linux`) and architecture (for example `x64`).
    fn latest_runner_release<'a>(
        &'a self,
        platform: &'a str,
        architecture: &'a str,
    ) -> RegistryFuture<'a, String, Self::Error>;
}

/// Maps a CPU architecture name onto the runner release naming scheme.
#[must_use]
pub fn runner_architecture(architecture: &str) -> &str {
    match architecture {
        "x86_64" | "amd64" | "x64" => "x64",
        "aarch64" | "arm64" => "arm64",
        "arm" | "armv7" | "armhf" => "arm",
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn token_debug_is_redacted() {
        let token = RegistrationToken::new("super-secret");
        let debug = format!("{token:?}");
        assert!(!debug.contains("super-secret"), "debug leaked token: {debug}");
    }

    #[rstest]
    #[case("x86_64", "x64")]
    #[case("aarch64", "arm64")]
    #[case("arm64", "arm64")]
    #[case("riscv64", "riscv64")]
    fn maps_architectures(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(runner_architecture(input), expected);
    }

    #[rstest]
    fn removal_error_lists_every_label() {
        let err = RunnerRemovalError {
            removed: vec![RunnerLabel::from("runner-a")],
            failures: vec![
                LabelFailure::new("runner-b", "HTTP 500"),
                LabelFailure::new("runner-c", "HTTP 502"),
            ],
        };
        assert_eq!(
            err.to_string(),
            "failed to remove runners: runner-b: HTTP 500; runner-c: HTTP 502"
        );
    }
}
