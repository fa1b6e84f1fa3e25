//! Cloud provider abstraction for provisioning disposable runner instances.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;

use thiserror::Error;

use crate::bootstrap::StartupPayload;
use crate::label::{DEFAULT_LABEL_PREFIX, RunnerLabel};
use crate::poll::PollSchedule;

/// Provider-assigned identity of a compute instance.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct InstanceId(String);

impl InstanceId {
    /// Wraps a provider identity.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the identity as a string slice.
    #[must_use]
    pub const fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for InstanceId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for InstanceId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl AsRef<str> for InstanceId {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

/// Lifecycle of a provisioned instance as seen by the orchestrators.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum InstanceState {
    /// Accepted by the provider but not yet scheduled.
    Requested,
    /// Created and booting, or stopped and waiting to be powered on.
    Pending,
    /// Booted and usable.
    Running,
    /// The provider gave up on the instance.
    Failed,
    /// The instance no longer exists.
    Terminated,
}

/// Key/value tag applied to every instance of a batch.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ResourceTag {
    /// Tag key.
    pub key: String,
    /// Tag value.
    pub value: String,
}

/// Parameters required to provision a batch of runner instances.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstanceRequest {
    /// Machine image identifier or label.
    pub image: String,
    /// Instance size or commercial type (for example `DEV1-S`).
    pub instance_type: String,
    /// Availability zone or region hosting the batch.
    pub zone: String,
    /// CPU architecture, used for image resolution and the runner download.
    pub architecture: String,
    /// Number of instances to create; at least one.
    pub count: u32,
    /// Optional subnet or private network to attach.
    pub subnet_id: Option<String>,
    /// Optional security group.
    pub security_group_id: Option<String>,
    /// Optional instance role or identity.
    pub instance_role: Option<String>,
    /// Tags applied to every instance.
    pub tags: Vec<ResourceTag>,
    /// Directory the bootstrap script works from on the instance.
    pub home_dir: String,
    /// Labels attached to every runner in addition to its unique label.
    pub extra_labels: Vec<String>,
    /// Prefix of the generated unique runner labels.
    pub label_prefix: String,
}

impl InstanceRequest {
    /// Starts a builder for an [`InstanceRequest`].
    #[must_use]
    pub fn builder() -> InstanceRequestBuilder {
        InstanceRequestBuilder::new()
    }

    /// Validates the request, naming the first offending field.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Validation`] when a required string is empty,
    /// the count is zero, or an extra label contains a comma.
    pub fn validate(&self) -> Result<(), BackendError> {
        let required = [
            ("image", self.image.as_str()),
            ("instance_type", self.instance_type.as_str()),
            ("zone", self.zone.as_str()),
            ("architecture", self.architecture.as_str()),
            ("home_dir", self.home_dir.as_str()),
            ("label_prefix", self.label_prefix.as_str()),
        ];
        for (field, value) in required {
            if value.is_empty() {
                return Err(BackendError::Validation(field.to_owned()));
            }
        }
        if self.count == 0 {
            return Err(BackendError::Validation(String::from("count")));
        }
        if self
            .extra_labels
            .iter()
            .any(|label| label.is_empty() || label.contains(','))
        {
            return Err(BackendError::Validation(String::from("extra_labels")));
        }
        Ok(())
    }
}

/// Builder for [`InstanceRequest`] that trims inputs and validates on build.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct InstanceRequestBuilder {
    image: String,
    instance_type: String,
    zone: String,
    architecture: String,
    count: u32,
    subnet_id: Option<String>,
    security_group_id: Option<String>,
    instance_role: Option<String>,
    tags: Vec<ResourceTag>,
    home_dir: String,
    extra_labels: Vec<String>,
    label_prefix: Option<String>,
}

impl InstanceRequestBuilder {
    /// Creates a builder for a single instance.
    #[must_use]
    pub fn new() -> Self {
        Self {
            count: 1,
            ..Self::default()
        }
    }

    /// Sets the image identifier or label.
    #[must_use]
    pub fn image(mut self, value: impl Into<String>) -> Self {
        self.image = value.into();
        self
    }

    /// Sets the instance type.
    #[must_use]
    pub fn instance_type(mut self, value: impl Into<String>) -> Self {
        self.instance_type = value.into();
        self
    }

    /// Sets the zone or region.
    #[must_use]
    pub fn zone(mut self, value: impl Into<String>) -> Self {
        self.zone = value.into();
        self
    }

    /// Sets the CPU architecture.
    #[must_use]
    pub fn architecture(mut self, value: impl Into<String>) -> Self {
        self.architecture = value.into();
        self
    }

    /// Sets the number of instances.
    #[must_use]
    pub const fn count(mut self, value: u32) -> Self {
        self.count = value;
        self
    }

    /// Sets the optional subnet.
    #[must_use]
    pub fn subnet_id(mut self, value: Option<String>) -> Self {
        self.subnet_id = value;
        self
    }

    /// Sets the optional security group.
    #[must_use]
    pub fn security_group_id(mut self, value: Option<String>) -> Self {
        self.security_group_id = value;
        self
    }

    /// Sets the optional instance role.
    #[must_use]
    pub fn instance_role(mut self, value: Option<String>) -> Self {
        self.instance_role = value;
        self
    }

    /// Sets the resource tags.
    #[must_use]
    pub fn tags(mut self, value: Vec<ResourceTag>) -> Self {
        self.tags = value;
        self
    }

    /// Sets the bootstrap home directory.
    #[must_use]
    pub fn home_dir(mut self, value: impl Into<String>) -> Self {
        self.home_dir = value.into();
        self
    }

    /// Sets the extra runner labels.
    #[must_use]
    pub fn extra_labels<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_labels = values.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the prefix of generated runner labels.
    #[must_use]
    pub fn label_prefix(mut self, value: impl Into<String>) -> Self {
        self.label_prefix = Some(value.into());
        self
    }

    /// Builds and validates the [`InstanceRequest`].
    ///
    /// Blank optional values collapse to `None` and blank extra labels are
    /// dropped.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Validation`] when a required field is empty or
    /// the count is zero.
    pub fn build(self) -> Result<InstanceRequest, BackendError> {
        let request = InstanceRequest {
            image: self.image.trim().to_owned(),
            instance_type: self.instance_type.trim().to_owned(),
            zone: self.zone.trim().to_owned(),
            architecture: self.architecture.trim().to_owned(),
            count: self.count,
            subnet_id: non_blank(self.subnet_id),
            security_group_id: non_blank(self.security_group_id),
            instance_role: non_blank(self.instance_role),
            tags: self.tags,
            home_dir: self.home_dir.trim().to_owned(),
            extra_labels: self
                .extra_labels
                .iter()
                .map(|label| label.trim().to_owned())
                .filter(|label| !label.is_empty())
                .collect(),
            label_prefix: self
                .label_prefix
                .map_or_else(|| DEFAULT_LABEL_PREFIX.to_owned(), |p| p.trim().to_owned()),
        };
        request.validate()?;
        Ok(request)
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|inner| inner.trim().to_owned())
        .filter(|inner| !inner.is_empty())
}

/// One compute resource created for a batch.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProvisionedInstance {
    /// Provider identity.
    pub id: InstanceId,
    /// Last known lifecycle state.
    pub state: InstanceState,
    /// Runner label, once assigned by the provisioner.
    pub label: Option<RunnerLabel>,
}

impl ProvisionedInstance {
    /// Creates an instance record without a label.
    #[must_use]
    pub fn new(id: impl Into<InstanceId>, state: InstanceState) -> Self {
        Self {
            id: id.into(),
            state,
            label: None,
        }
    }
}

/// Addressing information reported once an instance is running.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct InstanceAddress {
    /// Public address, when the provider assigned one.
    pub public_ip: Option<IpAddr>,
}

/// Failure attributed to a single instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstanceFailure {
    /// Instance the failure applies to.
    pub instance_id: InstanceId,
    /// Human-readable cause.
    pub cause: String,
}

impl InstanceFailure {
    /// Creates a failure record.
    #[must_use]
    pub fn new(instance_id: impl Into<InstanceId>, cause: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            cause: cause.into(),
        }
    }
}

impl fmt::Display for InstanceFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.instance_id, self.cause)
    }
}

/// Joins failure records into one `; `-separated message.
#[must_use]
pub fn join_failures<T: fmt::Display>(failures: &[T]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors raised by request validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum BackendError {
    /// Raised when a request is missing a required field.
    #[error("missing or invalid field: {0}")]
    Validation(String),
}

/// Raised when the provider created only part of a batch.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error(
    "provider created {} of {} instances: {}",
    .created.len(),
    .created.len() + .failures.len(),
    .failures.join("; ")
)]
pub struct PartialProvisionError {
    /// Instances that were created and must be tracked.
    pub created: Vec<ProvisionedInstance>,
    /// Cause for each slot the provider rejected.
    pub failures: Vec<String>,
}

/// Errors returned by [`CloudProvider::create_instances`].
#[derive(Debug, Error)]
pub enum CreateError<E>
where
    E: std::error::Error + 'static,
{
    /// The provider rejected the whole batch; nothing was created.
    #[error("provider rejected the batch: {0}")]
    Rejected(#[source] E),
    /// Some instances were created before the provider stopped accepting.
    #[error(transparent)]
    Partial(PartialProvisionError),
}

/// Raised when instances fail to power on.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("failed to power on instances: {}", join_failures(.failures))]
pub struct PowerOnError {
    /// Instances that were powered on.
    pub started: Vec<InstanceId>,
    /// Instances that could not be powered on.
    pub failures: Vec<InstanceFailure>,
}

/// Raised when some instances did not reach the running state in time.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("instances not running before the deadline: {}", join_failures(.failures))]
pub struct ProvisioningTimeoutError {
    /// Instances that did become ready, with their addresses.
    pub ready: BTreeMap<InstanceId, InstanceAddress>,
    /// Instances that stayed pending, failed, or disappeared.
    pub failures: Vec<InstanceFailure>,
}

/// Raised when some instances could not be terminated.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("failed to terminate instances: {}", join_failures(.failures))]
pub struct TerminationError {
    /// Instances that were terminated (or were already gone).
    pub terminated: Vec<InstanceId>,
    /// Instances that remain, with their causes.
    pub failures: Vec<InstanceFailure>,
}

/// Future returned by provider operations.
pub type ProviderFuture<'a, T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'a>>;

/// Capability interface implemented by cloud providers.
pub trait CloudProvider {
    /// Provider specific error type for whole-request failures.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Requests `request.count` instances as one logical batch.
    fn create_instances<'a>(
        &'a self,
        request: &'a InstanceRequest,
    ) -> ProviderFuture<'a, Vec<ProvisionedInstance>, CreateError<Self::Error>>;

    /// Supplies the startup payload consumed on the instance's first boot.
    fn attach_startup_payload<'a>(
        &'a self,
        instance_id: &'a InstanceId,
        payload: &'a StartupPayload,
    ) -> ProviderFuture<'a, (), Self::Error>;

    /// Boots instances that were created in a stopped state.
    fn power_on<'a>(
        &'a self,
        instance_ids: &'a [InstanceId],
    ) -> ProviderFuture<'a, Vec<InstanceId>, PowerOnError>;

    /// Polls until every instance is running or the schedule runs out.
    fn wait_until_running<'a>(
        &'a self,
        instance_ids: &'a [InstanceId],
        schedule: PollSchedule,
    ) -> ProviderFuture<'a, BTreeMap<InstanceId, InstanceAddress>, ProvisioningTimeoutError>;

    /// Terminates instances; unknown identities count as terminated.
    fn terminate<'a>(
        &'a self,
        instance_ids: &'a [InstanceId],
    ) -> ProviderFuture<'a, Vec<InstanceId>, TerminationError>;

    /// Polls until none of the instances is visible any more.
    fn wait_until_terminated<'a>(
        &'a self,
        instance_ids: &'a [InstanceId],
        schedule: PollSchedule,
    ) -> ProviderFuture<'a, (), TerminationError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn builder() -> InstanceRequestBuilder {
        InstanceRequest::builder()
            .image(" ubuntu ")
            .instance_type("DEV1-S")
            .zone("fr-par-1")
            .architecture("x86_64")
            .home_dir("/root")
    }

    #[rstest]
    fn build_trims_and_defaults() {
        let request = builder()
            .subnet_id(Some(String::from("  ")))
            .extra_labels(["gpu", " ", "linux "])
            .build()
            .expect("request should build");

        assert_eq!(request.image, "ubuntu");
        assert_eq!(request.count, 1);
        assert_eq!(request.subnet_id, None);
        assert_eq!(request.extra_labels, vec!["gpu", "linux"]);
        assert_eq!(request.label_prefix, DEFAULT_LABEL_PREFIX);
    }

    #[rstest]
    #[case(builder().image(""), "image")]
    #[case(builder().zone(" "), "zone")]
    #[case(builder().home_dir(""), "home_dir")]
    #[case(builder().count(0), "count")]
    #[case(builder().extra_labels(["a,b"]), "extra_labels")]
    fn build_rejects_invalid_fields(#[case] candidate: InstanceRequestBuilder, #[case] field: &str) {
        let err = candidate.build().expect_err("request should be invalid");
        assert_eq!(err, BackendError::Validation(field.to_owned()));
    }

    #[rstest]
    fn partial_error_reports_counts() {
        let err = PartialProvisionError {
            created: vec![ProvisionedInstance::new("a", InstanceState::Pending)],
            failures: vec![String::from("quota exceeded")],
        };
        assert_eq!(
            err.to_string(),
            "provider created 1 of 2 instances: quota exceeded"
        );
    }

    #[rstest]
    fn timeout_error_names_every_failure() {
        let err = ProvisioningTimeoutError {
            ready: BTreeMap::new(),
            failures: vec![
                InstanceFailure::new("a", "still pending"),
                InstanceFailure::new("b", "locked"),
            ],
        };
        let message = err.to_string();
        assert!(message.contains("a: still pending"), "{message}");
        assert!(message.contains("b: locked"), "{message}");
    }
}
