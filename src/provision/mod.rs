//! The `start` path: turns an [`InstanceRequest`] into registered runners.
//!
//! The provisioner creates the batch, gives every instance a unique runner
//! label, attaches a bootstrap payload carrying a fresh registration token,
//! boots the instances and waits for them to run. Instances that fail any step
//! are terminated on the spot and excluded; the rest end up in the
//! [`InstanceLabelMapping`] handed to the `stop` path.
//!
//! Instances are only tracked once the mapping has been emitted. If the
//! process is interrupted earlier, instances that were already created are
//! not cleaned up and have to be found through their batch tag.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Display;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::bootstrap::{BootstrapParams, render};
use crate::label::{LabelAllocator, RunnerLabel};
use crate::mapping::{InstanceLabelMapping, MappingError};
use crate::poll::{DEFAULT_POLL_INTERVAL, DEFAULT_REGISTRATION_TIMEOUT, PollSchedule};
use crate::provider::{
    BackendError, CloudProvider, CreateError, InstanceAddress, InstanceFailure, InstanceId,
    InstanceRequest, InstanceState, PartialProvisionError, ProvisionedInstance, join_failures,
};
use crate::registry::{RunnerRegistry, runner_architecture};

/// Platform segment of the runner release asset names.
pub const RUNNER_PLATFORM: &str = "linux";

/// Registry-side settings of a batch.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RunnerSetup {
    /// URL the runners register against, for example
    /// `https://github.com/owner/repo`.
    pub repository_url: String,
    /// Runner agent archive; the latest release is looked up when unset.
    pub runner_download_url: Option<String>,
    /// Shell snippet sourced before the agent is installed.
    pub pre_install_script: Option<String>,
    /// Whether to wait for every runner to show up online.
    pub wait_for_registration: bool,
}

/// Result of a provisioning run that produced at least one running instance.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ProvisionOutcome {
    /// Every instance that is still running, including instances whose
    /// rollback termination failed.
    pub mapping: InstanceLabelMapping,
    /// Final state and label of every instance the provider created.
    pub instances: Vec<ProvisionedInstance>,
    /// Addresses of the instances that reached the running state.
    pub addresses: BTreeMap<InstanceId, InstanceAddress>,
    /// Instances that were excluded from the batch, with their causes.
    pub failures: Vec<InstanceFailure>,
    /// Causes of the slots the provider refused to create.
    pub rejected_slots: Vec<String>,
    /// Excluded instances whose termination also failed. They remain in the
    /// mapping.
    pub rollback_failures: Vec<InstanceFailure>,
    /// Labels that were not seen online before the registration deadline.
    pub unregistered: Vec<RunnerLabel>,
}

impl ProvisionOutcome {
    /// Returns `true` when every requested instance is running.
    ///
    /// Unregistered runners do not count as failures; they are tracked in
    /// the mapping and reported separately.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty() && self.rejected_slots.is_empty()
    }
}

/// Errors surfaced by [`Provisioner::execute`].
#[derive(Debug, Error)]
pub enum ProvisionError<ProviderError, RegistryError>
where
    ProviderError: std::error::Error + 'static,
    RegistryError: std::error::Error + 'static,
{
    /// Raised when the request fails validation; nothing was created.
    #[error("invalid instance request: {0}")]
    InvalidRequest(#[from] BackendError),
    /// Raised when the runner release could not be resolved; nothing was
    /// created.
    #[error("failed to resolve the runner release: {0}")]
    RunnerRelease(#[source] RegistryError),
    /// Raised when the provider rejected the whole batch; nothing was
    /// created.
    #[error("provider rejected the batch: {0}")]
    Rejected(#[source] ProviderError),
    /// Raised when the provider reported a partial batch with no instance.
    #[error(transparent)]
    NothingCreated(PartialProvisionError),
    /// Raised when a registration token could not be issued. Every created
    /// instance was rolled back.
    #[error("failed to issue a registration token: {source}")]
    Registry {
        /// Underlying registry error.
        #[source]
        source: RegistryError,
        /// Instances whose rollback failed and that must still be cleaned up.
        residual: InstanceLabelMapping,
    },
    /// Raised when no instance became ready.
    #[error("no instance became ready: {}", join_failures(.failures))]
    NoneReady {
        /// Cause for every instance of the batch.
        failures: Vec<InstanceFailure>,
        /// Instances whose rollback failed and that must still be cleaned up.
        residual: InstanceLabelMapping,
    },
    /// Raised when the final mapping could not be assembled.
    #[error("failed to build the instance mapping: {0}")]
    Mapping(#[from] MappingError),
}

impl<PE, RE> ProvisionError<PE, RE>
where
    PE: std::error::Error + 'static,
    RE: std::error::Error + 'static,
{
    /// Instances left behind by a failed run, if any.
    #[must_use]
    pub const fn residual_mapping(&self) -> Option<&InstanceLabelMapping> {
        match self {
            Self::Registry { residual, .. } | Self::NoneReady { residual, .. } => Some(residual),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
struct Assigned {
    id: InstanceId,
    label: RunnerLabel,
}

/// Bookkeeping for instances dropped from the batch.
#[derive(Debug, Default)]
struct Ledger {
    failures: Vec<InstanceFailure>,
    rollback_failures: Vec<InstanceFailure>,
    states: BTreeMap<InstanceId, InstanceState>,
}

/// Drives the `start` path against a provider and a registry.
#[derive(Debug)]
pub struct Provisioner<P, R> {
    provider: P,
    registry: R,
    setup: RunnerSetup,
    ready_schedule: PollSchedule,
    registration_schedule: PollSchedule,
}

impl<P, R> Provisioner<P, R>
where
    P: CloudProvider,
    R: RunnerRegistry,
{
    /// Creates a provisioner with the default polling schedules.
    #[must_use]
    pub fn new(provider: P, registry: R, setup: RunnerSetup) -> Self {
        Self {
            provider,
            registry,
            setup,
            ready_schedule: PollSchedule::default(),
            registration_schedule: PollSchedule::new(
                DEFAULT_POLL_INTERVAL,
                DEFAULT_REGISTRATION_TIMEOUT,
            ),
        }
    }

    /// Overrides the schedule of the readiness wait.
    #[must_use]
    pub const fn with_ready_schedule(mut self, schedule: PollSchedule) -> Self {
        self.ready_schedule = schedule;
        self
    }

    /// Overrides the schedule of the registration wait.
    #[must_use]
    pub const fn with_registration_schedule(mut self, schedule: PollSchedule) -> Self {
        self.registration_schedule = schedule;
        self
    }

    /// Returns the provider, mainly for inspection in tests.
    #[must_use]
    pub const fn provider(&self) -> &P {
        &self.provider
    }

    /// Returns the registry, mainly for inspection in tests.
    #[must_use]
    pub const fn registry(&self) -> &R {
        &self.registry
    }

    /// Provisions the batch described by `request`.
    ///
    /// Failures of individual instances do not abort the batch: the instance
    /// is terminated, recorded in [`ProvisionOutcome::failures`], and the
    /// others carry on.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError`] when the request is invalid, the provider
    /// rejects the batch, a registration token cannot be issued, or no
    /// instance becomes ready. Every instance created before the error was
    /// rolled back unless it appears in
    /// [`ProvisionError::residual_mapping`].
    pub async fn execute(
        &self,
        request: &InstanceRequest,
    ) -> Result<ProvisionOutcome, ProvisionError<P::Error, R::Error>> {
        request.validate()?;
        let download_url = self.resolve_download_url(request).await?;

        let (created, rejected_slots) = self.create_batch(request).await?;
        let batch = assign_labels(created, &request.label_prefix);
        let mut ledger = Ledger::default();
        for runner in &batch {
            ledger.states.insert(runner.id.clone(), InstanceState::Pending);
        }

        let bootstrapped = self
            .bootstrap(request, &download_url, &batch, &mut ledger)
            .await?;
        let started = self.power_on(bootstrapped, &mut ledger).await;
        let (running, addresses) = self.await_running(started, &mut ledger).await;

        if running.is_empty() {
            let residual = build_mapping(&batch, &[], &ledger)?;
            return Err(ProvisionError::NoneReady {
                failures: ledger.failures,
                residual,
            });
        }

        let unregistered = self.await_registration(&batch, &running).await;
        let mapping = build_mapping(&batch, &running, &ledger)?;
        let instances = batch
            .iter()
            .map(|runner| ProvisionedInstance {
                id: runner.id.clone(),
                state: ledger
                    .states
                    .get(&runner.id)
                    .copied()
                    .unwrap_or(InstanceState::Failed),
                label: Some(runner.label.clone()),
            })
            .collect();

        info!(
            count = mapping.len(),
            failed = ledger.failures.len(),
            "provisioning finished"
        );
        Ok(ProvisionOutcome {
            mapping,
            instances,
            addresses,
            failures: ledger.failures,
            rejected_slots,
            rollback_failures: ledger.rollback_failures,
            unregistered,
        })
    }

    async fn resolve_download_url(
        &self,
        request: &InstanceRequest,
    ) -> Result<String, ProvisionError<P::Error, R::Error>> {
        if let Some(url) = self.setup.runner_download_url.as_deref() {
            return Ok(url.to_owned());
        }
        let architecture = runner_architecture(&request.architecture);
        let url = self
            .registry
            .latest_runner_release(RUNNER_PLATFORM, architecture)
            .await
            .map_err(ProvisionError::RunnerRelease)?;
        debug!(%url, "resolved latest runner release");
        Ok(url)
    }

    async fn create_batch(
        &self,
        request: &InstanceRequest,
    ) -> Result<(Vec<ProvisionedInstance>, Vec<String>), ProvisionError<P::Error, R::Error>> {
        info!(count = request.count, zone = %request.zone, "requesting instances");
        match self.provider.create_instances(request).await {
            Ok(created) => Ok((created, Vec::new())),
            Err(CreateError::Rejected(err)) => Err(ProvisionError::Rejected(err)),
            Err(CreateError::Partial(partial)) if partial.created.is_empty() => {
                Err(ProvisionError::NothingCreated(partial))
            }
            Err(CreateError::Partial(partial)) => {
                warn!(
                    created = partial.created.len(),
                    rejected = partial.failures.len(),
                    "provider created part of the batch"
                );
                Ok((partial.created, partial.failures))
            }
        }
    }

    async fn bootstrap(
        &self,
        request: &InstanceRequest,
        download_url: &str,
        batch: &[Assigned],
        ledger: &mut Ledger,
    ) -> Result<Vec<InstanceId>, ProvisionError<P::Error, R::Error>> {
        let mut attached = Vec::with_capacity(batch.len());
        let mut victims = Vec::new();

        for runner in batch {
            let token = match self.registry.issue_registration_token().await {
                Ok(token) => token,
                Err(source) => {
                    warn!(error = %source, "registration token request failed; rolling back batch");
                    let cause = format!("registration token unavailable: {source}");
                    let everyone = batch
                        .iter()
                        .map(|assigned| InstanceFailure::new(assigned.id.clone(), cause.clone()))
                        .collect();
                    self.roll_back(everyone, ledger).await;
                    let residual = build_mapping(batch, &[], ledger)?;
                    return Err(ProvisionError::Registry { source, residual });
                }
            };

            let payload = render(&BootstrapParams {
                home_dir: &request.home_dir,
                token: &token,
                repository_url: &self.setup.repository_url,
                label: &runner.label,
                extra_labels: &request.extra_labels,
                runner_download_url: download_url,
                pre_install_script: self.setup.pre_install_script.as_deref(),
            });

            match self
                .provider
                .attach_startup_payload(&runner.id, &payload)
                .await
            {
                Ok(()) => {
                    debug!(instance_id = %runner.id, label = %runner.label, "bootstrap payload attached");
                    attached.push(runner.id.clone());
                }
                Err(err) => {
                    warn!(instance_id = %runner.id, error = %err, "failed to attach bootstrap payload");
                    victims.push(InstanceFailure::new(
                        runner.id.clone(),
                        format!("failed to attach bootstrap payload: {err}"),
                    ));
                }
            }
        }

        self.roll_back(victims, ledger).await;
        Ok(attached)
    }

    async fn power_on(&self, ids: Vec<InstanceId>, ledger: &mut Ledger) -> Vec<InstanceId> {
        if ids.is_empty() {
            return ids;
        }
        let (started, reported) = match self.provider.power_on(&ids).await {
            Ok(started) => (started, Vec::new()),
            Err(err) => {
                warn!(error = %err, "some instances failed to power on");
                (err.started, err.failures)
            }
        };
        let powered = retain_known(&ids, &started);
        let victims = missing_with_cause(&ids, &powered, &reported, "failed to power on");
        self.roll_back(victims, ledger).await;
        powered
    }

    async fn await_running(
        &self,
        ids: Vec<InstanceId>,
        ledger: &mut Ledger,
    ) -> (Vec<InstanceId>, BTreeMap<InstanceId, InstanceAddress>) {
        if ids.is_empty() {
            return (ids, BTreeMap::new());
        }
        info!(count = ids.len(), "waiting for instances to run");
        let (ready, reported) = match self
            .provider
            .wait_until_running(&ids, self.ready_schedule)
            .await
        {
            Ok(ready) => (ready, Vec::new()),
            Err(err) => {
                warn!(error = %err, "instances did not become ready");
                (err.ready, err.failures)
            }
        };

        let running = ids
            .iter()
            .filter(|id| ready.contains_key(*id))
            .cloned()
            .collect::<Vec<_>>();
        let victims = missing_with_cause(&ids, &running, &reported, "not running before the deadline");
        self.roll_back(victims, ledger).await;

        for id in &running {
            ledger.states.insert(id.clone(), InstanceState::Running);
        }
        let addresses = ready
            .into_iter()
            .filter(|(id, _)| running.contains(id))
            .collect();
        (running, addresses)
    }

    async fn await_registration(
        &self,
        batch: &[Assigned],
        running: &[InstanceId],
    ) -> Vec<RunnerLabel> {
        if !self.setup.wait_for_registration {
            return Vec::new();
        }
        let live = running.iter().collect::<BTreeSet<_>>();
        let labels = batch
            .iter()
            .filter(|runner| live.contains(&runner.id))
            .map(|runner| runner.label.clone())
            .collect::<Vec<_>>();
        info!(count = labels.len(), "waiting for runners to come online");

        let online = self
            .registry
            .wait_until_online(&labels, self.registration_schedule)
            .await;
        let unregistered = labels
            .into_iter()
            .filter(|label| !online.contains(label))
            .collect::<Vec<_>>();
        for label in &unregistered {
            warn!(%label, "runner did not come online; its instance stays tracked");
        }
        unregistered
    }

    /// Terminates `victims` and records the outcome. Instances whose
    /// termination fails stay tracked through the ledger's rollback
    /// failures.
    async fn roll_back(&self, victims: Vec<InstanceFailure>, ledger: &mut Ledger) {
        if victims.is_empty() {
            return;
        }
        let ids = victims
            .iter()
            .map(|victim| victim.instance_id.clone())
            .collect::<Vec<_>>();
        info!(count = ids.len(), "rolling back instances");

        let (terminated, reported) = match self.provider.terminate(&ids).await {
            Ok(terminated) => (terminated, Vec::new()),
            Err(err) => {
                warn!(error = %err, "rollback left instances behind");
                (err.terminated, err.failures)
            }
        };
        let stranded = missing_with_cause(&ids, &terminated, &reported, "termination failed");
        let stranded_ids = stranded
            .iter()
            .map(|failure| failure.instance_id.clone())
            .collect::<BTreeSet<_>>();

        for victim in victims {
            let state = if stranded_ids.contains(&victim.instance_id) {
                InstanceState::Failed
            } else {
                InstanceState::Terminated
            };
            ledger.states.insert(victim.instance_id.clone(), state);
            ledger.failures.push(victim);
        }
        ledger.rollback_failures.extend(stranded);
    }
}

fn assign_labels(created: Vec<ProvisionedInstance>, prefix: &str) -> Vec<Assigned> {
    let mut allocator = LabelAllocator::new(prefix);
    let mut seen = BTreeSet::new();
    created
        .into_iter()
        .filter(|instance| {
            let fresh = seen.insert(instance.id.clone());
            if !fresh {
                warn!(instance_id = %instance.id, "provider reported the same instance twice");
            }
            fresh
        })
        .map(|instance| {
            let label = allocator.assign(&instance.id);
            debug!(instance_id = %instance.id, %label, "assigned runner label");
            Assigned {
                id: instance.id,
                label,
            }
        })
        .collect()
}

/// Keeps the members of `ids` that appear in `subset`, in `ids` order.
fn retain_known(ids: &[InstanceId], subset: &[InstanceId]) -> Vec<InstanceId> {
    let known = subset.iter().collect::<BTreeSet<_>>();
    ids.iter().filter(|id| known.contains(id)).cloned().collect()
}

/// Returns a failure for every member of `ids` missing from `succeeded`,
/// using the reported cause when there is one.
fn missing_with_cause(
    ids: &[InstanceId],
    succeeded: &[InstanceId],
    reported: &[InstanceFailure],
    fallback: impl Display,
) -> Vec<InstanceFailure> {
    let done = succeeded.iter().collect::<BTreeSet<_>>();
    ids.iter()
        .filter(|id| !done.contains(id))
        .map(|id| {
            reported
                .iter()
                .find(|failure| failure.instance_id == *id)
                .cloned()
                .unwrap_or_else(|| InstanceFailure::new(id.clone(), fallback.to_string()))
        })
        .collect()
}

fn build_mapping(
    batch: &[Assigned],
    running: &[InstanceId],
    ledger: &Ledger,
) -> Result<InstanceLabelMapping, MappingError> {
    let live = running.iter().collect::<BTreeSet<_>>();
    let stranded = ledger
        .rollback_failures
        .iter()
        .map(|failure| &failure.instance_id)
        .collect::<BTreeSet<_>>();
    let mut mapping = InstanceLabelMapping::new();
    for runner in batch
        .iter()
        .filter(|runner| live.contains(&runner.id) || stranded.contains(&runner.id))
    {
        mapping.insert(runner.id.clone(), runner.label.clone())?;
    }
    Ok(mapping)
}
