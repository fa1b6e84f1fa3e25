//! The `stop` path: removes the runners and instances named by a mapping.
//!
//! Runner removal and instance termination are independent. Both are always
//! attempted, concurrently, and a failure on one side never prevents the
//! other. Re-running teardown on the same mapping is safe: runners and
//! instances that are already gone count as cleaned up.

use std::fmt;

use tracing::{info, warn};

use crate::label::RunnerLabel;
use crate::mapping::{InstanceLabelMapping, labels_with_extra};
use crate::poll::PollSchedule;
use crate::provider::{CloudProvider, InstanceFailure, InstanceId, join_failures};
use crate::registry::{LabelFailure, RunnerRegistry};

/// Aggregated result of a teardown.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TeardownReport {
    /// Labels whose runners were removed or already absent.
    pub removed: Vec<RunnerLabel>,
    /// Instances that were terminated or already absent.
    pub terminated: Vec<InstanceId>,
    /// Runners that could not be removed.
    pub removal_failures: Vec<LabelFailure>,
    /// Instances that could not be terminated.
    pub termination_failures: Vec<InstanceFailure>,
    /// Instances still visible after the termination wait, when enabled.
    pub lingering: Vec<InstanceFailure>,
}

impl TeardownReport {
    /// Returns `true` when every runner and instance was cleaned up.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.removal_failures.is_empty()
            && self.termination_failures.is_empty()
            && self.lingering.is_empty()
    }
}

impl fmt::Display for TeardownReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "removed {} runner(s), terminated {} instance(s)",
            self.removed.len(),
            self.terminated.len()
        )?;
        if !self.removal_failures.is_empty() {
            write!(
                f,
                "; runner removal failed: {}",
                join_failures(&self.removal_failures)
            )?;
        }
        if !self.termination_failures.is_empty() {
            write!(
                f,
                "; termination failed: {}",
                join_failures(&self.termination_failures)
            )?;
        }
        if !self.lingering.is_empty() {
            write!(f, "; still visible: {}", join_failures(&self.lingering))?;
        }
        Ok(())
    }
}

/// Drives the `stop` path against a provider and a registry.
#[derive(Debug)]
pub struct Deprovisioner<P, R> {
    provider: P,
    registry: R,
    termination_wait: Option<PollSchedule>,
}

impl<P, R> Deprovisioner<P, R>
where
    P: CloudProvider,
    R: RunnerRegistry,
{
    /// Creates a deprovisioner that does not wait for instances to vanish.
    #[must_use]
    pub const fn new(provider: P, registry: R) -> Self {
        Self {
            provider,
            registry,
            termination_wait: None,
        }
    }

    /// Waits for terminated instances to disappear, using `schedule`.
    #[must_use]
    pub const fn with_termination_wait(mut self, schedule: PollSchedule) -> Self {
        self.termination_wait = Some(schedule);
        self
    }

    /// Removes every runner labelled in `mapping` or `extra_labels` and
    /// terminates every instance in `mapping`.
    ///
    /// Never fails as a whole; inspect [`TeardownReport::is_clean`].
    pub async fn execute(
        &self,
        mapping: &InstanceLabelMapping,
        extra_labels: &[RunnerLabel],
    ) -> TeardownReport {
        let labels = labels_with_extra(mapping, extra_labels);
        let ids = mapping.instance_ids();
        info!(
            runners = labels.len(),
            instances = ids.len(),
            "tearing down runners"
        );

        let (removal, termination) = tokio::join!(self.remove(&labels), self.terminate(&ids));
        let (removed, removal_failures) = removal;
        let (terminated, termination_failures) = termination;

        let lingering = match self.termination_wait {
            Some(schedule) if !terminated.is_empty() => {
                self.await_gone(&terminated, schedule).await
            }
            _ => Vec::new(),
        };

        let report = TeardownReport {
            removed,
            terminated,
            removal_failures,
            termination_failures,
            lingering,
        };
        if report.is_clean() {
            info!(%report, "teardown complete");
        } else {
            warn!(%report, "teardown incomplete");
        }
        report
    }

    async fn remove(&self, labels: &[RunnerLabel]) -> (Vec<RunnerLabel>, Vec<LabelFailure>) {
        if labels.is_empty() {
            return (Vec::new(), Vec::new());
        }
        match self.registry.remove_runners(labels).await {
            Ok(removed) => (removed, Vec::new()),
            Err(err) => {
                for failure in &err.failures {
                    warn!(label = %failure.label, cause = %failure.cause, "runner removal failed");
                }
                (err.removed, err.failures)
            }
        }
    }

    async fn terminate(&self, ids: &[InstanceId]) -> (Vec<InstanceId>, Vec<InstanceFailure>) {
        if ids.is_empty() {
            return (Vec::new(), Vec::new());
        }
        match self.provider.terminate(ids).await {
            Ok(terminated) => (terminated, Vec::new()),
            Err(err) => {
                for failure in &err.failures {
                    warn!(instance_id = %failure.instance_id, cause = %failure.cause, "termination failed");
                }
                (err.terminated, err.failures)
            }
        }
    }

    async fn await_gone(&self, ids: &[InstanceId], schedule: PollSchedule) -> Vec<InstanceFailure> {
        match self.provider.wait_until_terminated(ids, schedule).await {
            Ok(()) => Vec::new(),
            Err(err) => err.failures,
        }
    }
}
