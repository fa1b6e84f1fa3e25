//! Test support utilities shared across unit and integration tests.
//!
//! [`FakeProvider`] and [`FakeRegistry`] implement the capability traits in
//! memory. Each is a cheap handle over shared state, so a test can keep a
//! clone for scripting failures and inspecting calls while the orchestrator
//! owns the other.

use std::collections::{BTreeMap, BTreeSet};
use std::env;
use std::ffi::OsString;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard as StdMutexGuard, PoisonError};

use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};

use crate::bootstrap::StartupPayload;
use crate::label::RunnerLabel;
use crate::poll::PollSchedule;
use crate::provider::{
    CloudProvider, CreateError, InstanceAddress, InstanceFailure, InstanceId, InstanceRequest,
    InstanceState, PartialProvisionError, PowerOnError, ProviderFuture, ProvisionedInstance,
    ProvisioningTimeoutError, TerminationError,
};
use crate::registry::{
    LabelFailure, OnlineFuture, RegistrationToken, RegistryFuture, RunnerRegistry,
    RunnerRemovalError,
};

/// Error raised by the in-memory doubles.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("{0}")]
pub struct FakeError(pub String);

fn lock<T>(state: &StdMutex<T>) -> StdMutexGuard<'_, T> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
struct ProviderState {
    next_serial: u32,
    reject_batch: Option<String>,
    create_limit: Option<usize>,
    attach_failures: BTreeSet<InstanceId>,
    power_on_failures: BTreeSet<InstanceId>,
    never_ready: BTreeSet<InstanceId>,
    terminate_failures: BTreeSet<InstanceId>,
    linger_after_terminate: BTreeSet<InstanceId>,
    live: BTreeSet<InstanceId>,
    created: Vec<InstanceId>,
    payloads: BTreeMap<InstanceId, StartupPayload>,
    powered_on: Vec<InstanceId>,
    terminate_calls: Vec<Vec<InstanceId>>,
}

/// In-memory [`CloudProvider`] with scriptable failures.
///
/// Instances are named `fake-0001`, `fake-0002`, and so on in creation
/// order, so tests can script failures before the batch exists.
#[derive(Clone, Debug, Default)]
pub struct FakeProvider {
    state: Arc<StdMutex<ProviderState>>,
}

impl FakeProvider {
    /// Creates a provider that accepts every call.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Identity the provider gives to its `serial`-th instance (1-based).
    #[must_use]
    pub fn instance_id(serial: u32) -> InstanceId {
        InstanceId::new(format!("fake-{serial:04}"))
    }

    /// Rejects every subsequent batch with `cause`.
    pub fn reject_batches(&self, cause: impl Into<String>) {
        lock(&self.state).reject_batch = Some(cause.into());
    }

    /// Creates at most `limit` instances per batch and reports the rest as
    /// rejected slots.
    pub fn limit_batch_size(&self, limit: usize) {
        lock(&self.state).create_limit = Some(limit);
    }

    /// Makes payload attachment fail for `id`.
    pub fn fail_attach(&self, id: impl Into<InstanceId>) {
        lock(&self.state).attach_failures.insert(id.into());
    }

    /// Makes power-on fail for `id`.
    pub fn fail_power_on(&self, id: impl Into<InstanceId>) {
        lock(&self.state).power_on_failures.insert(id.into());
    }

    /// Keeps `id` pending forever.
    pub fn never_ready(&self, id: impl Into<InstanceId>) {
        lock(&self.state).never_ready.insert(id.into());
    }

    /// Makes termination fail for `id`.
    pub fn fail_terminate(&self, id: impl Into<InstanceId>) {
        lock(&self.state).terminate_failures.insert(id.into());
    }

    /// Clears a scripted termination failure for `id`.
    pub fn allow_terminate(&self, id: &InstanceId) {
        lock(&self.state).terminate_failures.remove(id);
    }

    /// Keeps `id` visible after a successful termination request.
    pub fn linger_after_terminate(&self, id: impl Into<InstanceId>) {
        lock(&self.state).linger_after_terminate.insert(id.into());
    }

    /// Registers an instance that exists before the test starts.
    pub fn seed_instance(&self, id: impl Into<InstanceId>) {
        lock(&self.state).live.insert(id.into());
    }

    /// Identities of instances that currently exist.
    #[must_use]
    pub fn live_instances(&self) -> BTreeSet<InstanceId> {
        lock(&self.state).live.clone()
    }

    /// Identities created so far, in creation order.
    #[must_use]
    pub fn created(&self) -> Vec<InstanceId> {
        lock(&self.state).created.clone()
    }

    /// Payload attached to `id`, if any.
    #[must_use]
    pub fn payload_for(&self, id: &InstanceId) -> Option<StartupPayload> {
        lock(&self.state).payloads.get(id).cloned()
    }

    /// Identities passed to `power_on`, in call order.
    #[must_use]
    pub fn powered_on(&self) -> Vec<InstanceId> {
        lock(&self.state).powered_on.clone()
    }

    /// Every `terminate` call with its arguments.
    #[must_use]
    pub fn terminate_calls(&self) -> Vec<Vec<InstanceId>> {
        lock(&self.state).terminate_calls.clone()
    }

    /// Every identity ever passed to `terminate`.
    #[must_use]
    pub fn terminated_ids(&self) -> BTreeSet<InstanceId> {
        lock(&self.state)
            .terminate_calls
            .iter()
            .flatten()
            .cloned()
            .collect()
    }

    fn create(
        &self,
        request: &InstanceRequest,
    ) -> Result<Vec<ProvisionedInstance>, CreateError<FakeError>> {
        let mut state = lock(&self.state);
        if let Some(cause) = state.reject_batch.clone() {
            return Err(CreateError::Rejected(FakeError(cause)));
        }

        let requested = usize::try_from(request.count).unwrap_or(usize::MAX);
        let allowed = state.create_limit.map_or(requested, |limit| limit.min(requested));
        let mut created = Vec::with_capacity(allowed);
        for _ in 0..allowed {
            state.next_serial += 1;
            let id = Self::instance_id(state.next_serial);
            state.live.insert(id.clone());
            state.created.push(id.clone());
            created.push(ProvisionedInstance::new(id, InstanceState::Pending));
        }

        if allowed < requested {
            let failures = (allowed..requested)
                .map(|slot| format!("slot {slot}: quota exceeded"))
                .collect();
            return Err(CreateError::Partial(PartialProvisionError { created, failures }));
        }
        Ok(created)
    }

    fn attach(&self, id: &InstanceId, payload: &StartupPayload) -> Result<(), FakeError> {
        let mut state = lock(&self.state);
        if state.attach_failures.contains(id) {
            return Err(FakeError(String::from("user data rejected")));
        }
        if !state.live.contains(id) {
            return Err(FakeError(format!("instance {id} not found")));
        }
        state.payloads.insert(id.clone(), payload.clone());
        Ok(())
    }

    fn start(&self, ids: &[InstanceId]) -> Result<Vec<InstanceId>, PowerOnError> {
        let mut state = lock(&self.state);
        let mut started = Vec::new();
        let mut failures = Vec::new();
        for id in ids {
            if state.power_on_failures.contains(id) {
                failures.push(InstanceFailure::new(id.clone(), "poweron refused"));
            } else {
                state.powered_on.push(id.clone());
                started.push(id.clone());
            }
        }
        if failures.is_empty() {
            Ok(started)
        } else {
            Err(PowerOnError { started, failures })
        }
    }

    fn ready(
        &self,
        ids: &[InstanceId],
    ) -> Result<BTreeMap<InstanceId, InstanceAddress>, ProvisioningTimeoutError> {
        let state = lock(&self.state);
        let mut ready = BTreeMap::new();
        let mut failures = Vec::new();
        for id in ids {
            if !state.live.contains(id) {
                failures.push(InstanceFailure::new(id.clone(), "instance disappeared"));
            } else if state.never_ready.contains(id) {
                failures.push(InstanceFailure::new(id.clone(), "still pending"));
            } else {
                ready.insert(id.clone(), InstanceAddress::default());
            }
        }
        if failures.is_empty() {
            Ok(ready)
        } else {
            Err(ProvisioningTimeoutError { ready, failures })
        }
    }

    fn destroy(&self, ids: &[InstanceId]) -> Result<Vec<InstanceId>, TerminationError> {
        let mut state = lock(&self.state);
        state.terminate_calls.push(ids.to_vec());
        let mut terminated = Vec::new();
        let mut failures = Vec::new();
        for id in ids {
            if state.terminate_failures.contains(id) {
                failures.push(InstanceFailure::new(id.clone(), "termination refused"));
                continue;
            }
            if !state.linger_after_terminate.contains(id) {
                state.live.remove(id);
            }
            terminated.push(id.clone());
        }
        if failures.is_empty() {
            Ok(terminated)
        } else {
            Err(TerminationError {
                terminated,
                failures,
            })
        }
    }

    fn gone(&self, ids: &[InstanceId]) -> Result<(), TerminationError> {
        let state = lock(&self.state);
        let (visible, terminated): (Vec<_>, Vec<_>) =
            ids.iter().cloned().partition(|id| state.live.contains(id));
        if visible.is_empty() {
            return Ok(());
        }
        Err(TerminationError {
            terminated,
            failures: visible
                .into_iter()
                .map(|id| InstanceFailure::new(id, "still visible"))
                .collect(),
        })
    }
}

impl CloudProvider for FakeProvider {
    type Error = FakeError;

    fn create_instances<'a>(
        &'a self,
        request: &'a InstanceRequest,
    ) -> ProviderFuture<'a, Vec<ProvisionedInstance>, CreateError<Self::Error>> {
        Box::pin(async move { self.create(request) })
    }

    fn attach_startup_payload<'a>(
        &'a self,
        instance_id: &'a InstanceId,
        payload: &'a StartupPayload,
    ) -> ProviderFuture<'a, (), Self::Error> {
        Box::pin(async move { self.attach(instance_id, payload) })
    }

    fn power_on<'a>(
        &'a self,
        instance_ids: &'a [InstanceId],
    ) -> ProviderFuture<'a, Vec<InstanceId>, PowerOnError> {
        Box::pin(async move { self.start(instance_ids) })
    }

    fn wait_until_running<'a>(
        &'a self,
        instance_ids: &'a [InstanceId],
        _schedule: PollSchedule,
    ) -> ProviderFuture<'a, BTreeMap<InstanceId, InstanceAddress>, ProvisioningTimeoutError> {
        Box::pin(async move { self.ready(instance_ids) })
    }

    fn terminate<'a>(
        &'a self,
        instance_ids: &'a [InstanceId],
    ) -> ProviderFuture<'a, Vec<InstanceId>, TerminationError> {
        Box::pin(async move { self.destroy(instance_ids) })
    }

    fn wait_until_terminated<'a>(
        &'a self,
        instance_ids: &'a [InstanceId],
        _schedule: PollSchedule,
    ) -> ProviderFuture<'a, (), TerminationError> {
        Box::pin(async move { self.gone(instance_ids) })
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    tokens_issued: usize,
    token_failure: Option<String>,
    release_url: Option<String>,
    release_lookups: Vec<(String, String)>,
    offline: BTreeSet<RunnerLabel>,
    registered: BTreeSet<RunnerLabel>,
    removal_failures: BTreeSet<RunnerLabel>,
    removal_calls: Vec<Vec<RunnerLabel>>,
    awaited: Vec<Vec<RunnerLabel>>,
}

/// In-memory [`RunnerRegistry`] with scriptable failures.
///
/// Every label passed to `wait_until_online` is reported online unless it
/// was marked offline.
#[derive(Clone, Debug, Default)]
pub struct FakeRegistry {
    state: Arc<StdMutex<RegistryState>>,
}

/// Download URL returned by [`FakeRegistry`] when none was scripted.
pub const FAKE_RUNNER_URL: &str = "https://example.test/actions-runner-linux-x64.tar.gz";

impl FakeRegistry {
    /// Creates a registry that accepts every call.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes token issuance fail with `cause`.
    pub fn fail_tokens(&self, cause: impl Into<String>) {
        lock(&self.state).token_failure = Some(cause.into());
    }

    /// Sets the URL returned by `latest_runner_release`.
    pub fn set_release_url(&self, url: impl Into<String>) {
        lock(&self.state).release_url = Some(url.into());
    }

    /// Keeps `label` from ever coming online.
    pub fn keep_offline(&self, label: impl Into<RunnerLabel>) {
        lock(&self.state).offline.insert(label.into());
    }

    /// Registers a runner that exists before the test starts.
    pub fn register(&self, label: impl Into<RunnerLabel>) {
        lock(&self.state).registered.insert(label.into());
    }

    /// Makes removal fail for `label`.
    pub fn fail_removal(&self, label: impl Into<RunnerLabel>) {
        lock(&self.state).removal_failures.insert(label.into());
    }

    /// Clears a scripted removal failure for `label`.
    pub fn allow_removal(&self, label: &RunnerLabel) {
        lock(&self.state).removal_failures.remove(label);
    }

    /// Number of registration tokens issued.
    #[must_use]
    pub fn tokens_issued(&self) -> usize {
        lock(&self.state).tokens_issued
    }

    /// `(platform, architecture)` pairs passed to `latest_runner_release`.
    #[must_use]
    pub fn release_lookups(&self) -> Vec<(String, String)> {
        lock(&self.state).release_lookups.clone()
    }

    /// Runners currently registered.
    #[must_use]
    pub fn registered(&self) -> BTreeSet<RunnerLabel> {
        lock(&self.state).registered.clone()
    }

    /// Every `remove_runners` call with its arguments.
    #[must_use]
    pub fn removal_calls(&self) -> Vec<Vec<RunnerLabel>> {
        lock(&self.state).removal_calls.clone()
    }

    /// Every label set passed to `wait_until_online`.
    #[must_use]
    pub fn awaited(&self) -> Vec<Vec<RunnerLabel>> {
        lock(&self.state).awaited.clone()
    }

    fn issue(&self) -> Result<RegistrationToken, FakeError> {
        let mut state = lock(&self.state);
        if let Some(cause) = state.token_failure.clone() {
            return Err(FakeError(cause));
        }
        state.tokens_issued += 1;
        Ok(RegistrationToken::new(format!(
            "fake-token-{}",
            state.tokens_issued
        )))
    }

    fn online(&self, labels: &[RunnerLabel]) -> BTreeSet<RunnerLabel> {
        let mut state = lock(&self.state);
        state.awaited.push(labels.to_vec());
        let online = labels
            .iter()
            .filter(|label| !state.offline.contains(*label))
            .cloned()
            .collect::<BTreeSet<_>>();
        state.registered.extend(online.iter().cloned());
        online
    }

    fn remove(&self, labels: &[RunnerLabel]) -> Result<Vec<RunnerLabel>, RunnerRemovalError> {
        let mut state = lock(&self.state);
        state.removal_calls.push(labels.to_vec());
        let mut removed = Vec::new();
        let mut failures = Vec::new();
        for label in labels {
            if state.removal_failures.contains(label) {
                failures.push(LabelFailure::new(label.clone(), "HTTP 500"));
            } else {
                state.registered.remove(label);
                removed.push(label.clone());
            }
        }
        if failures.is_empty() {
            Ok(removed)
        } else {
            Err(RunnerRemovalError { removed, failures })
        }
    }

    fn release(&self, platform: &str, architecture: &str) -> String {
        let mut state = lock(&self.state);
        state
            .release_lookups
            .push((platform.to_owned(), architecture.to_owned()));
        state
            .release_url
            .clone()
            .unwrap_or_else(|| FAKE_RUNNER_URL.to_owned())
    }
}

impl RunnerRegistry for FakeRegistry {
    type Error = FakeError;

    fn issue_registration_token(&self) -> RegistryFuture<'_, RegistrationToken, Self::Error> {
        Box::pin(async move { self.issue() })
    }

    fn wait_until_online<'a>(
        &'a self,
        labels: &'a [RunnerLabel],
        _schedule: PollSchedule,
    ) -> OnlineFuture<'a> {
        Box::pin(async move { self.online(labels) })
    }

    fn remove_runners<'a>(
        &'a self,
        labels: &'a [RunnerLabel],
    ) -> RegistryFuture<'a, Vec<RunnerLabel>, RunnerRemovalError> {
        Box::pin(async move { self.remove(labels) })
    }

    fn latest_runner_release<'a>(
        &'a self,
        platform: &'a str,
        architecture: &'a str,
    ) -> RegistryFuture<'a, String, Self::Error> {
        Box::pin(async move { Ok(self.release(platform, architecture)) })
    }
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: Mutex<()> = Mutex::const_new(());

/// Guard that holds the env mutex and restores variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: MutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets multiple environment variables while holding a global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        Self::apply(pairs, &[]).await
    }

    /// Sets `pairs` and removes `cleared` while holding a global mutex.
    pub async fn apply(pairs: &[(&str, &str)], cleared: &[&str]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs
                    .iter()
                    .map(|(key, _)| *key)
                    .chain(cleared.iter().copied())
                    .all(|key| seen.insert(key))
            },
            "duplicate environment variable keys passed to EnvGuard"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len() + cleared.len());
        for (key, value) in pairs {
            previous.push(((*key).to_owned(), env::var_os(key)));
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::set_var(key, value) };
        }
        for key in cleared {
            previous.push(((*key).to_owned(), env::var_os(key)));
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::remove_var(key) };
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
