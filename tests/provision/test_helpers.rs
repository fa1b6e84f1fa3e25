//! Shared fixtures for provisioning BDD scenarios.
//!
//! The context holds plain data only: what the scenario scripted and what
//! the fakes recorded. The fakes themselves live inside the `when` step.

use std::collections::BTreeSet;

use gha_runner::label::RunnerLabel;
use gha_runner::provider::{InstanceId, InstanceRequest};
use gha_runner::provision::RunnerSetup;
use gha_runner::test_support::{FakeProvider, FakeRegistry};
use rstest::fixture;

use crate::test_constants::{DEFAULT_INSTANCE_TYPE, TEST_REPO};

#[derive(Clone, Debug)]
pub enum ProvisionResult {
    Success {
        labels: Vec<RunnerLabel>,
        unregistered: Vec<RunnerLabel>,
        complete: bool,
    },
    Failure {
        message: String,
        residual: Vec<InstanceId>,
    },
}

/// State of the fakes once provisioning returned.
#[derive(Clone, Debug, Default)]
pub struct Recorded {
    pub registered: BTreeSet<RunnerLabel>,
    pub tokens_issued: usize,
    pub created: Vec<InstanceId>,
    pub live: BTreeSet<InstanceId>,
    pub terminated: BTreeSet<InstanceId>,
}

impl Recorded {
    pub fn capture(provider: &FakeProvider, registry: &FakeRegistry) -> Self {
        Self {
            registered: registry.registered(),
            tokens_issued: registry.tokens_issued(),
            created: provider.created(),
            live: provider.live_instances(),
            terminated: provider.terminated_ids(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ProvisionContext {
    pub count: u32,
    pub never_ready: Vec<u32>,
    pub token_failure: Option<String>,
    pub batch_rejection: Option<String>,
    pub outcome: Option<ProvisionResult>,
    pub recorded: Recorded,
}

#[fixture]
pub fn provision_context() -> ProvisionContext {
    ProvisionContext {
        count: 1,
        never_ready: Vec::new(),
        token_failure: None,
        batch_rejection: None,
        outcome: None,
        recorded: Recorded::default(),
    }
}

impl ProvisionContext {
    /// Builds fakes scripted with the failures the scenario asked for.
    pub fn scripted_fakes(&self) -> (FakeProvider, FakeRegistry) {
        let provider = FakeProvider::new();
        for serial in &self.never_ready {
            provider.never_ready(FakeProvider::instance_id(*serial));
        }
        if let Some(cause) = &self.batch_rejection {
            provider.reject_batches(cause.clone());
        }
        let registry = FakeRegistry::new();
        if let Some(cause) = &self.token_failure {
            registry.fail_tokens(cause.clone());
        }
        (provider, registry)
    }
}

pub fn runner_setup() -> RunnerSetup {
    RunnerSetup {
        repository_url: format!("https://github.com/{TEST_REPO}"),
        runner_download_url: None,
        pre_install_script: None,
        wait_for_registration: true,
    }
}

pub fn build_request(count: u32) -> InstanceRequest {
    InstanceRequest::builder()
        .image("Ubuntu 24.04 Noble Numbat")
        .instance_type(DEFAULT_INSTANCE_TYPE)
        .zone("fr-par-1")
        .architecture("x86_64")
        .home_dir("/root")
        .count(count)
        .build()
        .unwrap_or_else(|err| panic!("instance request should build: {err}"))
}
