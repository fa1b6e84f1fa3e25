//! Shared fixtures for teardown BDD scenarios.
//!
//! The context records the cloud and registry state as plain data; each
//! `when` step seeds fresh fakes from it and writes the result back, so
//! repeated teardowns observe what earlier ones left behind.

use std::collections::BTreeSet;

use gha_runner::deprovision::TeardownReport;
use gha_runner::label::RunnerLabel;
use gha_runner::mapping::InstanceLabelMapping;
use gha_runner::provider::InstanceId;
use gha_runner::test_support::{FakeProvider, FakeRegistry};
use rstest::fixture;

#[derive(Clone, Debug)]
pub struct TeardownContext {
    pub mapping: InstanceLabelMapping,
    pub live: BTreeSet<InstanceId>,
    pub registered: BTreeSet<RunnerLabel>,
    pub failing_removals: Vec<RunnerLabel>,
    pub failing_terminations: Vec<InstanceId>,
    pub reports: Vec<TeardownReport>,
}

#[fixture]
pub fn teardown_context() -> TeardownContext {
    TeardownContext {
        mapping: InstanceLabelMapping::new(),
        live: BTreeSet::new(),
        registered: BTreeSet::new(),
        failing_removals: Vec::new(),
        failing_terminations: Vec::new(),
        reports: Vec::new(),
    }
}

impl TeardownContext {
    /// Builds fakes holding the current state and scripted failures.
    pub fn seeded_fakes(&self) -> (FakeProvider, FakeRegistry) {
        let provider = FakeProvider::new();
        for id in &self.live {
            provider.seed_instance(id.clone());
        }
        for id in &self.failing_terminations {
            provider.fail_terminate(id.clone());
        }
        let registry = FakeRegistry::new();
        for runner in &self.registered {
            registry.register(runner.clone());
        }
        for runner in &self.failing_removals {
            registry.fail_removal(runner.clone());
        }
        (provider, registry)
    }
}

pub fn label(serial: u32) -> RunnerLabel {
    RunnerLabel::from(format!("runner-{serial}"))
}
