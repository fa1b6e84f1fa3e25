//! BDD step definitions for the teardown workflow.

use gha_runner::deprovision::{Deprovisioner, TeardownReport};
use gha_runner::label::RunnerLabel;
use gha_runner::test_support::FakeProvider;
use rstest_bdd_macros::{given, then, when};
use tokio::runtime::Runtime;

use super::test_helpers::{TeardownContext, label};

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("assertion failed: {0}")]
    Assertion(String),
}

#[given("a mapping of {count:u32} running runners")]
fn mapping_of_runners(mut teardown_context: TeardownContext, count: u32) -> TeardownContext {
    for serial in 1..=count {
        let id = FakeProvider::instance_id(serial);
        teardown_context.live.insert(id.clone());
        teardown_context.registered.insert(label(serial));
        teardown_context
            .mapping
            .insert(id, label(serial))
            .unwrap_or_else(|err| panic!("mapping insert: {err}"));
    }
    teardown_context
}

#[given("removal of runner \"{name}\" fails")]
fn removal_fails(mut teardown_context: TeardownContext, name: String) -> TeardownContext {
    teardown_context
        .failing_removals
        .push(RunnerLabel::from(name));
    teardown_context
}

#[given("termination of instance {serial:u32} fails")]
fn termination_fails(mut teardown_context: TeardownContext, serial: u32) -> TeardownContext {
    teardown_context
        .failing_terminations
        .push(FakeProvider::instance_id(serial));
    teardown_context
}

fn run_teardown(mut teardown_context: TeardownContext) -> TeardownContext {
    let runtime =
        Runtime::new().unwrap_or_else(|err| panic!("tokio runtime should start: {err}"));
    let (provider, registry) = teardown_context.seeded_fakes();
    let deprovisioner = Deprovisioner::new(provider.clone(), registry.clone());
    let mapping = teardown_context.mapping.clone();

    let report = runtime.block_on(async move { deprovisioner.execute(&mapping, &[]).await });
    teardown_context.reports.push(report);
    teardown_context.live = provider.live_instances();
    teardown_context.registered = registry.registered();
    teardown_context
}

#[when("I tear down the mapping")]
fn tear_down(teardown_context: TeardownContext) -> TeardownContext {
    run_teardown(teardown_context)
}

#[when("I tear down the mapping again")]
fn tear_down_again(teardown_context: TeardownContext) -> TeardownContext {
    run_teardown(teardown_context)
}

fn last_report(teardown_context: &TeardownContext) -> Result<&TeardownReport, StepError> {
    teardown_context
        .reports
        .last()
        .ok_or_else(|| StepError::Assertion(String::from("missing teardown report")))
}

#[then("the teardown is clean")]
fn teardown_clean(teardown_context: &TeardownContext) -> Result<(), StepError> {
    let report = last_report(teardown_context)?;
    if report.is_clean() {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected clean teardown, got: {report}"
        )))
    }
}

#[then("no mapped instance remains")]
fn no_instance_remains(teardown_context: &TeardownContext) -> Result<(), StepError> {
    let remaining: Vec<_> = teardown_context
        .mapping
        .instance_ids()
        .into_iter()
        .filter(|id| teardown_context.live.contains(id))
        .collect();
    if remaining.is_empty() {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "instances still running: {remaining:?}"
        )))
    }
}

#[then("no mapped runner remains")]
fn no_runner_remains(teardown_context: &TeardownContext) -> Result<(), StepError> {
    let remaining: Vec<_> = teardown_context
        .mapping
        .labels()
        .into_iter()
        .filter(|runner| teardown_context.registered.contains(runner))
        .collect();
    if remaining.is_empty() {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "runners still registered: {remaining:?}"
        )))
    }
}

#[then("the teardown reports a removal failure for \"{name}\"")]
fn removal_failure_reported(
    teardown_context: &TeardownContext,
    name: String,
) -> Result<(), StepError> {
    let report = last_report(teardown_context)?;
    let expected = RunnerLabel::from(name);
    let matches = report
        .removal_failures
        .iter()
        .any(|failure| failure.label == expected);
    if matches && !report.is_clean() {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected removal failure for {expected}, got: {report}"
        )))
    }
}

#[then("the teardown reports a termination failure for instance {serial:u32}")]
fn termination_failure_reported(
    teardown_context: &TeardownContext,
    serial: u32,
) -> Result<(), StepError> {
    let report = last_report(teardown_context)?;
    let expected = FakeProvider::instance_id(serial);
    let matches = report
        .termination_failures
        .iter()
        .any(|failure| failure.instance_id == expected);
    if matches && !report.is_clean() {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected termination failure for {expected}, got: {report}"
        )))
    }
}
