//! BDD step definitions for the provisioning workflow.

use std::collections::BTreeSet;
use std::time::Duration;

use gha_runner::label::RunnerLabel;
use gha_runner::poll::PollSchedule;
use gha_runner::provision::Provisioner;
use gha_runner::test_support::FakeProvider;
use rstest_bdd_macros::{given, then, when};
use tokio::runtime::Runtime;

use super::test_helpers::{ProvisionContext, ProvisionResult, Recorded, build_request, runner_setup};

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("assertion failed: {0}")]
    Assertion(String),
}

const QUICK: PollSchedule = PollSchedule::new(Duration::from_millis(5), Duration::from_millis(50));

#[given("a provisioning request for {count:u32} runners")]
fn provisioning_request(mut provision_context: ProvisionContext, count: u32) -> ProvisionContext {
    provision_context.count = count;
    provision_context
}

#[given("instance {serial:u32} never becomes ready")]
fn instance_never_ready(mut provision_context: ProvisionContext, serial: u32) -> ProvisionContext {
    provision_context.never_ready.push(serial);
    provision_context
}

#[given("the registry refuses to issue tokens")]
fn registry_refuses_tokens(mut provision_context: ProvisionContext) -> ProvisionContext {
    provision_context.token_failure = Some(String::from("HTTP 403"));
    provision_context
}

#[given("the provider rejects the batch with \"{cause}\"")]
fn provider_rejects_batch(
    mut provision_context: ProvisionContext,
    cause: String,
) -> ProvisionContext {
    provision_context.batch_rejection = Some(cause);
    provision_context
}

#[when("I provision the batch")]
fn provision_batch(mut provision_context: ProvisionContext) -> ProvisionContext {
    let runtime =
        Runtime::new().unwrap_or_else(|err| panic!("tokio runtime should start: {err}"));
    let (provider, registry) = provision_context.scripted_fakes();
    let provisioner = Provisioner::new(provider.clone(), registry.clone(), runner_setup())
        .with_ready_schedule(QUICK)
        .with_registration_schedule(QUICK);
    let request = build_request(provision_context.count);

    let result = runtime.block_on(async move { provisioner.execute(&request).await });
    provision_context.outcome = Some(match result {
        Ok(outcome) => ProvisionResult::Success {
            labels: outcome.mapping.labels(),
            unregistered: outcome.unregistered.clone(),
            complete: outcome.is_complete(),
        },
        Err(err) => ProvisionResult::Failure {
            message: err.to_string(),
            residual: err
                .residual_mapping()
                .map(|mapping| mapping.instance_ids())
                .unwrap_or_default(),
        },
    });
    provision_context.recorded = Recorded::capture(&provider, &registry);
    provision_context
}

struct Success<'a> {
    labels: &'a [RunnerLabel],
    unregistered: &'a [RunnerLabel],
    complete: bool,
}

fn success(provision_context: &ProvisionContext) -> Result<Success<'_>, StepError> {
    match provision_context.outcome.as_ref() {
        Some(ProvisionResult::Success {
            labels,
            unregistered,
            complete,
        }) => Ok(Success {
            labels,
            unregistered,
            complete: *complete,
        }),
        Some(other) => Err(StepError::Assertion(format!(
            "expected success, got: {other:?}"
        ))),
        None => Err(StepError::Assertion(String::from("missing outcome"))),
    }
}

#[then("the mapping lists {count:u32} runners with distinct labels")]
fn mapping_lists_runners(
    provision_context: &ProvisionContext,
    count: u32,
) -> Result<(), StepError> {
    let outcome = success(provision_context)?;
    let distinct: BTreeSet<_> = outcome.labels.iter().collect();
    let expected = usize::try_from(count).map_err(|err| StepError::Assertion(err.to_string()))?;
    if outcome.labels.len() == expected && distinct.len() == expected {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected {count} distinct runners, got {:?}",
            outcome.labels
        )))
    }
}

#[then("every mapped runner is online")]
fn every_runner_online(provision_context: &ProvisionContext) -> Result<(), StepError> {
    let outcome = success(provision_context)?;
    let registered = &provision_context.recorded.registered;
    let missing: Vec<_> = outcome
        .labels
        .iter()
        .filter(|label| !registered.contains(*label))
        .collect();
    if missing.is_empty() && outcome.unregistered.is_empty() {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "runners not online: {missing:?}"
        )))
    }
}

#[then("{count:u32} registration tokens were issued")]
fn tokens_issued(provision_context: &ProvisionContext, count: u32) -> Result<(), StepError> {
    let issued = provision_context.recorded.tokens_issued;
    if u32::try_from(issued).is_ok_and(|value| value == count) {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected {count} tokens, got {issued}"
        )))
    }
}

#[then("instance {serial:u32} was terminated")]
fn instance_terminated(provision_context: &ProvisionContext, serial: u32) -> Result<(), StepError> {
    let id = FakeProvider::instance_id(serial);
    let recorded = &provision_context.recorded;
    if recorded.terminated.contains(&id) && !recorded.live.contains(&id)
    {
        Ok(())
    } else {
        Err(StepError::Assertion(format!("instance {id} should be terminated")))
    }
}

#[then("the batch is reported incomplete")]
fn batch_incomplete(provision_context: &ProvisionContext) -> Result<(), StepError> {
    let outcome = success(provision_context)?;
    if outcome.complete {
        Err(StepError::Assertion(String::from(
            "batch should be incomplete",
        )))
    } else {
        Ok(())
    }
}

#[then("provisioning fails with \"{fragment}\"")]
fn provisioning_fails(provision_context: &ProvisionContext, fragment: String) -> Result<(), StepError> {
    let Some(ProvisionResult::Failure { message, residual }) = provision_context.outcome.as_ref()
    else {
        return Err(StepError::Assertion(String::from(
            "expected failure outcome",
        )));
    };
    if !message.contains(&fragment) {
        return Err(StepError::Assertion(format!(
            "expected error containing {fragment:?}, got: {message}"
        )));
    }
    if !residual.is_empty() {
        return Err(StepError::Assertion(format!(
            "no instance should be left behind: {residual:?}"
        )));
    }
    Ok(())
}

#[then("every created instance was terminated")]
fn created_instances_terminated(provision_context: &ProvisionContext) -> Result<(), StepError> {
    let recorded = &provision_context.recorded;
    if recorded.created.is_empty() {
        return Err(StepError::Assertion(String::from(
            "instances should have been created",
        )));
    }
    let remaining: Vec<_> = recorded
        .created
        .iter()
        .filter(|id| recorded.live.contains(*id))
        .collect();
    if remaining.is_empty() {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "instances left running: {remaining:?}"
        )))
    }
}

#[then("no instance was created")]
fn no_instance_created(provision_context: &ProvisionContext) -> Result<(), StepError> {
    let created = &provision_context.recorded.created;
    if created.is_empty() {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "unexpected instances: {created:?}"
        )))
    }
}
