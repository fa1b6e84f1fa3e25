//! BDD scenarios for the provisioning workflow.

use rstest_bdd_macros::scenario;

use super::test_helpers::{ProvisionContext, provision_context};

#[scenario(
    path = "tests/features/provision.feature",
    name = "Provision a batch of registered runners"
)]
fn scenario_provision_batch(provision_context: ProvisionContext) {
    drop(provision_context);
}

#[scenario(
    path = "tests/features/provision.feature",
    name = "Exclude an instance that never becomes ready"
)]
fn scenario_exclude_unready_instance(provision_context: ProvisionContext) {
    drop(provision_context);
}

#[scenario(
    path = "tests/features/provision.feature",
    name = "Roll back the batch when tokens cannot be issued"
)]
fn scenario_roll_back_on_token_failure(provision_context: ProvisionContext) {
    drop(provision_context);
}

#[scenario(
    path = "tests/features/provision.feature",
    name = "Surface a rejected batch without creating anything"
)]
fn scenario_rejected_batch(provision_context: ProvisionContext) {
    drop(provision_context);
}
