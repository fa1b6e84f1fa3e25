//! BDD scenarios for the teardown workflow.

use rstest_bdd_macros::scenario;

use super::test_helpers::{TeardownContext, teardown_context};

#[scenario(
    path = "tests/features/teardown.feature",
    name = "Tear down every runner and instance of a mapping"
)]
fn scenario_full_teardown(teardown_context: TeardownContext) {
    drop(teardown_context);
}

#[scenario(
    path = "tests/features/teardown.feature",
    name = "Keep terminating instances when runner removal fails"
)]
fn scenario_removal_failure(teardown_context: TeardownContext) {
    drop(teardown_context);
}

#[scenario(
    path = "tests/features/teardown.feature",
    name = "Keep removing runners when termination fails"
)]
fn scenario_termination_failure(teardown_context: TeardownContext) {
    drop(teardown_context);
}

#[scenario(
    path = "tests/features/teardown.feature",
    name = "Re-run teardown on an already cleaned mapping"
)]
fn scenario_repeat_teardown(teardown_context: TeardownContext) {
    drop(teardown_context);
}
