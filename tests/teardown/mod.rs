//! Step definitions, fixtures and scenarios for the teardown workflow.

mod bdd_steps;
mod scenarios;
mod test_helpers;
