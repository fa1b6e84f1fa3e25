//! Binary entry point for the `gha-runner` CLI.

mod cli;

use std::io::{self, Write};
use std::process;

use clap::Parser;
use thiserror::Error;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use gha_runner::config::{RunnerConfig, ScalewayConfig};
use gha_runner::deprovision::Deprovisioner;
use gha_runner::github::GitHubRegistry;
use gha_runner::label::RunnerLabel;
use gha_runner::mapping::InstanceLabelMapping;
use gha_runner::outputs::{ActionOutputs, OutputTarget};
use gha_runner::provider::{CloudProvider, join_failures};
use gha_runner::provision::{ProvisionOutcome, Provisioner};
use gha_runner::registry::RunnerRegistry;
use gha_runner::scaleway::ScalewayProvider;

use cli::{Cli, StartCommand, StopCommand};

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("backend error: {0}")]
    Backend(String),
    #[error("registry error: {0}")]
    Registry(String),
    #[error("provisioning failed: {0}")]
    Provision(String),
    #[error("failed to publish outputs: {0}")]
    Outputs(String),
    #[error("provisioning incomplete: {0}")]
    Incomplete(String),
    #[error("teardown incomplete: {0}")]
    Teardown(String),
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();
    let exit_code = match dispatch(cli).await {
        Ok(()) => 0,
        Err(err) => {
            write_error(io::stderr(), &err);
            1
        }
    };

    process::exit(exit_code);
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

async fn dispatch(cli: Cli) -> Result<(), CliError> {
    match cli {
        Cli::Start(args) => start(args).await,
        Cli::Stop(args) => stop(args).await,
    }
}

async fn start(args: StartCommand) -> Result<(), CliError> {
    let mut runner = load_runner_config()?;
    let mut scaleway = load_scaleway_config()?;
    apply_start_overrides(&mut runner, &mut scaleway, args);

    runner
        .validate_for_start()
        .map_err(|err| CliError::Config(err.to_string()))?;
    scaleway
        .validate()
        .map_err(|err| CliError::Config(err.to_string()))?;
    let request = runner
        .instance_request(&scaleway)
        .map_err(|err| CliError::Config(err.to_string()))?;
    let setup = runner
        .runner_setup()
        .map_err(|err| CliError::Config(err.to_string()))?;

    let provider =
        ScalewayProvider::new(&scaleway).map_err(|err| CliError::Backend(err.to_string()))?;
    let registry = build_registry(&runner)?;
    info!(
        count = request.count,
        instance_type = %request.instance_type,
        zone = %request.zone,
        batch = provider.batch_tag(),
        "starting runner batch"
    );

    let provisioner = Provisioner::new(provider, registry, setup)
        .with_ready_schedule(runner.ready_schedule())
        .with_registration_schedule(runner.registration_schedule());
    let target = OutputTarget::from_env();

    match provisioner.execute(&request).await {
        Ok(outcome) => {
            publish(&target, &outcome.mapping)?;
            log_outcome(&outcome);
            if outcome.is_complete() {
                Ok(())
            } else {
                Err(CliError::Incomplete(describe_shortfall(&outcome)))
            }
        }
        Err(err) => {
            publish_failure(&target, err.residual_mapping())?;
            Err(CliError::Provision(err.to_string()))
        }
    }
}

async fn stop(args: StopCommand) -> Result<(), CliError> {
    let mut runner = load_runner_config()?;
    let scaleway = load_scaleway_config()?;
    apply_stop_overrides(&mut runner, args);

    runner
        .validate_for_stop()
        .map_err(|err| CliError::Config(err.to_string()))?;
    scaleway
        .validate_credentials()
        .map_err(|err| CliError::Config(err.to_string()))?;
    let mapping = runner
        .instance_mapping()
        .map_err(|err| CliError::Config(err.to_string()))?;
    let extra_labels = runner.remove_labels();

    let provider =
        ScalewayProvider::new(&scaleway).map_err(|err| CliError::Backend(err.to_string()))?;
    let registry = build_registry(&runner)?;
    let mut deprovisioner = Deprovisioner::new(provider, registry);
    if runner.wait_for_termination {
        deprovisioner = deprovisioner.with_termination_wait(runner.ready_schedule());
    }

    run_teardown(&deprovisioner, &mapping, &extra_labels).await
}

async fn run_teardown<P, R>(
    deprovisioner: &Deprovisioner<P, R>,
    mapping: &InstanceLabelMapping,
    extra_labels: &[RunnerLabel],
) -> Result<(), CliError>
where
    P: CloudProvider,
    R: RunnerRegistry,
{
    let report = deprovisioner.execute(mapping, extra_labels).await;
    if report.is_clean() {
        info!(%report, "teardown complete");
        Ok(())
    } else {
        Err(CliError::Teardown(report.to_string()))
    }
}

fn load_runner_config() -> Result<RunnerConfig, CliError> {
    RunnerConfig::load_without_cli_args().map_err(|err| CliError::Config(err.to_string()))
}

fn load_scaleway_config() -> Result<ScalewayConfig, CliError> {
    ScalewayConfig::load_without_cli_args().map_err(|err| CliError::Config(err.to_string()))
}

fn build_registry(runner: &RunnerConfig) -> Result<GitHubRegistry, CliError> {
    let repo = runner
        .repository()
        .ok_or_else(|| CliError::Config(String::from("repository is not set")))?;
    GitHubRegistry::new(&runner.github_token, &repo)
        .map(|registry| registry.with_api_base(runner.github_api_url.as_str()))
        .map_err(|err| CliError::Registry(err.to_string()))
}

fn apply_start_overrides(
    runner: &mut RunnerConfig,
    scaleway: &mut ScalewayConfig,
    args: StartCommand,
) {
    let StartCommand {
        count,
        instance_type,
        image,
        repo,
        extra_labels,
        pre_install_script,
        pre_install_script_file,
        no_wait_for_registration,
    } = args;

    if let Some(value) = count {
        runner.instance_count = value;
    }
    if let Some(value) = instance_type {
        scaleway.default_instance_type = value;
    }
    if let Some(value) = image {
        scaleway.default_image = value;
    }
    if let Some(value) = repo {
        runner.repo = Some(value);
    }
    if let Some(value) = extra_labels {
        runner.extra_labels = value;
    }
    if pre_install_script.is_some() || pre_install_script_file.is_some() {
        runner.pre_install_script = pre_install_script;
        runner.pre_install_script_file = pre_install_script_file;
    }
    if no_wait_for_registration {
        runner.wait_for_registration = false;
    }
}

fn apply_stop_overrides(runner: &mut RunnerConfig, args: StopCommand) {
    let StopCommand {
        mapping,
        mapping_file,
        repo,
        remove_labels,
        wait_for_termination,
    } = args;

    if mapping.is_some() || mapping_file.is_some() {
        runner.instance_mapping = mapping;
        runner.instance_mapping_file = mapping_file;
    }
    if let Some(value) = repo {
        runner.repo = Some(value);
    }
    if let Some(value) = remove_labels {
        runner.remove_labels = value;
    }
    if wait_for_termination {
        runner.wait_for_termination = true;
    }
}

fn publish(target: &OutputTarget, mapping: &InstanceLabelMapping) -> Result<(), CliError> {
    let outputs =
        ActionOutputs::from_mapping(mapping).map_err(|err| CliError::Outputs(err.to_string()))?;
    target
        .publish(&outputs)
        .map_err(|err| CliError::Outputs(err.to_string()))
}

/// Publishes what a failed run left behind, or `{}` so later steps always
/// find a mapping.
fn publish_failure(
    target: &OutputTarget,
    residual: Option<&InstanceLabelMapping>,
) -> Result<(), CliError> {
    match residual.filter(|mapping| !mapping.is_empty()) {
        Some(mapping) => {
            warn!(
                instances = mapping.len(),
                "publishing instances left behind by the failed run"
            );
            publish(target, mapping)
        }
        None => publish(target, &InstanceLabelMapping::default()),
    }
}

fn log_outcome(outcome: &ProvisionOutcome) {
    info!(
        runners = outcome.mapping.len(),
        "published instance mapping"
    );
    for (id, label) in outcome.mapping.iter() {
        let ip = outcome
            .addresses
            .get(id)
            .and_then(|address| address.public_ip)
            .map_or_else(|| String::from("none"), |ip| ip.to_string());
        info!(instance = id.as_str(), label = label.as_str(), public_ip = %ip, "runner ready");
    }
    if !outcome.unregistered.is_empty() {
        let labels: Vec<&str> = outcome.unregistered.iter().map(|label| label.as_str()).collect();
        warn!(
            labels = %labels.join(", "),
            "runners not seen online before the registration deadline"
        );
    }
    if !outcome.rollback_failures.is_empty() {
        warn!(
            failures = %join_failures(&outcome.rollback_failures),
            "excluded instances could not be terminated and stay in the mapping"
        );
    }
}

fn describe_shortfall(outcome: &ProvisionOutcome) -> String {
    let mut causes: Vec<String> = outcome
        .failures
        .iter()
        .map(ToString::to_string)
        .collect();
    causes.extend(
        outcome
            .rejected_slots
            .iter()
            .map(|cause| format!("creation refused: {cause}")),
    );
    format!(
        "{} runner(s) started; {}",
        outcome.mapping.len(),
        causes.join("; ")
    )
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}

#[cfg(test)]
#[path = "main_tests.rs"]
mod tests;
