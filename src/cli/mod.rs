//! Command-line interface definitions for the `gha-runner` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.
//! Flags override the matching values loaded from configuration.

use clap::Parser;

/// Top-level CLI for the `gha-runner` binary.
#[derive(Debug, Parser)]
#[command(
    name = "gha-runner",
    about = "Provision ephemeral cloud instances as GitHub Actions self-hosted runners",
    arg_required_else_help = true
)]
pub(crate) enum Cli {
    /// Create instances, register them as runners and publish the mapping.
    #[command(
        name = "start",
        about = "Create instances and register them as ephemeral runners"
    )]
    Start(StartCommand),
    /// Remove the runners of a mapping and terminate their instances.
    #[command(
        name = "stop",
        about = "Remove runners and terminate the instances of a mapping"
    )]
    Stop(StopCommand),
}

/// Arguments for the `gha-runner start` subcommand.
#[derive(Debug, Default, Parser)]
pub(crate) struct StartCommand {
    /// Number of runners to create.
    #[arg(long, value_name = "COUNT")]
    pub(crate) count: Option<u32>,
    /// Override the Scaleway commercial type for this batch.
    #[arg(long, value_name = "TYPE")]
    pub(crate) instance_type: Option<String>,
    /// Override the image UUID or label for this batch.
    #[arg(long, value_name = "IMAGE")]
    pub(crate) image: Option<String>,
    /// Repository as `owner/name`.
    #[arg(long, value_name = "OWNER/NAME")]
    pub(crate) repo: Option<String>,
    /// Comma-separated labels added to every runner.
    #[arg(long, value_name = "LABELS")]
    pub(crate) extra_labels: Option<String>,
    /// Shell snippet sourced before the runner agent is installed.
    #[arg(long, value_name = "SCRIPT", conflicts_with = "pre_install_script_file")]
    pub(crate) pre_install_script: Option<String>,
    /// File holding the pre-install snippet.
    #[arg(long, value_name = "PATH", conflicts_with = "pre_install_script")]
    pub(crate) pre_install_script_file: Option<String>,
    /// Publish the mapping without waiting for the runners to come online.
    #[arg(long)]
    pub(crate) no_wait_for_registration: bool,
}

/// Arguments for the `gha-runner stop` subcommand.
#[derive(Debug, Default, Parser)]
pub(crate) struct StopCommand {
    /// Mapping published by `start`, as inline JSON.
    #[arg(long, value_name = "JSON", conflicts_with = "mapping_file")]
    pub(crate) mapping: Option<String>,
    /// File holding the mapping published by `start`.
    #[arg(long, value_name = "PATH", conflicts_with = "mapping")]
    pub(crate) mapping_file: Option<String>,
    /// Repository as `owner/name`.
    #[arg(long, value_name = "OWNER/NAME")]
    pub(crate) repo: Option<String>,
    /// Comma-separated labels whose runners are removed as well.
    #[arg(long, value_name = "LABELS")]
    pub(crate) remove_labels: Option<String>,
    /// Wait until every instance is gone before exiting.
    #[arg(long)]
    pub(crate) wait_for_termination: bool,
}
