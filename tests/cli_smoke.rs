//! Behavioural smoke tests for the CLI entrypoint.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use tempfile::TempDir;

const CLEARED_VARS: &[&str] = &[
    "SCW_SECRET_KEY",
    "SCW_DEFAULT_PROJECT_ID",
    "GHA_RUNNER_GITHUB_TOKEN",
    "GHA_RUNNER_REPO",
    "GHA_RUNNER_INSTANCE_MAPPING",
    "GHA_RUNNER_INSTANCE_MAPPING_FILE",
    "GHA_RUNNER_CONFIG_PATH",
    "GITHUB_REPOSITORY",
    "GITHUB_OUTPUT",
];

fn isolated_command(home: &TempDir) -> Command {
    let mut cmd = cargo_bin_cmd!("gha-runner");
    for var in CLEARED_VARS {
        cmd.env_remove(var);
    }
    cmd.env("HOME", home.path())
        .env("XDG_CONFIG_HOME", home.path())
        .env("RUST_LOG", "off")
        .current_dir(home.path());
    cmd
}

fn temp_home() -> TempDir {
    TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"))
}

#[test]
fn help_lists_both_subcommands() {
    let home = temp_home();
    isolated_command(&home)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("start").and(predicate::str::contains("stop")));
}

#[test]
fn start_without_token_fails_before_touching_the_cloud() {
    let home = temp_home();
    isolated_command(&home)
        .args(["start", "--repo", "octo/widgets"])
        .assert()
        .code(1)
        .stdout("")
        .stderr(predicate::str::contains("GHA_RUNNER_GITHUB_TOKEN"));
}

#[test]
fn stop_without_mapping_names_both_sources() {
    let home = temp_home();
    isolated_command(&home)
        .env("GHA_RUNNER_GITHUB_TOKEN", "token")
        .args(["stop", "--repo", "octo/widgets"])
        .assert()
        .code(1)
        .stderr(
            predicate::str::contains("GHA_RUNNER_INSTANCE_MAPPING")
                .and(predicate::str::contains("GHA_RUNNER_INSTANCE_MAPPING_FILE")),
        );
}

#[test]
fn conflicting_script_sources_are_rejected_by_the_parser() {
    let home = temp_home();
    isolated_command(&home)
        .args([
            "start",
            "--pre-install-script",
            "echo hi",
            "--pre-install-script-file",
            "pre.sh",
        ])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("cannot be used with"));
}
