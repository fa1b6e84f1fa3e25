//! Rendering of the startup script that turns an instance into a runner.
//!
//! The script runs once on first boot. It sources the caller's pre-install
//! script, downloads the runner agent, registers it against the repository
//! with the instance's unique label, and starts it in ephemeral mode so the
//! runner deregisters itself after a single job.

use std::borrow::Cow;
use std::fmt;

use shell_escape::unix::escape;

use crate::label::RunnerLabel;
use crate::registry::RegistrationToken;

const PRE_INSTALL_SCRIPT_NAME: &str = "pre-runner-script.sh";
const RUNNER_DIR: &str = "actions-runner";
const RUNNER_ARCHIVE: &str = "actions-runner.tar.gz";

/// Inputs of [`render`].
#[derive(Clone, Copy, Debug)]
pub struct BootstrapParams<'a> {
    /// Working directory on the instance.
    pub home_dir: &'a str,
    /// Registration token embedded in the agent configuration.
    pub token: &'a RegistrationToken,
    /// Repository URL the runner registers against.
    pub repository_url: &'a str,
    /// Unique label of this runner.
    pub label: &'a RunnerLabel,
    /// Labels shared by every runner of the batch.
    pub extra_labels: &'a [String],
    /// Download URL of the runner agent archive.
    pub runner_download_url: &'a str,
    /// Shell snippet executed before the agent is installed.
    pub pre_install_script: Option<&'a str>,
}

/// Rendered startup payload.
///
/// The payload embeds a registration token, so its `Debug` output only
/// reports the size.
#[derive(Clone, Eq, PartialEq)]
pub struct StartupPayload(Vec<u8>);

impl StartupPayload {
    /// Wraps raw payload bytes.
    #[must_use]
    pub const fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Returns the payload bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Returns the payload as text for providers that take a string body.
    #[must_use]
    pub fn to_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.0)
    }
}

impl fmt::Debug for StartupPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StartupPayload(<{} bytes>)", self.0.len())
    }
}

/// Renders the bootstrap script for one runner.
///
/// Rendering is pure: identical inputs produce identical bytes. Every
/// interpolated value is shell-quoted.
#[must_use]
pub fn render(params: &BootstrapParams<'_>) -> StartupPayload {
    let labels = std::iter::once(params.label.as_str())
        .chain(params.extra_labels.iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join(",");
    let pre_install = params.pre_install_script.unwrap_or_default();

    let lines = [
        String::from("#!/bin/bash"),
        String::from("set -eo pipefail"),
        format!("cd {}", quote(params.home_dir)),
        format!(
            "printf '%s\\n' {} > {PRE_INSTALL_SCRIPT_NAME}",
            quote(pre_install)
        ),
        format!("source ./{PRE_INSTALL_SCRIPT_NAME}"),
        String::from("export RUNNER_ALLOW_RUNASROOT=1"),
        format!("mkdir -p {RUNNER_DIR}"),
        format!("cd {RUNNER_DIR}"),
        format!(
            "curl -fsSL -o {RUNNER_ARCHIVE} {}",
            quote(params.runner_download_url)
        ),
        format!("tar xzf {RUNNER_ARCHIVE}"),
        format!(
            "./config.sh --unattended --ephemeral --url {} --token {} --labels {} --name {}",
            quote(params.repository_url),
            quote(params.token.secret()),
            quote(&labels),
            quote(params.label.as_str()),
        ),
        String::from("./run.sh"),
    ];

    let mut script = lines.join("\n");
    script.push('\n');
    StartupPayload::new(script.into_bytes())
}

fn quote(value: &str) -> Cow<'_, str> {
    escape(Cow::Borrowed(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::{fixture, rstest};

    #[fixture]
    fn token() -> RegistrationToken {
        RegistrationToken::new("AABBCC")
    }

    fn params<'a>(token: &'a RegistrationToken, label: &'a RunnerLabel) -> BootstrapParams<'a> {
        BootstrapParams {
            home_dir: "/home/ubuntu",
            token,
            repository_url: "https://github.com/octo/repo",
            label,
            extra_labels: &[],
            runner_download_url: "https://example.test/runner.tar.gz",
            pre_install_script: None,
        }
    }

    #[rstest]
    fn render_produces_expected_script(token: RegistrationToken) {
        let label = RunnerLabel::from("runner-abc");
        let payload = render(&params(&token, &label));

        let expected = concat!(
            "#!/bin/bash\n",
            "set -eo pipefail\n",
            "cd /home/ubuntu\n",
            "printf '%s\\n' '' > pre-runner-script.sh\n",
            "source ./pre-runner-script.sh\n",
            "export RUNNER_ALLOW_RUNASROOT=1\n",
            "mkdir -p actions-runner\n",
            "cd actions-runner\n",
            "curl -fsSL -o actions-runner.tar.gz 'https://example.test/runner.tar.gz'\n",
            "tar xzf actions-runner.tar.gz\n",
            "./config.sh --unattended --ephemeral --url 'https://github.com/octo/repo' ",
            "--token AABBCC --labels runner-abc --name runner-abc\n",
            "./run.sh\n",
        );
        assert_eq!(payload.to_text(), expected);
    }

    #[rstest]
    fn render_is_deterministic(token: RegistrationToken) {
        let label = RunnerLabel::from("runner-abc");
        let extra = [String::from("gpu")];
        let mut inputs = params(&token, &label);
        inputs.extra_labels = &extra;

        assert_eq!(render(&inputs), render(&inputs));
    }

    #[rstest]
    fn render_combines_unique_and_extra_labels(token: RegistrationToken) {
        let label = RunnerLabel::from("runner-abc");
        let extra = [String::from("gpu"), String::from("linux")];
        let mut inputs = params(&token, &label);
        inputs.extra_labels = &extra;

        let text = render(&inputs).to_text().into_owned();
        assert!(text.contains("runner-abc,gpu,linux"), "script: {text}");
    }

    #[rstest]
    fn render_quotes_pre_install_script(token: RegistrationToken) {
        let label = RunnerLabel::from("runner-abc");
        let mut inputs = params(&token, &label);
        inputs.pre_install_script = Some("apt-get update\necho 'done'");

        let text = render(&inputs).to_text().into_owned();
        assert!(
            text.contains("printf '%s\\n' 'apt-get update\necho '\\''done'\\''' > pre-runner-script.sh"),
            "script: {text}"
        );
    }

    #[rstest]
    fn payload_debug_hides_contents(token: RegistrationToken) {
        let label = RunnerLabel::from("runner-abc");
        let payload = render(&params(&token, &label));
        let debug = format!("{payload:?}");

        assert!(!debug.contains("AABBCC"), "debug leaked token: {debug}");
        assert!(debug.starts_with("StartupPayload(<"), "debug: {debug}");
    }
}
