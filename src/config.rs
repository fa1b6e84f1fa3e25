//! Configuration loading via `ortho-config`.
//!
//! Two layered structs cover the two sides of the lifecycle:
//! [`ScalewayConfig`] (prefix `SCW`) describes the cloud account and the
//! instance shape, and [`RunnerConfig`] (prefix `GHA_RUNNER`) describes the
//! repository, the runners and the timing of both commands. Each merges
//! defaults, the `gha-runner.toml` configuration file and environment
//! variables.

use std::ffi::OsString;
use std::time::Duration;

use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::github::GITHUB_API_URL;
use crate::label::{DEFAULT_LABEL_PREFIX, RunnerLabel};
use crate::mapping::{InstanceLabelMapping, MappingError, resolve_mapping};
use crate::poll::PollSchedule;
use crate::provider::{InstanceRequest, ResourceTag};
use crate::provision::RunnerSetup;
use crate::script::{InputSourceError, resolve_pre_install_script};

/// Name of the configuration file searched by both structs.
pub const CONFIG_FILE_NAME: &str = "gha-runner.toml";

/// Environment variable GitHub Actions sets to the current `owner/name`.
pub const GITHUB_REPOSITORY_ENV: &str = "GITHUB_REPOSITORY";

/// Scaleway specific configuration derived from environment variables and
/// configuration files.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "SCW",
    discovery(
        app_name = "gha-runner",
        env_var = "GHA_RUNNER_CONFIG_PATH",
        config_file_name = "gha-runner.toml",
        dotfile_name = ".gha-runner.toml",
        project_file_name = "gha-runner.toml"
    )
)]
pub struct ScalewayConfig {
    /// Secret key used for authentication. Required.
    #[ortho_config(default = String::new())]
    pub secret_key: String,
    /// Organisation identifier used by some Scaleway endpoints.
    pub default_organization_id: Option<String>,
    /// Project identifier used for billing and resource scoping. Required.
    #[ortho_config(default = String::new())]
    pub default_project_id: String,
    /// Zone hosting the runners. Defaults to `fr-par-1`.
    #[ortho_config(default = "fr-par-1".to_owned())]
    pub default_zone: String,
    /// Commercial type for new instances. Defaults to `DEV1-S`.
    #[ortho_config(default = "DEV1-S".to_owned())]
    pub default_instance_type: String,
    /// Image UUID or label (for example `Ubuntu 24.04 Noble Numbat`).
    #[ortho_config(default = "Ubuntu 24.04 Noble Numbat".to_owned())]
    pub default_image: String,
    /// CPU architecture used to select the image and the runner agent.
    #[ortho_config(default = "x86_64".to_owned())]
    pub default_architecture: String,
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
    section: &'static str,
}

impl FieldMetadata {
    const fn new(
        description: &'static str,
        env_var: &'static str,
        toml_key: &'static str,
        section: &'static str,
    ) -> Self {
        Self {
            description,
            env_var,
            toml_key,
            section,
        }
    }

    fn missing(&self) -> ConfigError {
        ConfigError::MissingField(format!(
            "missing {}: set {} or add {} to [{}] in {CONFIG_FILE_NAME}",
            self.description, self.env_var, self.toml_key, self.section
        ))
    }
}

fn require_field(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(metadata.missing());
    }
    Ok(())
}

fn comma_separated(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_owned)
        .collect()
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.filter(|inner| !inner.trim().is_empty())
}

impl ScalewayConfig {
    /// Loads configuration from defaults, configuration files and environment
    /// variables without parsing CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([OsString::from("gha-runner")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Checks the settings every Scaleway call needs.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] naming the environment variable
    /// and configuration key of the first empty field.
    pub fn validate_credentials(&self) -> Result<(), ConfigError> {
        require_field(
            &self.secret_key,
            &FieldMetadata::new(
                "Scaleway API secret key",
                "SCW_SECRET_KEY",
                "secret_key",
                "scaleway",
            ),
        )?;
        require_field(
            &self.default_project_id,
            &FieldMetadata::new(
                "Scaleway project ID",
                "SCW_DEFAULT_PROJECT_ID",
                "default_project_id",
                "scaleway",
            ),
        )?;
        require_field(
            &self.default_zone,
            &FieldMetadata::new(
                "availability zone",
                "SCW_DEFAULT_ZONE",
                "default_zone",
                "scaleway",
            ),
        )
    }

    /// Checks every setting `start` needs.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required field is empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_credentials()?;
        require_field(
            &self.default_image,
            &FieldMetadata::new("VM image", "SCW_DEFAULT_IMAGE", "default_image", "scaleway"),
        )?;
        require_field(
            &self.default_instance_type,
            &FieldMetadata::new(
                "instance type",
                "SCW_DEFAULT_INSTANCE_TYPE",
                "default_instance_type",
                "scaleway",
            ),
        )?;
        require_field(
            &self.default_architecture,
            &FieldMetadata::new(
                "CPU architecture",
                "SCW_DEFAULT_ARCHITECTURE",
                "default_architecture",
                "scaleway",
            ),
        )
    }
}

/// Repository, runner and timing settings shared by `start` and `stop`.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "GHA_RUNNER",
    discovery(
        app_name = "gha-runner",
        env_var = "GHA_RUNNER_CONFIG_PATH",
        config_file_name = "gha-runner.toml",
        dotfile_name = ".gha-runner.toml",
        project_file_name = "gha-runner.toml"
    )
)]
pub struct RunnerConfig {
    /// Personal access token with the repository administration scope.
    #[ortho_config(default = String::new())]
    pub github_token: String,
    /// Repository as `owner/name`; falls back to `GITHUB_REPOSITORY`.
    pub repo: Option<String>,
    /// Host the runners register against.
    #[ortho_config(default = "github.com".to_owned())]
    pub github_host: String,
    /// REST API base URL.
    #[ortho_config(default = GITHUB_API_URL.to_owned())]
    pub github_api_url: String,
    /// Number of runners `start` creates.
    #[ortho_config(default = 1)]
    pub instance_count: u32,
    /// Working directory of the bootstrap script on the instance.
    #[ortho_config(default = "/root".to_owned())]
    pub home_dir: String,
    /// Comma-separated labels added to every runner.
    #[ortho_config(default = String::new())]
    pub extra_labels: String,
    /// Prefix of the generated unique runner labels.
    #[ortho_config(default = DEFAULT_LABEL_PREFIX.to_owned())]
    pub label_prefix: String,
    /// Inline shell snippet run before the runner agent is installed.
    pub pre_install_script: Option<String>,
    /// File holding the pre-install snippet.
    pub pre_install_script_file: Option<String>,
    /// Runner agent archive URL; the latest release is used when unset.
    pub runner_release: Option<String>,
    /// Private network attached to every instance.
    pub subnet_id: Option<String>,
    /// Security group applied to every instance.
    pub security_group_id: Option<String>,
    /// Identity role for the instances. Not supported on Scaleway.
    pub instance_role: Option<String>,
    /// Tags as JSON, for example `[{"Key": "team", "Value": "ci"}]`.
    pub tags: Option<String>,
    /// Seconds to wait for instances to reach the running state.
    #[ortho_config(default = 300)]
    pub ready_timeout_secs: u64,
    /// Seconds to wait for runners to show up online.
    #[ortho_config(default = 600)]
    pub registration_timeout_secs: u64,
    /// Seconds between two polls of the provider or the registry.
    #[ortho_config(default = 5)]
    pub poll_interval_secs: u64,
    /// Whether `start` waits for every runner to register.
    #[ortho_config(default = true)]
    pub wait_for_registration: bool,
    /// Mapping emitted by `start`, as inline JSON.
    pub instance_mapping: Option<String>,
    /// File holding the mapping emitted by `start`.
    pub instance_mapping_file: Option<String>,
    /// Comma-separated labels whose runners `stop` also removes.
    #[ortho_config(default = String::new())]
    pub remove_labels: String,
    /// Whether `stop` waits until the instances are gone.
    #[ortho_config(default = false)]
    pub wait_for_termination: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawTag {
    key: String,
    value: String,
}

impl RunnerConfig {
    /// Loads configuration from defaults, configuration files and environment
    /// variables without parsing CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([OsString::from("gha-runner")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Returns the configured repository, falling back to
    /// `GITHUB_REPOSITORY`.
    #[must_use]
    pub fn repository(&self) -> Option<String> {
        non_blank(self.repo.as_deref())
            .map(|repo| repo.trim().to_owned())
            .or_else(|| {
                std::env::var(GITHUB_REPOSITORY_ENV)
                    .ok()
                    .map(|repo| repo.trim().to_owned())
                    .filter(|repo| !repo.is_empty())
            })
    }

    /// URL the runner agents register against.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when no repository is known.
    pub fn repository_url(&self) -> Result<String, ConfigError> {
        let repo = self.require_repository()?;
        Ok(format!(
            "https://{}/{repo}",
            self.github_host.trim().trim_end_matches('/')
        ))
    }

    fn require_repository(&self) -> Result<String, ConfigError> {
        self.repository().ok_or_else(|| {
            FieldMetadata::new(
                "repository (owner/name)",
                "GHA_RUNNER_REPO or GITHUB_REPOSITORY",
                "repo",
                "runner",
            )
            .missing()
        })
    }

    fn validate_common(&self) -> Result<(), ConfigError> {
        require_field(
            &self.github_token,
            &FieldMetadata::new(
                "GitHub token",
                "GHA_RUNNER_GITHUB_TOKEN",
                "github_token",
                "runner",
            ),
        )?;
        self.require_repository()?;
        if self.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid(String::from(
                "poll_interval_secs must be at least 1",
            )));
        }
        Ok(())
    }

    /// Checks every setting `start` needs before any cloud call.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] naming the first missing or invalid setting.
    pub fn validate_for_start(&self) -> Result<(), ConfigError> {
        self.validate_common()?;
        if self.instance_count == 0 {
            return Err(ConfigError::Invalid(String::from(
                "instance_count must be at least 1",
            )));
        }
        require_field(
            &self.home_dir,
            &FieldMetadata::new(
                "runner home directory",
                "GHA_RUNNER_HOME_DIR",
                "home_dir",
                "runner",
            ),
        )?;
        require_field(
            &self.label_prefix,
            &FieldMetadata::new(
                "runner label prefix",
                "GHA_RUNNER_LABEL_PREFIX",
                "label_prefix",
                "runner",
            ),
        )?;
        self.resource_tags()?;
        self.pre_install_script()?;
        Ok(())
    }

    /// Checks every setting `stop` needs before any cloud call.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] naming the first missing setting; a missing
    /// mapping is reported as [`ConfigError::MissingField`].
    pub fn validate_for_stop(&self) -> Result<(), ConfigError> {
        self.validate_common()?;
        if non_blank(self.instance_mapping.as_deref()).is_none()
            && self.instance_mapping_file.is_none()
        {
            return Err(FieldMetadata::new(
                "instance mapping",
                "GHA_RUNNER_INSTANCE_MAPPING or GHA_RUNNER_INSTANCE_MAPPING_FILE",
                "instance_mapping",
                "runner",
            )
            .missing());
        }
        Ok(())
    }

    /// Parses the JSON tag list.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when the JSON is malformed or a key is
    /// empty.
    pub fn resource_tags(&self) -> Result<Vec<ResourceTag>, ConfigError> {
        let Some(raw) = non_blank(self.tags.as_deref()) else {
            return Ok(Vec::new());
        };
        let parsed: Vec<RawTag> = serde_json::from_str(raw).map_err(|err| {
            ConfigError::Invalid(format!(
                "tags must be a JSON list of {{\"Key\": ..., \"Value\": ...}} objects: {err}"
            ))
        })?;
        parsed
            .into_iter()
            .map(|tag| {
                if tag.key.trim().is_empty() {
                    Err(ConfigError::Invalid(String::from("tag keys must not be empty")))
                } else {
                    Ok(ResourceTag {
                        key: tag.key,
                        value: tag.value,
                    })
                }
            })
            .collect()
    }

    /// Labels added to every runner at registration.
    #[must_use]
    pub fn extra_labels(&self) -> Vec<String> {
        comma_separated(&self.extra_labels)
    }

    /// Labels whose runners `stop` removes besides the mapped ones.
    #[must_use]
    pub fn remove_labels(&self) -> Vec<RunnerLabel> {
        comma_separated(&self.remove_labels)
            .into_iter()
            .map(RunnerLabel::from)
            .collect()
    }

    /// Resolves the pre-install script from its inline or file source.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Input`] when both sources are set or the file
    /// cannot be read.
    pub fn pre_install_script(&self) -> Result<Option<String>, ConfigError> {
        Ok(resolve_pre_install_script(
            self.pre_install_script.as_deref(),
            self.pre_install_script_file.as_deref(),
        )?)
    }

    /// Resolves the mapping `stop` tears down.
    ///
    /// # Errors
    ///
    /// Returns [`MappingError`] when no mapping is given or it is malformed.
    pub fn instance_mapping(&self) -> Result<InstanceLabelMapping, MappingError> {
        resolve_mapping(
            self.instance_mapping.as_deref(),
            self.instance_mapping_file.as_deref(),
        )
    }

    /// Builds the batch request from both configurations.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when either configuration is incomplete or the
    /// resulting request is invalid.
    pub fn instance_request(
        &self,
        scaleway: &ScalewayConfig,
    ) -> Result<InstanceRequest, ConfigError> {
        scaleway.validate()?;
        InstanceRequest::builder()
            .image(&scaleway.default_image)
            .instance_type(&scaleway.default_instance_type)
            .zone(&scaleway.default_zone)
            .architecture(&scaleway.default_architecture)
            .count(self.instance_count)
            .subnet_id(self.subnet_id.clone())
            .security_group_id(self.security_group_id.clone())
            .instance_role(self.instance_role.clone())
            .tags(self.resource_tags()?)
            .home_dir(&self.home_dir)
            .extra_labels(self.extra_labels())
            .label_prefix(&self.label_prefix)
            .build()
            .map_err(|err| ConfigError::Invalid(err.to_string()))
    }

    /// Builds the registry-side settings of a batch.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the repository is unknown or the
    /// pre-install script cannot be resolved.
    pub fn runner_setup(&self) -> Result<RunnerSetup, ConfigError> {
        Ok(RunnerSetup {
            repository_url: self.repository_url()?,
            runner_download_url: non_blank(self.runner_release.as_deref())
                .map(|url| url.trim().to_owned()),
            pre_install_script: self.pre_install_script()?,
            wait_for_registration: self.wait_for_registration,
        })
    }

    const fn interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Schedule for the readiness and termination waits.
    #[must_use]
    pub const fn ready_schedule(&self) -> PollSchedule {
        PollSchedule::new(self.interval(), Duration::from_secs(self.ready_timeout_secs))
    }

    /// Schedule for the registration wait.
    #[must_use]
    pub const fn registration_schedule(&self) -> PollSchedule {
        PollSchedule::new(
            self.interval(),
            Duration::from_secs(self.registration_timeout_secs),
        )
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Indicates a configuration value is present but unusable.
    #[error("invalid configuration: {0}")]
    Invalid(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
    /// Surfaces errors resolving an inline-or-file input.
    #[error(transparent)]
    Input(#[from] InputSourceError),
}

