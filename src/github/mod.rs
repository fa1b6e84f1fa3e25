//! GitHub implementation of [`RunnerRegistry`].
//!
//! Runners are registered against a single repository. Registration tokens
//! come from the repository's `registration-token` endpoint; runners are
//! found through the repository runner listing by label and removed by id.
//! The runner agent download is resolved from the latest `actions/runner`
//! release.

mod error;
mod types;

use std::collections::BTreeSet;
use std::fmt;
use std::time::{Duration, Instant};

use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderMap, HeaderValue};
use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::label::RunnerLabel;
use crate::poll::PollSchedule;
use crate::registry::{
    LabelFailure, OnlineFuture, RegistrationToken, RegistryFuture, RunnerRegistry,
    RunnerRemovalError,
};

pub use error::GitHubError;
use types::{Release, RegistrationTokenResponse, RunnerPage, SelfHostedRunner, select_asset};

/// Public GitHub REST endpoint.
pub const GITHUB_API_URL: &str = "https://api.github.com";

/// REST API version pinned in every request.
const API_VERSION: &str = "2022-11-28";

/// Largest page the runner listing returns.
const RUNNER_PAGE_SIZE: usize = 100;

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Repository that publishes the runner agent.
const RUNNER_RELEASE_REPO: &str = "actions/runner";

/// Registry backed by the GitHub REST API.
#[derive(Clone)]
pub struct GitHubRegistry {
    client: reqwest::Client,
    api_base: String,
    repo: String,
}

impl fmt::Debug for GitHubRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GitHubRegistry")
            .field("api_base", &self.api_base)
            .field("repo", &self.repo)
            .finish_non_exhaustive()
    }
}

impl GitHubRegistry {
    /// Creates a registry client for `repo` (`owner/name`) authenticated with
    /// a personal access token.
    ///
    /// # Errors
    ///
    /// Returns [`GitHubError::Config`] when the token or repository is blank
    /// or the token cannot be sent as a header.
    pub fn new(token: &str, repo: &str) -> Result<Self, GitHubError> {
        let repo_name = repo.trim().trim_matches('/');
        if repo_name.split('/').filter(|part| !part.is_empty()).count() != 2 {
            return Err(GitHubError::Config(format!(
                "repository must be owner/name, got '{repo}'"
            )));
        }
        if token.trim().is_empty() {
            return Err(GitHubError::Config(String::from("token is empty")));
        }

        let mut auth = HeaderValue::from_str(&format!("Bearer {}", token.trim()))
            .map_err(|_| GitHubError::Config(String::from("token is not a valid header value")))?;
        auth.set_sensitive(true);
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, auth);
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/vnd.github+json"),
        );
        headers.insert(
            "x-github-api-version",
            HeaderValue::from_static(API_VERSION),
        );

        let client = reqwest::Client::builder()
            .user_agent(concat!("gha-runner/", env!("CARGO_PKG_VERSION")))
            .default_headers(headers)
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|err| GitHubError::Config(err.to_string()))?;

        Ok(Self {
            client,
            api_base: GITHUB_API_URL.to_owned(),
            repo: repo_name.to_owned(),
        })
    }

    /// Sends requests to `api_base` instead of `api.github.com`, for GitHub
    /// Enterprise Server or tests.
    #[must_use]
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_owned();
        self
    }

    /// Repository the runners are registered against.
    #[must_use]
    pub fn repo(&self) -> &str {
        &self.repo
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/{endpoint}", self.api_base)
    }

    async fn create_registration_token(&self) -> Result<RegistrationToken, GitHubError> {
        let endpoint = format!("repos/{}/actions/runners/registration-token", self.repo);
        let response = self
            .client
            .post(self.url(&endpoint))
            .send()
            .await
            .map_err(GitHubError::transport)?;
        let body: RegistrationTokenResponse = decode(&endpoint, response).await?;
        Ok(RegistrationToken::new(body.token))
    }

    async fn list_runners(&self) -> Result<Vec<SelfHostedRunner>, GitHubError> {
        let endpoint = format!("repos/{}/actions/runners", self.repo);
        let mut runners = Vec::new();
        for page in 1.. {
            let response = self
                .client
                .get(self.url(&endpoint))
                .query(&[("per_page", RUNNER_PAGE_SIZE), ("page", page)])
                .send()
                .await
                .map_err(GitHubError::transport)?;
            let body: RunnerPage = decode(&endpoint, response).await?;
            let fetched = body.runners.len();
            runners.extend(body.runners);
            if fetched < RUNNER_PAGE_SIZE || runners.len() >= body.total_count {
                break;
            }
        }
        Ok(runners)
    }

    async fn delete_runner(&self, runner: &SelfHostedRunner) -> Result<(), GitHubError> {
        let endpoint = format!("repos/{}/actions/runners/{}", self.repo, runner.id);
        let response = self
            .client
            .delete(self.url(&endpoint))
            .send()
            .await
            .map_err(GitHubError::transport)?;
        if response.status() == StatusCode::NOT_FOUND {
            debug!(runner = %runner.name, "runner already removed");
            return Ok(());
        }
        check_status(&endpoint, response).await.map(|_| ())
    }

    async fn poll_online(
        &self,
        labels: &[RunnerLabel],
        schedule: PollSchedule,
    ) -> BTreeSet<RunnerLabel> {
        let deadline = schedule.deadline();
        let mut online = BTreeSet::new();
        while Instant::now() <= deadline {
            match self.list_runners().await {
                Ok(runners) => {
                    online.extend(
                        labels
                            .iter()
                            .filter(|label| {
                                runners
                                    .iter()
                                    .any(|runner| runner.carries(label) && runner.is_online())
                            })
                            .cloned(),
                    );
                    debug!(online = online.len(), expected = labels.len(), "registration poll");
                    if online.len() == labels.len() {
                        break;
                    }
                }
                Err(err) => warn!(error = %err, "runner listing failed; retrying"),
            }
            sleep(schedule.interval).await;
        }
        online
    }

    async fn remove_labelled(
        &self,
        labels: &[RunnerLabel],
    ) -> Result<Vec<RunnerLabel>, RunnerRemovalError> {
        let runners = match self.list_runners().await {
            Ok(runners) => runners,
            Err(err) => {
                return Err(RunnerRemovalError {
                    removed: Vec::new(),
                    failures: labels
                        .iter()
                        .map(|label| LabelFailure::new(label.clone(), err.to_string()))
                        .collect(),
                });
            }
        };

        let mut removed = Vec::with_capacity(labels.len());
        let mut failures = Vec::new();
        for label in labels {
            let mut causes = Vec::new();
            for runner in runners.iter().filter(|runner| runner.carries(label)) {
                if let Err(err) = self.delete_runner(runner).await {
                    causes.push(format!("runner {}: {err}", runner.name));
                }
            }
            if causes.is_empty() {
                removed.push(label.clone());
            } else {
                failures.push(LabelFailure::new(label.clone(), causes.join("; ")));
            }
        }

        info!(
            removed = removed.len(),
            failed = failures.len(),
            "runner removal finished"
        );
        if failures.is_empty() {
            Ok(removed)
        } else {
            Err(RunnerRemovalError { removed, failures })
        }
    }

    async fn find_release_asset(
        &self,
        platform: &str,
        architecture: &str,
    ) -> Result<String, GitHubError> {
        let endpoint = format!("repos/{RUNNER_RELEASE_REPO}/releases/latest");
        let response = self
            .client
            .get(self.url(&endpoint))
            .send()
            .await
            .map_err(GitHubError::transport)?;
        let release: Release = decode(&endpoint, response).await?;
        select_asset(&release.assets, platform, architecture)
            .map(|asset| asset.browser_download_url.clone())
            .ok_or_else(|| GitHubError::ReleaseNotFound {
                platform: platform.to_owned(),
                architecture: architecture.to_owned(),
            })
    }
}

async fn check_status(endpoint: &str, response: Response) -> Result<Response, GitHubError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        return Err(GitHubError::Auth {
            endpoint: endpoint.to_owned(),
            status: status.as_u16(),
        });
    }
    let message = response.text().await.unwrap_or_default();
    Err(GitHubError::Http {
        endpoint: endpoint.to_owned(),
        status: status.as_u16(),
        message,
    })
}

async fn decode<T: DeserializeOwned>(endpoint: &str, response: Response) -> Result<T, GitHubError> {
    check_status(endpoint, response)
        .await?
        .json::<T>()
        .await
        .map_err(GitHubError::decode)
}

impl RunnerRegistry for GitHubRegistry {
    type Error = GitHubError;

    fn issue_registration_token(&self) -> RegistryFuture<'_, RegistrationToken, Self::Error> {
        Box::pin(async move { self.create_registration_token().await })
    }

    fn wait_until_online<'a>(
        &'a self,
        labels: &'a [RunnerLabel],
        schedule: PollSchedule,
    ) -> OnlineFuture<'a> {
        Box::pin(async move { self.poll_online(labels, schedule).await })
    }

    fn remove_runners<'a>(
        &'a self,
        labels: &'a [RunnerLabel],
    ) -> RegistryFuture<'a, Vec<RunnerLabel>, RunnerRemovalError> {
        Box::pin(async move { self.remove_labelled(labels).await })
    }

    fn latest_runner_release<'a>(
        &'a self,
        platform: &'a str,
        architecture: &'a str,
    ) -> RegistryFuture<'a, String, Self::Error> {
        Box::pin(async move { self.find_release_asset(platform, architecture).await })
    }
}
