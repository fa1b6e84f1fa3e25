//! Wire types for the slice of the GitHub REST API the registry uses.

use serde::Deserialize;

use crate::label::RunnerLabel;

#[derive(Debug, Deserialize)]
pub(super) struct RegistrationTokenResponse {
    pub(super) token: String,
}

#[derive(Debug, Deserialize)]
pub(super) struct RunnerPage {
    pub(super) total_count: usize,
    #[serde(default)]
    pub(super) runners: Vec<SelfHostedRunner>,
}

/// A self-hosted runner as listed by the repository runner endpoint.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub(super) struct SelfHostedRunner {
    pub(super) id: u64,
    pub(super) name: String,
    pub(super) status: String,
    #[serde(default)]
    pub(super) labels: Vec<RunnerLabelEntry>,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub(super) struct RunnerLabelEntry {
    pub(super) name: String,
}

impl SelfHostedRunner {
    pub(super) fn carries(&self, label: &RunnerLabel) -> bool {
        self.labels.iter().any(|entry| entry.name == label.as_str())
    }

    pub(super) fn is_online(&self) -> bool {
        self.status == "online"
    }
}

#[derive(Debug, Deserialize)]
pub(super) struct Release {
    #[serde(default)]
    pub(super) assets: Vec<ReleaseAsset>,
}

#[derive(Debug, Deserialize)]
pub(super) struct ReleaseAsset {
    pub(super) name: String,
    pub(super) browser_download_url: String,
}

/// Picks the runner archive for `platform` and `architecture`, for example
/// `actions-runner-linux-x64-2.321.0.tar.gz`.
pub(super) fn select_asset<'a>(
    assets: &'a [ReleaseAsset],
    platform: &str,
    architecture: &str,
) -> Option<&'a ReleaseAsset> {
    let needle = format!("-{platform}-{architecture}-");
    assets
        .iter()
        .filter(|asset| asset.name.contains(&needle))
        .find(|asset| asset.name.ends_with(".tar.gz"))
        .or_else(|| assets.iter().find(|asset| asset.name.contains(&needle)))
}
