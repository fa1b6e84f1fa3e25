//! Image resolution helpers for the Scaleway backend.
//!
//! The configured image may be an image UUID, used as is, or a label such as
//! `Ubuntu 24.04 Noble Numbat`, resolved to the newest available image of
//! the requested architecture.

use std::future::Future;

use scaleway_rs::{ScalewayImage, ScalewayListInstanceImagesBuilder};
use uuid::Uuid;

use crate::provider::InstanceRequest;
use crate::scaleway::{ScalewayBackendError, ScalewayProvider};

impl ScalewayProvider {
    pub(in crate::scaleway) async fn resolve_image_id(
        &self,
        request: &InstanceRequest,
    ) -> Result<String, ScalewayBackendError> {
        if Uuid::parse_str(&request.image).is_ok() {
            return Ok(request.image.clone());
        }
        let architecture = scaleway_architecture(&request.architecture);

        Self::resolve_image_id_with(
            request,
            || async move {
                let mut scoped =
                    ScalewayListInstanceImagesBuilder::new(self.api.clone(), &self.zone)
                        .public(true)
                        .project(&self.project_id)
                        .name(&request.image)
                        .arch(architecture);
                if let Some(org) = &self.organisation_id {
                    scoped = scoped.organization(org);
                }
                scoped.run_async().await.map_err(ScalewayBackendError::from)
            },
            || async move {
                ScalewayListInstanceImagesBuilder::new(self.api.clone(), &self.zone)
                    .public(true)
                    .name(&request.image)
                    .arch(architecture)
                    .run_async()
                    .await
                    .map_err(ScalewayBackendError::from)
            },
        )
        .await
    }

    pub(in crate::scaleway) async fn resolve_image_id_with<FutA, FutB, FetchA, FetchB>(
        request: &InstanceRequest,
        project_fetch: FetchA,
        public_fetch: FetchB,
    ) -> Result<String, ScalewayBackendError>
    where
        FetchA: FnOnce() -> FutA,
        FetchB: FnOnce() -> FutB,
        FutA: Future<Output = Result<Vec<ScalewayImage>, ScalewayBackendError>>,
        FutB: Future<Output = Result<Vec<ScalewayImage>, ScalewayBackendError>>,
    {
        let project_images = Self::filter_images(project_fetch().await?, request);
        let candidates = if project_images.is_empty() {
            Self::filter_images(public_fetch().await?, request)
        } else {
            project_images
        };

        Self::select_image_id(candidates, request)
    }

    pub(in crate::scaleway) fn select_image_id(
        candidates: Vec<ScalewayImage>,
        request: &InstanceRequest,
    ) -> Result<String, ScalewayBackendError> {
        candidates
            .into_iter()
            .max_by(|lhs, rhs| lhs.creation_date.cmp(&rhs.creation_date))
            .map(|image| image.id)
            .ok_or_else(|| ScalewayBackendError::ImageNotFound {
                label: request.image.clone(),
                arch: request.architecture.clone(),
                zone: request.zone.clone(),
            })
    }

    pub(in crate::scaleway) fn filter_images(
        images: Vec<ScalewayImage>,
        request: &InstanceRequest,
    ) -> Vec<ScalewayImage> {
        let architecture = scaleway_architecture(&request.architecture);
        images
            .into_iter()
            .filter(|image| image.arch == architecture)
            .filter(|image| image.state == "available")
            .collect()
    }
}

/// Maps common architecture spellings onto Scaleway's image naming.
pub(in crate::scaleway) fn scaleway_architecture(architecture: &str) -> &str {
    match architecture {
        "amd64" | "x64" => "x86_64",
        "aarch64" => "arm64",
        other => other,
    }
}
