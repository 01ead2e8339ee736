//! Stages storage: the cache of stage images keyed by signature

use crate::error::{StrataError, StrataResult};
use crate::image::{labels, repo_stage_tag, signature_from_repo_stage_tag, BuiltImage};
use crate::orchestration::ContainerRuntime;
use crate::registry::RegistryClient;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

/// Cache of stage images
#[async_trait]
pub trait StagesStorage: Send + Sync {
    /// Human-readable location of the storage
    fn address(&self) -> &str;

    /// Cached stage image for `signature`, if any
    async fn get_stage(&self, project: &str, signature: &str) -> StrataResult<Option<BuiltImage>>;

    /// Store a stage image under `signature`
    async fn store_stage(
        &self,
        project: &str,
        signature: &str,
        image: &BuiltImage,
    ) -> StrataResult<BuiltImage>;

    /// Every stage image of `project`
    async fn list_stages(&self, project: &str) -> StrataResult<Vec<BuiltImage>>;

    /// Remove one stage image; removing a missing image succeeds
    async fn delete_stage(&self, image: &BuiltImage) -> StrataResult<()>;
}

/// Stages kept as `<address>:image-stage-<signature>` tags in one registry repo.
///
/// Reading and deleting only need the registry; storing pushes through a
/// container runtime set with `with_runtime`.
pub struct RepoStagesStorage {
    address: String,
    registry: RegistryClient,
    runtime: Option<Arc<dyn ContainerRuntime>>,
}

impl RepoStagesStorage {
    pub fn new(address: impl Into<String>, registry: RegistryClient) -> Self {
        Self {
            address: address.into(),
            registry,
            runtime: None,
        }
    }

    pub fn with_runtime(mut self, runtime: Arc<dyn ContainerRuntime>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    fn stage_reference(&self, signature: &str) -> String {
        format!("{}:{}", self.address, repo_stage_tag(signature))
    }
}

#[async_trait]
impl StagesStorage for RepoStagesStorage {
    fn address(&self) -> &str {
        &self.address
    }

    async fn get_stage(&self, project: &str, signature: &str) -> StrataResult<Option<BuiltImage>> {
        let reference = self.stage_reference(signature);

        let inspect = match self.registry.inspect(&reference).await {
            Ok(inspect) => inspect,
            Err(err) if err.is_not_found() => return Ok(None),
            Err(err) => return Err(err),
        };

        let image = BuiltImage {
            name: reference,
            id: inspect.id,
            parent_id: inspect.parent_id,
            labels: inspect.labels,
        };
        if !image.belongs_to(project) {
            debug!("{} belongs to another project, ignoring", image.name);
            return Ok(None);
        }
        Ok(Some(image))
    }

    async fn store_stage(
        &self,
        project: &str,
        signature: &str,
        image: &BuiltImage,
    ) -> StrataResult<BuiltImage> {
        if !image.belongs_to(project) {
            return Err(StrataError::Internal(format!(
                "image {} has no {} label for {}",
                image.name,
                labels::PROJECT,
                project
            )));
        }

        let runtime = self.runtime.as_ref().ok_or_else(|| {
            StrataError::Runtime(format!("no container runtime to push {} with", image.name))
        })?;

        let reference = self.stage_reference(signature);
        info!("Storing stage of {} as {}", project, reference);
        runtime.push(image, &reference).await
    }

    async fn list_stages(&self, project: &str) -> StrataResult<Vec<BuiltImage>> {
        let images = self
            .registry
            .find_by_label(&self.address, labels::PROJECT, project)
            .await?;

        Ok(images
            .into_iter()
            .filter(|image| signature_from_repo_stage_tag(&image.tag).is_some())
            .map(|image| image.into_built_image())
            .filter(|image| !image.is_published())
            .collect())
    }

    async fn delete_stage(&self, image: &BuiltImage) -> StrataResult<()> {
        match self.registry.delete(&image.name).await {
            Err(err) if err.is_not_found() => {
                debug!("{} is already gone", image.name);
                Ok(())
            }
            result => result,
        }
    }
}
