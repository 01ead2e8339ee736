//! Build driver: walks every image's stages against the stages storage

use crate::build::stage::{Stage, StageContext, StageName};
use crate::config::{ImageConfig, ProjectConfig};
use crate::error::{StrataError, StrataResult};
use crate::git::GitRepository;
use crate::image::{labels, managed_image_record_name, BuiltImage, TagStrategy, STAGE_CONTAINER_NAME_PREFIX};
use crate::naming::ImagesRepoManager;
use crate::orchestration::{ContainerRuntime, LayerSpec};
use crate::storage::StagesStorage;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// What to do when an incremental patch cannot be applied
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PatchFailurePolicy {
    /// Fail the build
    #[default]
    Abort,
    /// Replay the git mappings as full archives
    Rebuild,
}

/// Outcome of one stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageResult {
    pub name: StageName,
    pub signature: String,
    pub image: BuiltImage,
    /// Taken from the stages storage rather than built
    pub cached: bool,
}

/// Outcome of one image's pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageBuildResult {
    pub name: String,
    pub stages: Vec<StageResult>,
}

impl ImageBuildResult {
    pub fn last_stage(&self) -> Option<&StageResult> {
        self.stages.last()
    }

    /// Signature of the last stage
    pub fn signature(&self) -> Option<&str> {
        self.last_stage().map(|s| s.signature.as_str())
    }

    /// Image of the last stage
    pub fn image(&self) -> Option<&BuiltImage> {
        self.last_stage().map(|s| &s.image)
    }

    pub fn stage(&self, name: StageName) -> Option<&StageResult> {
        self.stages.iter().find(|s| s.name == name)
    }
}

/// Builds the images of one project
pub struct Conveyor {
    project: ProjectConfig,
    git: Arc<dyn GitRepository>,
    runtime: Arc<dyn ContainerRuntime>,
    storage: Arc<dyn StagesStorage>,
    patch_failure: PatchFailurePolicy,
}

impl Conveyor {
    pub fn new(
        project: ProjectConfig,
        git: Arc<dyn GitRepository>,
        runtime: Arc<dyn ContainerRuntime>,
        storage: Arc<dyn StagesStorage>,
    ) -> Self {
        Self {
            project,
            git,
            runtime,
            storage,
            patch_failure: PatchFailurePolicy::default(),
        }
    }

    pub fn with_patch_failure(mut self, policy: PatchFailurePolicy) -> Self {
        self.patch_failure = policy;
        self
    }

    /// Build every image in declaration order
    pub async fn build(&self) -> StrataResult<Vec<ImageBuildResult>> {
        let needs_git = self.project.images.iter().any(|i| !i.git.is_empty());
        let target_commit = if needs_git {
            self.git.head_commit().await?
        } else {
            String::new()
        };

        info!(
            "Building {} image(s) of {} using {}",
            self.project.images.len(),
            self.project.meta.project,
            self.runtime.runtime_name()
        );

        let mut built: HashMap<String, ImageBuildResult> = HashMap::new();
        let mut results = Vec::new();
        for image in &self.project.images {
            let result = self.build_image(image, &target_commit, &built).await?;
            built.insert(image.name.clone(), result.clone());
            results.push(result);
        }
        Ok(results)
    }

    async fn build_image(
        &self,
        image: &ImageConfig,
        target_commit: &str,
        built: &HashMap<String, ImageBuildResult>,
    ) -> StrataResult<ImageBuildResult> {
        let ctx = StageContext {
            project: &self.project.meta.project,
            image,
            git: self.git.as_ref(),
            runtime: self.runtime.as_ref(),
            target_commit,
            built,
        };

        let mut stages: Vec<StageResult> = Vec::new();
        for stage in Stage::for_image(image) {
            let previous = stages.last();
            let result = self
                .build_stage(
                    &ctx,
                    &stage,
                    previous.map(|p| p.signature.as_str()),
                    previous.map(|p| &p.image),
                )
                .await
                .map_err(|e| e.in_stage(image.display_name(), stage.name()))?;
            stages.push(result);
        }

        if let Some(last) = stages.last() {
            let record = managed_image_record_name(&self.project.meta.project, &image.name);
            self.runtime.tag(&last.image, &record).await?;
        }

        Ok(ImageBuildResult {
            name: image.name.clone(),
            stages,
        })
    }

    async fn build_stage(
        &self,
        ctx: &StageContext<'_>,
        stage: &Stage,
        previous_signature: Option<&str>,
        previous: Option<&BuiltImage>,
    ) -> StrataResult<StageResult> {
        let signature = stage.signature(ctx, previous_signature).await?;

        if let Some(image) = self.storage.get_stage(ctx.project, &signature).await? {
            info!(
                "Use cache image for {}/{}: {}",
                ctx.image.display_name(),
                stage.name(),
                image.name
            );
            return Ok(StageResult {
                name: stage.name(),
                signature,
                image,
                cached: true,
            });
        }

        let image = match stage.prepare_image(ctx, &signature, previous).await {
            Ok(image) => image,
            Err(err)
                if err.is_patch_failure()
                    && stage.is_incremental()
                    && self.patch_failure == PatchFailurePolicy::Rebuild =>
            {
                warn!(
                    "Incremental patch of {} failed, rebuilding: {}",
                    ctx.image.display_name(),
                    err
                );
                stage.rebuild_image(ctx, &signature, previous).await?
            }
            Err(err) => return Err(err),
        };

        info!(
            "Built {}/{} with signature {}",
            ctx.image.display_name(),
            stage.name(),
            signature
        );
        let image = self
            .storage
            .store_stage(ctx.project, &signature, &image)
            .await?;

        Ok(StageResult {
            name: stage.name(),
            signature,
            image,
            cached: false,
        })
    }

    /// Publish a built image as `naming.image_repo_with_tag(name, tag)`
    pub async fn publish(
        &self,
        result: &ImageBuildResult,
        naming: &ImagesRepoManager,
        tag: &str,
        strategy: TagStrategy,
    ) -> StrataResult<BuiltImage> {
        naming.validate_image_name(&result.name)?;
        let last = result
            .image()
            .ok_or_else(|| StrataError::ImageNotBuilt(result.name.clone()))?;

        let reference = naming.image_repo_with_tag(&result.name, tag);
        let mut spec = LayerSpec::new(
            reference.clone(),
            format!("{}{}", STAGE_CONTAINER_NAME_PREFIX, uuid::Uuid::new_v4()),
            last.clone(),
        );
        let signature = result.signature().unwrap_or_default();
        let publish_labels = [
            (labels::IMAGE, "true".to_string()),
            (labels::STAGE_SIGNATURE, signature.to_string()),
            (labels::IMAGE_NAME, result.name.clone()),
            (labels::IMAGE_TAG, tag.to_string()),
            (labels::TAG_STRATEGY, strategy.to_string()),
        ];
        for (key, value) in publish_labels {
            spec.labels.insert(key.to_string(), value);
        }

        let image = self.runtime.build_layer(&spec).await?;
        info!("Publishing {}", reference);
        self.runtime.push(&image, &reference).await
    }
}
