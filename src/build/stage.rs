//! Build stages
//!
//! A stage turns the previous stage's image plus its own inputs into a new
//! image. Its signature hashes the previous signature together with those
//! inputs, so a change anywhere upstream invalidates everything below it.

use crate::build::conveyor::ImageBuildResult;
use crate::config::ImageConfig;
use crate::error::{StrataError, StrataResult};
use crate::git::{ArchiveOptions, DependentStage, GitRepository, PatchOptions};
use crate::image::{
    labels, local_stage_image_name, BuiltImage, BUILD_CACHE_VERSION, STAGE_CONTAINER_NAME_PREFIX,
};
use crate::orchestration::{
    ArchiveLayer, ContainerRuntime, ImportLayer, LayerSpec, MountSource, PatchLayer,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, info};

/// Stage names, in pipeline order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StageName {
    From,
    BeforeInstall,
    GitArchive,
    Install,
    BeforeSetup,
    Setup,
    GitLatestPatch,
}

impl StageName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::From => "from",
            Self::BeforeInstall => "beforeInstall",
            Self::GitArchive => "gitArchive",
            Self::Install => "install",
            Self::BeforeSetup => "beforeSetup",
            Self::Setup => "setup",
            Self::GitLatestPatch => "gitLatestPatch",
        }
    }

    /// Stage whose dependency paths invalidate this one
    fn dependent_stage(&self) -> Option<DependentStage> {
        match self {
            Self::Install => Some(DependentStage::Install),
            Self::BeforeSetup => Some(DependentStage::BeforeSetup),
            Self::Setup => Some(DependentStage::Setup),
            _ => None,
        }
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What one stage needs to know about the build in progress
pub struct StageContext<'a> {
    pub project: &'a str,
    pub image: &'a ImageConfig,
    pub git: &'a dyn GitRepository,
    pub runtime: &'a dyn ContainerRuntime,
    /// Commit the build advances to
    pub target_commit: &'a str,
    /// Images built earlier in this run, by name
    pub built: &'a HashMap<String, ImageBuildResult>,
}

/// One step of an image's pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stage {
    /// Base image
    From { base: String },
    /// Shell commands of `beforeInstall`, `install`, `beforeSetup` or `setup`
    Instructions(StageName),
    /// Full tree of every git mapping
    GitArchive,
    /// Patch bringing every git mapping up to the target commit
    GitLatestPatch,
}

impl Stage {
    /// The pipeline of `image`; stages without inputs are left out
    pub fn for_image(image: &ImageConfig) -> Vec<Stage> {
        let has_git = !image.git.is_empty();
        let user_stage = |name: StageName| {
            let used = !image.commands(name).is_empty() || image.imports_after(name).next().is_some();
            used.then_some(Stage::Instructions(name))
        };

        let mut stages = vec![Stage::From {
            base: image.from.clone(),
        }];
        stages.extend(user_stage(StageName::BeforeInstall));
        if has_git {
            stages.push(Stage::GitArchive);
        }
        stages.extend(user_stage(StageName::Install));
        stages.extend(user_stage(StageName::BeforeSetup));
        stages.extend(user_stage(StageName::Setup));
        if has_git {
            stages.push(Stage::GitLatestPatch);
        }
        stages
    }

    pub fn name(&self) -> StageName {
        match self {
            Self::From { .. } => StageName::From,
            Self::Instructions(name) => *name,
            Self::GitArchive => StageName::GitArchive,
            Self::GitLatestPatch => StageName::GitLatestPatch,
        }
    }

    /// Cache key of this stage given the previous stage's signature
    pub async fn signature(
        &self,
        ctx: &StageContext<'_>,
        previous: Option<&str>,
    ) -> StrataResult<String> {
        let mut inputs = vec![
            match previous {
                Some(signature) => signature.to_string(),
                None => format!("cache-version {}", BUILD_CACHE_VERSION),
            },
            self.name().to_string(),
        ];

        match self {
            Self::From { base } => {
                inputs.push(format!("from {}", base));
                for mount in ctx.image.mounts()? {
                    inputs.push(format!("mount {} {}", mount_source_key(&mount.source), mount.to));
                }
            }
            Self::Instructions(name) => {
                inputs.extend(ctx.image.commands(*name).iter().map(|c| format!("run {}", c)));

                if let Some(dependent) = name.dependent_stage() {
                    for artifact in &ctx.image.git {
                        if let Some(matcher) = artifact.stage_dependencies_matcher(dependent)? {
                            let checksum = ctx.git.checksum(ctx.target_commit, &matcher).await?;
                            inputs.push(format!("dependencies {} {}", artifact.id()?, checksum));
                        }
                    }
                }

                for import in ctx.image.imports_after(*name) {
                    let source = import_source(ctx, &import.image)?;
                    inputs.push(format!(
                        "import {} {} {} {}",
                        import.image,
                        source.signature().unwrap_or_default(),
                        import.add,
                        import.to
                    ));
                }
            }
            Self::GitArchive => {
                for artifact in &ctx.image.git {
                    inputs.push(format!("archive {}", artifact.id()?));
                }
            }
            Self::GitLatestPatch => {
                for artifact in &ctx.image.git {
                    let checksum = ctx.git.checksum(ctx.target_commit, &artifact.matcher()?).await?;
                    inputs.push(format!("content {} {}", artifact.id()?, checksum));
                }
            }
        }

        let signature = hash_inputs(&inputs);
        debug!("Signature of {} is {}", self.name(), signature);
        Ok(signature)
    }

    /// Materialize this stage on top of `previous`
    pub async fn prepare_image(
        &self,
        ctx: &StageContext<'_>,
        signature: &str,
        previous: Option<&BuiltImage>,
    ) -> StrataResult<BuiltImage> {
        match self {
            Self::From { base } => {
                let base_image = ctx.runtime.pull(base).await?;
                let spec = self.base_spec(ctx, signature, base_image)?;
                ctx.runtime.build_layer(&spec).await
            }
            Self::Instructions(name) => {
                let mut spec = self.base_spec(ctx, signature, require_previous(self, previous)?)?;
                if name.dependent_stage().is_some() {
                    self.advance_git(ctx, &mut spec, false).await?;
                }
                self.add_instructions(ctx, *name, &mut spec)?;
                ctx.runtime.build_layer(&spec).await
            }
            Self::GitArchive => {
                let previous = require_previous(self, previous)?;
                self.archive_onto(ctx, signature, previous).await
            }
            Self::GitLatestPatch => {
                let previous = require_previous(self, previous)?;
                self.patch_onto(ctx, signature, previous).await
            }
        }
    }

    /// Full-tree replacement for a failed incremental patch
    pub async fn rebuild_image(
        &self,
        ctx: &StageContext<'_>,
        signature: &str,
        previous: Option<&BuiltImage>,
    ) -> StrataResult<BuiltImage> {
        match self {
            Self::GitLatestPatch => {
                let previous = require_previous(self, previous)?;
                info!(
                    "Replaying git mappings of {} as full archives",
                    ctx.image.display_name()
                );
                self.archive_onto(ctx, signature, previous).await
            }
            Self::Instructions(name) if name.dependent_stage().is_some() => {
                let mut spec = self.base_spec(ctx, signature, require_previous(self, previous)?)?;
                self.advance_git(ctx, &mut spec, true).await?;
                self.add_instructions(ctx, *name, &mut spec)?;
                ctx.runtime.build_layer(&spec).await
            }
            _ => self.prepare_image(ctx, signature, previous).await,
        }
    }

    /// Whether a patch failure of this stage can be recovered by rebuilding
    pub fn is_incremental(&self) -> bool {
        match self {
            Self::GitLatestPatch => true,
            Self::Instructions(name) => name.dependent_stage().is_some(),
            _ => false,
        }
    }

    /// Bring the git mappings of `spec.from` up to the target commit.
    ///
    /// Stages that depend on repository paths run their commands against
    /// the target tree. A previous commit that is not an ancestor of the
    /// target, or `replay`, puts full archives in place of patches.
    async fn advance_git(
        &self,
        ctx: &StageContext<'_>,
        spec: &mut LayerSpec,
        replay: bool,
    ) -> StrataResult<()> {
        if ctx.image.git.is_empty() {
            return Ok(());
        }
        let Some(from_commit) = spec.from.last_commit().map(str::to_string) else {
            return Ok(());
        };
        if from_commit == ctx.target_commit {
            return Ok(());
        }

        if !replay && ctx.git.is_ancestor(&from_commit, ctx.target_commit).await? {
            add_patches(ctx, spec, &from_commit).await?;
        } else {
            debug!(
                "{} replays git mappings at {}",
                self.name(),
                ctx.target_commit
            );
            add_archives(ctx, spec).await?;
        }
        spec.labels
            .insert(labels::GIT_COMMIT.to_string(), ctx.target_commit.to_string());
        Ok(())
    }

    async fn archive_onto(
        &self,
        ctx: &StageContext<'_>,
        signature: &str,
        previous: BuiltImage,
    ) -> StrataResult<BuiltImage> {
        let mut spec = self.base_spec(ctx, signature, previous)?;
        add_archives(ctx, &mut spec).await?;
        spec.labels
            .insert(labels::GIT_COMMIT.to_string(), ctx.target_commit.to_string());

        ctx.runtime.build_layer(&spec).await
    }

    async fn patch_onto(
        &self,
        ctx: &StageContext<'_>,
        signature: &str,
        previous: BuiltImage,
    ) -> StrataResult<BuiltImage> {
        let target = ctx.target_commit;
        let from_commit = match previous.last_commit() {
            Some(commit) if commit == target => {
                debug!("{} already at {}, nothing to patch", previous.name, target);
                return Ok(previous);
            }
            Some(commit) => commit.to_string(),
            None => {
                return Err(StrataError::Internal(format!(
                    "image {} records no git commit to patch from",
                    previous.name
                )))
            }
        };

        if !ctx.git.is_ancestor(&from_commit, target).await? {
            return Err(StrataError::CommitNotAncestor {
                from: from_commit,
                to: target.to_string(),
            });
        }

        let mut spec = self.base_spec(ctx, signature, previous)?;
        add_patches(ctx, &mut spec, &from_commit).await?;
        spec.labels
            .insert(labels::GIT_COMMIT.to_string(), target.to_string());

        ctx.runtime.build_layer(&spec).await
    }

    /// Commands and imports of a user stage
    fn add_instructions(
        &self,
        ctx: &StageContext<'_>,
        name: StageName,
        spec: &mut LayerSpec,
    ) -> StrataResult<()> {
        spec.commands = ctx.image.commands(name).to_vec();

        for import in ctx.image.imports_after(name) {
            let source = import_source(ctx, &import.image)?;
            let source_image = source
                .image()
                .ok_or_else(|| StrataError::ImageNotBuilt(import.image.clone()))?;
            spec.labels.insert(
                format!("{}{}", labels::IMPORT_PREFIX, import_id(&import.image, &import.add, &import.to)),
                source_image.id.clone(),
            );
            spec.imports.push(ImportLayer {
                image_id: source_image.id.clone(),
                add: import.add.clone(),
                to: import.to.clone(),
            });
        }
        Ok(())
    }

    /// Preparation shared by every stage: names, bookkeeping labels, mounts
    fn base_spec(
        &self,
        ctx: &StageContext<'_>,
        signature: &str,
        from: BuiltImage,
    ) -> StrataResult<LayerSpec> {
        let mut spec = LayerSpec::new(
            local_stage_image_name(ctx.project, signature),
            format!("{}{}", STAGE_CONTAINER_NAME_PREFIX, uuid::Uuid::new_v4()),
            from,
        );

        let stage_labels = [
            (labels::STRATA, "true"),
            (labels::VERSION, env!("CARGO_PKG_VERSION")),
            (labels::CACHE_VERSION, BUILD_CACHE_VERSION),
            (labels::PROJECT, ctx.project),
            (labels::IMAGE_NAME, ctx.image.name.as_str()),
            (labels::STAGE_NAME, self.name().as_str()),
            (labels::STAGE_SIGNATURE, signature),
        ];
        for (key, value) in stage_labels {
            spec.labels.insert(key.to_string(), value.to_string());
        }

        let mounts = ctx.image.mounts()?;
        let mut mount_labels: HashMap<String, Vec<&str>> = HashMap::new();
        for mount in &mounts {
            let key = match &mount.source {
                MountSource::TmpDir => labels::MOUNT_TMP_DIR.to_string(),
                MountSource::BuildDir => labels::MOUNT_BUILD_DIR.to_string(),
                MountSource::Host(path) => format!(
                    "{}{}",
                    labels::MOUNT_CUSTOM_DIR_PREFIX,
                    path.to_string_lossy().replace('/', "--")
                ),
            };
            mount_labels.entry(key).or_default().push(mount.to.as_str());
        }
        for (key, paths) in mount_labels {
            spec.labels.insert(key, paths.join(","));
        }
        spec.mounts = mounts;

        Ok(spec)
    }
}

/// Full trees of every git mapping at the target commit
async fn add_archives(ctx: &StageContext<'_>, spec: &mut LayerSpec) -> StrataResult<()> {
    for artifact in &ctx.image.git {
        let archive = ctx
            .git
            .archive(&ArchiveOptions {
                commit: ctx.target_commit.to_string(),
                matcher: artifact.matcher()?,
            })
            .await?;
        spec.archives.push(ArchiveLayer {
            to: artifact.git_mapping_to().to_string(),
            archive,
        });
    }
    Ok(())
}

/// Changes of every git mapping between `from_commit` and the target commit
async fn add_patches(
    ctx: &StageContext<'_>,
    spec: &mut LayerSpec,
    from_commit: &str,
) -> StrataResult<()> {
    for artifact in &ctx.image.git {
        let patch = ctx
            .git
            .patch(&PatchOptions {
                from_commit: from_commit.to_string(),
                to_commit: ctx.target_commit.to_string(),
                matcher: artifact.matcher()?,
                with_submodules: true,
            })
            .await?;

        if patch.is_empty() {
            continue;
        }
        debug!(
            "Patch for {} -> {}: {} path(s), {} binary",
            artifact.add,
            artifact.to,
            patch.paths.len(),
            patch.binary_paths.len()
        );
        spec.patches.push(PatchLayer {
            to: artifact.git_mapping_to().to_string(),
            patch,
        });
    }
    Ok(())
}

fn require_previous(stage: &Stage, previous: Option<&BuiltImage>) -> StrataResult<BuiltImage> {
    previous.cloned().ok_or_else(|| {
        StrataError::Internal(format!("stage {} needs a previous image", stage.name()))
    })
}

fn import_source<'a>(ctx: &'a StageContext<'_>, image: &str) -> StrataResult<&'a ImageBuildResult> {
    ctx.built
        .get(image)
        .ok_or_else(|| StrataError::ImageNotBuilt(image.to_string()))
}

fn mount_source_key(source: &MountSource) -> String {
    match source {
        MountSource::TmpDir => "tmp_dir".to_string(),
        MountSource::BuildDir => "build_dir".to_string(),
        MountSource::Host(path) => path.to_string_lossy().into_owned(),
    }
}

/// Short id of an import, used in its label key
fn import_id(image: &str, add: &str, to: &str) -> String {
    let digest = Sha256::digest(format!("{}\0{}\0{}", image, add, to).as_bytes());
    hex::encode(&digest[..6])
}

fn hash_inputs(inputs: &[String]) -> String {
    let mut hasher = Sha256::new();
    for input in inputs {
        hasher.update(input.as_bytes());
        hasher.update(b"\0");
    }
    hex::encode(hasher.finalize())
}
