//! Stages cleanup
//!
//! Stage images accumulate in the stages repo with every build. An image is
//! worth keeping while some published tag of the project still points into
//! its chain: a published image records the id of the last stage it was
//! built from (its parent) and that stage's signature. Everything reachable
//! from those roots through stage parent ids is retained, the rest is
//! deleted.
//!
//! The sweep is best effort per image. Enumeration runs for every image
//! before any decision is made. When an image cannot be enumerated its
//! retained set is unknown, so its stages and their parent chains are
//! withheld while the other images are still swept. Delete failures are
//! collected per image while the remaining orphans are still removed.

use crate::error::{ImageFailure, StrataError, StrataResult};
use crate::image::{labels, signature_from_repo_stage_tag, BuiltImage};
use crate::naming::ImagesRepoManager;
use crate::registry::{RegistryClient, RepoImage};
use crate::storage::StagesStorage;
use futures_util::future::join_all;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What to clean
#[derive(Debug, Clone)]
pub struct StagesCleanupOptions {
    pub project_name: String,
    /// Declared image names; the nameless image is the empty string
    pub image_names: Vec<String>,
    pub dry_run: bool,
}

/// Partition of the project's stage images
#[derive(Debug)]
pub struct CleanupPlan {
    pub project_name: String,
    pub image_names: Vec<String>,
    pub dry_run: bool,
    pub retain: Vec<BuiltImage>,
    pub delete: Vec<BuiltImage>,
    /// Orphans kept because an image they belong to could not be enumerated
    pub withhold: Vec<BuiltImage>,
    /// Images whose published tags could not be enumerated
    pub failures: Vec<ImageFailure>,
}

/// Outcome of one sweep
#[derive(Debug)]
pub struct CleanupReport {
    pub retained: Vec<BuiltImage>,
    /// Stage images no published tag refers to
    pub orphans: Vec<BuiltImage>,
    /// Orphans left in place because their image failed to enumerate
    pub withheld: Vec<BuiltImage>,
    /// Orphans actually removed; always empty on a dry run
    pub deleted: Vec<BuiltImage>,
    pub failures: Vec<ImageFailure>,
    pub dry_run: bool,
}

impl CleanupReport {
    /// Fold the collected failures into one error
    pub fn into_result(self) -> StrataResult<Self> {
        if self.failures.is_empty() {
            Ok(self)
        } else {
            Err(StrataError::CleanupFailed {
                failures: self.failures,
            })
        }
    }
}

/// Garbage collector for the stages repo
pub struct StagesCleanup {
    naming: ImagesRepoManager,
    registry: RegistryClient,
    storage: Arc<dyn StagesStorage>,
}

impl StagesCleanup {
    pub fn new(
        naming: ImagesRepoManager,
        registry: RegistryClient,
        storage: Arc<dyn StagesStorage>,
    ) -> Self {
        Self {
            naming,
            registry,
            storage,
        }
    }

    /// Plan, execute and report, failing if any image failed
    pub async fn run(&self, options: &StagesCleanupOptions) -> StrataResult<CleanupReport> {
        let plan = self.plan(options).await?;
        self.execute(plan).await.into_result()
    }

    /// Enumerate published tags and stages and decide what to delete.
    ///
    /// Images that fail to enumerate are recorded in the plan rather than
    /// failing it; only a failure to list the stages themselves is fatal.
    pub async fn plan(&self, options: &StagesCleanupOptions) -> StrataResult<CleanupPlan> {
        let names = &options.image_names;
        let enumerations = join_all(names.iter().map(|name| self.published(name, names))).await;

        let mut published = Vec::new();
        let mut failures = Vec::new();
        for (name, result) in names.iter().zip(enumerations) {
            match result {
                Ok(images) => published.extend(images),
                Err(error) => {
                    warn!("Cannot list published tags of {}: {}", display(name), error);
                    failures.push(ImageFailure {
                        image: name.clone(),
                        error,
                    });
                }
            }
        }

        let stages = self.storage.list_stages(&options.project_name).await?;
        let retained = owned_ids(retained_ids(&published, &stages));
        let failed: HashSet<&str> = failures.iter().map(|f| f.image.as_str()).collect();
        let protected = owned_ids(chain_ids(
            &stages,
            stages
                .iter()
                .filter(|stage| stage.image_name().is_some_and(|name| failed.contains(name))),
        ));

        let mut retain = Vec::new();
        let mut delete = Vec::new();
        let mut withhold = Vec::new();
        for stage in stages {
            if retained.contains(&stage.id) {
                retain.push(stage);
            } else if protected.contains(&stage.id) {
                withhold.push(stage);
            } else {
                delete.push(stage);
            }
        }
        delete.sort_by(|a, b| a.name.cmp(&b.name));

        info!(
            "{}: {} published image(s), {} stage(s) retained, {} orphan(s), {} withheld",
            options.project_name,
            published.len(),
            retain.len(),
            delete.len(),
            withhold.len()
        );

        Ok(CleanupPlan {
            project_name: options.project_name.clone(),
            image_names: options.image_names.clone(),
            dry_run: options.dry_run,
            retain,
            delete,
            withhold,
            failures,
        })
    }

    /// Delete the orphans of `plan`, unless it is a dry run
    pub async fn execute(&self, plan: CleanupPlan) -> CleanupReport {
        let mut report = CleanupReport {
            retained: plan.retain,
            orphans: plan.delete.clone(),
            withheld: plan.withhold,
            deleted: Vec::new(),
            failures: plan.failures,
            dry_run: plan.dry_run,
        };

        for stage in &report.withheld {
            info!("Keeping {} until its image can be enumerated", stage.name);
        }

        if plan.dry_run {
            for orphan in &report.orphans {
                info!("Would delete {}", orphan.name);
            }
            return report;
        }

        for orphan in plan.delete {
            match self.storage.delete_stage(&orphan).await {
                Ok(()) => {
                    info!("Deleted {}", orphan.name);
                    report.deleted.push(orphan);
                }
                Err(error) => {
                    warn!("Cannot delete {}: {}", orphan.name, error);
                    report.failures.push(ImageFailure {
                        image: orphan.image_name().unwrap_or_default().to_string(),
                        error,
                    });
                }
            }
        }

        report
    }

    /// Published images of `name`
    async fn published(&self, name: &str, names: &[String]) -> StrataResult<Vec<RepoImage>> {
        let repo = self.naming.image_repo(name);
        let images = self
            .registry
            .find_by_label(&repo, labels::IMAGE, "true")
            .await?;

        let owned: Vec<_> = images
            .into_iter()
            .filter(|image| self.naming.tag_belongs_to_image(name, &image.tag, names))
            .collect();
        debug!("{} has {} published tag(s)", display(name), owned.len());
        Ok(owned)
    }
}

/// Ids of the stages reachable from `published`
fn retained_ids<'a>(published: &[RepoImage], stages: &'a [BuiltImage]) -> HashSet<&'a str> {
    let root_ids: HashSet<&str> = published
        .iter()
        .filter_map(|image| image.inspect.parent_id.as_deref())
        .collect();
    let root_signatures: HashSet<&str> = published
        .iter()
        .filter_map(|image| image.label(labels::STAGE_SIGNATURE))
        .collect();

    chain_ids(
        stages,
        stages.iter().filter(|stage| {
            root_ids.contains(stage.id.as_str())
                || stored_signature(stage).is_some_and(|s| root_signatures.contains(s))
        }),
    )
}

/// Ids of `roots` and of their parents within `stages`
fn chain_ids<'a>(
    stages: &'a [BuiltImage],
    roots: impl Iterator<Item = &'a BuiltImage>,
) -> HashSet<&'a str> {
    let by_id: HashMap<&str, &BuiltImage> = stages.iter().map(|s| (s.id.as_str(), s)).collect();
    let mut pending: Vec<&str> = roots.map(|stage| stage.id.as_str()).collect();

    let mut chain = HashSet::new();
    while let Some(id) = pending.pop() {
        let Some(&stage) = by_id.get(id) else {
            continue;
        };
        if !chain.insert(stage.id.as_str()) {
            continue;
        }
        if let Some(parent) = stage.parent_id.as_deref() {
            pending.push(parent);
        }
    }
    chain
}

fn owned_ids(ids: HashSet<&str>) -> HashSet<String> {
    ids.into_iter().map(str::to_string).collect()
}

/// Signature a stage is stored under; the tag wins over the label for aliases
fn stored_signature(stage: &BuiltImage) -> Option<&str> {
    stage
        .name
        .rsplit_once(':')
        .and_then(|(_, tag)| signature_from_repo_stage_tag(tag))
        .or_else(|| stage.stage_signature())
}

fn display(name: &str) -> &str {
    if name.is_empty() {
        "~"
    } else {
        name
    }
}
