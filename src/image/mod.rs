//! Built images and the label schema recorded on them
//!
//! Labels are the only way to recover build metadata from an opaque
//! registry entry, so every stage image and every published image carries
//! the keys below.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Image label keys
pub mod labels {
    /// Marks an image as produced by strata
    pub const STRATA: &str = "strata";
    /// Version of strata that produced the image
    pub const VERSION: &str = "strata-version";
    /// Cache format version; bumping it invalidates every signature
    pub const CACHE_VERSION: &str = "strata-cache-version";
    /// Marks a published (user-facing) image, value `"true"`
    pub const IMAGE: &str = "strata-image";
    /// Logical image name
    pub const IMAGE_NAME: &str = "strata-image-name";
    /// Tag of a published image
    pub const IMAGE_TAG: &str = "strata-image-tag";
    /// Project the image belongs to
    pub const PROJECT: &str = "strata-project";
    /// Stage that produced the image
    pub const STAGE_NAME: &str = "strata-stage-name";
    /// Signature of the stage that produced the image
    pub const STAGE_SIGNATURE: &str = "strata-stage-signature";
    /// Tag strategy of a published image
    pub const TAG_STRATEGY: &str = "strata-tag-strategy";
    /// Last git commit baked into the image
    pub const GIT_COMMIT: &str = "strata-git-commit";

    /// Paths mounted from the per-build temporary directory
    pub const MOUNT_TMP_DIR: &str = "strata-mount-type-tmp-dir";
    /// Paths mounted from the shared build directory
    pub const MOUNT_BUILD_DIR: &str = "strata-mount-type-build-dir";
    /// Prefix for host directory mounts, suffixed with the escaped host path
    pub const MOUNT_CUSTOM_DIR_PREFIX: &str = "strata-mount-type-custom-dir-";

    /// Prefix for cross-image import records, suffixed with the import id
    pub const IMPORT_PREFIX: &str = "strata-import-";
}

/// Cache format version recorded on every stage image
pub const BUILD_CACHE_VERSION: &str = "1.1";

/// Prefix of build container names
pub const STAGE_CONTAINER_NAME_PREFIX: &str = "strata.build.";

/// Prefix of local stage image names
pub const LOCAL_STAGE_IMAGE_NAME_PREFIX: &str = "strata-stages-storage/";

/// Prefix of local managed image records
pub const MANAGED_IMAGE_RECORD_PREFIX: &str = "strata-managed-images/";

/// Record tag used for the nameless image
pub const NAMELESS_IMAGE_RECORD_TAG: &str = "__nameless__";

/// Prefix of per-stage tags in the stages repo
pub const REPO_STAGE_TAG_PREFIX: &str = "image-stage-";

/// Local name of a stage image: `strata-stages-storage/<project>:<signature>-<unique>`
pub fn local_stage_image_name(project: &str, signature: &str) -> String {
    format!(
        "{}{}:{}-{}",
        LOCAL_STAGE_IMAGE_NAME_PREFIX,
        project,
        signature,
        uuid::Uuid::new_v4().simple()
    )
}

/// Local marker of an image the project manages:
/// `strata-managed-images/<project>:<image>`
pub fn managed_image_record_name(project: &str, image: &str) -> String {
    let tag = if image.is_empty() {
        NAMELESS_IMAGE_RECORD_TAG
    } else {
        image
    };
    format!("{}{}:{}", MANAGED_IMAGE_RECORD_PREFIX, project, tag)
}

/// Tag of a stage image in the stages repo: `image-stage-<signature>`
pub fn repo_stage_tag(signature: &str) -> String {
    format!("{}{}", REPO_STAGE_TAG_PREFIX, signature)
}

/// Recover the signature from a stages repo tag
pub fn signature_from_repo_stage_tag(tag: &str) -> Option<&str> {
    tag.strip_prefix(REPO_STAGE_TAG_PREFIX)
        .filter(|s| !s.is_empty())
}

/// How the tag of a published image was chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TagStrategy {
    /// Tag given explicitly by the user
    Custom,
    /// Tag derived from a git branch name
    GitBranch,
    /// Tag derived from a git tag
    GitTag,
    /// Tag derived from a git commit
    GitCommit,
}

impl fmt::Display for TagStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Custom => write!(f, "custom"),
            Self::GitBranch => write!(f, "git-branch"),
            Self::GitTag => write!(f, "git-tag"),
            Self::GitCommit => write!(f, "git-commit"),
        }
    }
}

/// A produced or cached container image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuiltImage {
    /// Local name or remote reference
    pub name: String,
    /// Image id (config digest)
    pub id: String,
    /// Id of the image this one was built on top of
    pub parent_id: Option<String>,
    /// Full label set
    pub labels: BTreeMap<String, String>,
}

impl BuiltImage {
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    /// Signature of the stage that produced this image
    pub fn stage_signature(&self) -> Option<&str> {
        self.label(labels::STAGE_SIGNATURE)
    }

    /// Last git commit applied to this image
    pub fn last_commit(&self) -> Option<&str> {
        self.label(labels::GIT_COMMIT)
    }

    /// Logical image name this stage was built for
    pub fn image_name(&self) -> Option<&str> {
        self.label(labels::IMAGE_NAME)
    }

    /// Whether this image is a stage of `project`
    pub fn belongs_to(&self, project: &str) -> bool {
        self.label(labels::PROJECT) == Some(project)
    }

    /// Whether this image is a published image rather than a stage
    pub fn is_published(&self) -> bool {
        self.label(labels::IMAGE) == Some("true")
    }
}
