//! Git mappings: a repository subtree copied into the image

use crate::error::{StrataError, StrataResult};
use crate::git::matcher::PathMatcher;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Paths whose changes invalidate the user stages
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StageDependencies {
    pub install: Vec<String>,
    pub before_setup: Vec<String>,
    pub setup: Vec<String>,
}

/// Which user stage a set of dependency paths belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependentStage {
    Install,
    BeforeSetup,
    Setup,
}

/// One git-source-to-image-path mapping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitArtifact {
    /// Source subtree, slash-separated, repository-relative (`/` = root)
    #[serde(default = "default_add")]
    pub add: String,
    /// Absolute destination path in the image
    pub to: String,
    #[serde(default)]
    pub include_paths: Vec<String>,
    #[serde(default)]
    pub exclude_paths: Vec<String>,
    #[serde(default)]
    pub stage_dependencies: StageDependencies,
}

fn default_add() -> String {
    "/".to_string()
}

impl GitArtifact {
    /// Check the mapping before it is used in a build
    pub fn validate(&self) -> StrataResult<()> {
        let invalid = |reason: &str| StrataError::InvalidGitMapping {
            add: self.add.clone(),
            to: self.to.clone(),
            reason: reason.to_string(),
        };

        if !self.to.starts_with('/') {
            return Err(invalid("`to` must be an absolute path"));
        }
        if !self.add.starts_with('/') {
            return Err(invalid("`add` must be an absolute repository path"));
        }
        let all_paths = self
            .include_paths
            .iter()
            .chain(&self.exclude_paths)
            .chain(&self.stage_dependencies.install)
            .chain(&self.stage_dependencies.before_setup)
            .chain(&self.stage_dependencies.setup);
        for path in all_paths {
            if path.starts_with('/') {
                return Err(invalid("filter paths must be relative to `add`"));
            }
            if path.split('/').any(|c| c == "..") {
                return Err(invalid("filter paths must not contain `..`"));
            }
        }

        Ok(())
    }

    pub fn git_mapping_to(&self) -> &str {
        &self.to
    }

    /// `add` relative to the repository root in git's slash syntax; the
    /// root maps to an empty path
    pub fn repo_base(&self) -> &str {
        self.add.trim_matches('/')
    }

    /// Matcher for every path this mapping copies into the image
    pub fn matcher(&self) -> StrataResult<PathMatcher> {
        PathMatcher::new(self.repo_base(), &self.include_paths, &self.exclude_paths)
    }

    /// Matcher for the dependency paths of a user stage, if any are declared
    pub fn stage_dependencies_matcher(
        &self,
        stage: DependentStage,
    ) -> StrataResult<Option<PathMatcher>> {
        let paths = match stage {
            DependentStage::Install => &self.stage_dependencies.install,
            DependentStage::BeforeSetup => &self.stage_dependencies.before_setup,
            DependentStage::Setup => &self.stage_dependencies.setup,
        };
        if paths.is_empty() {
            return Ok(None);
        }
        PathMatcher::new(self.repo_base(), paths, &[]).map(Some)
    }

    /// Short stable id of the mapping parameters
    pub fn id(&self) -> StrataResult<String> {
        let mut hasher = Sha256::new();
        hasher.update(self.matcher()?.id().as_bytes());
        hasher.update(b"\0");
        hasher.update(self.to.as_bytes());
        Ok(hex::encode(&hasher.finalize()[..6]))
    }
}
