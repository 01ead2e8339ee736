//! Project configuration (`strata.toml`)
//!
//! ```toml
//! [meta]
//! project = "shop"
//!
//! [[image]]
//! name = "api"
//! from = "alpine:3.20"
//! shell.install = ["apk add --no-cache curl"]
//!
//! [[image.git]]
//! add = "/api"
//! to = "/app"
//! stageDependencies.install = ["go.mod", "go.sum"]
//! ```

use crate::build::StageName;
use crate::error::{StrataError, StrataResult};
use crate::git::GitArtifact;
use crate::naming::ImagesRepoManager;
use crate::orchestration::{Mount, MountSource};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meta {
    pub project: String,
}

/// Root of `strata.toml`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub meta: Meta,

    #[serde(rename = "image", default)]
    pub images: Vec<ImageConfig>,
}

/// Shell commands per user stage
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ShellConfig {
    pub before_install: Vec<String>,
    pub install: Vec<String>,
    pub before_setup: Vec<String>,
    pub setup: Vec<String>,
}

/// Build-time mount; `from` is `tmp_dir`, `build_dir` or an absolute host path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountConfig {
    pub from: String,
    pub to: String,
}

impl MountConfig {
    pub fn to_mount(&self) -> StrataResult<Mount> {
        let source = match self.from.as_str() {
            "tmp_dir" => MountSource::TmpDir,
            "build_dir" => MountSource::BuildDir,
            path if path.starts_with('/') => MountSource::Host(PathBuf::from(path)),
            other => {
                return Err(StrataError::InvalidConfiguration(format!(
                    "mount from {:?}: expected tmp_dir, build_dir or an absolute path",
                    other
                )))
            }
        };
        if !self.to.starts_with('/') {
            return Err(StrataError::InvalidConfiguration(format!(
                "mount to {:?} must be an absolute path",
                self.to
            )));
        }
        Ok(Mount {
            source,
            to: self.to.clone(),
        })
    }
}

/// Files copied from an earlier image of the project
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportConfig {
    pub image: String,
    pub add: String,
    pub to: String,
    pub after: StageName,
}

/// One logical image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageConfig {
    /// Empty for the nameless image
    #[serde(default)]
    pub name: String,

    /// Base image reference
    pub from: String,

    #[serde(default)]
    pub shell: ShellConfig,

    #[serde(default)]
    pub git: Vec<GitArtifact>,

    #[serde(default)]
    pub mount: Vec<MountConfig>,

    #[serde(default)]
    pub import: Vec<ImportConfig>,
}

impl ImageConfig {
    /// Commands of a user stage
    pub fn commands(&self, stage: StageName) -> &[String] {
        match stage {
            StageName::BeforeInstall => self.shell.before_install.as_slice(),
            StageName::Install => self.shell.install.as_slice(),
            StageName::BeforeSetup => self.shell.before_setup.as_slice(),
            StageName::Setup => self.shell.setup.as_slice(),
            _ => &[],
        }
    }

    /// Imports applied after `stage`
    pub fn imports_after(&self, stage: StageName) -> impl Iterator<Item = &ImportConfig> {
        self.import.iter().filter(move |i| i.after == stage)
    }

    pub fn mounts(&self) -> StrataResult<Vec<Mount>> {
        self.mount.iter().map(MountConfig::to_mount).collect()
    }

    /// Name for messages; the nameless image shows as `~`
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            "~"
        } else {
            &self.name
        }
    }
}

impl ProjectConfig {
    /// Parse and validate `strata.toml` content
    pub fn parse(content: &str) -> StrataResult<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Declared image names, in order (empty string for the nameless image)
    pub fn image_names(&self) -> Vec<String> {
        self.images.iter().map(|i| i.name.clone()).collect()
    }

    pub fn image(&self, name: &str) -> Option<&ImageConfig> {
        self.images.iter().find(|i| i.name == name)
    }

    /// Check the project independently of where it is published
    pub fn validate(&self) -> StrataResult<()> {
        if self.meta.project.is_empty() {
            return Err(StrataError::InvalidConfiguration(
                "meta.project must not be empty".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for image in &self.images {
            if !seen.insert(image.name.as_str()) {
                return Err(StrataError::InvalidConfiguration(format!(
                    "image {} is declared more than once",
                    image.display_name()
                )));
            }
            if image.from.is_empty() {
                return Err(StrataError::InvalidConfiguration(format!(
                    "image {} has no base image",
                    image.display_name()
                )));
            }

            for artifact in &image.git {
                artifact.validate()?;
            }
            image.mounts()?;

            for import in &image.import {
                if !matches!(
                    import.after,
                    StageName::Install | StageName::BeforeSetup | StageName::Setup
                ) {
                    return Err(StrataError::InvalidConfiguration(format!(
                        "image {}: imports can only follow install, beforeSetup or setup",
                        image.display_name()
                    )));
                }
                // Images build in declaration order
                if import.image == image.name || !seen.contains(import.image.as_str()) {
                    return Err(StrataError::InvalidConfiguration(format!(
                        "image {} imports from {:?}, which is not declared before it",
                        image.display_name(),
                        import.image
                    )));
                }
            }
        }

        Ok(())
    }

    /// Check that every image name maps unambiguously under `naming`
    pub fn validate_names(&self, naming: &ImagesRepoManager) -> StrataResult<()> {
        self.images
            .iter()
            .try_for_each(|image| naming.validate_image_name(&image.name))
    }
}
