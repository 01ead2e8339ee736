//! Images repo naming strategy
//!
//! Maps logical image names and tags to registry references. In multirepo
//! mode every image gets its own repository under the shared address; in
//! monorepo mode all images share the address and the image name is folded
//! into the tag.

use crate::error::{StrataError, StrataResult};
use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Separator between image name and tag in monorepo tags.
///
/// Part of the on-registry tag format; changing it orphans every published
/// monorepo tag.
pub const MONOREPO_TAG_PARTS_SEPARATOR: &str = "-";

/// Repository layout for published images
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImagesRepoMode {
    /// One repository, image name embedded in the tag
    Monorepo,
    /// One repository per image under the shared address
    Multirepo,
}

impl FromStr for ImagesRepoMode {
    type Err = StrataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "monorepo" => Ok(Self::Monorepo),
            "multirepo" => Ok(Self::Multirepo),
            other => Err(StrataError::InvalidConfiguration(format!(
                "bad images repo mode {:?}: expected monorepo or multirepo",
                other
            ))),
        }
    }
}

impl fmt::Display for ImagesRepoMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Monorepo => write!(f, "monorepo"),
            Self::Multirepo => write!(f, "multirepo"),
        }
    }
}

/// Naming strategy for the images repo
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImagesRepoManager {
    address: String,
    mode: ImagesRepoMode,
}

impl ImagesRepoManager {
    /// Create a manager from a mode string (`monorepo` or `multirepo`)
    pub fn new(address: impl Into<String>, mode: &str) -> StrataResult<Self> {
        Ok(Self::with_mode(address, mode.parse()?))
    }

    /// Create a manager from an already parsed mode
    pub fn with_mode(address: impl Into<String>, mode: ImagesRepoMode) -> Self {
        Self {
            address: address.into(),
            mode,
        }
    }

    /// The shared repository address
    pub fn address(&self) -> &str {
        &self.address
    }

    /// The configured layout mode
    pub fn mode(&self) -> ImagesRepoMode {
        self.mode
    }

    pub fn is_monorepo(&self) -> bool {
        self.mode == ImagesRepoMode::Monorepo
    }

    /// Repository holding the tags of `name`
    pub fn image_repo(&self, name: &str) -> String {
        if name.is_empty() || self.is_monorepo() {
            return self.address.clone();
        }
        format!("{}/{}", self.address, name)
    }

    /// Full reference of `name` published under `tag`
    pub fn image_repo_with_tag(&self, name: &str, tag: &str) -> String {
        if name.is_empty() || !self.is_monorepo() {
            return format!("{}:{}", self.image_repo(name), tag);
        }
        format!(
            "{}:{}{}{}",
            self.image_repo(name),
            name,
            MONOREPO_TAG_PARTS_SEPARATOR,
            tag
        )
    }

    /// Reject image names that cannot be mapped unambiguously.
    ///
    /// In monorepo mode the name becomes a tag prefix, so it must consist of
    /// tag characters and must not contain the separator itself.
    pub fn validate_image_name(&self, name: &str) -> StrataResult<()> {
        if name.is_empty() {
            return Ok(());
        }

        let pattern = match self.mode {
            ImagesRepoMode::Monorepo => r"^[A-Za-z0-9_][A-Za-z0-9_.]*$",
            ImagesRepoMode::Multirepo => r"^[a-z0-9]+(?:[._-][a-z0-9]+)*(?:/[a-z0-9]+(?:[._-][a-z0-9]+)*)*$",
        };
        let re = Regex::new(pattern).map_err(|e| StrataError::Internal(e.to_string()))?;

        if self.is_monorepo() && name.contains(MONOREPO_TAG_PARTS_SEPARATOR) {
            return Err(StrataError::InvalidConfiguration(format!(
                "image name {:?} contains the monorepo tag separator {:?}",
                name, MONOREPO_TAG_PARTS_SEPARATOR
            )));
        }

        if !re.is_match(name) {
            return Err(StrataError::InvalidConfiguration(format!(
                "image name {:?} is not valid in {} mode",
                name, self.mode
            )));
        }

        Ok(())
    }

    /// Whether `tag`, found in `image_repo(name)`, was published for `name`.
    ///
    /// In multirepo mode every tag of a repository belongs to its image. In
    /// monorepo mode the prefix before the separator selects one of the
    /// declared `names`; tags without a declared prefix belong to the nameless
    /// image.
    pub fn tag_belongs_to_image(&self, name: &str, tag: &str, names: &[String]) -> bool {
        if !self.is_monorepo() {
            return true;
        }

        let owner = match split_monorepo_tag(tag) {
            Some((prefix, _)) if names.iter().any(|n| !n.is_empty() && n == prefix) => prefix,
            _ => "",
        };
        owner == name
    }
}

/// Split a monorepo tag into `(image name, tag)` at the first separator
pub fn split_monorepo_tag(tag: &str) -> Option<(&str, &str)> {
    tag.split_once(MONOREPO_TAG_PARTS_SEPARATOR)
        .filter(|(name, rest)| !name.is_empty() && !rest.is_empty())
}
