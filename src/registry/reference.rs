//! Image reference parsing
//!
//! Weak validation in the style of `docker pull`: a missing registry means
//! Docker Hub, single-component Hub repositories live under `library/`, and
//! a missing tag means `latest`.

use crate::error::{StrataError, StrataResult};
use std::fmt;

/// Registry host used when a reference names none
pub const DEFAULT_REGISTRY: &str = "index.docker.io";

const DEFAULT_TAG: &str = "latest";

/// A parsed `registry/repository[:tag][@digest]` reference
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Reference {
    registry: String,
    repository: String,
    tag: Option<String>,
    digest: Option<String>,
}

impl Reference {
    /// Parse a repository or image reference
    pub fn parse(reference: &str) -> StrataResult<Self> {
        let invalid = |reason: &str| StrataError::InvalidReference {
            reference: reference.to_string(),
            reason: reason.to_string(),
        };

        if reference.is_empty() {
            return Err(invalid("empty reference"));
        }
        if reference.contains("://") {
            return Err(invalid("references must not include a scheme"));
        }

        let (name, digest) = match reference.split_once('@') {
            Some((name, digest)) => {
                if !digest.contains(':') {
                    return Err(invalid("digest must be <algorithm>:<hex>"));
                }
                (name, Some(digest.to_string()))
            }
            None => (reference, None),
        };

        // A colon after the last slash separates the tag
        let last_slash = name.rfind('/').map_or(0, |i| i + 1);
        let (name, tag) = match name[last_slash..].rfind(':') {
            Some(i) => {
                let split = last_slash + i;
                (&name[..split], Some(name[split + 1..].to_string()))
            }
            None => (name, None),
        };

        if let Some(tag) = &tag {
            if tag.is_empty() || tag.len() > 128 || !tag.chars().all(is_tag_char) {
                return Err(invalid("invalid tag"));
            }
        }

        let (registry, repository) = match name.split_once('/') {
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                let registry = if first == "docker.io" {
                    DEFAULT_REGISTRY
                } else {
                    first
                };
                (registry.to_string(), rest.to_string())
            }
            _ => (DEFAULT_REGISTRY.to_string(), name.to_string()),
        };

        let repository = if registry == DEFAULT_REGISTRY && !repository.contains('/') {
            format!("library/{}", repository)
        } else {
            repository
        };

        if repository.is_empty()
            || repository
                .split('/')
                .any(|c| c.is_empty() || !c.chars().all(is_repository_char))
        {
            return Err(invalid("invalid repository name"));
        }

        Ok(Self {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// Registry host (with port, if any)
    pub fn registry(&self) -> &str {
        &self.registry
    }

    /// Repository path inside the registry
    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn digest(&self) -> Option<&str> {
        self.digest.as_deref()
    }

    /// Digest if pinned, else tag, else `latest`
    pub fn identifier(&self) -> &str {
        self.digest
            .as_deref()
            .or(self.tag.as_deref())
            .unwrap_or(DEFAULT_TAG)
    }

    /// `registry/repository` without tag or digest
    pub fn repository_str(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }

    /// Same repository, pinned to `tag`
    pub fn with_tag(&self, tag: &str) -> Self {
        Self {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            tag: Some(tag.to_string()),
            digest: None,
        }
    }

    /// Same repository, pinned to `digest`
    pub fn with_digest(&self, digest: &str) -> Self {
        Self {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            tag: self.tag.clone(),
            digest: Some(digest.to_string()),
        }
    }

    /// Token scope for `action` on this repository, e.g. `repository:app:pull`
    pub fn scope(&self, action: &str) -> String {
        format!("repository:{}:{}", self.repository, action)
    }

    /// URL scheme: plain HTTP for insecure registries and loopback hosts
    pub fn scheme(&self, insecure: bool) -> &'static str {
        let host = self.registry.split(':').next().unwrap_or_default();
        if insecure || host == "localhost" || host == "127.0.0.1" || host.ends_with(".local") {
            "http"
        } else {
            "https"
        }
    }
}

fn is_tag_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-'
}

fn is_repository_char(c: char) -> bool {
    c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '.' || c == '-'
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{}", tag)?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{}", digest)?;
        }
        Ok(())
    }
}
