//! Registry transport seam and the wire documents read through it

use crate::error::{StrataError, StrataResult};
use crate::image::BuiltImage;
use crate::registry::auth::Credentials;
use crate::registry::reference::Reference;
use async_trait::async_trait;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};

pub const MEDIA_TYPE_DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const MEDIA_TYPE_DOCKER_MANIFEST_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
pub const MEDIA_TYPE_OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const MEDIA_TYPE_OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";

/// `Accept` header for manifest requests
pub fn manifest_accept() -> String {
    [
        MEDIA_TYPE_DOCKER_MANIFEST,
        MEDIA_TYPE_DOCKER_MANIFEST_LIST,
        MEDIA_TYPE_OCI_MANIFEST,
        MEDIA_TYPE_OCI_INDEX,
    ]
    .join(", ")
}

/// A fetched manifest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestResponse {
    /// Content digest of the manifest bytes
    pub digest: String,
    /// `Content-Type` of the response, if the registry sent one
    pub media_type: Option<String>,
    pub body: Vec<u8>,
}

/// sha256 digest of raw content, `sha256:<hex>`
pub fn content_digest(content: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(content)))
}

/// Raw registry operations.
///
/// Errors use `StrataError::Registry` with the code the registry reported,
/// `StrataError::Transport` for network failures. Not-found and broken
/// entries are not interpreted here; that is `RegistryClient`'s job.
#[async_trait]
pub trait RegistryApi: Send + Sync {
    /// All tags of a repository, following pagination
    async fn list_tags(&self, repository: &Reference) -> StrataResult<Vec<String>>;

    /// Manifest of a tag or digest
    async fn get_manifest(&self, reference: &Reference) -> StrataResult<ManifestResponse>;

    /// Blob content by digest
    async fn get_blob(&self, repository: &Reference, digest: &str) -> StrataResult<Vec<u8>>;

    /// Generic `DELETE /v2/<repo>/manifests/<identifier>` with the usual auth flow
    async fn delete_manifest(&self, reference: &Reference) -> StrataResult<()>;

    /// Delete with explicitly supplied credentials and a forced token scope
    async fn delete_manifest_scoped(
        &self,
        reference: &Reference,
        credentials: &Credentials,
        scope: &str,
    ) -> StrataResult<()>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ManifestDocument {
    #[serde(default)]
    pub media_type: Option<String>,
    #[serde(default)]
    pub config: Option<Descriptor>,
    #[serde(default)]
    pub manifests: Option<Vec<IndexEntry>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Descriptor {
    pub digest: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct IndexEntry {
    pub digest: String,
    #[serde(default)]
    pub platform: Option<Platform>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Platform {
    pub architecture: String,
    pub os: String,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ConfigDocument {
    #[serde(default)]
    pub config: Option<ContainerConfig>,
    #[serde(default)]
    pub parent: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ContainerConfig {
    #[serde(rename = "Labels", default)]
    pub labels: Option<HashMap<String, String>>,
    #[serde(rename = "Image", default)]
    pub image: Option<String>,
}

impl ManifestDocument {
    pub fn parse(reference: &Reference, body: &[u8]) -> StrataResult<Self> {
        serde_json::from_slice(body).map_err(|e| StrataError::MalformedResponse {
            reference: reference.to_string(),
            reason: format!("manifest: {}", e),
        })
    }

    pub fn is_index(&self, media_type: Option<&str>) -> bool {
        let media_type = media_type.or(self.media_type.as_deref());
        matches!(
            media_type,
            Some(MEDIA_TYPE_DOCKER_MANIFEST_LIST) | Some(MEDIA_TYPE_OCI_INDEX)
        ) || (self.config.is_none() && self.manifests.is_some())
    }

    /// Digest of the `linux/amd64` entry of an index, else the first entry
    pub fn platform_digest(&self) -> Option<&str> {
        let entries = self.manifests.as_deref()?;
        entries
            .iter()
            .find(|e| {
                e.platform
                    .as_ref()
                    .is_some_and(|p| p.os == "linux" && p.architecture == "amd64")
            })
            .or_else(|| entries.first())
            .map(|e| e.digest.as_str())
    }
}

impl ConfigDocument {
    pub fn parse(reference: &Reference, body: &[u8]) -> StrataResult<Self> {
        serde_json::from_slice(body).map_err(|e| StrataError::MalformedResponse {
            reference: reference.to_string(),
            reason: format!("config: {}", e),
        })
    }

    /// `config.Image`, falling back to the top-level `parent`
    pub fn parent_id(&self) -> Option<String> {
        self.config
            .as_ref()
            .and_then(|c| c.image.clone())
            .filter(|id| !id.is_empty())
            .or_else(|| self.parent.clone().filter(|id| !id.is_empty()))
    }

    pub fn labels(&self) -> BTreeMap<String, String> {
        self.config
            .as_ref()
            .and_then(|c| c.labels.as_ref())
            .map(|l| l.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default()
    }
}

/// Manifest and config data of one image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInspect {
    /// Manifest digest
    pub digest: String,
    /// Image id (config digest)
    pub id: String,
    pub parent_id: Option<String>,
    pub labels: BTreeMap<String, String>,
}

/// A tag found in a repository, with its inspected content
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoImage {
    /// Repository the tag lives in
    pub repository: Reference,
    pub tag: String,
    pub inspect: ImageInspect,
}

impl RepoImage {
    /// Full tagged reference
    pub fn reference(&self) -> Reference {
        self.repository.with_tag(&self.tag)
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.inspect.labels.get(key).map(String::as_str)
    }

    pub fn into_built_image(self) -> BuiltImage {
        BuiltImage {
            name: self.reference().to_string(),
            id: self.inspect.id,
            parent_id: self.inspect.parent_id,
            labels: self.inspect.labels,
        }
    }
}
