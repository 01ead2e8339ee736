//! Remote image registry access
//!
//! `RegistryClient` gives the build and cleanup code four primitives
//! (list, inspect, find by label, delete) over a `RegistryApi` transport,
//! and owns the policy around them:
//! - a missing repository lists as empty,
//! - broken tags are skipped during label searches,
//! - an unauthorized delete gets one provider-specific fallback attempt.

pub mod api;
pub mod auth;
mod http;
pub mod provider;
pub mod reference;

pub use api::{ImageInspect, ManifestResponse, RegistryApi, RepoImage};
pub use auth::{AnonymousResolver, CredentialResolver, Credentials, StaticCredentials};
pub use http::HttpRegistryApi;
pub use provider::{is_gcr, DeleteFallback, ProviderRules};
pub use reference::Reference;

use crate::error::{RegistryErrorCode, StrataError, StrataResult};
use api::{ConfigDocument, ManifestDocument};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Transport switches, fixed for the lifetime of a client
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryOptions {
    /// Talk plain HTTP to registries
    pub insecure_registry: bool,
    /// Accept any TLS certificate
    pub skip_tls_verify: bool,
}

/// Registry operations used by stages storage and cleanup
#[derive(Clone)]
pub struct RegistryClient {
    api: Arc<dyn RegistryApi>,
    credentials: Arc<dyn CredentialResolver>,
    providers: ProviderRules,
}

impl RegistryClient {
    pub fn new(
        api: Arc<dyn RegistryApi>,
        credentials: Arc<dyn CredentialResolver>,
    ) -> StrataResult<Self> {
        Ok(Self {
            api,
            credentials,
            providers: ProviderRules::builtin()?,
        })
    }

    /// Client over the HTTP transport
    pub fn http(
        options: RegistryOptions,
        credentials: Arc<dyn CredentialResolver>,
    ) -> StrataResult<Self> {
        let api = Arc::new(HttpRegistryApi::new(options, Arc::clone(&credentials)));
        Self::new(api, credentials)
    }

    pub fn with_providers(mut self, providers: ProviderRules) -> Self {
        self.providers = providers;
        self
    }

    /// All tags of a repository; a repository that does not exist has none
    #[instrument(skip(self))]
    pub async fn list_tags(&self, reference: &str) -> StrataResult<Vec<String>> {
        let repository = Reference::parse(reference)?;

        match self.api.list_tags(&repository).await {
            Ok(tags) => Ok(tags),
            Err(err) if err.registry_code() == Some(&RegistryErrorCode::NameUnknown) => {
                debug!("Repository {} does not exist yet", repository);
                Ok(Vec::new())
            }
            Err(err) => Err(err),
        }
    }

    /// Manifest digest, image id, parent id and labels of one image
    #[instrument(skip(self))]
    pub async fn inspect(&self, reference: &str) -> StrataResult<ImageInspect> {
        self.inspect_reference(&Reference::parse(reference)?).await
    }

    async fn inspect_reference(&self, reference: &Reference) -> StrataResult<ImageInspect> {
        let manifest = self.api.get_manifest(reference).await?;
        let mut document = ManifestDocument::parse(reference, &manifest.body)?;

        if document.is_index(manifest.media_type.as_deref()) {
            let platform_digest = document
                .platform_digest()
                .ok_or_else(|| StrataError::MalformedResponse {
                    reference: reference.to_string(),
                    reason: "image index has no manifests".to_string(),
                })?
                .to_string();
            let platform_reference = reference.with_digest(&platform_digest);
            let platform = self.api.get_manifest(&platform_reference).await?;
            document = ManifestDocument::parse(&platform_reference, &platform.body)?;
        }

        let config = document
            .config
            .ok_or_else(|| StrataError::MalformedResponse {
                reference: reference.to_string(),
                reason: "manifest has no config descriptor".to_string(),
            })?;
        let blob = self.api.get_blob(reference, &config.digest).await?;
        let config_document = ConfigDocument::parse(reference, &blob)?;

        Ok(ImageInspect {
            digest: manifest.digest,
            parent_id: config_document.parent_id(),
            labels: config_document.labels(),
            id: config.digest,
        })
    }

    /// Images of a repository whose `label` equals `value`.
    ///
    /// Tags with a missing manifest or blob, or an unreadable document, are
    /// skipped with a warning; any other failure aborts the search.
    #[instrument(skip(self))]
    pub async fn find_by_label(
        &self,
        reference: &str,
        label: &str,
        value: &str,
    ) -> StrataResult<Vec<RepoImage>> {
        let repository = Reference::parse(reference)?;
        let tags = self.list_tags(reference).await?;

        let mut images = Vec::new();
        for tag in tags {
            let tagged = repository.with_tag(&tag);
            let inspect = match self.inspect_reference(&tagged).await {
                Ok(inspect) => inspect,
                Err(err) if err.is_broken_entry() => {
                    warn!("Broken tag {} was skipped: {}", tagged, err);
                    continue;
                }
                Err(err) => return Err(err),
            };

            if inspect.labels.get(label).map(String::as_str) == Some(value) {
                images.push(RepoImage {
                    repository: repository.clone(),
                    tag,
                    inspect,
                });
            }
        }

        debug!(
            "Found {} image(s) in {} with {}={}",
            images.len(),
            repository,
            label,
            value
        );
        Ok(images)
    }

    /// Delete the manifest a tag points to.
    ///
    /// An unauthorized generic delete is retried once through the provider
    /// fallback. When the fallback is unauthorized too, the original error is
    /// returned; any other fallback error replaces it.
    #[instrument(skip(self))]
    pub async fn delete(&self, reference: &str) -> StrataResult<()> {
        let reference = Reference::parse(reference)?;

        let digest = match reference.digest() {
            Some(digest) => digest.to_string(),
            None => self.api.get_manifest(&reference).await?.digest,
        };

        match self.api.delete_manifest(&reference.with_digest(&digest)).await {
            Ok(()) => {
                debug!("Deleted {}", reference);
                Ok(())
            }
            Err(err) if err.is_unauthorized() => self.delete_fallback(&reference, err).await,
            Err(err) => Err(err),
        }
    }

    async fn delete_fallback(
        &self,
        reference: &Reference,
        original: StrataError,
    ) -> StrataResult<()> {
        let Some(fallback) = self.providers.delete_fallback(reference.registry()) else {
            return Err(original);
        };

        match fallback {
            DeleteFallback::ScopedManifestDelete => {
                let credentials = self
                    .credentials
                    .resolve(reference.registry())
                    .map_err(|e| StrataError::Credentials {
                        registry: reference.registry().to_string(),
                        reason: e.to_string(),
                    })?;

                match self
                    .api
                    .delete_manifest_scoped(reference, &credentials, &reference.scope("*"))
                    .await
                {
                    Ok(()) => {
                        info!("Deleted {} with scoped manifest delete", reference);
                        Ok(())
                    }
                    Err(err) if err.is_unauthorized() => Err(original),
                    Err(err) => Err(err),
                }
            }
        }
    }
}
