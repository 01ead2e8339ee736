//! Docker Registry HTTP API v2 transport over `ureq`
//!
//! Requests are sent anonymously (or with a cached token) first; a `401`
//! carrying a `WWW-Authenticate` challenge triggers one retry with basic
//! credentials or a bearer token fetched from the challenge realm. `ureq`
//! is blocking, so every call runs on the tokio blocking pool.

use crate::error::{RegistryErrorCode, StrataError, StrataResult};
use crate::registry::api::{content_digest, manifest_accept, ManifestResponse, RegistryApi};
use crate::registry::auth::{Challenge, CredentialResolver, Credentials};
use crate::registry::reference::Reference;
use crate::registry::RegistryOptions;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, instrument};
use ureq::tls::TlsConfig;
use ureq::Agent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Method {
    Get,
    Delete,
}

/// What the caller needs from one HTTP exchange
struct Response {
    status: u16,
    link: Option<String>,
    digest: Option<String>,
    content_type: Option<String>,
    www_authenticate: Option<String>,
    body: Vec<u8>,
}

struct Request<'a> {
    method: Method,
    url: String,
    reference: &'a Reference,
    accept: Option<String>,
    /// Token action used when the challenge names no scope
    action: &'static str,
    /// Credentials that bypass the resolver
    credentials: Option<Credentials>,
    /// Scope that overrides the one the challenge asks for
    scope: Option<String>,
}

#[derive(Deserialize)]
struct ErrorsBody {
    #[serde(default)]
    errors: Vec<ErrorEntry>,
}

#[derive(Deserialize)]
struct ErrorEntry {
    code: String,
    #[serde(default)]
    message: String,
}

#[derive(Deserialize)]
struct TagList {
    #[serde(default)]
    tags: Option<Vec<String>>,
}

#[derive(Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

struct Inner {
    agent: Agent,
    options: RegistryOptions,
    credentials: Arc<dyn CredentialResolver>,
    /// Bearer tokens keyed by `registry scope`
    tokens: Mutex<HashMap<String, String>>,
}

/// Registry transport backed by a shared `ureq` agent
#[derive(Clone)]
pub struct HttpRegistryApi {
    inner: Arc<Inner>,
}

impl HttpRegistryApi {
    pub fn new(options: RegistryOptions, credentials: Arc<dyn CredentialResolver>) -> Self {
        let config = Agent::config_builder()
            .http_status_as_error(false)
            .tls_config(
                TlsConfig::builder()
                    .disable_verification(options.skip_tls_verify)
                    .build(),
            )
            .build();

        Self {
            inner: Arc::new(Inner {
                agent: Agent::new_with_config(config),
                options,
                credentials,
                tokens: Mutex::new(HashMap::new()),
            }),
        }
    }

    async fn blocking<T, F>(&self, f: F) -> StrataResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Inner) -> StrataResult<T> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || f(&inner))
            .await
            .map_err(|e| StrataError::Internal(format!("registry task failed: {}", e)))?
    }
}

impl Inner {
    fn base_url(&self, reference: &Reference) -> String {
        format!(
            "{}://{}",
            reference.scheme(self.options.insecure_registry),
            reference.registry()
        )
    }

    fn repository_url(&self, reference: &Reference) -> String {
        format!("{}/v2/{}", self.base_url(reference), reference.repository())
    }

    fn transport_error(reference: &Reference, e: impl std::fmt::Display) -> StrataError {
        StrataError::Transport {
            reference: reference.to_string(),
            message: e.to_string(),
        }
    }

    fn call(&self, req: &Request<'_>, authorization: Option<&str>) -> StrataResult<Response> {
        debug!("{:?} {}", req.method, req.url);

        let mut request = match req.method {
            Method::Get => self.agent.get(req.url.as_str()),
            Method::Delete => self.agent.delete(req.url.as_str()),
        };
        if let Some(accept) = &req.accept {
            request = request.header("Accept", accept.as_str());
        }
        if let Some(authorization) = authorization {
            request = request.header("Authorization", authorization);
        }

        let mut response = request
            .call()
            .map_err(|e| Self::transport_error(req.reference, e))?;

        let header = |name: &str| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let status = response.status().as_u16();
        let link = header("Link");
        let digest = header("Docker-Content-Digest");
        let content_type = header("Content-Type");
        let www_authenticate = header("WWW-Authenticate");

        let body = response
            .body_mut()
            .read_to_vec()
            .map_err(|e| Self::transport_error(req.reference, e))?;

        Ok(Response {
            status,
            link,
            digest,
            content_type,
            www_authenticate,
            body,
        })
    }

    /// Send, answering one authentication challenge if the registry asks
    fn execute(&self, req: &Request<'_>) -> StrataResult<Response> {
        let default_scope = req
            .scope
            .clone()
            .unwrap_or_else(|| req.reference.scope(req.action));
        let cache_key = format!("{} {}", req.reference.registry(), default_scope);

        let cached = self
            .tokens
            .lock()
            .ok()
            .and_then(|tokens| tokens.get(&cache_key).cloned());
        let response = self.call(req, cached.as_ref().map(|t| format!("Bearer {}", t)).as_deref())?;
        if response.status != 401 {
            return Ok(response);
        }

        let Some(challenge) = response.www_authenticate.as_deref().and_then(Challenge::parse)
        else {
            return Ok(response);
        };

        let credentials = match &req.credentials {
            Some(credentials) => credentials.clone(),
            None => self.credentials.resolve(req.reference.registry())?,
        };

        let authorization = match challenge {
            Challenge::Basic => match credentials.authorization() {
                Some(authorization) => authorization,
                None => return Ok(response),
            },
            Challenge::Bearer {
                realm,
                service,
                scope,
            } => {
                let scope = req.scope.clone().or(scope).unwrap_or(default_scope);
                let token =
                    self.fetch_token(req.reference, &realm, service.as_deref(), &scope, &credentials)?;
                if let Ok(mut tokens) = self.tokens.lock() {
                    tokens.insert(cache_key, token.clone());
                }
                format!("Bearer {}", token)
            }
        };

        self.call(req, Some(&authorization))
    }

    fn fetch_token(
        &self,
        reference: &Reference,
        realm: &str,
        service: Option<&str>,
        scope: &str,
        credentials: &Credentials,
    ) -> StrataResult<String> {
        debug!("Requesting token from {} for {}", realm, scope);

        let mut request = self.agent.get(realm).query("scope", scope);
        if let Some(service) = service {
            request = request.query("service", service);
        }
        if let Some(authorization) = credentials.authorization() {
            request = request.header("Authorization", authorization.as_str());
        }

        let mut response = request
            .call()
            .map_err(|e| Self::transport_error(reference, e))?;
        let status = response.status().as_u16();
        let body = response
            .body_mut()
            .read_to_vec()
            .map_err(|e| Self::transport_error(reference, e))?;

        if status != 200 {
            return Err(registry_error(
                reference,
                status,
                &body,
                RegistryErrorCode::Unauthorized,
            ));
        }

        let token: TokenResponse = serde_json::from_slice(&body).map_err(|e| {
            StrataError::MalformedResponse {
                reference: reference.to_string(),
                reason: format!("token response: {}", e),
            }
        })?;
        token
            .token
            .or(token.access_token)
            .ok_or_else(|| StrataError::MalformedResponse {
                reference: reference.to_string(),
                reason: "token response carries no token".to_string(),
            })
    }

    fn list_tags(&self, repository: &Reference) -> StrataResult<Vec<String>> {
        let mut tags = Vec::new();
        let mut url = format!("{}/tags/list", self.repository_url(repository));

        loop {
            let response = self.execute(&Request {
                method: Method::Get,
                url: url.clone(),
                reference: repository,
                accept: None,
                action: "pull",
                credentials: None,
                scope: None,
            })?;
            if response.status != 200 {
                return Err(registry_error(
                    repository,
                    response.status,
                    &response.body,
                    RegistryErrorCode::NameUnknown,
                ));
            }

            let page: TagList = serde_json::from_slice(&response.body).map_err(|e| {
                StrataError::MalformedResponse {
                    reference: repository.to_string(),
                    reason: format!("tag list: {}", e),
                }
            })?;
            tags.extend(page.tags.unwrap_or_default());

            match response.link.as_deref().and_then(next_link) {
                Some(next) if next.starts_with('/') => {
                    url = format!("{}{}", self.base_url(repository), next)
                }
                Some(next) => url = next,
                None => break,
            }
        }

        Ok(tags)
    }

    fn get_manifest(&self, reference: &Reference) -> StrataResult<ManifestResponse> {
        let response = self.execute(&Request {
            method: Method::Get,
            url: format!(
                "{}/manifests/{}",
                self.repository_url(reference),
                reference.identifier()
            ),
            reference,
            accept: Some(manifest_accept()),
            action: "pull",
            credentials: None,
            scope: None,
        })?;
        if response.status != 200 {
            return Err(registry_error(
                reference,
                response.status,
                &response.body,
                RegistryErrorCode::ManifestUnknown,
            ));
        }

        let digest = response
            .digest
            .unwrap_or_else(|| content_digest(&response.body));
        Ok(ManifestResponse {
            digest,
            media_type: response
                .content_type
                .map(|ct| ct.split(';').next().unwrap_or_default().trim().to_string()),
            body: response.body,
        })
    }

    fn get_blob(&self, repository: &Reference, digest: &str) -> StrataResult<Vec<u8>> {
        let response = self.execute(&Request {
            method: Method::Get,
            url: format!("{}/blobs/{}", self.repository_url(repository), digest),
            reference: repository,
            accept: None,
            action: "pull",
            credentials: None,
            scope: None,
        })?;
        if response.status != 200 {
            return Err(registry_error(
                repository,
                response.status,
                &response.body,
                RegistryErrorCode::BlobUnknown,
            ));
        }
        Ok(response.body)
    }

    fn delete_manifest(
        &self,
        reference: &Reference,
        credentials: Option<Credentials>,
        scope: Option<String>,
    ) -> StrataResult<()> {
        let response = self.execute(&Request {
            method: Method::Delete,
            url: format!(
                "{}/manifests/{}",
                self.repository_url(reference),
                reference.identifier()
            ),
            reference,
            accept: None,
            action: "delete",
            credentials,
            scope,
        })?;

        match response.status {
            200 | 202 => Ok(()),
            status => Err(registry_error(
                reference,
                status,
                &response.body,
                RegistryErrorCode::ManifestUnknown,
            )),
        }
    }
}

/// Build a registry error from a failed response.
///
/// The first entry of the `errors` body wins; without one the code is derived
/// from the status, using `not_found` for `404`.
fn registry_error(
    reference: &Reference,
    status: u16,
    body: &[u8],
    not_found: RegistryErrorCode,
) -> StrataError {
    if let Ok(parsed) = serde_json::from_slice::<ErrorsBody>(body) {
        if let Some(first) = parsed.errors.into_iter().next() {
            return StrataError::registry(
                reference.to_string(),
                RegistryErrorCode::from_code(&first.code),
                status,
                first.message,
            );
        }
    }

    let code = match status {
        401 => RegistryErrorCode::Unauthorized,
        403 => RegistryErrorCode::Denied,
        404 => not_found,
        405 => RegistryErrorCode::Unsupported,
        other => RegistryErrorCode::Other(format!("HTTP {}", other)),
    };
    let message = String::from_utf8_lossy(body).trim().chars().take(200).collect::<String>();
    StrataError::registry(reference.to_string(), code, status, message)
}

/// Target of `<url>; rel="next"` in a `Link` header
fn next_link(header: &str) -> Option<String> {
    header.split(',').find_map(|part| {
        let (target, params) = part.split_once(';')?;
        if !params.contains("rel=\"next\"") && !params.contains("rel=next") {
            return None;
        }
        let target = target.trim().strip_prefix('<')?.strip_suffix('>')?;
        Some(target.to_string())
    })
}

#[async_trait]
impl RegistryApi for HttpRegistryApi {
    #[instrument(skip(self), fields(repository = %repository))]
    async fn list_tags(&self, repository: &Reference) -> StrataResult<Vec<String>> {
        let repository = repository.clone();
        self.blocking(move |inner| inner.list_tags(&repository)).await
    }

    #[instrument(skip(self), fields(reference = %reference))]
    async fn get_manifest(&self, reference: &Reference) -> StrataResult<ManifestResponse> {
        let reference = reference.clone();
        self.blocking(move |inner| inner.get_manifest(&reference)).await
    }

    #[instrument(skip(self), fields(repository = %repository))]
    async fn get_blob(&self, repository: &Reference, digest: &str) -> StrataResult<Vec<u8>> {
        let repository = repository.clone();
        let digest = digest.to_string();
        self.blocking(move |inner| inner.get_blob(&repository, &digest))
            .await
    }

    #[instrument(skip(self), fields(reference = %reference))]
    async fn delete_manifest(&self, reference: &Reference) -> StrataResult<()> {
        let reference = reference.clone();
        self.blocking(move |inner| inner.delete_manifest(&reference, None, None))
            .await
    }

    #[instrument(skip(self, credentials), fields(reference = %reference))]
    async fn delete_manifest_scoped(
        &self,
        reference: &Reference,
        credentials: &Credentials,
        scope: &str,
    ) -> StrataResult<()> {
        let reference = reference.clone();
        let credentials = credentials.clone();
        let scope = scope.to_string();
        self.blocking(move |inner| inner.delete_manifest(&reference, Some(credentials), Some(scope)))
            .await
    }
}
