//! Registry credentials and authentication challenges
//!
//! Strata does not log in anywhere itself: credentials come from a
//! `CredentialResolver` supplied by the caller, and are only exchanged for
//! bearer tokens when the registry asks for it.

use crate::error::StrataResult;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::collections::HashMap;

/// Credentials for one registry host
#[derive(Clone, PartialEq, Eq, Default)]
pub enum Credentials {
    #[default]
    Anonymous,
    Basic {
        username: String,
        password: String,
    },
    /// Identity or registry token used as-is
    Bearer(String),
}

impl Credentials {
    /// `Authorization` header value for direct (non-token) use
    pub fn authorization(&self) -> Option<String> {
        match self {
            Self::Anonymous => None,
            Self::Basic { username, password } => Some(format!(
                "Basic {}",
                STANDARD.encode(format!("{}:{}", username, password))
            )),
            Self::Bearer(token) => Some(format!("Bearer {}", token)),
        }
    }
}

// Never print secrets
impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Anonymous => write!(f, "Anonymous"),
            Self::Basic { username, .. } => write!(f, "Basic({}, ***)", username),
            Self::Bearer(_) => write!(f, "Bearer(***)"),
        }
    }
}

/// Source of registry credentials, keyed by registry host
pub trait CredentialResolver: Send + Sync {
    fn resolve(&self, registry: &str) -> StrataResult<Credentials>;
}

/// Resolver that never has credentials
#[derive(Debug, Default, Clone, Copy)]
pub struct AnonymousResolver;

impl CredentialResolver for AnonymousResolver {
    fn resolve(&self, _registry: &str) -> StrataResult<Credentials> {
        Ok(Credentials::Anonymous)
    }
}

/// Fixed credentials per registry host
#[derive(Debug, Default, Clone)]
pub struct StaticCredentials {
    by_registry: HashMap<String, Credentials>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, registry: impl Into<String>, credentials: Credentials) -> Self {
        self.by_registry.insert(registry.into(), credentials);
        self
    }

    /// Credentials from `STRATA_REGISTRY_USERNAME` / `STRATA_REGISTRY_PASSWORD`,
    /// applied to every registry in `registries`
    pub fn from_env(registries: &[&str]) -> Self {
        let username = std::env::var("STRATA_REGISTRY_USERNAME").ok();
        let password = std::env::var("STRATA_REGISTRY_PASSWORD").ok();

        let mut resolver = Self::new();
        if let (Some(username), Some(password)) = (username, password) {
            for registry in registries {
                resolver = resolver.with(
                    *registry,
                    Credentials::Basic {
                        username: username.clone(),
                        password: password.clone(),
                    },
                );
            }
        }
        resolver
    }
}

impl CredentialResolver for StaticCredentials {
    fn resolve(&self, registry: &str) -> StrataResult<Credentials> {
        Ok(self.by_registry.get(registry).cloned().unwrap_or_default())
    }
}

/// Parsed `WWW-Authenticate` challenge
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Challenge {
    Basic,
    Bearer {
        realm: String,
        service: Option<String>,
        scope: Option<String>,
    },
}

impl Challenge {
    /// Parse `Bearer realm="...",service="...",scope="..."` or `Basic realm="..."`
    pub fn parse(header: &str) -> Option<Self> {
        let header = header.trim();
        let (scheme, params) = header.split_once(' ').unwrap_or((header, ""));

        if scheme.eq_ignore_ascii_case("basic") {
            return Some(Self::Basic);
        }
        if !scheme.eq_ignore_ascii_case("bearer") {
            return None;
        }

        let params = parse_params(params);
        Some(Self::Bearer {
            realm: params.get("realm")?.clone(),
            service: params.get("service").cloned(),
            scope: params.get("scope").cloned(),
        })
    }
}

/// Split `k="v",k2="v2"` honouring commas inside quotes
fn parse_params(input: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    let mut rest = input.trim();

    while !rest.is_empty() {
        let Some((key, after)) = rest.split_once('=') else {
            break;
        };
        let key = key.trim().trim_start_matches(',').trim().to_ascii_lowercase();

        let (value, remaining) = if let Some(quoted) = after.strip_prefix('"') {
            match quoted.find('"') {
                Some(end) => (&quoted[..end], &quoted[end + 1..]),
                None => (quoted, ""),
            }
        } else {
            match after.find(',') {
                Some(end) => (&after[..end], &after[end..]),
                None => (after, ""),
            }
        };

        params.insert(key, value.to_string());
        rest = remaining.trim_start_matches(',').trim();
    }

    params
}
