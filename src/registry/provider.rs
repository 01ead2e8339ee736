//! Provider-specific registry behavior keyed by hostname patterns

use crate::error::{StrataError, StrataResult};
use crate::registry::reference::Reference;
use regex_lite::Regex;

/// Google Container Registry hosts
pub const GCR_URL_PATTERNS: &[&str] = &[
    r"^container\.cloud\.google\.com",
    r"^gcr\.io",
    r"^.*\.gcr\.io",
];

/// What to try when the generic manifest delete is rejected as unauthorized
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteFallback {
    /// `DELETE /v2/<repo>/manifests/<tag>` with resolved credentials and a
    /// `repository:<repo>:*` token scope (GitLab-style registries)
    ScopedManifestDelete,
}

/// One provider: hostname patterns and the behavior they select
#[derive(Debug, Clone)]
pub struct ProviderRule {
    pub name: &'static str,
    patterns: Vec<Regex>,
    pub delete_fallback: Option<DeleteFallback>,
}

impl ProviderRule {
    pub fn new(
        name: &'static str,
        patterns: &[&str],
        delete_fallback: Option<DeleteFallback>,
    ) -> StrataResult<Self> {
        let patterns = patterns
            .iter()
            .map(|p| Regex::new(p).map_err(|e| StrataError::Internal(format!("bad pattern {}: {}", p, e))))
            .collect::<StrataResult<Vec<_>>>()?;
        Ok(Self {
            name,
            patterns,
            delete_fallback,
        })
    }

    pub fn matches(&self, host: &str) -> bool {
        self.patterns.iter().any(|re| re.is_match(host))
    }
}

/// Ordered rule table; the first matching rule wins
#[derive(Debug, Clone)]
pub struct ProviderRules {
    rules: Vec<ProviderRule>,
}

impl ProviderRules {
    /// Every known host, GCR included, gets the scoped delete
    pub fn builtin() -> StrataResult<Self> {
        Ok(Self {
            rules: vec![
                ProviderRule::new("gcr", GCR_URL_PATTERNS, Some(DeleteFallback::ScopedManifestDelete))?,
                ProviderRule::new("generic", &[".*"], Some(DeleteFallback::ScopedManifestDelete))?,
            ],
        })
    }

    pub fn new(rules: Vec<ProviderRule>) -> Self {
        Self { rules }
    }

    /// Insert a rule ahead of the existing ones
    pub fn with_rule(mut self, rule: ProviderRule) -> Self {
        self.rules.insert(0, rule);
        self
    }

    pub fn matching(&self, host: &str) -> Option<&ProviderRule> {
        self.rules.iter().find(|rule| rule.matches(host))
    }

    pub fn delete_fallback(&self, host: &str) -> Option<DeleteFallback> {
        self.matching(host).and_then(|rule| rule.delete_fallback)
    }
}

/// Whether `host` matches any of `patterns`
pub fn host_matches(host: &str, patterns: &[&str]) -> StrataResult<bool> {
    for pattern in patterns {
        let re = Regex::new(pattern)
            .map_err(|e| StrataError::Internal(format!("bad pattern {}: {}", pattern, e)))?;
        if re.is_match(host) {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Whether the registry of `reference` is Google Container Registry
pub fn is_gcr(reference: &str) -> StrataResult<bool> {
    let reference = Reference::parse(reference)?;
    host_matches(reference.registry(), GCR_URL_PATTERNS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_gcr_hosts() {
        assert!(is_gcr("gcr.io/project/app").unwrap());
        assert!(is_gcr("eu.gcr.io/project/app:v1").unwrap());
        assert!(is_gcr("container.cloud.google.com/project/app").unwrap());
        assert!(!is_gcr("registry.gitlab.com/group/app").unwrap());
        assert!(!is_gcr("alpine").unwrap());
    }

    #[test]
    fn first_matching_rule_wins() {
        let rules = ProviderRules::builtin().unwrap();
        assert_eq!(rules.matching("gcr.io").unwrap().name, "gcr");
        assert_eq!(rules.matching("registry.gitlab.com").unwrap().name, "generic");
        assert_eq!(
            rules.delete_fallback("eu.gcr.io"),
            Some(DeleteFallback::ScopedManifestDelete)
        );
        assert_eq!(
            rules.delete_fallback("registry.gitlab.com"),
            Some(DeleteFallback::ScopedManifestDelete)
        );
    }

    #[test]
    fn custom_rule_takes_precedence() {
        let rules = ProviderRules::builtin()
            .unwrap()
            .with_rule(ProviderRule::new("internal", &[r"^registry\.corp\.local"], None).unwrap());
        assert_eq!(rules.matching("registry.corp.local:5000").unwrap().name, "internal");
        assert_eq!(rules.delete_fallback("registry.corp.local"), None);
    }

    #[test]
    fn empty_table_matches_nothing() {
        assert!(ProviderRules::new(Vec::new()).matching("gcr.io").is_none());
    }
}
