//! Include/exclude filtering of repository paths
//!
//! Patterns are globs relative to the artifact's `add` directory. A pattern
//! naming a directory matches everything below it.

use crate::error::{StrataError, StrataResult};
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};

/// Filter selecting the repository paths that belong to a git mapping
#[derive(Debug, Clone)]
pub struct PathMatcher {
    base: String,
    include_paths: Vec<String>,
    exclude_paths: Vec<String>,
    include: Option<GlobSet>,
    exclude: Option<GlobSet>,
}

impl PathMatcher {
    /// Build a matcher rooted at `base` (slash-separated, repository-relative)
    pub fn new(
        base: &str,
        include_paths: &[String],
        exclude_paths: &[String],
    ) -> StrataResult<Self> {
        let include_paths = normalize_all(include_paths);
        let exclude_paths = normalize_all(exclude_paths);

        Ok(Self {
            base: normalize(base),
            include: build_set(&include_paths)?,
            exclude: build_set(&exclude_paths)?,
            include_paths,
            exclude_paths,
        })
    }

    /// Matcher accepting every path below `base`
    pub fn all_under(base: &str) -> StrataResult<Self> {
        Self::new(base, &[], &[])
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    /// `path` relative to the base, or `None` when it lies outside of it
    pub fn trim_base<'a>(&self, path: &'a str) -> Option<&'a str> {
        if self.base.is_empty() {
            return Some(path);
        }
        match path.strip_prefix(self.base.as_str()) {
            Some("") => Some(""),
            Some(rest) => rest.strip_prefix('/'),
            None => None,
        }
    }

    /// Whether a repository-relative path passes the filters
    pub fn is_path_matched(&self, path: &str) -> bool {
        let Some(rel) = self.trim_base(path) else {
            return false;
        };

        if let Some(include) = &self.include {
            if !include.is_match(rel) {
                return false;
            }
        }

        match &self.exclude {
            Some(exclude) => !exclude.is_match(rel),
            None => true,
        }
    }

    /// Whether the directory `dir` may hold paths that pass the filters
    pub fn may_contain(&self, dir: &str) -> bool {
        if let Some(rel) = self.trim_base(dir) {
            return match &self.exclude {
                Some(exclude) if !rel.is_empty() => !exclude.is_match(rel),
                _ => true,
            };
        }
        self.base
            .strip_prefix(dir)
            .is_some_and(|rest| rest.starts_with('/'))
    }

    /// Stable textual description, used as a signature input
    pub fn id(&self) -> String {
        format!(
            "base={};include={};exclude={}",
            self.base,
            self.include_paths.join(","),
            self.exclude_paths.join(",")
        )
    }
}

fn normalize(path: &str) -> String {
    path.split('/')
        .filter(|c| !c.is_empty() && *c != ".")
        .collect::<Vec<_>>()
        .join("/")
}

fn normalize_all(paths: &[String]) -> Vec<String> {
    let mut out: Vec<String> = paths
        .iter()
        .map(|p| normalize(p))
        .filter(|p| !p.is_empty())
        .collect();
    out.sort();
    out.dedup();
    out
}

fn build_set(patterns: &[String]) -> StrataResult<Option<GlobSet>> {
    if patterns.is_empty() {
        return Ok(None);
    }

    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        // The pattern itself, and everything below it when it names a directory
        for glob in [pattern.clone(), format!("{}/**", pattern)] {
            let glob = GlobBuilder::new(&glob)
                .literal_separator(true)
                .build()
                .map_err(|e| {
                    StrataError::InvalidConfiguration(format!("bad path pattern {:?}: {}", pattern, e))
                })?;
            builder.add(glob);
        }
    }

    builder
        .build()
        .map(Some)
        .map_err(|e| StrataError::InvalidConfiguration(format!("bad path patterns: {}", e)))
}
