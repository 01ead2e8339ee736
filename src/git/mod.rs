//! Git repository access for stage signatures and incremental patches
//!
//! The build pipeline needs four things from the project repository: the
//! commit to build, ancestry checks between commits, a content checksum of
//! the paths a mapping covers, and patches/archives restricted to a mapping.

pub mod artifact;
mod cli;
pub mod matcher;
pub mod patch;

pub use artifact::{DependentStage, GitArtifact, StageDependencies};
pub use cli::CliGitRepository;
pub use matcher::PathMatcher;
pub use patch::{Archive, Patch};

use crate::error::StrataResult;
use async_trait::async_trait;

/// Parameters of a patch between two commits
#[derive(Debug, Clone)]
pub struct PatchOptions {
    pub from_commit: String,
    pub to_commit: String,
    pub matcher: PathMatcher,
    /// Descend into submodules instead of diffing their commit pointers
    pub with_submodules: bool,
}

/// Parameters of a full archive at one commit
#[derive(Debug, Clone)]
pub struct ArchiveOptions {
    pub commit: String,
    pub matcher: PathMatcher,
}

/// Read access to the project repository
#[async_trait]
pub trait GitRepository: Send + Sync {
    /// Commit currently checked out
    async fn head_commit(&self) -> StrataResult<String>;

    /// Whether `ancestor` is reachable from `descendant` (equal commits count)
    async fn is_ancestor(&self, ancestor: &str, descendant: &str) -> StrataResult<bool>;

    /// Deterministic checksum of every matched path and its content at `commit`
    async fn checksum(&self, commit: &str, matcher: &PathMatcher) -> StrataResult<String>;

    /// Patch of matched paths between two commits, rebased onto the matcher base
    async fn patch(&self, options: &PatchOptions) -> StrataResult<Patch>;

    /// Archive of matched paths at one commit, relative to the matcher base
    async fn archive(&self, options: &ArchiveOptions) -> StrataResult<Archive>;
}
