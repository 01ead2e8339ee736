//! Container runtime abstraction
//!
//! The build pipeline never talks to a container engine directly. It
//! describes each stage as a `LayerSpec` and hands it to a
//! `ContainerRuntime`, which runs the commands, applies patches and archives,
//! commits the result and returns the new image.

use crate::error::StrataResult;
use crate::git::{Archive, Patch};
use crate::image::BuiltImage;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Host side of a build-time mount
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountSource {
    /// Fresh temporary directory per build
    TmpDir,
    /// Directory shared between builds of the project
    BuildDir,
    /// Directory on the host
    Host(PathBuf),
}

/// A directory mounted into the build container, never committed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub source: MountSource,
    pub to: String,
}

/// A patch applied under `to`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchLayer {
    pub to: String,
    pub patch: Patch,
}

/// A full tree extracted under `to`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveLayer {
    pub to: String,
    pub archive: Archive,
}

/// Files copied from another built image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportLayer {
    pub image_id: String,
    pub add: String,
    pub to: String,
}

/// Everything needed to produce one stage image on top of `from`.
///
/// Runtimes apply, in order: imports, archives, patches, commands. The new
/// image inherits `from`'s labels, overridden by `labels`. Application is
/// all-or-nothing: on error no image is committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerSpec {
    /// Local image name to commit as
    pub name: String,
    /// Name of the build container
    pub container_name: String,
    pub from: BuiltImage,
    pub labels: BTreeMap<String, String>,
    pub commands: Vec<String>,
    pub archives: Vec<ArchiveLayer>,
    pub patches: Vec<PatchLayer>,
    pub imports: Vec<ImportLayer>,
    pub mounts: Vec<Mount>,
}

impl LayerSpec {
    /// Layer that changes nothing but labels
    pub fn new(name: impl Into<String>, container_name: impl Into<String>, from: BuiltImage) -> Self {
        Self {
            name: name.into(),
            container_name: container_name.into(),
            from,
            labels: BTreeMap::new(),
            commands: Vec::new(),
            archives: Vec::new(),
            patches: Vec::new(),
            imports: Vec::new(),
            mounts: Vec::new(),
        }
    }
}

/// Abstract container runtime interface
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Make a base image available locally
    async fn pull(&self, reference: &str) -> StrataResult<BuiltImage>;

    /// Build and commit one layer
    async fn build_layer(&self, spec: &LayerSpec) -> StrataResult<BuiltImage>;

    /// Push a local image to `reference`, returning the remote image
    async fn push(&self, image: &BuiltImage, reference: &str) -> StrataResult<BuiltImage>;

    /// Add a local name to an image
    async fn tag(&self, image: &BuiltImage, name: &str) -> StrataResult<()>;

    /// Get the human-readable runtime name for display
    fn runtime_name(&self) -> &'static str;
}
