//! Orchestration seam for the container runtime
//!
//! Strata ships no runtime of its own; callers plug one in through
//! `ContainerRuntime`.

mod runtime;

pub use runtime::{
    ArchiveLayer, ContainerRuntime, ImportLayer, LayerSpec, Mount, MountSource, PatchLayer,
};
