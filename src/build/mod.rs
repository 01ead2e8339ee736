//! Stage pipeline: signatures, materialization and the build driver

pub mod conveyor;
pub mod stage;

pub use conveyor::{Conveyor, ImageBuildResult, PatchFailurePolicy, StageResult};
pub use stage::{Stage, StageContext, StageName};
