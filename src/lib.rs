//! Strata - incremental container image stages
//!
//! Builds images as chains of cached stages keyed by content signatures,
//! keeps the stages in a registry repo, and garbage-collects stages that no
//! published tag refers to anymore.

pub mod build;
pub mod cleanup;
pub mod cli;
pub mod config;
pub mod error;
pub mod git;
pub mod image;
pub mod naming;
pub mod orchestration;
pub mod registry;
pub mod storage;

#[cfg(test)]
mod test_support;

pub use error::{StrataError, StrataResult};
