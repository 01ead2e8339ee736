//! Configuration schema for Strata
//!
//! Configuration is stored at `~/.config/strata/config.toml`

use crate::naming::ImagesRepoMode;
use crate::registry::RegistryOptions;
use serde::{Deserialize, Serialize};

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Registry transport settings
    pub registry: RegistryConfig,

    /// Where published images live
    pub images_repo: ImagesRepoConfig,

    /// Where stage images live
    pub stages_storage: StagesStorageConfig,

    /// Cleanup defaults
    pub cleanup: CleanupConfig,
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Enable verbose logging
    pub verbose: bool,

    /// Log format: "text" or "json"
    pub log_format: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            verbose: false,
            log_format: "text".to_string(),
        }
    }
}

/// Registry transport settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Use plain HTTP
    pub insecure: bool,

    /// Do not verify TLS certificates
    pub skip_tls_verify: bool,
}

impl RegistryConfig {
    pub fn options(&self) -> RegistryOptions {
        RegistryOptions {
            insecure_registry: self.insecure,
            skip_tls_verify: self.skip_tls_verify,
        }
    }
}

/// Images repo settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImagesRepoConfig {
    /// Repository address, e.g. `registry.example.com/group/project`
    pub address: Option<String>,

    /// Layout mode
    pub mode: ImagesRepoMode,
}

impl Default for ImagesRepoConfig {
    fn default() -> Self {
        Self {
            address: None,
            mode: ImagesRepoMode::Multirepo,
        }
    }
}

/// Stages storage settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StagesStorageConfig {
    /// Repository holding stage images; defaults to `<images repo>/stages`
    pub address: Option<String>,
}

/// Cleanup settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    /// Only report what would be deleted
    pub dry_run: bool,
}

impl Config {
    /// Stages repo address, falling back to `<images repo>/stages`
    pub fn stages_storage_address(&self) -> Option<String> {
        self.stages_storage.address.clone().or_else(|| {
            self.images_repo
                .address
                .as_ref()
                .map(|address| format!("{}/stages", address.trim_end_matches('/')))
        })
    }
}
