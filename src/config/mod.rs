//! Configuration management for Strata
//!
//! Two files are involved: the user config (`~/.config/strata/config.toml`)
//! with registry and repository settings, and the project config
//! (`strata.toml`) declaring the images to build.

pub mod project;
pub mod schema;

pub use project::{ImageConfig, ImportConfig, MountConfig, ProjectConfig, ShellConfig};
pub use schema::Config;

use crate::error::{StrataError, StrataResult};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

/// Name of the project config file
pub const PROJECT_CONFIG_FILE: &str = "strata.toml";

/// Locates, reads and writes the user config; reads project configs
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    /// Manager for `<config dir>/strata/config.toml`
    pub fn new() -> Self {
        Self::with_path(Self::default_config_path())
    }

    /// Manager for an explicit file, as given by `--config` or `STRATA_CONFIG`
    pub fn with_path(path: PathBuf) -> Self {
        Self { config_path: path }
    }

    pub fn default_config_path() -> PathBuf {
        let base = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
        base.join("strata").join("config.toml")
    }

    /// The user config; a missing file means all defaults
    pub async fn load(&self) -> StrataResult<Config> {
        if fs::try_exists(&self.config_path).await.unwrap_or(false) {
            read_toml(&self.config_path, "config", |content| {
                toml::from_str(content).map_err(|e| e.to_string())
            })
            .await
        } else {
            debug!("No config at {}, using defaults", self.config_path.display());
            Ok(Config::default())
        }
    }

    /// The project config at `dir/strata.toml`, which must exist
    pub async fn load_project(dir: &Path) -> StrataResult<ProjectConfig> {
        read_toml(&dir.join(PROJECT_CONFIG_FILE), "project config", |content| {
            ProjectConfig::parse(content).map_err(|e| e.to_string())
        })
        .await
    }

    /// Write `config`, creating the config directory if needed
    pub async fn save(&self, config: &Config) -> StrataResult<()> {
        if let Some(dir) = self.config_path.parent() {
            fs::create_dir_all(dir)
                .await
                .map_err(|e| StrataError::ConfigDirCreate {
                    path: dir.to_path_buf(),
                    source: e,
                })?;
        }

        let rendered = toml::to_string_pretty(config)?;
        fs::write(&self.config_path, rendered).await.map_err(|e| {
            StrataError::io(format!("writing config to {}", self.config_path.display()), e)
        })?;

        info!("Wrote {}", self.config_path.display());
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config_path
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

async fn read_toml<T>(
    path: &Path,
    what: &str,
    parse: impl FnOnce(&str) -> Result<T, String>,
) -> StrataResult<T> {
    let content = fs::read_to_string(path)
        .await
        .map_err(|e| StrataError::io(format!("reading {} from {}", what, path.display()), e))?;

    parse(&content).map_err(|reason| StrataError::ConfigInvalid {
        path: path.to_path_buf(),
        reason,
    })
}
