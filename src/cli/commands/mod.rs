//! CLI command implementations

pub mod cleanup;
pub mod config;
pub mod image_repo;

pub use cleanup::execute as cleanup;
pub use config::execute as config;
pub use image_repo::execute as image_repo;

use crate::cli::args::ImagesRepoArgs;
use crate::config::Config;
use crate::error::{StrataError, StrataResult};
use crate::naming::ImagesRepoManager;

/// Config with command-line overrides of the images repo applied
pub(crate) fn with_images_repo(args: &ImagesRepoArgs, config: &Config) -> Config {
    let mut config = config.clone();
    if let Some(address) = &args.images_repo {
        config.images_repo.address = Some(address.clone());
    }
    if let Some(mode) = args.images_repo_mode {
        config.images_repo.mode = mode;
    }
    config
}

/// Naming strategy of the configured images repo
pub(crate) fn naming(config: &Config) -> StrataResult<ImagesRepoManager> {
    let address = config.images_repo.address.as_deref().ok_or_else(|| {
        StrataError::InvalidConfiguration("images repo address is not set".to_string())
    })?;
    Ok(ImagesRepoManager::with_mode(
        address.trim_end_matches('/'),
        config.images_repo.mode,
    ))
}
