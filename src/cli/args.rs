//! CLI argument definitions using clap derive

use crate::naming::ImagesRepoMode;
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Strata - incremental image stages and registry cleanup
///
/// Resolves where images of a project are published and removes stage
/// images that no published tag refers to anymore.
#[derive(Parser, Debug)]
#[command(name = "strata")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Configuration file path
    #[arg(short, long, global = true, env = "STRATA_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log output format
    #[arg(long, global = true, value_enum)]
    pub log_format: Option<LogFormat>,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print the registry reference of an image
    ImageRepo(ImageRepoArgs),

    /// Delete stage images no published tag refers to
    Cleanup(CleanupArgs),

    /// Show or initialize configuration
    Config(ConfigArgs),
}

/// Images repo selection shared by commands
#[derive(Args, Debug, Clone, Default)]
pub struct ImagesRepoArgs {
    /// Images repo address (default: images_repo.address from config)
    #[arg(long, env = "STRATA_IMAGES_REPO")]
    pub images_repo: Option<String>,

    /// Images repo layout (default: images_repo.mode from config)
    #[arg(long, env = "STRATA_IMAGES_REPO_MODE", value_parser = parse_mode)]
    pub images_repo_mode: Option<ImagesRepoMode>,
}

/// Arguments for the image-repo command
#[derive(Parser, Debug)]
pub struct ImageRepoArgs {
    #[command(flatten)]
    pub repo: ImagesRepoArgs,

    /// Image name; omit for the nameless image
    #[arg(default_value = "")]
    pub name: String,

    /// Print the full reference for this tag
    #[arg(short, long)]
    pub tag: Option<String>,
}

/// Arguments for the cleanup command
#[derive(Parser, Debug)]
pub struct CleanupArgs {
    #[command(flatten)]
    pub repo: ImagesRepoArgs,

    /// Project directory containing strata.toml (defaults to current directory)
    #[arg(short, long)]
    pub project: Option<PathBuf>,

    /// Stages storage address (default: <images repo>/stages)
    #[arg(long, env = "STRATA_STAGES_STORAGE")]
    pub stages_storage: Option<String>,

    /// Only report what would be deleted
    #[arg(long)]
    pub dry_run: bool,

    /// Talk plain HTTP to the registry
    #[arg(long)]
    pub insecure_registry: bool,

    /// Do not verify registry TLS certificates
    #[arg(long)]
    pub skip_tls_verify_registry: bool,
}

/// Arguments for the config command
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    /// Subcommand for config
    #[command(subcommand)]
    pub action: Option<ConfigAction>,
}

/// Config subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,

    /// Show configuration file path
    Path,

    /// Initialize default configuration
    Init {
        /// Overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines
    Text,
    /// One JSON object per event
    Json,
}

fn parse_mode(s: &str) -> Result<ImagesRepoMode, String> {
    s.parse().map_err(|e: crate::error::StrataError| e.to_string())
}
