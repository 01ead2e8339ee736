//! Cleanup command - remove stage images no published tag refers to

use crate::cleanup::{CleanupReport, StagesCleanup, StagesCleanupOptions};
use crate::cli::args::CleanupArgs;
use crate::cli::commands::{naming, with_images_repo};
use crate::config::{Config, ConfigManager};
use crate::error::{StrataError, StrataResult};
use crate::registry::{Reference, RegistryClient, RegistryOptions, StaticCredentials};
use crate::storage::RepoStagesStorage;
use console::style;
use std::sync::Arc;
use tracing::debug;

/// Execute the cleanup command
pub async fn execute(args: CleanupArgs, config: &Config) -> StrataResult<()> {
    let mut config = with_images_repo(&args.repo, config);
    if let Some(address) = &args.stages_storage {
        config.stages_storage.address = Some(address.clone());
    }
    let naming = naming(&config)?;

    let project_dir = match &args.project {
        Some(dir) => dir.clone(),
        None => std::env::current_dir()
            .map_err(|e| StrataError::io("getting current directory", e))?,
    };
    let project = ConfigManager::load_project(&project_dir).await?;
    project.validate_names(&naming)?;

    let stages_address = config.stages_storage_address().ok_or_else(|| {
        StrataError::InvalidConfiguration("stages storage address is not set".to_string())
    })?;
    debug!("Stages storage: {}", stages_address);

    let options = RegistryOptions {
        insecure_registry: args.insecure_registry || config.registry.insecure,
        skip_tls_verify: args.skip_tls_verify_registry || config.registry.skip_tls_verify,
    };
    let hosts = [
        Reference::parse(naming.address())?.registry().to_string(),
        Reference::parse(&stages_address)?.registry().to_string(),
    ];
    let host_refs: Vec<&str> = hosts.iter().map(String::as_str).collect();
    let credentials = Arc::new(StaticCredentials::from_env(&host_refs));

    let registry = RegistryClient::http(options, credentials)?;
    let storage = Arc::new(RepoStagesStorage::new(stages_address, registry.clone()));
    let cleanup = StagesCleanup::new(naming, registry, storage);

    let dry_run = args.dry_run || config.cleanup.dry_run;
    let plan = cleanup
        .plan(&StagesCleanupOptions {
            project_name: project.meta.project.clone(),
            image_names: project.image_names(),
            dry_run,
        })
        .await?;
    let report = cleanup.execute(plan).await;
    finish(report)
}

/// Print what happened, then fail if any image failed
fn finish(report: CleanupReport) -> StrataResult<()> {
    for line in report_lines(&report) {
        println!("{}", line);
    }
    report.into_result().map(|_| ())
}

fn report_lines(report: &CleanupReport) -> Vec<String> {
    let mut lines: Vec<String> = report
        .withheld
        .iter()
        .map(|kept| format!("  {} {}", style("kept").yellow(), kept.name))
        .collect();

    if report.orphans.is_empty() {
        lines.push(format!(
            "{} Nothing to clean, {} stage(s) in use",
            style("✓").green().bold(),
            report.retained.len()
        ));
        return lines;
    }

    if report.dry_run {
        for orphan in &report.orphans {
            lines.push(format!("  {} {}", style("would delete").yellow(), orphan.name));
        }
        lines.push(format!(
            "{} {} orphan stage(s) found, {} in use (dry run)",
            style("!").yellow().bold(),
            report.orphans.len(),
            report.retained.len()
        ));
        return lines;
    }

    for deleted in &report.deleted {
        lines.push(format!("  {} {}", style("deleted").red(), deleted.name));
    }
    lines.push(format!(
        "{} Deleted {} of {} orphan stage(s), {} in use",
        style("✓").green().bold(),
        report.deleted.len(),
        report.orphans.len(),
        report.retained.len()
    ));
    lines
}
