//! Restore command
//!
//! Connects the CLI to the proxsafe-restore session.

use anyhow::{anyhow, Context, Result};
use camino::Utf8Path;
use proxsafe_core::Deps;
use proxsafe_restore::RestoreSession;
use tokio_util::sync::CancellationToken;

use super::load_config;
use crate::cli::RestoreArgs;
use crate::output;
use crate::version::VersionInfo;

pub async fn run(args: RestoreArgs, config: Option<&Utf8Path>, cancel: &CancellationToken) -> Result<()> {
    let mut config = load_config(config)?;
    if args.dry_run {
        config.dry_run = true;
    }

    output::header("Restore Proxmox Configuration");
    output::kv("Primary backups", config.backup_path.as_str());
    if let Some(secondary) = config.secondary() {
        output::kv("Secondary backups", secondary.as_str());
    }
    if let Some(cloud) = config.cloud() {
        output::kv("Cloud source", cloud);
    }
    if config.dry_run {
        output::warning("DRY RUN MODE - nothing on this host will be changed");
    }
    println!();

    let deps = Deps::system(config);
    let report = match RestoreSession::new(&deps, VersionInfo::current().stamp()).run(cancel).await {
        Ok(report) => report,
        Err(e) if e.is_abort() => return Err(anyhow!("Restore aborted")),
        Err(e) => return Err(e).context("Restore failed"),
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        output::print_report(&report);
    }

    if report.network.is_some() {
        return Err(anyhow!("Network configuration was not committed"));
    }
    if report.has_failures() {
        return Err(anyhow!("Some categories failed to restore"));
    }
    if !report.dry_run {
        output::success("Restore finished");
    }
    Ok(())
}
