//! PVE cluster RECOVERY
//!
//! The cluster filesystem (`/etc/pve`) is backed by an SQLite database
//! owned by `pve-cluster`. Recovery swaps that database for the staged one
//! while the service is down, then brings the service back and waits for
//! it to report active.

use crate::apply::files::{copy_patterns, ModePolicy};
use crate::apply::{ApplyContext, Outcome};
use crate::error::{Error, Result};
use crate::services::PVE_CLUSTER_UNIT;
use proxsafe_core::sys::{write_file_atomic, PRIVATE_MODE};
use tracing::{info, warn};

pub const CONFIG_DB: &str = "var/lib/pve-cluster/config.db";
const DB_SIDECARS: &[&str] = &["var/lib/pve-cluster/config.db-wal", "var/lib/pve-cluster/config.db-shm"];
const COROSYNC_DIR: &str = "etc/corosync/";
const COROSYNC_CONF: &str = "etc/corosync/corosync.conf";
const COROSYNC_UNIT: &str = "corosync.service";

/// Restore the cluster database in place. `pve-cluster` ends up started
/// again even when writing the database fails.
pub async fn recover_cluster(ctx: &ApplyContext<'_>) -> Result<Outcome> {
    let fs = ctx.deps.fs.as_ref();
    let staged_db = ctx.staged(CONFIG_DB);
    if !fs.exists(&staged_db) {
        return Ok(Outcome::skipped("no cluster database in backup"));
    }
    let data = fs
        .read(&staged_db)
        .map_err(|e| Error::path_io("Failed to read", &staged_db, e))?;

    let services = ctx.services();
    ctx.deps.ui.println("Entering cluster recovery: stopping pve-cluster");
    if let Err(e) = services.stop(COROSYNC_UNIT).await {
        warn!("Could not stop corosync: {}", e);
    }
    services.stop(PVE_CLUSTER_UNIT).await?;

    let written = write_database(ctx, &data).and_then(|_| {
        copy_patterns(
            ctx.deps,
            ctx.staging,
            ctx.dest,
            &[COROSYNC_DIR.to_string()],
            ModePolicy::Config,
        )
    });

    services.reset_failed(PVE_CLUSTER_UNIT).await;
    let started = services.start_and_wait(PVE_CLUSTER_UNIT).await;

    let corosync = written?;
    started?;
    info!("Cluster database restored ({} bytes)", data.len());

    if corosync.iter().any(|p| p.as_path() == std::path::Path::new(COROSYNC_CONF)) {
        if let Err(e) = services.start_and_wait(COROSYNC_UNIT).await {
            warn!("corosync did not come up: {}", e);
            ctx.deps.ui.warn(&format!("corosync did not start: {}", e));
        }
    }
    Ok(Outcome::Applied)
}

fn write_database(ctx: &ApplyContext<'_>, data: &[u8]) -> Result<()> {
    let fs = ctx.deps.fs.as_ref();
    for rel in DB_SIDECARS {
        let path = ctx.live(rel);
        if fs.exists(&path) {
            fs.remove_file(&path)
                .map_err(|e| Error::path_io("Failed to remove", &path, e))?;
        }
    }
    write_file_atomic(fs, ctx.deps.host.as_ref(), &ctx.live(CONFIG_DB), data, PRIVATE_MODE)?;
    Ok(())
}
