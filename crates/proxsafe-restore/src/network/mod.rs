//! Network safety envelope
//!
//! Network files are never applied bare. The sequence is: snapshot the
//! management interface address, save the current files and arm the
//! deadman rollback, write the staged files, remap NIC names, reload, then
//! ask the operator to type the commit phrase. Anything short of that
//! phrase leaves the rollback armed and surfaces
//! [`Error::NetworkApplyNotCommitted`].

pub mod fstab;
pub mod mgmt;
pub mod nic;
pub mod rollback;

use crate::apply::files::{copy_staged, staged_files, ModePolicy};
use crate::apply::{ApplyContext, Outcome};
use crate::categories;
use crate::error::{Error, NotCommitted, Result};
use proxsafe_core::sys::join_under;
use proxsafe_core::ui::confirm;
use rollback::RollbackHandle;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Relative paths of the network category present in the staging root or
/// on the live system.
fn network_files(ctx: &ApplyContext<'_>, patterns: &[String]) -> Result<(Vec<PathBuf>, Vec<PathBuf>)> {
    let staged = staged_files(ctx.deps, ctx.staging, patterns)?;
    let live = staged_files(ctx.deps, ctx.dest, patterns)?;
    let all: BTreeSet<PathBuf> = staged.iter().chain(live.iter()).cloned().collect();
    Ok((staged, all.into_iter().collect()))
}

/// `network` category
pub async fn apply_network(ctx: &ApplyContext<'_>) -> Result<Outcome> {
    let deps = ctx.deps;
    let cancel = ctx.cancel;
    let config = &deps.config.network;
    let Some(category) = categories::find(categories::NETWORK) else {
        return Ok(Outcome::skipped("unknown category"));
    };

    let (staged, touched) = network_files(ctx, &category.patterns())?;
    if staged.is_empty() {
        return Ok(Outcome::skipped("nothing staged"));
    }

    let interface = mgmt::detect_interface(deps, cancel).await;
    let before = mgmt::snapshot_addresses(deps, cancel).await;
    let pre_ip = interface.as_deref().and_then(|i| mgmt::address_of(&before, i));
    if let Some(iface) = &interface {
        info!("Management interface {} ({})", iface, pre_ip.as_deref().unwrap_or("no address"));
    }

    let workdir = rollback::create_workdir(deps)?;
    let live_paths: Vec<PathBuf> = touched.iter().map(|rel| join_under(ctx.dest, rel)).collect();
    let entries = rollback::save_originals(deps, &workdir, &live_paths)?;
    let reload_line = mgmt::reload_command(deps)
        .map(|(program, argv)| std::iter::once(program).chain(argv.iter().copied()).collect::<Vec<_>>().join(" "))
        .unwrap_or_default();
    let handle = rollback::arm(
        deps,
        cancel,
        &workdir,
        &entries,
        &reload_line,
        deps.config.rollback_timeout(),
    )
    .await?;
    deps.ui.println(&format!(
        "Network rollback armed: previous configuration returns at {} unless committed",
        handle.deadline.format("%H:%M:%S UTC")
    ));

    for rel in &staged {
        copy_staged(deps, ctx.staging, ctx.dest, rel, ModePolicy::Keep)?;
    }
    remap_interfaces(ctx, &workdir).await?;

    if let Err(e) = mgmt::reload(deps, cancel).await {
        warn!("Network reload failed: {}", e);
        deps.ui.warn(&format!("network reload failed: {}", e));
    }

    let post_ip = match &interface {
        Some(iface) => mgmt::address_of(&mgmt::snapshot_addresses(deps, cancel).await, iface),
        None => None,
    };
    if let Some(iface) = &interface {
        deps.ui.println(&format!(
            "{}: {} -> {}",
            iface,
            pre_ip.as_deref().unwrap_or("?"),
            post_ip.as_deref().unwrap_or("?")
        ));
    }

    let prompt = format!(
        "Type {} within {}s to keep the new network configuration: ",
        config.commit_phrase,
        deps.config.commit_window().as_secs()
    );
    let answer = deps
        .ui
        .read_line_timeout(cancel, &prompt, deps.config.commit_window())
        .await;
    let committed = match answer {
        Ok(Some(line)) => line.trim() == config.commit_phrase,
        Ok(None) => false,
        Err(e) => {
            warn!("Commit prompt ended: {}", e);
            false
        }
    };

    if committed {
        handle.disarm(deps, cancel).await?;
        deps.ui.println("Network configuration committed");
        return Ok(Outcome::Applied);
    }
    Err(not_committed(&handle, interface, pre_ip, post_ip))
}

fn not_committed(
    handle: &RollbackHandle,
    interface: Option<String>,
    pre_ip: Option<String>,
    post_ip: Option<String>,
) -> Error {
    Error::NetworkApplyNotCommitted(Box::new(NotCommitted {
        marker: handle.marker.clone(),
        log: handle.log.clone(),
        deadline: handle.deadline,
        interface,
        pre_ip,
        post_ip,
    }))
}

/// Offer the NIC rename mapping derived from the backup's inventory.
async fn remap_interfaces(ctx: &ApplyContext<'_>, workdir: &Path) -> Result<()> {
    let deps = ctx.deps;
    let ui = deps.ui.as_ref();
    let Some(text) = ctx.read_staged(nic::INVENTORY_PATH)? else {
        return Ok(());
    };
    let inventory = match nic::NicInventory::parse(&text) {
        Ok(inv) => inv,
        Err(e) => {
            warn!("Ignoring unreadable NIC inventory: {}", e);
            return Ok(());
        }
    };
    let current = nic::read_current(deps, ctx.cancel).await?;
    let mapping = nic::compute_mapping(&inventory.interfaces, &current);
    if mapping.is_empty() {
        return Ok(());
    }

    let overrides = nic::persistent_overrides(deps, ctx.dest);
    if !overrides.is_empty() {
        ui.warn("Persistent NIC naming rules are present:");
        for path in &overrides {
            ui.println(&format!("  {}", path.display()));
        }
        if !confirm(ui, ctx.cancel, "Apply the NIC rename mapping anyway?", false).await? {
            info!("NIC rename skipped because of persistent naming rules");
            return Ok(());
        }
    }

    ui.println("Interface renames:");
    for rename in &mapping.renames {
        ui.println(&format!("  {}", rename));
    }
    let question = if mapping.conflicts.is_empty() {
        "Rewrite network configuration with these names?"
    } else {
        ui.warn("Conflicting matches excluded:");
        for conflict in &mapping.conflicts {
            ui.println(&format!("  {}", conflict));
        }
        "Apply the conflict-free renames?"
    };
    if mapping.renames.is_empty() {
        return Ok(());
    }
    if confirm(ui, ctx.cancel, question, mapping.conflicts.is_empty()).await? {
        let changed = nic::apply_renames(deps, ctx.dest, workdir, &mapping.renames)?;
        info!("NIC rename applied to {} file(s)", changed.len());
    }
    Ok(())
}
