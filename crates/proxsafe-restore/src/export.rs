//! Export-only categories
//!
//! Categories that must not be applied live (and `pve_cluster` in SAFE
//! mode) are copied out of the staging root into a timestamped export
//! directory for the operator to inspect or apply by hand.

use crate::apply::files::{copy_staged_to, staged_files, ModePolicy};
use crate::categories::patterns_of;
use crate::error::Result;
use crate::plan::RestorePlan;
use proxsafe_core::sys::{ensure_dir_all_inherit, join_under, DIR_MODE};
use proxsafe_core::Deps;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportResult {
    pub dir: PathBuf,
    pub files: Vec<PathBuf>,
}

/// Copy every export-only category out of `staging`. `None` when the plan
/// has nothing to export.
pub fn export_categories(deps: &Deps, plan: &RestorePlan, staging: &Path) -> Result<Option<ExportResult>> {
    if plan.export_categories.is_empty() {
        return Ok(None);
    }
    let patterns = patterns_of(plan.export_categories.iter());
    let files = staged_files(deps, staging, &patterns)?;

    let dir = deps
        .config
        .export_dir
        .as_std_path()
        .join(format!("proxmox-config-export-{}", deps.clock.stamp()));
    ensure_dir_all_inherit(deps.fs.as_ref(), deps.host.as_ref(), &dir, DIR_MODE)?;

    for rel in &files {
        copy_staged_to(deps, &join_under(staging, rel), &join_under(&dir, rel), ModePolicy::Keep)?;
    }
    info!("Exported {} file(s) to {}", files.len(), dir.display());
    deps.ui.println(&format!("Export-only configuration written to {}", dir.display()));
    Ok(Some(ExportResult { dir, files }))
}
