//! Staged applier
//!
//! Takes the unpacked backup (the staging root) and applies each planned
//! category to the destination root through its own policy. A safety
//! snapshot of every path about to change is taken first. PBS categories
//! write their files in plan order and defer management-API work to a
//! final phase that runs with the PBS daemon started.

pub mod access;
pub mod files;
pub mod mountguard;
pub mod pbs;
pub mod pve;

use crate::categories::{self, Category};
use crate::cluster;
use crate::error::{Error, NotCommitted, Result};
use crate::network;
use crate::plan::RestorePlan;
use crate::services::Services;
use files::ModePolicy;
use proxsafe_backup::{create_safety_backup, SafetyBackup};
use proxsafe_core::sys::join_under;
use proxsafe_core::Deps;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Result of applying one category
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "lowercase")]
pub enum Outcome {
    Applied,
    Skipped(String),
    Failed(String),
}

impl Outcome {
    pub fn skipped(reason: impl Into<String>) -> Self {
        Self::Skipped(reason.into())
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Applied => f.write_str("applied"),
            Self::Skipped(reason) => write!(f, "skipped ({})", reason),
            Self::Failed(message) => write!(f, "failed: {}", message),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CategoryReport {
    pub id: &'static str,
    pub outcome: Outcome,
    /// Extra remarks (fallbacks taken, files left alone)
    pub notes: Vec<String>,
}

impl CategoryReport {
    pub(crate) fn new(id: &'static str, outcome: Outcome) -> Self {
        Self {
            id,
            outcome,
            notes: Vec::new(),
        }
    }
}

/// What an apply run produced
#[derive(Debug, Default)]
pub struct ApplyResult {
    pub categories: Vec<CategoryReport>,
    pub safety_backup: Option<SafetyBackup>,
    /// Set when network changes were left uncommitted
    pub network: Option<NotCommitted>,
}

impl ApplyResult {
    fn report_mut(&mut self, id: &str) -> Option<&mut CategoryReport> {
        self.categories.iter_mut().find(|r| r.id == id)
    }
}

/// Everything a category policy needs
pub struct ApplyContext<'a> {
    pub deps: &'a Deps,
    pub cancel: &'a CancellationToken,
    pub staging: &'a Path,
    pub dest: &'a Path,
    pub plan: &'a RestorePlan,
}

impl<'a> ApplyContext<'a> {
    pub fn staged(&self, rel: &str) -> PathBuf {
        join_under(self.staging, Path::new(rel))
    }

    pub fn live(&self, rel: &str) -> PathBuf {
        join_under(self.dest, Path::new(rel))
    }

    pub fn services(&self) -> Services<'a> {
        Services::new(self.deps, self.cancel)
    }

    /// Read a staged file; `None` when it was not in the backup.
    pub fn read_staged(&self, rel: &str) -> Result<Option<String>> {
        let path = self.staged(rel);
        match self.deps.fs.read_to_string(&path) {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::path_io("Failed to read", &path, e)),
        }
    }

    /// Read a live file; empty when missing.
    pub fn read_live(&self, rel: &str) -> Result<String> {
        let path = self.live(rel);
        match self.deps.fs.read_to_string(&path) {
            Ok(text) => Ok(text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(Error::path_io("Failed to read", &path, e)),
        }
    }
}

/// Reason the live apply must not run, if any.
pub fn preflight(deps: &Deps, dest: &Path) -> Option<String> {
    if !deps.fs.is_system() {
        Some("filesystem is sandboxed".to_string())
    } else if deps.host.euid() != 0 {
        Some(format!("not running as root (euid {})", deps.host.euid()))
    } else if deps.config.dry_run {
        Some("dry run".to_string())
    } else if dest != Path::new("/") {
        Some(format!("destination {} is not /", dest.display()))
    } else {
        None
    }
}

/// Apply `plan` from `staging` onto `dest`. Skips everything when the
/// preflight conditions do not hold.
pub async fn apply_plan(
    deps: &Deps,
    cancel: &CancellationToken,
    plan: &RestorePlan,
    staging: &Path,
    dest: &Path,
) -> Result<ApplyResult> {
    if let Some(reason) = preflight(deps, dest) {
        info!("Live apply skipped: {}", reason);
        return Ok(ApplyResult {
            categories: plan
                .normal_categories
                .iter()
                .map(|c| CategoryReport::new(c.id, Outcome::skipped(reason.clone())))
                .collect(),
            ..ApplyResult::default()
        });
    }
    let ctx = ApplyContext {
        deps,
        cancel,
        staging,
        dest,
        plan,
    };
    apply_all(&ctx).await
}

/// Apply every normal category of the plan without the preflight checks.
pub(crate) async fn apply_all(ctx: &ApplyContext<'_>) -> Result<ApplyResult> {
    let mut result = ApplyResult::default();
    if ctx.plan.normal_categories.is_empty() {
        return Ok(result);
    }

    result.safety_backup = create_safety_backup(ctx.deps, ctx.dest, &ctx.plan.normal_patterns())?;
    if let Some(backup) = &result.safety_backup {
        ctx.deps.ui.println(&format!(
            "Safety backup of current files: {}",
            backup.archive.display()
        ));
    }

    let mut pending_api = Vec::new();
    let mut halted: Option<String> = None;

    for category in &ctx.plan.normal_categories {
        if let Some(reason) = &halted {
            result.categories.push(CategoryReport::new(category.id, Outcome::skipped(reason.clone())));
            continue;
        }
        if ctx.cancel.is_cancelled() {
            halted = Some("cancelled".to_string());
            result.categories.push(CategoryReport::new(category.id, Outcome::skipped("cancelled")));
            continue;
        }

        info!("Applying {}", category.id);
        let outcome = if category.id == categories::NETWORK {
            match network::apply_network(ctx).await {
                Ok(outcome) => outcome,
                Err(Error::NetworkApplyNotCommitted(diag)) => {
                    error!("Network changes not committed: {}", diag);
                    halted = Some("network changes not committed".to_string());
                    result.network = Some(*diag);
                    Outcome::Failed("not committed; rollback armed".to_string())
                }
                Err(e) if e.is_abort() => return Err(e),
                Err(e) => {
                    error!("Network apply failed: {}", e);
                    halted = Some("network apply failed".to_string());
                    Outcome::Failed(e.to_string())
                }
            }
        } else if category.kind == categories::CategoryType::Pbs {
            match pbs::apply_pbs_files(ctx, category) {
                Ok((outcome, deferred)) => {
                    pending_api.extend(deferred);
                    outcome
                }
                Err(e) => failed(category, e),
            }
        } else {
            match apply_category(ctx, category).await {
                Ok(outcome) => outcome,
                Err(e) if e.is_abort() => return Err(e),
                Err(e) => failed(category, e),
            }
        };
        result.categories.push(CategoryReport::new(category.id, outcome));
    }

    if halted.is_none() && ctx.plan.needs_pbs_services {
        for (id, outcome, note) in pbs::apply_pbs_api(ctx, &pending_api).await {
            if let Some(report) = result.report_mut(id) {
                merge_outcome(report, outcome, note);
            }
        }
    }

    Ok(result)
}

fn failed(category: &Category, e: Error) -> Outcome {
    warn!("Category {} failed: {}", category.id, e);
    Outcome::Failed(e.to_string())
}

/// Fold an API-phase outcome into the file-phase report.
fn merge_outcome(report: &mut CategoryReport, api: Outcome, note: Option<String>) {
    report.notes.extend(note);
    report.outcome = match (&report.outcome, api) {
        (Outcome::Failed(_), _) => return,
        (_, failed @ Outcome::Failed(_)) => failed,
        (_, Outcome::Applied) => Outcome::Applied,
        (Outcome::Applied, Outcome::Skipped(reason)) => {
            report.notes.push(reason);
            Outcome::Applied
        }
        (Outcome::Skipped(_), skipped) => skipped,
    };
}

/// Policies for non-network, non-PBS categories.
async fn apply_category(ctx: &ApplyContext<'_>, category: &'static Category) -> Result<Outcome> {
    let plan = ctx.plan;
    match category.id {
        categories::FILESYSTEM => network::fstab::apply_fstab(ctx).await,
        categories::PVE_CLUSTER => cluster::recover_cluster(ctx).await,
        categories::PVE_HOST => copy_category(ctx, category, ModePolicy::Config),
        categories::STORAGE_PVE => pve::apply_storage(ctx).await,
        categories::PVE_JOBS if plan.needs_cluster_restore => Ok(owned_by_cluster()),
        categories::PVE_JOBS => pve::apply_jobs(ctx).await,
        categories::PVE_ACCESS_CONTROL if plan.needs_cluster_restore => Ok(owned_by_cluster()),
        categories::PVE_ACCESS_CONTROL => {
            let written = access::apply_pve_access(ctx.deps, ctx.staging, ctx.dest)?;
            Ok(if written.is_empty() {
                Outcome::skipped("nothing staged")
            } else {
                Outcome::Applied
            })
        }
        categories::PVE_FIREWALL if plan.needs_cluster_restore => Ok(owned_by_cluster()),
        categories::PVE_FIREWALL => pve::apply_firewall(ctx),
        _ => copy_category(ctx, category, ModePolicy::Keep),
    }
}

fn owned_by_cluster() -> Outcome {
    Outcome::skipped("restored with the cluster database")
}

/// Plain staged-file copy of a category.
pub(crate) fn copy_category(ctx: &ApplyContext<'_>, category: &Category, policy: ModePolicy) -> Result<Outcome> {
    let copied = files::copy_patterns(ctx.deps, ctx.staging, ctx.dest, &category.patterns(), policy)?;
    if copied.is_empty() {
        return Ok(Outcome::skipped("nothing staged"));
    }
    info!("{}: {} file(s) restored", category.id, copied.len());
    Ok(Outcome::Applied)
}
