//! Restore session
//!
//! Drives one interactive restore from candidate selection to the final
//! report. Every question goes through the [`RestorePrompter`]; the host's
//! product comes from the [`SystemDetector`].

use crate::apply::{apply_plan, CategoryReport};
use crate::categories::{self, PVE_CLUSTER};
use crate::error::{Error, NotCommitted, Result};
use crate::export::export_categories;
use crate::network::nic::INVENTORY_PATH;
use crate::plan::{RestoreMode, RestorePlan};
use crate::prompter::{RestorePrompter, UiPrompter};
use crate::system::{FsDetector, SystemDetector};
use proxsafe_backup::{
    prepare_candidate, select_candidate, unpack_archive, Compression, Manifest, PathSelector, StagedBundle,
    SystemType,
};
use proxsafe_core::ui::select_menu;
use proxsafe_core::Deps;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// What a restore session did
#[derive(Debug, Clone, Serialize)]
pub struct RestoreReport {
    pub plan: RestorePlan,
    pub categories: Vec<CategoryReport>,
    pub safety_backup: Option<PathBuf>,
    pub export_dir: Option<PathBuf>,
    /// Set when network changes were left uncommitted
    pub network: Option<NotCommitted>,
    pub dry_run: bool,
}

impl RestoreReport {
    fn planned(plan: RestorePlan, dry_run: bool) -> Self {
        Self {
            plan,
            categories: Vec::new(),
            safety_backup: None,
            export_dir: None,
            network: None,
            dry_run,
        }
    }

    pub fn has_failures(&self) -> bool {
        self.network.is_some() || self.categories.iter().any(|c| c.outcome.is_failed())
    }
}

pub struct RestoreSession<'a> {
    deps: &'a Deps,
    prompter: Arc<dyn RestorePrompter>,
    detector: Arc<dyn SystemDetector>,
    dest: PathBuf,
    tool_version: String,
}

impl<'a> RestoreSession<'a> {
    pub fn new(deps: &'a Deps, tool_version: impl Into<String>) -> Self {
        Self {
            deps,
            prompter: Arc::new(UiPrompter::new(deps.ui.clone())),
            detector: Arc::new(FsDetector::new(deps.fs.clone())),
            dest: PathBuf::from("/"),
            tool_version: tool_version.into(),
        }
    }

    pub fn with_prompter(mut self, prompter: Arc<dyn RestorePrompter>) -> Self {
        self.prompter = prompter;
        self
    }

    pub fn with_detector(mut self, detector: Arc<dyn SystemDetector>) -> Self {
        self.detector = detector;
        self
    }

    pub fn with_dest(mut self, dest: impl Into<PathBuf>) -> Self {
        self.dest = dest.into();
        self
    }

    /// Run the whole session. The scratch directory is removed on every
    /// path out.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<RestoreReport> {
        let deps = self.deps;

        info!("Stage 1/4: Cleaning up orphaned scratch directories");
        match deps.registry().cleanup_orphaned(deps.config.tempdir_ttl()) {
            Ok(summary) if !summary.removed.is_empty() => {
                info!("Removed {} orphaned scratch director(ies)", summary.removed.len())
            }
            Ok(_) => {}
            Err(e) => warn!("Scratch cleanup failed: {}", e),
        }

        info!("Stage 2/4: Selecting and preparing a backup");
        let candidate = select_candidate(deps, cancel, false).await?;
        let mut staged = prepare_candidate(deps, cancel, &candidate, Some(&self.tool_version)).await?;

        let result = self.restore_staged(cancel, &staged).await;
        if let Err(e) = staged.cleanup() {
            warn!("Failed to clean up {}: {}", staged.scratch.display(), e);
        }
        result
    }

    /// Plan, confirm, stage and apply an already prepared bundle.
    pub async fn restore_staged(&self, cancel: &CancellationToken, staged: &StagedBundle) -> Result<RestoreReport> {
        let deps = self.deps;
        let ui = deps.ui.as_ref();

        info!("Stage 3/4: Planning");
        let plan = self.plan_restore(cancel, &staged.manifest).await?;
        if plan.is_empty() {
            ui.println("Nothing selected to restore");
            return Ok(RestoreReport::planned(plan, deps.config.dry_run));
        }

        if deps.config.dry_run {
            ui.println("Restore plan:");
            for line in plan.summary() {
                ui.println(&format!("  {}", line));
            }
            ui.println("Dry run: stopping before any change");
            return Ok(RestoreReport::planned(plan, true));
        }
        if !self.prompter.confirm_restore(cancel, &plan).await? {
            return Err(Error::Aborted);
        }

        info!("Stage 4/4: Staging and applying");
        let staging = staged.scratch.join("stage");
        stage_archive(deps, staged, &plan, &staging)?;

        let export = export_categories(deps, &plan, &staging)?;
        let applied = apply_plan(deps, cancel, &plan, &staging, &self.dest).await?;

        Ok(RestoreReport {
            plan,
            categories: applied.categories,
            safety_backup: applied.safety_backup.map(|b| b.archive),
            export_dir: export.map(|e| e.dir),
            network: applied.network,
            dry_run: false,
        })
    }

    /// Ask the operator for mode, categories and (for a PVE cluster restore)
    /// RECOVERY or SAFE, and build the plan.
    pub async fn plan_restore(&self, cancel: &CancellationToken, manifest: &Manifest) -> Result<RestorePlan> {
        let deps = self.deps;
        let detected = self.detector.detect();
        let backup_type = if manifest.targets().contains(&detected) {
            detected
        } else {
            manifest.system_type()
        };
        info!("Backup type {}, host type {}", backup_type, detected);

        let (available, mismatch) = categories::offered(backup_type, detected);
        if mismatch {
            deps.ui.warn(&format!(
                "Backup was taken on {} but this host runs {}; only common categories are offered",
                backup_type, detected
            ));
        }

        let mode = self.prompter.restore_mode(cancel).await?;
        let selected = match mode {
            RestoreMode::Full => available,
            RestoreMode::Custom => self.prompter.select_categories(cancel, &available).await?,
        };
        let mut plan = RestorePlan::build(manifest, mode, &selected, detected, deps.config.pbs_behavior);

        if detected == SystemType::Pve && plan.has_normal(PVE_CLUSTER) {
            let items = vec![
                "RECOVERY: restore the cluster database in place".to_string(),
                "SAFE: export cluster configuration without touching the live cluster".to_string(),
            ];
            let choice = select_menu(deps.ui.as_ref(), cancel, "Cluster restore mode:", &items)
                .await
                .map_err(|e| if e.is_abort() { Error::Aborted } else { e.into() })?;
            plan.apply_cluster_safe_mode(choice == 1);
        }
        Ok(plan)
    }
}

/// Unpack the inner archive into `staging`, limited to what the plan needs.
pub fn stage_archive(deps: &Deps, staged: &StagedBundle, plan: &RestorePlan, staging: &Path) -> Result<Vec<PathBuf>> {
    let mut patterns = plan.all_patterns();
    if plan.has_normal(categories::NETWORK) {
        patterns.push(INVENTORY_PATH.to_string());
    }
    let selector = PathSelector::new(&patterns)?;
    let compression = Compression::detect(&staged.manifest.compression_type, &staged.archive_name())?;
    let written = unpack_archive(deps.fs.as_ref(), &staged.archive, compression, staging, &selector)?;
    info!("Staged {} entries from {}", written.len(), staged.archive_name());
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::categories::{CategoryType, NETWORK, SSH};
    use crate::system::FixedSystem;
    use proxsafe_core::testing::TestDeps;

    fn session(t: &TestDeps, system: SystemType) -> RestoreSession<'_> {
        RestoreSession::new(&t.deps, "test").with_detector(Arc::new(FixedSystem(system)))
    }

    fn manifest(json: &str) -> Manifest {
        Manifest::from_json(json).unwrap()
    }

    #[tokio::test]
    async fn test_full_restore_with_safe_cluster_mode() {
        let t = TestDeps::new();
        t.answers(["1", "2"]);
        let plan = session(&t, SystemType::Pve)
            .plan_restore(&CancellationToken::new(), &manifest(r#"{"ProxmoxType":"pve"}"#))
            .await
            .unwrap();

        assert_eq!(plan.mode, RestoreMode::Full);
        assert!(plan.has_export(PVE_CLUSTER));
        assert!(!plan.has_normal(PVE_CLUSTER));
        assert!(!plan.needs_cluster_restore);
        assert!(plan.has_normal(NETWORK));
        assert_eq!(t.ui.prompts().len(), 2);
    }

    #[tokio::test]
    async fn test_recovery_mode_keeps_cluster_live() {
        let t = TestDeps::new();
        t.answers(["1", "1"]);
        let plan = session(&t, SystemType::Pve)
            .plan_restore(&CancellationToken::new(), &manifest(r#"{"ProxmoxType":"pve"}"#))
            .await
            .unwrap();
        assert!(plan.needs_cluster_restore);
    }

    #[tokio::test]
    async fn test_mismatch_offers_common_categories_only() {
        let t = TestDeps::new();
        t.answers(["1"]);
        let plan = session(&t, SystemType::Pve)
            .plan_restore(&CancellationToken::new(), &manifest(r#"{"ProxmoxType":"pbs"}"#))
            .await
            .unwrap();

        assert!(plan
            .normal_categories
            .iter()
            .chain(plan.export_categories.iter())
            .all(|c| c.kind == CategoryType::Common));
        assert!(t.ui.output().iter().any(|l| l.contains("WARNING") && l.contains("pbs")));
    }

    #[tokio::test]
    async fn test_multi_target_backup_matches_host() {
        let t = TestDeps::new();
        t.answers(["1"]);
        let plan = session(&t, SystemType::Pbs)
            .plan_restore(
                &CancellationToken::new(),
                &manifest(r#"{"ProxmoxType":"pve","ProxmoxTargets":["pve","pbs"]}"#),
            )
            .await
            .unwrap();
        assert!(plan.normal_categories.iter().any(|c| c.kind == CategoryType::Pbs));
        assert!(!t.ui.output().iter().any(|l| l.contains("WARNING")));
    }

    #[tokio::test]
    async fn test_custom_selection() {
        let t = TestDeps::new();
        t.answers(["2", "3"]);
        let plan = session(&t, SystemType::Pve)
            .plan_restore(&CancellationToken::new(), &manifest(r#"{"ProxmoxType":"pve"}"#))
            .await
            .unwrap();
        assert_eq!(plan.mode, RestoreMode::Custom);
        assert_eq!(plan.normal_categories.iter().map(|c| c.id).collect::<Vec<_>>(), vec![SSH]);
    }

    #[test]
    fn test_report_failures() {
        let plan = RestorePlan::build(&Manifest::default(), RestoreMode::Full, &[], SystemType::Pve, None);
        let mut report = RestoreReport::planned(plan, false);
        assert!(!report.has_failures());
        report
            .categories
            .push(CategoryReport::new(SSH, crate::apply::Outcome::Failed("boom".into())));
        assert!(report.has_failures());
    }
}
