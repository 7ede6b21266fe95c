//! Restore plan
//!
//! A pure value computed from the manifest, the operator's selection and the
//! detected system. Nothing here touches the host.

use crate::categories::{self, Category, PVE_CLUSTER};
use proxsafe_backup::{Manifest, SystemType};
use proxsafe_core::config::PbsBehaviorOverride;
use serde::Serialize;
use std::fmt;

/// How categories were chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RestoreMode {
    Full,
    Custom,
}

impl fmt::Display for RestoreMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Full => "full",
            Self::Custom => "custom",
        })
    }
}

/// How PBS configuration is brought back
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PbsBehavior {
    /// Replace wholesale; API preferred, file fallback
    Clean,
    /// Additive, API only
    Merge,
}

impl fmt::Display for PbsBehavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Clean => "clean",
            Self::Merge => "merge",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RestorePlan {
    pub mode: RestoreMode,
    pub system_type: SystemType,
    /// Applied to live paths, in apply order
    pub normal_categories: Vec<&'static Category>,
    /// Copied to the export directory only
    pub export_categories: Vec<&'static Category>,
    pub cluster_safe_mode: bool,
    pub needs_cluster_restore: bool,
    pub needs_pbs_services: bool,
    pub cluster_backup: bool,
    pub pbs_behavior: PbsBehavior,
}

fn sort_dedup(categories: &mut Vec<&'static Category>) {
    categories.sort_by_key(|c| categories::order_of(c.id));
    categories.dedup_by_key(|c| c.id);
}

impl RestorePlan {
    /// Build a plan. Selected categories are deduplicated and put in
    /// catalog order.
    pub fn build(
        manifest: &Manifest,
        mode: RestoreMode,
        selected: &[&'static Category],
        system_type: SystemType,
        behavior_override: Option<PbsBehaviorOverride>,
    ) -> Self {
        let pbs_behavior = match (behavior_override, mode) {
            (Some(PbsBehaviorOverride::Clean), _) => PbsBehavior::Clean,
            (Some(PbsBehaviorOverride::Merge), _) => PbsBehavior::Merge,
            (None, RestoreMode::Full) => PbsBehavior::Clean,
            (None, RestoreMode::Custom) => PbsBehavior::Merge,
        };

        let mut plan = Self {
            mode,
            system_type,
            normal_categories: selected.to_vec(),
            export_categories: Vec::new(),
            cluster_safe_mode: false,
            needs_cluster_restore: false,
            needs_pbs_services: false,
            cluster_backup: manifest.is_cluster_backup(),
            pbs_behavior,
        };
        plan.resplit();
        plan
    }

    /// Move `pve_cluster` between the normal and export lists. Idempotent;
    /// enabling then disabling restores the original partition.
    pub fn apply_cluster_safe_mode(&mut self, enable: bool) {
        self.cluster_safe_mode = enable;
        self.resplit();
    }

    fn resplit(&mut self) {
        let mut all: Vec<&'static Category> = self
            .normal_categories
            .drain(..)
            .chain(self.export_categories.drain(..))
            .collect();
        sort_dedup(&mut all);

        let safe = self.cluster_safe_mode;
        let (export, normal): (Vec<_>, Vec<_>) = all
            .into_iter()
            .partition(|c| c.export_only || (safe && c.id == PVE_CLUSTER));
        self.normal_categories = normal;
        self.export_categories = export;
        self.recompute();
    }

    fn recompute(&mut self) {
        self.needs_cluster_restore = self.system_type == SystemType::Pve
            && self.has_normal(PVE_CLUSTER)
            && !self.cluster_safe_mode;
        self.needs_pbs_services = self.system_type == SystemType::Pbs
            && self.normal_categories.iter().any(|c| c.stops_pbs_services);
    }

    pub fn has_normal(&self, id: &str) -> bool {
        self.normal_categories.iter().any(|c| c.id == id)
    }

    pub fn has_export(&self, id: &str) -> bool {
        self.export_categories.iter().any(|c| c.id == id)
    }

    pub fn is_empty(&self) -> bool {
        self.normal_categories.is_empty() && self.export_categories.is_empty()
    }

    /// Patterns of every planned category, used to limit staging.
    pub fn all_patterns(&self) -> Vec<String> {
        categories::patterns_of(self.normal_categories.iter().chain(self.export_categories.iter()))
    }

    /// Patterns of categories applied to live paths.
    pub fn normal_patterns(&self) -> Vec<String> {
        categories::patterns_of(self.normal_categories.iter())
    }

    /// Human readable summary lines
    pub fn summary(&self) -> Vec<String> {
        let ids = |list: &[&'static Category]| {
            if list.is_empty() {
                "-".to_string()
            } else {
                list.iter().map(|c| c.id).collect::<Vec<_>>().join(", ")
            }
        };
        let mut lines = vec![
            format!("Mode: {}", self.mode),
            format!("System: {}", self.system_type),
            format!("Restore: {}", ids(&self.normal_categories)),
            format!("Export only: {}", ids(&self.export_categories)),
        ];
        if self.system_type == SystemType::Pve && (self.has_normal(PVE_CLUSTER) || self.has_export(PVE_CLUSTER)) {
            lines.push(format!(
                "Cluster: {}",
                if self.needs_cluster_restore { "RECOVERY (config.db restored in place)" } else { "SAFE (exported only)" }
            ));
        }
        if self.system_type == SystemType::Pbs {
            lines.push(format!("PBS behavior: {}", self.pbs_behavior));
        }
        lines
    }
}
