//! PBS category policies
//!
//! The file phase copies or merges files and never runs a command. Files
//! that PBS manages through `proxmox-backup-manager` are deferred to the
//! API phase, which starts the PBS daemon first. In clean mode an
//! unavailable API falls back to writing the files; in merge mode those
//! files are left alone.

use super::files::{copy_staged, staged_files, write_dest, ModePolicy};
use super::{access, ApplyContext, Outcome};
use crate::categories::{self, Category};
use crate::error::Result;
use crate::plan::PbsBehavior;
use crate::section_config::SectionConfig;
use crate::services::{PBS_DAEMON, PBS_PROXY};
use proxsafe_core::sys::{args, CONFIG_MODE};
use std::path::Path;
use tracing::{debug, info, warn};

const MANAGER: &str = "proxmox-backup-manager";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ApiShape {
    /// Section config, one object per section
    Sections,
    /// `key: value` lines applied with `node update`
    Properties,
}

/// A file owned by the management API
#[derive(Debug, PartialEq, Eq)]
pub struct ApiFile {
    pub rel: &'static str,
    pub category: &'static str,
    noun: &'static [&'static str],
    shape: ApiShape,
    /// Properties that cannot be changed after creation
    fixed: &'static [&'static str],
    /// Properties passed positionally on create
    positional: &'static [&'static str],
}

/// API-managed files in apply order
pub static API_FILES: &[ApiFile] = &[
    ApiFile {
        rel: "etc/proxmox-backup/node.cfg",
        category: categories::PBS_NODE,
        noun: &["node"],
        shape: ApiShape::Properties,
        fixed: &[],
        positional: &[],
    },
    ApiFile {
        rel: "etc/proxmox-backup/s3.cfg",
        category: categories::PBS_DATASTORE,
        noun: &["s3", "endpoint"],
        shape: ApiShape::Sections,
        fixed: &[],
        positional: &[],
    },
    ApiFile {
        rel: "etc/proxmox-backup/datastore.cfg",
        category: categories::PBS_DATASTORE,
        noun: &["datastore"],
        shape: ApiShape::Sections,
        fixed: &["path", "backend"],
        positional: &["path"],
    },
    ApiFile {
        rel: "etc/proxmox-backup/remote.cfg",
        category: categories::PBS_REMOTES,
        noun: &["remote"],
        shape: ApiShape::Sections,
        fixed: &[],
        positional: &[],
    },
    ApiFile {
        rel: "etc/proxmox-backup/sync.cfg",
        category: categories::PBS_JOBS,
        noun: &["sync-job"],
        shape: ApiShape::Sections,
        fixed: &[],
        positional: &[],
    },
];

pub fn api_file(rel: &Path) -> Option<&'static ApiFile> {
    API_FILES.iter().find(|f| Path::new(f.rel) == rel)
}

/// File phase of one PBS category. Returns the file outcome and the API
/// files left for the API phase. Runs no commands.
pub fn apply_pbs_files(
    ctx: &ApplyContext<'_>,
    category: &'static Category,
) -> Result<(Outcome, Vec<&'static ApiFile>)> {
    if category.id == categories::PBS_ACCESS_CONTROL {
        let written = access::apply_pbs_access(ctx.deps, ctx.staging, ctx.dest)?;
        let outcome = if written.is_empty() {
            Outcome::skipped("nothing staged")
        } else {
            Outcome::Applied
        };
        return Ok((outcome, Vec::new()));
    }

    let mut copied = 0usize;
    let mut deferred = Vec::new();
    for rel in staged_files(ctx.deps, ctx.staging, &category.patterns())? {
        if let Some(api) = api_file(&rel) {
            debug!("{} deferred to the API phase", rel.display());
            deferred.push(api);
            continue;
        }
        copy_staged(ctx.deps, ctx.staging, ctx.dest, &rel, ModePolicy::Config)?;
        copied += 1;
    }

    let outcome = if copied > 0 {
        info!("{}: {} file(s) restored", category.id, copied);
        Outcome::Applied
    } else if deferred.is_empty() {
        Outcome::skipped("nothing staged")
    } else {
        Outcome::skipped("waiting for API phase")
    };
    Ok((outcome, deferred))
}

/// Write an API file directly, as the clean-mode fallback.
fn write_file(ctx: &ApplyContext<'_>, api: &ApiFile) -> Result<()> {
    let data = ctx.read_staged(api.rel)?.unwrap_or_default();
    write_dest(ctx.deps, &ctx.live(api.rel), data.as_bytes(), CONFIG_MODE)
}

async fn manager(ctx: &ApplyContext<'_>, argv: Vec<String>) -> std::result::Result<(), String> {
    match ctx.deps.cmd.run(ctx.cancel, MANAGER, &argv).await {
        Ok(out) if out.success() => Ok(()),
        Ok(out) => Err(format!("{} {}: {}", MANAGER, argv.join(" "), out.output.trim())),
        Err(e) => Err(e.to_string()),
    }
}

fn noun_args(api: &ApiFile, verb: &str, id: Option<&str>) -> Vec<String> {
    let mut argv = args(api.noun);
    argv.push(verb.to_string());
    argv.extend(id.map(str::to_string));
    argv
}

/// `key: value` property files (node.cfg)
fn parse_properties(text: &str) -> Vec<(String, String)> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .filter_map(|l| l.split_once(':'))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

/// Push one file through the API. Returns the errors hit.
async fn apply_via_api(ctx: &ApplyContext<'_>, api: &ApiFile, strict: bool) -> Result<Vec<String>> {
    let staged = ctx.read_staged(api.rel)?.unwrap_or_default();
    let mut errors = Vec::new();

    if api.shape == ApiShape::Properties {
        let mut argv = noun_args(api, "update", None);
        for (key, value) in parse_properties(&staged) {
            argv.push(format!("--{}", key));
            argv.push(value);
        }
        if let Err(e) = manager(ctx, argv).await {
            errors.push(e);
        }
        return Ok(errors);
    }

    let staged = SectionConfig::parse(&staged);
    let live = SectionConfig::parse(&ctx.read_live(api.rel)?);

    for section in &staged.sections {
        let argv = if live.find(&section.id).is_some() {
            let mut argv = noun_args(api, "update", Some(section.id.as_str()));
            argv.extend(section.to_cli_args(api.fixed));
            argv
        } else {
            let mut argv = noun_args(api, "create", Some(section.id.as_str()));
            for key in api.positional {
                argv.extend(section.get(key).map(str::to_string));
            }
            argv.extend(section.to_cli_args(api.positional));
            argv
        };
        if let Err(e) = manager(ctx, argv).await {
            errors.push(e);
        }
    }

    if strict {
        for id in live.ids() {
            if staged.find(id).is_none() {
                info!("Removing {} {} (not in backup)", api.noun.join(" "), id);
                if let Err(e) = manager(ctx, noun_args(api, "remove", Some(id))).await {
                    errors.push(e);
                }
            }
        }
    }
    Ok(errors)
}

/// API phase. Yields `(category, outcome, note)` per deferred file.
pub async fn apply_pbs_api(
    ctx: &ApplyContext<'_>,
    deferred: &[&'static ApiFile],
) -> Vec<(&'static str, Outcome, Option<String>)> {
    let services = ctx.services();
    let behavior = ctx.plan.pbs_behavior;
    let mut results = Vec::new();

    let api_up = match services.start_and_wait(PBS_DAEMON).await {
        Ok(()) => true,
        Err(e) => {
            warn!("PBS API unavailable: {}", e);
            ctx.deps.ui.warn(&format!("PBS API unavailable: {}", e));
            false
        }
    };

    let ordered = API_FILES.iter().filter(|f| deferred.iter().any(|d| std::ptr::eq(*d, *f)));
    for api in ordered {
        let outcome = if api_up {
            match apply_via_api(ctx, api, behavior == PbsBehavior::Clean).await {
                Ok(errors) if errors.is_empty() => (Outcome::Applied, None),
                Ok(errors) if behavior == PbsBehavior::Clean => {
                    for e in &errors {
                        warn!("{}", e);
                    }
                    match write_file(ctx, api) {
                        Ok(()) => (Outcome::Applied, Some(format!("{}: API errors, file written", api.rel))),
                        Err(e) => (Outcome::Failed(e.to_string()), None),
                    }
                }
                Ok(errors) => (Outcome::Failed(errors.join("; ")), None),
                Err(e) => (Outcome::Failed(e.to_string()), None),
            }
        } else {
            match behavior {
                PbsBehavior::Clean => match write_file(ctx, api) {
                    Ok(()) => (Outcome::Applied, Some(format!("{}: written directly (API unavailable)", api.rel))),
                    Err(e) => (Outcome::Failed(e.to_string()), None),
                },
                PbsBehavior::Merge => (
                    Outcome::skipped(format!("{} needs the PBS API in merge mode", api.rel)),
                    None,
                ),
            }
        };
        results.push((api.category, outcome.0, outcome.1));
    }

    if api_up {
        if let Err(e) = services.stop_no_block(PBS_PROXY).await {
            warn!("Could not stop {}: {}", PBS_PROXY, e);
        }
        if let Err(e) = services.start_and_wait(PBS_PROXY).await {
            warn!("Could not start {}: {}", PBS_PROXY, e);
            ctx.deps.ui.warn(&format!("Start {} manually: {}", PBS_PROXY, e));
        }
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{RestoreMode, RestorePlan};
    use proxsafe_backup::{Manifest, SystemType};
    use proxsafe_core::config::PbsBehaviorOverride;
    use proxsafe_core::sys::CommandOutput;
    use proxsafe_core::testing::TestDeps;
    use tokio_util::sync::CancellationToken;

    const STAGED: &[&str] = &[
        "accounts.cfg",
        "node.cfg",
        "s3.cfg",
        "datastore.cfg",
        "remote.cfg",
        "sync.cfg",
        "verification.cfg",
        "prune.cfg",
        "tape.cfg",
        "tape-encryption-keys.json",
    ];

    const API_ONLY: &[&str] = &["node.cfg", "s3.cfg", "datastore.cfg", "remote.cfg", "sync.cfg"];

    fn stage_all(t: &TestDeps) {
        for name in STAGED {
            let body = match *name {
                "node.cfg" => "email-from: pbs@example.com\n".to_string(),
                "datastore.cfg" => "datastore: store1\n\tpath /mnt/datastore/store1\n".to_string(),
                _ => format!("# {}\n", name),
            };
            t.sandbox.put(format!("/stage/etc/proxmox-backup/{}", name), body);
        }
    }

    fn pbs_plan(behavior: PbsBehaviorOverride) -> RestorePlan {
        let selected: Vec<_> = categories::for_system(SystemType::Pbs)
            .into_iter()
            .filter(|c| c.id != categories::PBS_ACCESS_CONTROL)
            .collect();
        RestorePlan::build(
            &Manifest::default(),
            RestoreMode::Custom,
            &selected,
            SystemType::Pbs,
            Some(behavior),
        )
    }

    async fn run_pbs(t: &TestDeps, plan: &RestorePlan) {
        let cancel = CancellationToken::new();
        let ctx = ApplyContext {
            deps: &t.deps,
            cancel: &cancel,
            staging: Path::new("/stage"),
            dest: Path::new("/live"),
            plan,
        };
        crate::apply::apply_all(&ctx).await.unwrap();
    }

    #[test]
    fn test_file_phase_runs_no_commands() {
        let t = TestDeps::new();
        stage_all(&t);
        let plan = pbs_plan(PbsBehaviorOverride::Clean);
        let cancel = CancellationToken::new();
        let ctx = ApplyContext {
            deps: &t.deps,
            cancel: &cancel,
            staging: Path::new("/stage"),
            dest: Path::new("/live"),
            plan: &plan,
        };

        let mut deferred = Vec::new();
        for category in plan.normal_categories.iter().copied() {
            let (_, api) = apply_pbs_files(&ctx, category).unwrap();
            deferred.extend(api.into_iter().map(|a| a.rel));
        }
        assert!(t.runner.calls().is_empty());
        assert_eq!(deferred.len(), API_ONLY.len());
        assert!(t.sandbox.exists("/live/etc/proxmox-backup/accounts.cfg"));
        assert!(!t.sandbox.exists("/live/etc/proxmox-backup/node.cfg"));
    }

    #[tokio::test]
    async fn test_clean_mode_falls_back_to_files() {
        let t = TestDeps::new();
        stage_all(&t);
        t.runner.respond(
            "systemctl",
            &["start", PBS_DAEMON],
            CommandOutput::failed(1, "Job for proxmox-backup.service failed"),
        );

        run_pbs(&t, &pbs_plan(PbsBehaviorOverride::Clean)).await;
        for name in STAGED {
            assert!(
                t.sandbox.exists(format!("/live/etc/proxmox-backup/{}", name)),
                "{} missing",
                name
            );
        }
        assert!(!t.runner.called(MANAGER));
    }

    #[tokio::test]
    async fn test_merge_mode_leaves_api_files_absent() {
        let t = TestDeps::new();
        stage_all(&t);
        t.runner.respond(
            "systemctl",
            &["start", PBS_DAEMON],
            CommandOutput::failed(1, "Job for proxmox-backup.service failed"),
        );

        run_pbs(&t, &pbs_plan(PbsBehaviorOverride::Merge)).await;
        for name in STAGED {
            let present = t.sandbox.exists(format!("/live/etc/proxmox-backup/{}", name));
            assert_eq!(present, !API_ONLY.contains(name), "{}", name);
        }
    }

    #[tokio::test]
    async fn test_api_phase_creates_and_removes() {
        let t = TestDeps::new();
        stage_all(&t);
        t.sandbox.put(
            "/live/etc/proxmox-backup/datastore.cfg",
            "datastore: stale\n\tpath /mnt/old\n",
        );
        t.runner.respond("systemctl", &["is-active"], CommandOutput::ok("active\n"));

        run_pbs(&t, &pbs_plan(PbsBehaviorOverride::Clean)).await;
        let lines = t.runner.lines();
        assert!(lines.contains(&format!(
            "{} datastore create store1 /mnt/datastore/store1",
            MANAGER
        )));
        assert!(lines.contains(&format!("{} datastore remove stale", MANAGER)));
        assert!(lines.contains(&format!("{} node update --email-from pbs@example.com", MANAGER)));

        let api_start = lines.iter().position(|l| l.starts_with(MANAGER)).unwrap();
        let daemon = lines
            .iter()
            .position(|l| l == &format!("systemctl start {}", PBS_DAEMON))
            .unwrap();
        assert!(daemon < api_start);
        assert!(lines.contains(&format!("systemctl stop --no-block {}", PBS_PROXY)));
    }
}
