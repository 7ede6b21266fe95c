//! PVE category policies: storage, backup jobs and firewall

use super::files::{copy_staged, copy_staged_to, write_dest, ModePolicy};
use super::mountguard::guard_offline_mounts;
use super::{ApplyContext, Outcome};
use crate::error::{Error, Result};
use crate::section_config::{Section, SectionConfig};
use proxsafe_backup::paths::expand;
use proxsafe_core::sys::{args, join_under, CONFIG_MODE};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

const PVESH: &str = "pvesh";

const VZDUMP_CONF: &str = "etc/vzdump.conf";
const STORAGE_CFG: &str = "etc/pve/storage.cfg";
const DATACENTER_CFG: &str = "etc/pve/datacenter.cfg";
const JOBS_CFG: &str = "etc/pve/jobs.cfg";
const FIREWALL_DIR: &str = "etc/pve/firewall";
const HOST_FW_PATTERN: &str = "etc/pve/nodes/*/host.fw";

/// Storage properties that cannot be changed once a storage exists
const STORAGE_FIXED: &[&str] = &[
    "path", "pool", "server", "export", "share", "vgname", "thinpool", "base", "portal", "target",
    "datastore",
];

async fn pvesh(ctx: &ApplyContext<'_>, argv: Vec<String>) -> std::result::Result<(), String> {
    match ctx.deps.cmd.run(ctx.cancel, PVESH, &argv).await {
        Ok(out) if out.success() => Ok(()),
        Ok(out) => Err(out.output.trim().to_string()),
        Err(e) => Err(e.to_string()),
    }
}

/// `pvesh create <collection> --<id_key> <id> ...`, falling back to
/// `pvesh set <collection>/<id> ...` when the object already exists.
async fn create_or_set(
    ctx: &ApplyContext<'_>,
    collection: &str,
    id_key: &str,
    section: &Section,
    extra_create: &[String],
    fixed: &[&str],
) -> std::result::Result<(), String> {
    let flag = format!("--{}", id_key);
    let mut create = args(["create", collection, flag.as_str(), section.id.as_str()]);
    create.extend(extra_create.iter().cloned());
    create.extend(section.to_cli_args(&[]));
    match pvesh(ctx, create).await {
        Ok(()) => Ok(()),
        Err(create_err) => {
            debug!("create {} {} failed ({}), updating", collection, section.id, create_err);
            let mut set = args(["set".to_string(), format!("{}/{}", collection, section.id)]);
            set.extend(section.to_cli_args(fixed));
            pvesh(ctx, set)
                .await
                .map_err(|e| format!("{} {}: {}", collection, section.id, e))
        }
    }
}

/// Write a staged file straight to its live path.
fn write_staged_file(ctx: &ApplyContext<'_>, rel: &str) -> Result<bool> {
    match ctx.read_staged(rel)? {
        Some(text) => {
            write_dest(ctx.deps, &ctx.live(rel), text.as_bytes(), CONFIG_MODE)?;
            Ok(true)
        }
        None => Ok(false),
    }
}

fn summarize(category: &str, errors: Vec<String>) -> Outcome {
    if errors.is_empty() {
        Outcome::Applied
    } else {
        for e in &errors {
            warn!("{}: {}", category, e);
        }
        Outcome::Failed(format!("{} object(s) failed: {}", errors.len(), errors.join("; ")))
    }
}

/// `storage_pve`: vzdump defaults as a file, storages and datacenter
/// options through the API unless the cluster database brings them back.
pub async fn apply_storage(ctx: &ApplyContext<'_>) -> Result<Outcome> {
    let mut applied = false;
    if ctx.deps.fs.exists(&ctx.staged(VZDUMP_CONF)) {
        copy_staged(ctx.deps, ctx.staging, ctx.dest, Path::new(VZDUMP_CONF), ModePolicy::Config)?;
        applied = true;
    }

    let storage = ctx.read_staged(STORAGE_CFG)?;
    if let Some(text) = &storage {
        let guarded = guard_offline_mounts(ctx.deps, ctx.cancel, ctx.dest, text).await;
        if !guarded.is_empty() {
            ctx.deps.ui.println(&format!(
                "Protected {} offline storage mountpoint(s) from writes",
                guarded.len()
            ));
        }
    }

    if ctx.plan.needs_cluster_restore {
        info!("storage.cfg and datacenter.cfg come back with the cluster database");
        return Ok(if applied {
            Outcome::Applied
        } else {
            Outcome::skipped("restored with the cluster database")
        });
    }

    if !ctx.deps.cmd.available(PVESH) {
        warn!("{} not available, writing storage files directly", PVESH);
        applied |= write_staged_file(ctx, STORAGE_CFG)?;
        applied |= write_staged_file(ctx, DATACENTER_CFG)?;
        return Ok(if applied { Outcome::Applied } else { Outcome::skipped("nothing staged") });
    }

    let mut errors = Vec::new();
    if let Some(text) = storage {
        for section in SectionConfig::parse(&text).sections {
            let extra = args(["--type", section.kind.as_str()]);
            if let Err(e) = create_or_set(ctx, "/storage", "storage", &section, &extra, STORAGE_FIXED).await {
                errors.push(e);
            }
        }
        applied = true;
    }

    if let Some(text) = ctx.read_staged(DATACENTER_CFG)? {
        let mut argv = args(["set", "/cluster/options"]);
        for line in text.lines().map(str::trim).filter(|l| !l.is_empty() && !l.starts_with('#')) {
            if let Some((key, value)) = line.split_once(':') {
                argv.push(format!("--{}", key.trim()));
                argv.push(value.trim().to_string());
            }
        }
        if argv.len() > 2 {
            if let Err(e) = pvesh(ctx, argv).await {
                errors.push(format!("datacenter options: {}", e));
            }
        }
        applied = true;
    }

    if !applied {
        return Ok(Outcome::skipped("nothing staged"));
    }
    Ok(summarize("storage_pve", errors))
}

/// `pve_jobs`: every `vzdump` job through the API.
pub async fn apply_jobs(ctx: &ApplyContext<'_>) -> Result<Outcome> {
    let Some(text) = ctx.read_staged(JOBS_CFG)? else {
        return Ok(Outcome::skipped("nothing staged"));
    };
    let cfg = SectionConfig::parse(&text);
    let jobs: Vec<&Section> = cfg.of_kind("vzdump").collect();
    if jobs.is_empty() {
        return Ok(Outcome::skipped("no backup jobs in backup"));
    }

    let mut errors = Vec::new();
    for job in jobs {
        if let Err(e) = create_or_set(ctx, "/cluster/backup", "id", job, &[], &[]).await {
            errors.push(e);
        }
    }
    Ok(summarize("pve_jobs", errors))
}

fn files_under(ctx: &ApplyContext<'_>, dir: &Path) -> BTreeSet<PathBuf> {
    let fs = ctx.deps.fs.as_ref();
    let real = fs.resolve(dir);
    WalkDir::new(&real)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| !e.file_type().is_dir())
        .filter_map(|e| fs.logical(e.path()).strip_prefix(dir).ok().map(Path::to_path_buf))
        .collect()
}

/// `pve_firewall`: the live firewall tree becomes an exact copy of the
/// staged one; the first staged node's `host.fw` lands on this node.
pub fn apply_firewall(ctx: &ApplyContext<'_>) -> Result<Outcome> {
    let fs = ctx.deps.fs.as_ref();
    let staged_dir = ctx.staged(FIREWALL_DIR);
    let live_dir = ctx.live(FIREWALL_DIR);
    let mut touched = false;

    if fs.exists(&staged_dir) {
        let staged = files_under(ctx, &staged_dir);
        for rel in &staged {
            copy_staged_to(ctx.deps, &staged_dir.join(rel), &live_dir.join(rel), ModePolicy::Config)?;
        }
        for rel in files_under(ctx, &live_dir) {
            if !staged.contains(&rel) {
                let extra = live_dir.join(&rel);
                fs.remove_file(&extra)
                    .map_err(|e| Error::path_io("Failed to remove", &extra, e))?;
                info!("Removed {} (not in backup)", extra.display());
            }
        }
        touched = true;
    }

    let host_fws = expand(fs, ctx.staging, HOST_FW_PATTERN)?;
    if let Some(first) = host_fws.first() {
        let node = ctx.deps.host.short_hostname();
        let target = join_under(ctx.dest, &Path::new("etc/pve/nodes").join(&node).join("host.fw"));
        if host_fws.len() > 1 {
            warn!("{} node firewalls in backup, using {}", host_fws.len(), first.display());
        }
        copy_staged_to(ctx.deps, first, &target, ModePolicy::Config)?;
        touched = true;
    }

    Ok(if touched { Outcome::Applied } else { Outcome::skipped("nothing staged") })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::categories::{find, PVE_CLUSTER, PVE_FIREWALL, PVE_JOBS, STORAGE_PVE};
    use crate::plan::{RestoreMode, RestorePlan};
    use proxsafe_backup::{Manifest, SystemType};
    use proxsafe_core::sys::CommandOutput;
    use proxsafe_core::testing::TestDeps;
    use tokio_util::sync::CancellationToken;

    fn plan(ids: &[&str]) -> RestorePlan {
        let selected: Vec<_> = ids.iter().map(|id| find(id).unwrap()).collect();
        RestorePlan::build(&Manifest::default(), RestoreMode::Custom, &selected, SystemType::Pve, None)
    }

    fn ctx<'a>(t: &'a TestDeps, cancel: &'a CancellationToken, plan: &'a RestorePlan) -> ApplyContext<'a> {
        ApplyContext {
            deps: &t.deps,
            cancel,
            staging: Path::new("/stage"),
            dest: Path::new("/live"),
            plan,
        }
    }

    #[tokio::test]
    async fn test_jobs_create_then_set() {
        let t = TestDeps::new();
        t.sandbox.put(
            "/stage/etc/pve/jobs.cfg",
            "vzdump: backup-daily\n\tschedule 02:00\n\tstorage pbs\n\nrealm-sync: ldap\n\tschedule daily\n",
        );
        t.runner.respond_once("pvesh", &["create"], CommandOutput::failed(255, "already exists"));
        let plan = plan(&[PVE_JOBS]);
        let cancel = CancellationToken::new();

        let outcome = apply_jobs(&ctx(&t, &cancel, &plan)).await.unwrap();
        assert_eq!(outcome, Outcome::Applied);
        assert_eq!(
            t.runner.lines(),
            vec![
                "pvesh create /cluster/backup --id backup-daily --schedule 02:00 --storage pbs",
                "pvesh set /cluster/backup/backup-daily --schedule 02:00 --storage pbs",
            ]
        );
    }

    #[tokio::test]
    async fn test_storage_skips_cluster_owned_files() {
        let t = TestDeps::new();
        t.sandbox.put("/stage/etc/vzdump.conf", "bwlimit: 1000\n");
        t.sandbox.put("/stage/etc/pve/storage.cfg", "dir: local\n\tpath /var/lib/vz\n");
        let plan = plan(&[PVE_CLUSTER, STORAGE_PVE]);
        let cancel = CancellationToken::new();

        let outcome = apply_storage(&ctx(&t, &cancel, &plan)).await.unwrap();
        assert_eq!(outcome, Outcome::Applied);
        assert_eq!(t.sandbox.get("/live/etc/vzdump.conf"), "bwlimit: 1000\n");
        assert!(!t.runner.called("pvesh"));
        assert!(!t.sandbox.exists("/live/etc/pve/storage.cfg"));
    }

    #[tokio::test]
    async fn test_storage_via_api() {
        let t = TestDeps::new();
        t.sandbox.put(
            "/stage/etc/pve/storage.cfg",
            "dir: local\n\tpath /var/lib/vz\n\tcontent iso\n",
        );
        t.sandbox.put("/stage/etc/pve/datacenter.cfg", "keyboard: de\n");
        let plan = plan(&[STORAGE_PVE]);
        let cancel = CancellationToken::new();

        apply_storage(&ctx(&t, &cancel, &plan)).await.unwrap();
        let lines = t.runner.lines();
        assert!(lines.contains(
            &"pvesh create /storage --storage local --type dir --path /var/lib/vz --content iso".to_string()
        ));
        assert!(lines.contains(&"pvesh set /cluster/options --keyboard de".to_string()));
    }

    #[tokio::test]
    async fn test_firewall_exact_sync() {
        let t = TestDeps::new();
        t.sandbox.put("/stage/etc/pve/firewall/cluster.fw", "[OPTIONS]\nenable: 1\n");
        t.sandbox.put("/stage/etc/pve/nodes/oldnode/host.fw", "[RULES]\n");
        t.sandbox.put("/live/etc/pve/firewall/100.fw", "stale");
        let plan = plan(&[PVE_FIREWALL]);
        let cancel = CancellationToken::new();

        let outcome = apply_firewall(&ctx(&t, &cancel, &plan)).unwrap();
        assert_eq!(outcome, Outcome::Applied);
        assert!(t.sandbox.exists("/live/etc/pve/firewall/cluster.fw"));
        assert!(!t.sandbox.exists("/live/etc/pve/firewall/100.fw"));
        assert_eq!(t.sandbox.get("/live/etc/pve/nodes/pve1/host.fw"), "[RULES]\n");
    }
}
