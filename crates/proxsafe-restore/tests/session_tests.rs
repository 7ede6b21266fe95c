//! End-to-end restore sessions against a sandboxed filesystem
//!
//! The sandbox never passes the live-apply preflight, so these runs cover
//! discovery, staging, planning and export while every live category is
//! reported as skipped.

mod common;

use common::*;
use proxsafe_backup::SystemType;
use proxsafe_core::testing::TestDeps;
use proxsafe_core::RestoreConfig;
use proxsafe_restore::categories::{PVE_CLUSTER, SSH};
use proxsafe_restore::{Error, FixedSystem, Outcome, RestoreSession};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const EXPORT_DIR: &str = "/opt/proxsafe/export/proxmox-config-export-20240501_120000";

fn backup_files() -> Vec<(&'static str, &'static [u8])> {
    vec![
        ("etc/ssh/sshd_config", &b"Port 2222\n"[..]),
        ("etc/crontab", &b"0 3 * * * root true\n"[..]),
        ("var/lib/pve-cluster/config.db", &b"sqlite"[..]),
        ("etc/corosync/corosync.conf", &b"totem {}\n"[..]),
    ]
}

fn session(t: &TestDeps) -> RestoreSession<'_> {
    RestoreSession::new(&t.deps, "9.9.9").with_detector(Arc::new(FixedSystem(SystemType::Pve)))
}

#[tokio::test]
async fn test_custom_restore_with_safe_cluster_export() {
    let t = TestDeps::new();
    put_bundle(&t, &backup_files());
    // source, backup, custom mode, ssh + pve_cluster, SAFE, confirm
    t.answers(["1", "1", "2", "3,8", "2", "y"]);

    let report = session(&t).run(&CancellationToken::new()).await.unwrap();

    assert_eq!(report.export_dir, Some(PathBuf::from(EXPORT_DIR)));
    assert_eq!(t.sandbox.get(format!("{}/var/lib/pve-cluster/config.db", EXPORT_DIR)), "sqlite");
    assert_eq!(t.sandbox.get(format!("{}/etc/corosync/corosync.conf", EXPORT_DIR)), "totem {}\n");

    assert_eq!(report.categories.len(), 1);
    assert_eq!(report.categories[0].id, SSH);
    assert!(matches!(&report.categories[0].outcome, Outcome::Skipped(r) if r.contains("sandboxed")));
    assert!(report.plan.has_export(PVE_CLUSTER));
    assert!(!report.has_failures());

    assert!(!t.sandbox.exists("/etc/ssh/sshd_config"));
    assert!(t.deps.registry().entries().unwrap().is_empty());
}

#[tokio::test]
async fn test_dry_run_stops_before_staging() {
    let t = TestDeps::with_config(RestoreConfig {
        dry_run: true,
        ..RestoreConfig::default()
    });
    put_bundle(&t, &backup_files());
    t.answers(["1", "1", "2", "3"]);

    let report = session(&t).run(&CancellationToken::new()).await.unwrap();

    assert!(report.dry_run);
    assert!(report.categories.is_empty());
    assert!(report.export_dir.is_none());
    assert!(t.ui.output().iter().any(|l| l.contains("Restore: ssh")));
    assert!(t.deps.registry().entries().unwrap().is_empty());
}

#[tokio::test]
async fn test_declined_confirmation_aborts_and_cleans_up() {
    let t = TestDeps::new();
    put_bundle(&t, &backup_files());
    t.answers(["1", "1", "2", "3", "n"]);

    let err = session(&t).run(&CancellationToken::new()).await.unwrap_err();

    assert!(matches!(err, Error::Aborted));
    assert!(err.is_abort());
    assert!(t.deps.registry().entries().unwrap().is_empty());
}

#[tokio::test]
async fn test_orphaned_scratch_removed_at_start() {
    let t = TestDeps::new();
    put_bundle(&t, &backup_files());
    t.sandbox.put("/tmp/proxsafe/proxmox-decrypt-stale/junk", "x");
    t.deps
        .registry()
        .register(std::path::Path::new("/tmp/proxsafe/proxmox-decrypt-stale"))
        .unwrap();
    t.host.set_alive(&[]);
    t.clock.advance(Duration::from_secs(25 * 3600));
    t.answers(["0"]);

    let err = session(&t).run(&CancellationToken::new()).await.unwrap_err();

    assert!(err.is_abort());
    assert!(!t.sandbox.exists("/tmp/proxsafe/proxmox-decrypt-stale"));
}
