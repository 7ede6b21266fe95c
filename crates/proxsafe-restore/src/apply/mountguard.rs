//! Storage mount guard
//!
//! A directory storage whose backing disk is not mounted yet would make PVE
//! write backups and images straight into the root filesystem. Before
//! storage definitions come back, such paths are covered with a read-only
//! empty bind mount or, failing that, made immutable.

use crate::section_config::SectionConfig;
use proxsafe_core::sys::args;
use proxsafe_core::Deps;
use serde::Serialize;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const MOUNT_PREFIXES: &[&str] = &["/mnt/", "/media/"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum GuardMethod {
    ReadOnlyBind,
    Immutable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GuardAction {
    pub storage: String,
    pub path: PathBuf,
    pub method: GuardMethod,
}

/// Mountpoint a `dir` storage depends on, if it looks externally mounted.
fn expected_mountpoint(section: &crate::section_config::Section) -> Option<PathBuf> {
    let path = section.get("path")?;
    if let Some(mp) = section.get("is_mountpoint") {
        if mp.starts_with('/') {
            return Some(PathBuf::from(mp));
        }
        if section.flag("is_mountpoint") {
            return Some(PathBuf::from(path));
        }
    }
    MOUNT_PREFIXES
        .iter()
        .any(|p| path.starts_with(p))
        .then(|| PathBuf::from(path))
}

/// Storages in `storage_cfg` whose mountpoint sits on the same device as
/// `dest` (i.e. nothing is mounted there).
pub fn offline_mounts(deps: &Deps, dest: &Path, storage_cfg: &str) -> Vec<(String, PathBuf)> {
    let fs = deps.fs.as_ref();
    let root_dev = match fs.metadata(dest) {
        Ok(meta) => meta.dev(),
        Err(e) => {
            warn!("Cannot stat {}: {}", dest.display(), e);
            return Vec::new();
        }
    };

    let cfg = SectionConfig::parse(storage_cfg);
    let mut offline = Vec::new();
    for section in cfg.of_kind("dir") {
        if section.flag("disable") {
            continue;
        }
        let Some(mountpoint) = expected_mountpoint(section) else {
            continue;
        };
        let live = proxsafe_core::sys::join_under(dest, &mountpoint);
        let on_root = match fs.metadata(&live) {
            Ok(meta) => meta.dev() == root_dev,
            Err(_) => true,
        };
        if on_root {
            debug!("Storage {} mountpoint {} is offline", section.id, mountpoint.display());
            offline.push((section.id.clone(), live));
        }
    }
    offline
}

/// Guard every offline mountpoint. Returns what was done.
pub async fn guard_offline_mounts(
    deps: &Deps,
    cancel: &CancellationToken,
    dest: &Path,
    storage_cfg: &str,
) -> Vec<GuardAction> {
    let fs = deps.fs.as_ref();
    let mut actions = Vec::new();
    let empty = deps.config.tool_tmp_dir().into_std_path_buf().join("mount_guard_empty");

    for (storage, path) in offline_mounts(deps, dest, storage_cfg) {
        if let Err(e) = fs.create_dir_all(&path).and_then(|_| fs.create_dir_all(&empty)) {
            warn!("Cannot prepare guard for {}: {}", path.display(), e);
            continue;
        }
        let real = fs.resolve(&path).to_string_lossy().into_owned();
        let source = fs.resolve(&empty).to_string_lossy().into_owned();

        let bind = deps
            .cmd
            .run(cancel, "mount", &args(["-o", "bind,ro", source.as_str(), real.as_str()]))
            .await;
        let method = match bind {
            Ok(out) if out.success() => Some(GuardMethod::ReadOnlyBind),
            other => {
                if let Ok(out) = &other {
                    debug!("bind mount over {} failed: {}", real, out.output.trim());
                }
                match deps.cmd.run(cancel, "chattr", &args(["+i", real.as_str()])).await {
                    Ok(out) if out.success() => Some(GuardMethod::Immutable),
                    _ => None,
                }
            }
        };

        match method {
            Some(method) => {
                info!("Guarded offline storage {} at {} ({:?})", storage, path.display(), method);
                actions.push(GuardAction { storage, path, method });
            }
            None => {
                warn!("Could not guard offline storage {} at {}", storage, path.display());
                deps.ui.warn(&format!(
                    "Storage '{}' at {} is not mounted and could not be protected",
                    storage,
                    path.display()
                ));
            }
        }
    }
    actions
}

#[cfg(test)]
mod tests {
    use super::*;
    use proxsafe_core::sys::CommandOutput;
    use proxsafe_core::testing::TestDeps;

    const STORAGE: &str = "\
dir: local
\tpath /var/lib/vz

dir: usb
\tpath /mnt/usb-backup
\tcontent backup

dir: data
\tpath /srv/data
\tis_mountpoint /srv

nfs: archive
\tpath /mnt/pve/archive
\tserver 10.0.0.2
";

    #[test]
    fn test_offline_mounts_picks_external_dirs() {
        let t = TestDeps::new();
        t.sandbox.fs().create_dir_all(Path::new("/live")).unwrap();
        let offline = offline_mounts(&t.deps, Path::new("/live"), STORAGE);
        let ids: Vec<_> = offline.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["usb", "data"]);
        assert_eq!(offline[1].1, PathBuf::from("/live/srv"));
    }

    #[tokio::test]
    async fn test_falls_back_to_immutable() {
        let t = TestDeps::new();
        t.sandbox.fs().create_dir_all(Path::new("/live")).unwrap();
        t.runner.respond("mount", &[], CommandOutput::failed(32, "permission denied"));

        let actions = guard_offline_mounts(&t.deps, &CancellationToken::new(), Path::new("/live"), STORAGE).await;
        assert_eq!(actions.len(), 2);
        assert!(actions.iter().all(|a| a.method == GuardMethod::Immutable));
        assert!(t.sandbox.exists("/live/mnt/usb-backup"));
        assert!(t.runner.lines().iter().any(|l| l.starts_with("chattr +i") && l.ends_with("/live/mnt/usb-backup")));
    }

    #[tokio::test]
    async fn test_bind_mount_preferred() {
        let t = TestDeps::new();
        t.sandbox.fs().create_dir_all(Path::new("/live")).unwrap();
        let actions = guard_offline_mounts(&t.deps, &CancellationToken::new(), Path::new("/live"), STORAGE).await;
        assert!(actions.iter().all(|a| a.method == GuardMethod::ReadOnlyBind));
        assert!(!t.runner.called("chattr"));
    }
}
