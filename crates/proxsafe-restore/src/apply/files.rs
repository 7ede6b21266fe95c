//! Copying staged files onto the destination root

use crate::error::{Error, Result};
use proxsafe_backup::paths::expand;
use proxsafe_core::sys::{join_under, write_file_atomic, CONFIG_MODE, PRIVATE_MODE};
use proxsafe_core::Deps;
use std::collections::BTreeSet;
use std::io::Write;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

/// Mode given to a copied file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModePolicy {
    /// 0640, or 0600 for key material
    Config,
    /// Whatever mode the staged file carries
    Keep,
}

const PRIVATE_MARKERS: &[&str] = &[
    "/priv/",
    ".key",
    "shadow",
    "token",
    "encryption-keys",
    "authkey",
    "notifications-priv",
    "config.db",
];

/// Whether `rel` holds secrets and must not be group readable.
pub fn is_private(rel: &Path) -> bool {
    let text = rel.to_string_lossy();
    PRIVATE_MARKERS.iter().any(|m| text.contains(m))
}

/// Files under the pmxcfs mount reject chmod, chown and temp-file renames.
pub fn is_cluster_fs(path: &Path) -> bool {
    path.starts_with("/etc/pve")
}

/// Relative paths of the regular files and symlinks staged for `patterns`,
/// directories walked recursively.
pub fn staged_files(deps: &Deps, staging: &Path, patterns: &[String]) -> Result<Vec<PathBuf>> {
    let fs = deps.fs.as_ref();
    let mut found = BTreeSet::new();
    for pattern in patterns {
        for path in expand(fs, staging, pattern)? {
            let real = fs.resolve(&path);
            for entry in WalkDir::new(&real).follow_links(false) {
                let Ok(entry) = entry else { continue };
                if entry.file_type().is_dir() {
                    continue;
                }
                let logical = fs.logical(entry.path());
                if let Ok(rel) = logical.strip_prefix(staging) {
                    found.insert(rel.to_path_buf());
                }
            }
        }
    }
    Ok(found.into_iter().collect())
}

/// Write `data` to a destination path, picking the writer the path needs.
pub fn write_dest(deps: &Deps, path: &Path, data: &[u8], mode: u32) -> Result<()> {
    if is_cluster_fs(path) {
        let fs = deps.fs.as_ref();
        if let Some(parent) = path.parent() {
            fs.create_dir_all(parent)
                .map_err(|e| Error::path_io("Failed to create", parent, e))?;
        }
        let mut file = fs
            .create(path, mode)
            .map_err(|e| Error::path_io("Failed to open", path, e))?;
        file.write_all(data)
            .map_err(|e| Error::path_io("Failed to write", path, e))?;
        debug!("Wrote {} (cluster filesystem)", path.display());
        return Ok(());
    }
    write_file_atomic(deps.fs.as_ref(), deps.host.as_ref(), path, data, mode)?;
    Ok(())
}

/// Copy one staged file (or symlink) to the same relative path under `dest`.
pub fn copy_staged(deps: &Deps, staging: &Path, dest: &Path, rel: &Path, policy: ModePolicy) -> Result<()> {
    copy_staged_to(deps, &join_under(staging, rel), &join_under(dest, rel), policy)
}

/// Copy a staged file to an explicit target.
pub fn copy_staged_to(deps: &Deps, src: &Path, target: &Path, policy: ModePolicy) -> Result<()> {
    let fs = deps.fs.as_ref();
    let meta = fs
        .symlink_metadata(src)
        .map_err(|e| Error::path_io("Failed to stat", src, e))?;

    if meta.file_type().is_symlink() {
        let link = fs
            .read_link(src)
            .map_err(|e| Error::path_io("Failed to read link", src, e))?;
        if let Some(parent) = target.parent() {
            fs.create_dir_all(parent)
                .map_err(|e| Error::path_io("Failed to create", parent, e))?;
        }
        if fs.symlink_metadata(target).is_ok() {
            fs.remove_file(target)
                .map_err(|e| Error::path_io("Failed to replace", target, e))?;
        }
        fs.symlink(&link, target)
            .map_err(|e| Error::path_io("Failed to create symlink", target, e))?;
        return Ok(());
    }

    let data = fs.read(src).map_err(|e| Error::path_io("Failed to read", src, e))?;
    let mode = match policy {
        ModePolicy::Keep => meta.mode() & 0o7777,
        ModePolicy::Config if is_private(target) => PRIVATE_MODE,
        ModePolicy::Config => CONFIG_MODE,
    };
    write_dest(deps, target, &data, mode)
}

/// Copy every staged file of `patterns`. Returns the relative paths copied.
pub fn copy_patterns(
    deps: &Deps,
    staging: &Path,
    dest: &Path,
    patterns: &[String],
    policy: ModePolicy,
) -> Result<Vec<PathBuf>> {
    let files = staged_files(deps, staging, patterns)?;
    for rel in &files {
        copy_staged(deps, staging, dest, rel, policy)?;
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proxsafe_core::testing::TestDeps;

    #[test]
    fn test_private_detection() {
        assert!(is_private(Path::new("etc/pve/priv/token.cfg")));
        assert!(is_private(Path::new("etc/proxmox-backup/proxy.key")));
        assert!(is_private(Path::new("etc/proxmox-backup/tape-encryption-keys.json")));
        assert!(!is_private(Path::new("etc/proxmox-backup/proxy.pem")));
        assert!(!is_private(Path::new("etc/default/grub")));
    }

    #[test]
    fn test_copy_patterns_modes() {
        let t = TestDeps::new();
        t.sandbox.put("/stage/etc/cron.d/job", "* * * * * root true\n");
        t.sandbox.put("/stage/etc/proxmox-backup/proxy.key", "KEY");
        t.sandbox.put("/stage/etc/proxmox-backup/proxy.pem", "PEM");
        let fs = t.sandbox.fs();
        fs.set_mode(Path::new("/stage/etc/cron.d/job"), 0o755).unwrap();

        let stage = Path::new("/stage");
        let dest = Path::new("/live");
        let copied = copy_patterns(&t.deps, stage, dest, &["etc/cron.d/".to_string()], ModePolicy::Keep).unwrap();
        assert_eq!(copied, vec![PathBuf::from("etc/cron.d/job")]);
        let mode = fs.metadata(Path::new("/live/etc/cron.d/job")).unwrap().mode() & 0o7777;
        assert_eq!(mode, 0o755);

        copy_patterns(
            &t.deps,
            stage,
            dest,
            &["etc/proxmox-backup/proxy.*".to_string()],
            ModePolicy::Config,
        )
        .unwrap();
        let key = fs.metadata(Path::new("/live/etc/proxmox-backup/proxy.key")).unwrap().mode() & 0o7777;
        let pem = fs.metadata(Path::new("/live/etc/proxmox-backup/proxy.pem")).unwrap().mode() & 0o7777;
        assert_eq!(key, PRIVATE_MODE);
        assert_eq!(pem, CONFIG_MODE);
    }

    #[test]
    fn test_symlink_is_recreated() {
        let t = TestDeps::new();
        let fs = t.sandbox.fs();
        fs.create_dir_all(Path::new("/stage/etc/ssh")).unwrap();
        fs.symlink(Path::new("/etc/ssh/real_config"), Path::new("/stage/etc/ssh/sshd_config"))
            .unwrap();
        t.sandbox.put("/live/etc/ssh/sshd_config", "old");

        copy_staged(
            &t.deps,
            Path::new("/stage"),
            Path::new("/live"),
            Path::new("etc/ssh/sshd_config"),
            ModePolicy::Keep,
        )
        .unwrap();
        assert_eq!(
            fs.read_link(Path::new("/live/etc/ssh/sshd_config")).unwrap(),
            PathBuf::from("/etc/ssh/real_config")
        );
    }
}
