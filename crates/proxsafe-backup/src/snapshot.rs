//! Safety backup
//!
//! Before a category overwrites live files, whatever currently exists under
//! its paths is captured in `/tmp/<tool>/restore_backup_<stamp>.tar.gz`.
//! The same archive can be unpacked back onto the root to undo a restore.

use crate::error::{Error, Result};
use crate::extract::{unpack_archive, Compression};
use crate::paths::{expand, PathSelector};
use flate2::write::GzEncoder;
use proxsafe_core::sys::{join_under, FileSystem, PRIVATE_MODE};
use proxsafe_core::Deps;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tar::Builder;
use tracing::{debug, info};
use walkdir::WalkDir;

/// Name of the file recording the most recent snapshot
pub const LOCATION_FILE: &str = "restore_backup_location.txt";

/// A written safety snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SafetyBackup {
    pub archive: PathBuf,
    pub pointer: PathBuf,
    /// Entry names in the archive, relative to the root
    pub entries: Vec<String>,
}

/// Relative entry names for everything that currently exists under
/// `patterns`, directories walked recursively without following links.
fn collect_entries(fs: &dyn FileSystem, dest_root: &Path, patterns: &[String]) -> Result<BTreeSet<PathBuf>> {
    let mut found = BTreeSet::new();
    for pattern in patterns {
        for path in expand(fs, dest_root, pattern)? {
            let Ok(rel) = path.strip_prefix(dest_root) else {
                continue;
            };
            let real = fs.resolve(&path);
            for entry in WalkDir::new(&real).follow_links(false) {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) => {
                        debug!("Skipping unreadable path under {}: {}", path.display(), e);
                        continue;
                    }
                };
                let Ok(below) = entry.path().strip_prefix(&real) else {
                    continue;
                };
                if below.as_os_str().is_empty() {
                    found.insert(rel.to_path_buf());
                } else {
                    found.insert(rel.join(below));
                }
            }
        }
    }
    found.retain(|p| !p.as_os_str().is_empty());
    Ok(found)
}

/// Snapshot the current state of `patterns` under `dest_root`. Returns
/// `None` when none of the paths exist.
pub fn create_safety_backup(
    deps: &Deps,
    dest_root: &Path,
    patterns: &[String],
) -> Result<Option<SafetyBackup>> {
    let fs = deps.fs.as_ref();
    let entries = collect_entries(fs, dest_root, patterns)?;
    if entries.is_empty() {
        debug!("Nothing to snapshot under {}", dest_root.display());
        return Ok(None);
    }

    let dir = deps.config.tool_tmp_dir().into_std_path_buf();
    fs.create_dir_all(&dir)
        .map_err(|e| Error::path_io("Failed to create", &dir, e))?;
    let archive = dir.join(format!("restore_backup_{}.tar.gz", deps.clock.stamp()));

    let file = fs
        .create(&archive, PRIVATE_MODE)
        .map_err(|e| Error::path_io("Failed to create", &archive, e))?;
    let encoder = GzEncoder::new(file, flate2::Compression::default());
    let mut tar = Builder::new(encoder);
    tar.follow_symlinks(false);

    let mut names = Vec::with_capacity(entries.len());
    for rel in &entries {
        let real = fs.resolve(&join_under(dest_root, rel));
        tar.append_path_with_name(&real, rel)
            .map_err(|e| Error::path_io("Failed to archive", &real, e))?;
        names.push(rel.to_string_lossy().into_owned());
    }
    tar.into_inner()?.finish()?;

    let pointer = dir.join(LOCATION_FILE);
    fs.write(
        &pointer,
        format!("{}\n", archive.display()).as_bytes(),
        PRIVATE_MODE,
    )
    .map_err(|e| Error::path_io("Failed to write", &pointer, e))?;

    info!(
        "Safety backup of {} entries written to {}",
        names.len(),
        archive.display()
    );
    Ok(Some(SafetyBackup {
        archive,
        pointer,
        entries: names,
    }))
}

/// Unpack a safety snapshot onto `dest_root`. Returns the restored paths.
pub fn restore_safety_backup(fs: &dyn FileSystem, archive: &Path, dest_root: &Path) -> Result<Vec<PathBuf>> {
    let restored = unpack_archive(fs, archive, Compression::Gzip, dest_root, &PathSelector::all())?;
    info!(
        "Restored {} entries from {}",
        restored.len(),
        archive.display()
    );
    Ok(restored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use proxsafe_core::testing::TestDeps;

    fn archive_names(fs: &dyn FileSystem, archive: &Path) -> Vec<String> {
        let file = fs.open(archive).unwrap();
        let mut tar = tar::Archive::new(GzDecoder::new(file));
        let mut names: Vec<String> = tar
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_glob_pattern_snapshot_contains_exact_entries() {
        let t = TestDeps::new();
        t.sandbox.put("/etc/auto.master", "master");
        t.sandbox.put("/etc/auto.foo", "foo");
        t.sandbox.put("/etc/hosts", "hosts");

        let backup = create_safety_backup(&t.deps, Path::new("/"), &["./etc/auto.*".to_string()])
            .unwrap()
            .unwrap();
        assert_eq!(
            archive_names(t.deps.fs.as_ref(), &backup.archive),
            vec!["etc/auto.foo".to_string(), "etc/auto.master".to_string()]
        );
        assert!(backup
            .archive
            .to_string_lossy()
            .starts_with("/tmp/proxsafe/restore_backup_20240501_120000"));
        assert_eq!(
            t.sandbox.get("/tmp/proxsafe/restore_backup_location.txt").trim(),
            backup.archive.to_string_lossy()
        );
    }

    #[test]
    fn test_missing_paths_are_skipped() {
        let t = TestDeps::new();
        let none = create_safety_backup(&t.deps, Path::new("/"), &["etc/absent".to_string()]).unwrap();
        assert!(none.is_none());
        assert!(!t.sandbox.exists("/tmp/proxsafe"));
    }

    #[test]
    fn test_directories_and_symlinks_round_trip() {
        let t = TestDeps::new();
        let fs = t.deps.fs.clone();
        t.sandbox.put("/etc/pve/firewall/cluster.fw", "[OPTIONS]\nenable: 1\n");
        fs.symlink(Path::new("cluster.fw"), Path::new("/etc/pve/firewall/link.fw"))
            .unwrap();

        let backup = create_safety_backup(&t.deps, Path::new("/"), &["etc/pve/firewall/".to_string()])
            .unwrap()
            .unwrap();
        assert!(backup.entries.contains(&"etc/pve/firewall/link.fw".to_string()));

        fs.remove_dir_all(Path::new("/etc/pve/firewall")).unwrap();
        t.sandbox.put("/etc/pve/firewall/link.fw", "stale regular file");

        restore_safety_backup(fs.as_ref(), &backup.archive, Path::new("/")).unwrap();
        assert_eq!(t.sandbox.get("/etc/pve/firewall/cluster.fw"), "[OPTIONS]\nenable: 1\n");
        assert_eq!(
            fs.read_link(Path::new("/etc/pve/firewall/link.fw")).unwrap(),
            PathBuf::from("cluster.fw")
        );
    }
}
