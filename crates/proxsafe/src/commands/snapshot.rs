//! Safety snapshot rollback command

use anyhow::{bail, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use dialoguer::Confirm;
use proxsafe_backup::restore_safety_backup;
use proxsafe_backup::snapshot::LOCATION_FILE;
use proxsafe_core::Deps;
use std::path::{Path, PathBuf};

use super::load_config;
use crate::cli::RollbackSnapshotArgs;
use crate::output;

/// The explicit archive, or the one recorded by the last restore.
fn resolve_archive(deps: &Deps, explicit: Option<Utf8PathBuf>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path.into_std_path_buf());
    }
    let pointer = deps.config.tool_tmp_dir().join(LOCATION_FILE);
    let text = deps
        .fs
        .read_to_string(pointer.as_std_path())
        .with_context(|| format!("No archive given and {} could not be read", pointer))?;
    let recorded = text.trim();
    if recorded.is_empty() {
        bail!("{} does not name a snapshot", pointer);
    }
    Ok(PathBuf::from(recorded))
}

pub fn run(args: RollbackSnapshotArgs, config: Option<&Utf8Path>) -> Result<()> {
    let deps = Deps::system(load_config(config)?);
    let archive = resolve_archive(&deps, args.archive)?;
    if !deps.fs.exists(&archive) {
        bail!("Snapshot not found: {}", archive.display());
    }

    output::header("Roll Back Safety Snapshot");
    output::kv("Snapshot", &archive.display().to_string());
    output::kv("Destination", "/");
    if deps.host.euid() != 0 {
        output::warning("Not running as root; files owned by root cannot be restored");
    }

    if !args.yes {
        let proceed = Confirm::new()
            .with_prompt("Overwrite the current files with the snapshot?")
            .default(false)
            .interact()?;
        if !proceed {
            output::info("Rollback cancelled");
            return Ok(());
        }
    }

    let restored = restore_safety_backup(deps.fs.as_ref(), &archive, Path::new("/"))
        .with_context(|| format!("Failed to restore {}", archive.display()))?;
    output::success(&format!("Restored {} entries", restored.len()));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proxsafe_core::testing::TestDeps;

    #[test]
    fn test_resolve_explicit_archive() {
        let t = TestDeps::new();
        let path = resolve_archive(&t.deps, Some(Utf8PathBuf::from("/root/snap.tar.gz"))).unwrap();
        assert_eq!(path, PathBuf::from("/root/snap.tar.gz"));
    }

    #[test]
    fn test_resolve_recorded_archive() {
        let t = TestDeps::new();
        t.sandbox.put(
            "/tmp/proxsafe/restore_backup_location.txt",
            "/tmp/proxsafe/restore_backup_20240501_120000.tar.gz\n",
        );
        let path = resolve_archive(&t.deps, None).unwrap();
        assert_eq!(path, PathBuf::from("/tmp/proxsafe/restore_backup_20240501_120000.tar.gz"));
    }

    #[test]
    fn test_resolve_without_record_fails() {
        let t = TestDeps::new();
        assert!(resolve_archive(&t.deps, None).is_err());
    }
}
