//! Atomic configuration writes
//!
//! Configuration is never written in place: data goes to a sibling temp file
//! which is fsynced, given the requested mode (regardless of umask) and the
//! right owner, then renamed over the destination.

use super::fs::FileSystem;
use super::host::HostInfo;
use crate::error::{Error, Result};
use std::io::Write;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Default mode for restored configuration files.
pub const CONFIG_MODE: u32 = 0o640;

/// Mode for private files (keys, shadow, token secrets).
pub const PRIVATE_MODE: u32 = 0o600;

/// Default mode for directories created during restore.
pub const DIR_MODE: u32 = 0o755;

/// Write `data` to `path` atomically with exactly `mode`.
///
/// When running as root the owner is taken from the existing destination;
/// for a new file (or one whose group is root while the parent's is not) the
/// group is inherited from the parent directory.
pub fn write_file_atomic(
    fs: &dyn FileSystem,
    host: &dyn HostInfo,
    path: &Path,
    data: &[u8],
    mode: u32,
) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| Error::invalid_config(format!("no parent for {}", path.display())))?;
    ensure_dir_all_inherit(fs, host, parent, DIR_MODE)?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());
    let (mut file, tmp) = fs
        .create_temp_file(parent, &format!(".{}.tmp-", file_name))
        .map_err(|e| Error::path_io("Failed to create temp file in", parent, e))?;

    let result = (|| -> Result<()> {
        file.write_all(data)
            .map_err(|e| Error::path_io("Failed to write", &tmp, e))?;
        file.sync_all()
            .map_err(|e| Error::path_io("Failed to sync", &tmp, e))?;
        drop(file);

        fs.set_mode(&tmp, mode)
            .map_err(|e| Error::path_io("Failed to set mode on", &tmp, e))?;

        if host.euid() == 0 {
            let (uid, gid) = target_owner(fs, path, parent);
            fs.chown(&tmp, uid, gid)
                .map_err(|e| Error::path_io("Failed to chown", &tmp, e))?;
        }

        fs.rename(&tmp, path)
            .map_err(|e| Error::path_io("Failed to rename temp file over", path, e))
    })();

    if result.is_err() {
        fs.remove_file(&tmp).ok();
    } else {
        debug!("Wrote {} ({:o})", path.display(), mode);
    }
    result
}

/// Owner a freshly written file should get.
fn target_owner(fs: &dyn FileSystem, path: &Path, parent: &Path) -> (u32, u32) {
    let parent_gid = fs.metadata(parent).map(|m| m.gid()).unwrap_or(0);
    match fs.metadata(path) {
        Ok(meta) => {
            let gid = if meta.gid() == 0 && parent_gid != 0 {
                parent_gid
            } else {
                meta.gid()
            };
            (meta.uid(), gid)
        }
        Err(_) => (0, parent_gid),
    }
}

/// Create `dir` and any missing ancestors; each new segment inherits the
/// owner of its parent when running as root.
pub fn ensure_dir_all_inherit(
    fs: &dyn FileSystem,
    host: &dyn HostInfo,
    dir: &Path,
    mode: u32,
) -> Result<()> {
    if fs.metadata(dir).map(|m| m.is_dir()).unwrap_or(false) {
        return Ok(());
    }

    let mut missing: Vec<PathBuf> = Vec::new();
    let mut cursor = Some(dir);
    while let Some(current) = cursor {
        if fs.exists(current) {
            break;
        }
        missing.push(current.to_path_buf());
        cursor = current.parent();
    }

    for segment in missing.into_iter().rev() {
        match fs.create_dir(&segment, mode) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(Error::path_io("Failed to create directory", &segment, e)),
        }
        if host.euid() == 0 {
            if let Some(parent) = segment.parent() {
                if let Ok(meta) = fs.metadata(parent) {
                    fs.chown(&segment, meta.uid(), meta.gid())
                        .map_err(|e| Error::path_io("Failed to chown", &segment, e))?;
                }
            }
        }
    }
    Ok(())
}

/// Move a file, falling back to copy + remove across devices.
pub fn move_file(fs: &dyn FileSystem, from: &Path, to: &Path) -> Result<()> {
    match fs.rename(from, to) {
        Ok(()) => Ok(()),
        Err(rename_err) => {
            debug!(
                "rename {} -> {} failed ({}), copying instead",
                from.display(),
                to.display(),
                rename_err
            );
            let mode = fs
                .metadata(from)
                .map(|m| m.mode() & 0o7777)
                .unwrap_or(0o644);
            let mut src = fs
                .open(from)
                .map_err(|e| Error::path_io("Failed to open", from, e))?;
            let mut dst = fs
                .create(to, mode)
                .map_err(|e| Error::path_io("Failed to create", to, e))?;
            std::io::copy(&mut src, &mut dst).map_err(|e| Error::path_io("Failed to copy to", to, e))?;
            dst.sync_all()
                .map_err(|e| Error::path_io("Failed to sync", to, e))?;
            fs.remove_file(from)
                .map_err(|e| Error::path_io("Failed to remove", from, e))
        }
    }
}
