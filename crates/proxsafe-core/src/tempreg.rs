//! Temp-dir registry
//!
//! Scratch directories that hold plaintext archives are recorded in a JSON
//! file before anything is written into them, so a crashed run can be reaped
//! by the next one.

use crate::error::{Error, Result};
use crate::sys::{write_file_atomic, Clock, FileSystem, HostInfo, PRIVATE_MODE};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// One live scratch directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub path: PathBuf,
    pub pid: u32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    entries: Vec<RegistryEntry>,
}

/// Summary of a [`TempDirRegistry::cleanup_orphaned`] pass
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanupSummary {
    pub removed: Vec<PathBuf>,
    pub kept: usize,
    pub failed: Vec<(PathBuf, String)>,
}

/// Registry of scratch directories owned by restore runs
#[derive(Clone)]
pub struct TempDirRegistry {
    fs: Arc<dyn FileSystem>,
    host: Arc<dyn HostInfo>,
    clock: Arc<dyn Clock>,
    path: PathBuf,
}

impl TempDirRegistry {
    pub fn new(
        fs: Arc<dyn FileSystem>,
        host: Arc<dyn HostInfo>,
        clock: Arc<dyn Clock>,
        path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            fs,
            host,
            clock,
            path: path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current entries (an absent registry file is empty)
    pub fn entries(&self) -> Result<Vec<RegistryEntry>> {
        Ok(self.load()?.entries)
    }

    /// Record `dir` as owned by this process. Registering the same path twice
    /// keeps a single entry.
    pub fn register(&self, dir: &Path) -> Result<()> {
        let mut file = self.load()?;
        let entry = RegistryEntry {
            path: dir.to_path_buf(),
            pid: self.host.pid(),
            created_at: self.clock.now(),
        };
        match file.entries.iter_mut().find(|e| e.path == dir) {
            Some(existing) => *existing = entry,
            None => file.entries.push(entry),
        }
        self.save(&file)?;
        debug!("Registered scratch directory {}", dir.display());
        Ok(())
    }

    /// Remove `dir` from disk and from the registry
    pub fn deregister(&self, dir: &Path) -> Result<()> {
        remove_tree(self.fs.as_ref(), dir)
            .map_err(|e| Error::path_io("Failed to remove scratch directory", dir, e))?;

        let mut file = self.load()?;
        let before = file.entries.len();
        file.entries.retain(|e| e.path != dir);
        if file.entries.len() != before {
            self.save(&file)?;
        }
        debug!("Deregistered scratch directory {}", dir.display());
        Ok(())
    }

    /// Reap entries whose owner is gone and which are older than `ttl`.
    /// Entries whose directory has already vanished are dropped once their
    /// owner is dead.
    pub fn cleanup_orphaned(&self, ttl: Duration) -> Result<CleanupSummary> {
        let mut file = self.load()?;
        let now = self.clock.now();
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);

        let mut summary = CleanupSummary::default();
        let mut remaining = Vec::with_capacity(file.entries.len());

        for entry in file.entries.drain(..) {
            let dead = !self.host.pid_alive(entry.pid);
            let expired = now.signed_duration_since(entry.created_at) > ttl;
            let vanished = !self.fs.exists(&entry.path);

            if dead && (expired || vanished) {
                match remove_tree(self.fs.as_ref(), &entry.path) {
                    Ok(()) => {
                        info!("Removed orphaned scratch directory {}", entry.path.display());
                        summary.removed.push(entry.path);
                    }
                    Err(e) => {
                        warn!(
                            "Failed to remove orphaned scratch directory {}: {}",
                            entry.path.display(),
                            e
                        );
                        summary.failed.push((entry.path.clone(), e.to_string()));
                        remaining.push(entry);
                    }
                }
            } else {
                remaining.push(entry);
            }
        }

        summary.kept = remaining.len();
        file.entries = remaining;
        if !summary.removed.is_empty() {
            self.save(&file)?;
        }
        Ok(summary)
    }

    fn load(&self) -> Result<RegistryFile> {
        match self.fs.read(&self.path) {
            Ok(data) if data.iter().all(u8::is_ascii_whitespace) => Ok(RegistryFile::default()),
            Ok(data) => serde_json::from_slice(&data)
                .map_err(|e| Error::registry(&self.path, format!("invalid JSON: {}", e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(RegistryFile::default()),
            Err(e) => Err(Error::path_io("Failed to read registry", &self.path, e)),
        }
    }

    fn save(&self, file: &RegistryFile) -> Result<()> {
        let mut data = serde_json::to_vec_pretty(file)?;
        data.push(b'\n');
        write_file_atomic(
            self.fs.as_ref(),
            self.host.as_ref(),
            &self.path,
            &data,
            PRIVATE_MODE,
        )
    }
}

impl std::fmt::Debug for TempDirRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TempDirRegistry")
            .field("path", &self.path)
            .finish()
    }
}

fn remove_tree(fs: &dyn FileSystem, dir: &Path) -> std::io::Result<()> {
    match fs.remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
