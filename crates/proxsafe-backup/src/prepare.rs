//! Bundle preparation
//!
//! Turns a selected [`Candidate`] into a [`StagedBundle`]: a registered
//! scratch directory holding the plaintext archive, a refreshed manifest and
//! its checksum sidecar.

use crate::checksum::{calculate_checksum, format_sidecar, parse_sidecar};
use crate::decrypt::decrypt_interactive;
use crate::discovery::{Candidate, CandidateKind, Location};
use crate::error::{Error, Result};
use crate::extract::extract_bundle;
use crate::manifest::{Manifest, AGE_SUFFIX, CHECKSUM_SUFFIX, METADATA_SUFFIX};
use crate::remote::{RemoteClient, RemoteRef};
use proxsafe_core::sys::{FileSystem, PRIVATE_MODE};
use proxsafe_core::{Deps, TempDirRegistry};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Prefix of scratch directories under the temp root
pub const SCRATCH_PREFIX: &str = "proxmox-decrypt-";

/// A prepared working set. The scratch tree is removed by
/// [`StagedBundle::cleanup`] or, failing that, on drop.
pub struct StagedBundle {
    pub scratch: PathBuf,
    /// Plaintext archive inside `scratch`
    pub archive: PathBuf,
    pub manifest: Manifest,
    pub manifest_path: PathBuf,
    pub checksum_path: PathBuf,
    download: Option<PathBuf>,
    fs: Arc<dyn FileSystem>,
    registry: TempDirRegistry,
    cleaned: bool,
}

impl StagedBundle {
    /// Base name of the plaintext archive
    pub fn archive_name(&self) -> String {
        file_name(&self.archive)
    }

    /// Remove the scratch tree and any download temp file. Safe to call
    /// more than once.
    pub fn cleanup(&mut self) -> Result<()> {
        if self.cleaned {
            return Ok(());
        }
        self.cleaned = true;
        if let Some(download) = self.download.take() {
            if let Err(e) = self.fs.remove_file(&download) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!("Failed to remove download {}: {}", download.display(), e);
                }
            }
        }
        self.registry.deregister(&self.scratch)?;
        debug!("Removed scratch directory {}", self.scratch.display());
        Ok(())
    }
}

impl Drop for StagedBundle {
    fn drop(&mut self) {
        if let Err(e) = self.cleanup() {
            warn!("Scratch cleanup failed for {}: {}", self.scratch.display(), e);
        }
    }
}

impl std::fmt::Debug for StagedBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StagedBundle")
            .field("scratch", &self.scratch)
            .field("archive", &self.archive)
            .field("cleaned", &self.cleaned)
            .finish()
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Sources of the three files once they are reachable on the local
/// filesystem. The archive may live outside scratch (local raw candidates)
/// and is then only read.
struct Materialized {
    archive: PathBuf,
    metadata: PathBuf,
    checksum: Option<PathBuf>,
}

/// Create and register a scratch directory.
async fn create_scratch(deps: &Deps) -> Result<StagedBundle> {
    let fs = Arc::clone(&deps.fs);
    let temp_root = deps.config.temp_root.as_std_path();
    fs.create_dir_all(temp_root)
        .map_err(|e| Error::path_io("Failed to create", temp_root, e))?;
    let scratch = fs
        .create_temp_dir(temp_root, SCRATCH_PREFIX)
        .map_err(|e| Error::path_io("Failed to create scratch directory in", temp_root, e))?;

    let registry = deps.registry();
    if let Err(e) = registry.register(&scratch) {
        fs.remove_dir_all(&scratch).ok();
        return Err(e.into());
    }

    Ok(StagedBundle {
        archive: PathBuf::new(),
        manifest: Manifest::default(),
        manifest_path: PathBuf::new(),
        checksum_path: PathBuf::new(),
        download: None,
        scratch,
        fs,
        registry,
        cleaned: false,
    })
}

fn copy_into(fs: &dyn FileSystem, src: &Path, dst: &Path) -> Result<()> {
    let mut input = fs
        .open(src)
        .map_err(|e| Error::path_io("Failed to open", src, e))?;
    let mut output = fs
        .create(dst, PRIVATE_MODE)
        .map_err(|e| Error::path_io("Failed to create", dst, e))?;
    io::copy(&mut input, &mut output).map_err(|e| Error::path_io("Failed to copy to", dst, e))?;
    Ok(())
}

async fn run_blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Io(io::Error::other(e)))?
}

async fn download(
    deps: &Deps,
    client: &RemoteClient,
    cancel: &CancellationToken,
    object: &RemoteRef,
    dest: &Path,
) -> Result<()> {
    let object = RemoteRef::parse_object(&object.to_string())?;
    client.copy_to(cancel, &object, &deps.fs.resolve(dest)).await
}

async fn materialize(
    deps: &Deps,
    cancel: &CancellationToken,
    candidate: &Candidate,
    staged: &mut StagedBundle,
) -> Result<Materialized> {
    let client = RemoteClient::new(deps.cmd.clone(), deps.config.remote_client.clone());
    let scratch = staged.scratch.clone();

    match &candidate.kind {
        CandidateKind::Bundle { bundle } => {
            let local = match bundle {
                Location::Local(path) => path.clone(),
                Location::Remote(object) => {
                    let temp_root = deps.config.temp_root.as_std_path();
                    let (file, tmp) = deps
                        .fs
                        .create_temp_file(temp_root, "proxmox-bundle-")
                        .map_err(|e| Error::path_io("Failed to create temp file in", temp_root, e))?;
                    drop(file);
                    staged.download = Some(tmp.clone());
                    info!("Downloading {}", object);
                    download(deps, &client, cancel, object, &tmp).await?;
                    tmp
                }
            };
            let fs = Arc::clone(&deps.fs);
            let files = run_blocking(move || extract_bundle(fs.as_ref(), &local, &scratch)).await?;
            Ok(Materialized {
                archive: files.archive,
                metadata: files.metadata,
                checksum: Some(files.checksum),
            })
        }
        CandidateKind::Raw {
            archive,
            metadata,
            checksum,
        } => match archive {
            Location::Local(archive) => {
                let Location::Local(metadata) = metadata else {
                    return Err(Error::manifest(archive.display().to_string(), "mixed local and remote sidecars"));
                };
                let meta_copy = scratch.join(file_name(metadata));
                copy_into(deps.fs.as_ref(), metadata, &meta_copy)?;
                let checksum = match checksum {
                    Some(Location::Local(sum)) => {
                        let copy = scratch.join(file_name(sum));
                        copy_into(deps.fs.as_ref(), sum, &copy)?;
                        Some(copy)
                    }
                    _ => None,
                };
                Ok(Materialized {
                    archive: archive.clone(),
                    metadata: meta_copy,
                    checksum,
                })
            }
            Location::Remote(object) => {
                let archive_dst = scratch.join(object.basename());
                info!("Downloading {}", object);
                download(deps, &client, cancel, object, &archive_dst).await?;

                let metadata_dst = match metadata {
                    Location::Remote(meta) => {
                        let dst = scratch.join(meta.basename());
                        download(deps, &client, cancel, meta, &dst).await?;
                        dst
                    }
                    Location::Local(path) => path.clone(),
                };
                let checksum_dst = match checksum {
                    Some(Location::Remote(sum)) => {
                        let dst = scratch.join(sum.basename());
                        download(deps, &client, cancel, sum, &dst).await?;
                        Some(dst)
                    }
                    Some(Location::Local(path)) => Some(path.clone()),
                    None => None,
                };
                Ok(Materialized {
                    archive: archive_dst,
                    metadata: metadata_dst,
                    checksum: checksum_dst,
                })
            }
        },
    }
}

async fn verify_checksum(deps: &Deps, archive: &Path, sidecar: Option<&Path>) -> Result<()> {
    let Some(sidecar) = sidecar else {
        warn!("No checksum for {}; integrity not verified", archive.display());
        return Ok(());
    };
    let text = deps
        .fs
        .read_to_string(sidecar)
        .map_err(|e| Error::path_io("Failed to read", sidecar, e))?;
    let expected = parse_sidecar(&text)
        .ok_or_else(|| Error::manifest(file_name(sidecar), "checksum file holds no SHA-256 digest"))?;

    let fs = Arc::clone(&deps.fs);
    let path = archive.to_path_buf();
    let actual = run_blocking(move || calculate_checksum(fs.as_ref(), &path)).await?;
    if actual != expected {
        return Err(Error::ChecksumMismatch {
            path: archive.display().to_string(),
            expected,
            actual,
        });
    }
    debug!("Checksum verified for {}", archive.display());
    Ok(())
}

/// Stage a candidate: materialize, verify, decrypt and refresh the
/// manifest. `tool_version` overrides the manifest's `ScriptVersion`.
pub async fn prepare_candidate(
    deps: &Deps,
    cancel: &CancellationToken,
    candidate: &Candidate,
    tool_version: Option<&str>,
) -> Result<StagedBundle> {
    let mut staged = create_scratch(deps).await?;
    info!("Staging {} in {}", candidate.file_name(), staged.scratch.display());

    let files = materialize(deps, cancel, candidate, &mut staged).await?;
    let archive_name = file_name(&files.archive);
    let data = deps
        .fs
        .read(&files.metadata)
        .map_err(|e| Error::path_io("Failed to read", &files.metadata, e))?;
    let mut manifest = Manifest::parse(&data, &archive_name, &file_name(&files.metadata))?;

    verify_checksum(deps, &files.archive, files.checksum.as_deref()).await?;

    let plain_name = archive_name
        .strip_suffix(AGE_SUFFIX)
        .filter(|n| !n.is_empty())
        .unwrap_or(&archive_name)
        .to_string();
    let plain = staged.scratch.join(&plain_name);

    if manifest.is_encrypted() {
        decrypt_interactive(deps, cancel, &files.archive, &plain).await?;
    } else if files.archive != plain {
        copy_into(deps.fs.as_ref(), &files.archive, &plain)?;
    }

    let size = deps
        .fs
        .metadata(&plain)
        .map_err(|e| Error::path_io("Failed to stat", &plain, e))?
        .len();
    let fs = Arc::clone(&deps.fs);
    let path = plain.clone();
    let digest = run_blocking(move || calculate_checksum(fs.as_ref(), &path)).await?;

    manifest.archive_path = plain_name.clone();
    manifest.archive_size = i64::try_from(size).unwrap_or(i64::MAX);
    manifest.sha256 = digest.clone();
    manifest.encryption_mode = "none".to_string();
    if let Some(version) = tool_version.filter(|v| !v.is_empty()) {
        manifest.script_version = version.to_string();
    }

    let manifest_path = staged.scratch.join(format!("{}{}", plain_name, METADATA_SUFFIX));
    let checksum_path = staged.scratch.join(format!("{}{}", plain_name, CHECKSUM_SUFFIX));
    deps.fs
        .write(&manifest_path, manifest.to_json()?.as_bytes(), PRIVATE_MODE)
        .map_err(|e| Error::path_io("Failed to write", &manifest_path, e))?;
    deps.fs
        .write(
            &checksum_path,
            format_sidecar(&digest, &plain_name).as_bytes(),
            PRIVATE_MODE,
        )
        .map_err(|e| Error::path_io("Failed to write", &checksum_path, e))?;

    staged.archive = plain;
    staged.manifest = manifest;
    staged.manifest_path = manifest_path;
    staged.checksum_path = checksum_path;
    Ok(staged)
}
