//! Path-safe tar extraction
//!
//! Two flavours: bundle extraction flattens every entry to its basename
//! inside the scratch directory; archive unpacking keeps the relative layout
//! under a staging root. Both reject entries that would land outside their
//! root.

use crate::error::{Error, Result};
use crate::manifest::{CHECKSUM_SUFFIX, MANIFEST_JSON_SUFFIX, METADATA_SUFFIX};
use crate::paths::PathSelector;
use proxsafe_core::sys::FileSystem;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use tar::EntryType;
use tracing::{debug, warn};

/// Normalize an entry name and return its components, rejecting anything
/// that is empty, absolute, or resolves above the root.
fn safe_components(raw: &str) -> Result<Vec<String>> {
    let name = raw.replace('\\', "/");
    let trimmed = name.trim();
    if trimmed.is_empty() || trimmed == "." || trimmed == ".." {
        return Err(Error::escapes(raw));
    }
    if trimmed.starts_with('/') {
        return Err(Error::escapes(raw));
    }

    let mut parts: Vec<String> = Vec::new();
    for part in trimmed.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                if parts.pop().is_none() {
                    return Err(Error::escapes(raw));
                }
            }
            other => parts.push(other.to_string()),
        }
    }
    if parts.is_empty() {
        return Err(Error::escapes(raw));
    }
    Ok(parts)
}

/// Basename an entry is placed under inside a flat scratch directory.
pub fn sanitize_entry_name(raw: &str) -> Result<String> {
    let mut parts = safe_components(raw)?;
    parts.pop().ok_or_else(|| Error::escapes(raw))
}

/// Relative path an entry unpacks to under a staging root.
pub fn safe_relative_path(raw: &str) -> Result<PathBuf> {
    Ok(safe_components(raw)?.iter().collect())
}

/// Files a bundle must deliver
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleFiles {
    pub archive: PathBuf,
    pub metadata: PathBuf,
    pub checksum: PathBuf,
}

/// Classify flat scratch contents into archive, metadata and checksum.
pub fn classify_bundle_files(names: &[String], dir: &Path) -> Result<BundleFiles> {
    let metadata = names
        .iter()
        .find(|n| n.ends_with(METADATA_SUFFIX) || n.ends_with(MANIFEST_JSON_SUFFIX))
        .ok_or(Error::MissingEntry { what: "metadata" })?;
    let checksum = names
        .iter()
        .find(|n| n.ends_with(CHECKSUM_SUFFIX))
        .ok_or(Error::MissingEntry { what: "checksum" })?;
    let archive = names
        .iter()
        .find(|n| {
            !n.ends_with(METADATA_SUFFIX)
                && !n.ends_with(MANIFEST_JSON_SUFFIX)
                && !n.ends_with(CHECKSUM_SUFFIX)
        })
        .ok_or(Error::MissingEntry { what: "archive" })?;

    Ok(BundleFiles {
        archive: dir.join(archive),
        metadata: dir.join(metadata),
        checksum: dir.join(checksum),
    })
}

/// Extract a bundle TAR into `scratch`, flattening entries to basenames.
pub fn extract_bundle(fs: &dyn FileSystem, bundle: &Path, scratch: &Path) -> Result<BundleFiles> {
    let file = fs
        .open(bundle)
        .map_err(|e| Error::path_io("Failed to open bundle", bundle, e))?;
    let mut archive = tar::Archive::new(file);
    let mut names = Vec::new();

    for entry in archive.entries()? {
        let mut entry = entry?;
        let kind = entry.header().entry_type();
        let raw = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
        if kind.is_dir() {
            continue;
        }
        let name = sanitize_entry_name(&raw)?;
        if !matches!(kind, EntryType::Regular | EntryType::Continuous) {
            warn!("Skipping non-regular bundle entry {:?}", raw);
            continue;
        }
        let dest = scratch.join(&name);
        let mut out = fs
            .create(&dest, 0o600)
            .map_err(|e| Error::path_io("Failed to create", &dest, e))?;
        io::copy(&mut entry, &mut out).map_err(|e| Error::path_io("Failed to extract", &dest, e))?;
        debug!("Extracted {} from bundle", name);
        if !names.contains(&name) {
            names.push(name);
        }
    }

    classify_bundle_files(&names, scratch)
}

/// Read the first manifest-bearing entry of a bundle stream.
pub fn read_bundle_manifest<R: Read>(reader: R) -> Result<Option<(String, Vec<u8>)>> {
    let mut archive = tar::Archive::new(reader);
    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
        if name.ends_with(METADATA_SUFFIX) || name.ends_with(MANIFEST_JSON_SUFFIX) {
            let mut data = Vec::new();
            entry.read_to_end(&mut data)?;
            return Ok(Some((name, data)));
        }
    }
    Ok(None)
}

/// Compression of an inner archive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Gzip,
    Zstd,
    Xz,
    None,
}

impl Compression {
    /// Pick the decoder from the manifest's type, falling back to the
    /// file extension.
    pub fn detect(compression_type: &str, archive_name: &str) -> Result<Self> {
        match compression_type.trim().to_ascii_lowercase().as_str() {
            "gzip" | "gz" | "pigz" => return Ok(Self::Gzip),
            "zstd" | "zst" => return Ok(Self::Zstd),
            "xz" => return Ok(Self::Xz),
            "none" => return Ok(Self::None),
            "" => {}
            other => {
                debug!("Unknown compression type {:?}, using file extension", other);
            }
        }
        let name = archive_name.trim_end_matches(crate::manifest::AGE_SUFFIX);
        if name.ends_with(".gz") || name.ends_with(".tgz") {
            Ok(Self::Gzip)
        } else if name.ends_with(".zst") {
            Ok(Self::Zstd)
        } else if name.ends_with(".xz") {
            Ok(Self::Xz)
        } else if name.ends_with(".tar") {
            Ok(Self::None)
        } else {
            Err(Error::UnsupportedCompression(if compression_type.is_empty() {
                archive_name.to_string()
            } else {
                compression_type.to_string()
            }))
        }
    }

    fn reader<'a, R: Read + 'a>(&self, inner: R) -> Result<Box<dyn Read + 'a>> {
        Ok(match self {
            Self::Gzip => Box::new(flate2::read::GzDecoder::new(inner)),
            Self::Zstd => Box::new(zstd::stream::read::Decoder::new(inner)?),
            Self::Xz => Box::new(xz2::read::XzDecoder::new(inner)),
            Self::None => Box::new(inner),
        })
    }
}

/// Unpack the inner archive under `dest`, keeping only entries accepted by
/// `selector`. Returns the relative paths written.
pub fn unpack_archive(
    fs: &dyn FileSystem,
    archive_path: &Path,
    compression: Compression,
    dest: &Path,
    selector: &PathSelector,
) -> Result<Vec<PathBuf>> {
    let file = fs
        .open(archive_path)
        .map_err(|e| Error::path_io("Failed to open archive", archive_path, e))?;
    let reader = compression.reader(io::BufReader::new(file))?;
    let mut archive = tar::Archive::new(reader);
    let mut written = Vec::new();

    fs.create_dir_all(dest)
        .map_err(|e| Error::path_io("Failed to create", dest, e))?;

    for entry in archive.entries()? {
        let mut entry = entry?;
        let raw = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
        let rel = match safe_relative_path(&raw) {
            Ok(rel) => rel,
            // The archive root itself ("./") carries nothing to stage
            Err(_) if matches!(raw.replace('\\', "/").trim_end_matches('/'), "" | ".") => continue,
            Err(e) => return Err(e),
        };
        if !selector.matches(&rel.to_string_lossy()) {
            continue;
        }

        let target = dest.join(&rel);
        let kind = entry.header().entry_type();
        if kind.is_dir() {
            fs.create_dir_all(&target)
                .map_err(|e| Error::path_io("Failed to create", &target, e))?;
            continue;
        }

        if let Some(parent) = target.parent() {
            fs.create_dir_all(parent)
                .map_err(|e| Error::path_io("Failed to create", parent, e))?;
        }
        if fs.symlink_metadata(&target).is_ok() {
            fs.remove_file(&target).ok();
        }

        match kind {
            EntryType::Regular | EntryType::Continuous => {
                let mode = entry.header().mode().unwrap_or(0o644) & 0o7777;
                let mut out = fs
                    .create(&target, 0o600)
                    .map_err(|e| Error::path_io("Failed to create", &target, e))?;
                io::copy(&mut entry, &mut out)
                    .map_err(|e| Error::path_io("Failed to extract", &target, e))?;
                drop(out);
                fs.set_mode(&target, mode)
                    .map_err(|e| Error::path_io("Failed to set mode on", &target, e))?;
            }
            EntryType::Symlink => {
                let Some(link) = entry.link_name()? else {
                    warn!("Symlink entry {:?} has no target, skipping", raw);
                    continue;
                };
                fs.symlink(&link, &target)
                    .map_err(|e| Error::path_io("Failed to create symlink", &target, e))?;
            }
            other => {
                debug!("Skipping {:?} entry {:?}", other, raw);
                continue;
            }
        }
        written.push(rel);
    }

    Ok(written)
}
