//! SHA-256 digests and `.sha256` sidecars

use crate::error::{Error, Result};
use proxsafe_core::sys::FileSystem;
use sha2::{Digest, Sha256};
use std::io::{self, Read};
use std::path::Path;

/// Calculates the SHA-256 checksum of a file as lowercase hex.
pub fn calculate_checksum(fs: &dyn FileSystem, path: &Path) -> Result<String> {
    let mut file = fs
        .open(path)
        .map_err(|e| Error::path_io("Failed to open file for checksum", path, e))?;
    checksum_reader(&mut file).map_err(|e| Error::path_io("Failed to calculate checksum of", path, e))
}

pub fn checksum_reader<R: Read>(reader: &mut R) -> io::Result<String> {
    let mut hasher = Sha256::new();
    io::copy(reader, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

pub fn checksum_bytes(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// Extract the digest from a sidecar (`<hex>  <filename>`).
pub fn parse_sidecar(text: &str) -> Option<String> {
    let token = text.split_whitespace().next()?;
    let valid = token.len() == 64 && token.chars().all(|c| c.is_ascii_hexdigit());
    valid.then(|| token.to_ascii_lowercase())
}

/// Render a sidecar line for `file_name`.
pub fn format_sidecar(digest: &str, file_name: &str) -> String {
    format!("{}  {}\n", digest, file_name)
}
