//! Shared fixtures for proxsafe-restore integration tests
//!
//! Builds backup bundles in memory so a whole session can run against a
//! sandboxed filesystem.

#![allow(dead_code)]

use flate2::write::GzEncoder;
use flate2::Compression;
use proxsafe_backup::checksum::{checksum_bytes, format_sidecar};
use proxsafe_core::testing::TestDeps;

pub const BUNDLE_PATH: &str = "/opt/proxsafe/backup/pve1-20240430.bundle.tar";
pub const ARCHIVE_NAME: &str = "pve1-20240430.tar.gz";

/// Plain tar of `(name, data)` entries
pub fn tar_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, data) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, *data).unwrap();
    }
    builder.into_inner().unwrap()
}

/// Gzip-compressed tar of `(name, data)` entries
pub fn tar_gz_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    std::io::copy(&mut tar_bytes(entries).as_slice(), &mut encoder).unwrap();
    encoder.finish().unwrap()
}

/// Unencrypted PVE manifest for [`ARCHIVE_NAME`]
pub fn pve_manifest() -> String {
    format!(
        r#"{{"ArchivePath":"{}","EncryptionMode":"none","CompressionType":"gzip","ProxmoxType":"pve","Hostname":"pve1","CreatedAt":"2024-04-30T02:00:00Z"}}"#,
        ARCHIVE_NAME
    )
}

/// Place a bundle holding `files` as the only backup in the primary path.
pub fn put_bundle(t: &TestDeps, files: &[(&str, &[u8])]) {
    let archive = tar_gz_bytes(files);
    let metadata = format!("{}.metadata", ARCHIVE_NAME);
    let sidecar_name = format!("{}.sha256", ARCHIVE_NAME);
    let sidecar = format_sidecar(&checksum_bytes(&archive), ARCHIVE_NAME);
    let manifest = pve_manifest();
    let bundle = tar_bytes(&[
        (ARCHIVE_NAME, &archive[..]),
        (metadata.as_str(), manifest.as_bytes()),
        (sidecar_name.as_str(), sidecar.as_bytes()),
    ]);
    t.sandbox.put(BUNDLE_PATH, bundle);
}
