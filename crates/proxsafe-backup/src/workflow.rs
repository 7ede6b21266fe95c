//! Decrypt workflow
//!
//! Select an encrypted candidate, stage it, and write a plain
//! `<base>.decrypted.bundle.tar` to a directory the operator picks. Nothing
//! is applied to the system.

use crate::discovery::select_candidate;
use crate::error::{Error, Result};
use crate::prepare::{prepare_candidate, StagedBundle};
use proxsafe_core::sys::{move_file, FileSystem, PRIVATE_MODE};
use proxsafe_core::ui::{read_path, resolve_overwrite};
use proxsafe_core::Deps;
use std::path::{Path, PathBuf};
use tar::Builder;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Suffix of bundles produced by the decrypt workflow
pub const DECRYPTED_BUNDLE_SUFFIX: &str = ".decrypted.bundle.tar";

/// Pack archive, refreshed manifest and checksum into a bundle inside the
/// scratch directory.
pub fn write_plain_bundle(fs: &dyn FileSystem, staged: &StagedBundle) -> Result<PathBuf> {
    let name = format!("{}{}", staged.archive_name(), DECRYPTED_BUNDLE_SUFFIX);
    let bundle = staged.scratch.join(name);
    let file = fs
        .create(&bundle, PRIVATE_MODE)
        .map_err(|e| Error::path_io("Failed to create", &bundle, e))?;
    let mut tar = Builder::new(file);
    for path in [&staged.archive, &staged.manifest_path, &staged.checksum_path] {
        let Some(entry) = path.file_name() else {
            continue;
        };
        tar.append_path_with_name(fs.resolve(path), entry)
            .map_err(|e| Error::path_io("Failed to add to bundle", path, e))?;
    }
    tar.into_inner()?.sync_all()?;
    Ok(bundle)
}

fn bundle_file_name(bundle: &Path) -> String {
    bundle
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Run the decrypt workflow and return the path of the written bundle.
pub async fn run_decrypt_workflow(
    deps: &Deps,
    cancel: &CancellationToken,
    tool_version: &str,
) -> Result<PathBuf> {
    let candidate = select_candidate(deps, cancel, true).await?;
    let mut staged = prepare_candidate(deps, cancel, &candidate, Some(tool_version)).await?;

    let result = finish(deps, cancel, &staged, candidate.local_dir()).await;
    staged.cleanup()?;
    result
}

async fn finish(
    deps: &Deps,
    cancel: &CancellationToken,
    staged: &StagedBundle,
    default_dir: Option<PathBuf>,
) -> Result<PathBuf> {
    let bundle = write_plain_bundle(deps.fs.as_ref(), staged)?;
    let name = bundle_file_name(&bundle);

    let default_dir = default_dir.unwrap_or_else(|| deps.config.backup_path.as_std_path().to_path_buf());
    let dir = read_path(
        deps.ui.as_ref(),
        cancel,
        "Destination directory for the decrypted bundle",
        &default_dir,
    )
    .await?;
    deps.fs
        .create_dir_all(&dir)
        .map_err(|e| Error::path_io("Failed to create", &dir, e))?;

    let target = resolve_overwrite(deps.ui.as_ref(), deps.fs.as_ref(), cancel, &dir.join(&name)).await?;
    move_file(deps.fs.as_ref(), &bundle, &target)?;
    info!("Decrypted bundle written to {}", target.display());
    deps.ui
        .println(&format!("Decrypted bundle written to {}", target.display()));
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::{checksum_bytes, format_sidecar};
    use crate::decrypt::derive_identity;
    use crate::manifest::Manifest;
    use proxsafe_core::testing::TestDeps;
    use std::io::{Read, Write};

    const DOMAIN: &[u8] = b"proxsafe/age-x25519/v2\0";

    fn encrypt(passphrase: &str, data: &[u8]) -> Vec<u8> {
        let recipient = derive_identity(passphrase, Some(DOMAIN)).unwrap().to_public();
        let encryptor =
            age::Encryptor::with_recipients(std::iter::once(&recipient as &dyn age::Recipient)).unwrap();
        let mut out = Vec::new();
        let mut writer = encryptor.wrap_output(&mut out).unwrap();
        writer.write_all(data).unwrap();
        writer.finish().unwrap();
        out
    }

    fn bundle(entries: &[(&str, Vec<u8>)]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (name, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, data.as_slice()).unwrap();
        }
        builder.into_inner().unwrap()
    }

    fn read_bundle(t: &TestDeps, path: &Path) -> Vec<(String, Vec<u8>)> {
        let file = t.deps.fs.open(path).unwrap();
        let mut archive = tar::Archive::new(file);
        archive
            .entries()
            .unwrap()
            .map(|e| {
                let mut e = e.unwrap();
                let name = e.path().unwrap().to_string_lossy().into_owned();
                let mut data = Vec::new();
                e.read_to_end(&mut data).unwrap();
                (name, data)
            })
            .collect()
    }

    #[tokio::test]
    async fn test_encrypted_bundle_becomes_plain_bundle_at_destination() {
        let t = TestDeps::new();
        let plaintext = b"inner tar.gz payload".to_vec();
        let encrypted = encrypt("hunter2 hunter2", &plaintext);
        let manifest = r#"{"ArchivePath":"pve1.tar.gz.age","EncryptionMode":"age","ProxmoxType":"pve","CreatedAt":"2024-04-30T10:00:00Z"}"#;
        t.sandbox.put(
            "/opt/proxsafe/backup/pve1.bundle.tar",
            bundle(&[
                ("pve1.tar.gz.age", encrypted.clone()),
                ("pve1.tar.gz.age.metadata", manifest.as_bytes().to_vec()),
                (
                    "pve1.tar.gz.age.sha256",
                    format_sidecar(&checksum_bytes(&encrypted), "pve1.tar.gz.age").into_bytes(),
                ),
            ]),
        );
        // source, candidate, passphrase, destination
        t.answers(["1", "1", "hunter2 hunter2", "/srv/out"]);

        let out = run_decrypt_workflow(&t.deps, &CancellationToken::new(), "3.1.0")
            .await
            .unwrap();
        assert_eq!(out, PathBuf::from("/srv/out/pve1.tar.gz.decrypted.bundle.tar"));

        let entries = read_bundle(&t, &out);
        let names: Vec<&str> = entries.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["pve1.tar.gz", "pve1.tar.gz.metadata", "pve1.tar.gz.sha256"]);
        assert_eq!(entries[0].1, plaintext);

        let refreshed = Manifest::from_json(std::str::from_utf8(&entries[1].1).unwrap()).unwrap();
        assert_eq!(refreshed.encryption_mode, "none");
        assert_eq!(refreshed.sha256, checksum_bytes(&plaintext));
        assert_eq!(refreshed.script_version, "3.1.0");
        assert!(String::from_utf8_lossy(&entries[2].1).starts_with(&checksum_bytes(&plaintext)));

        // scratch is gone and no plaintext was left behind
        assert!(t.deps.registry().entries().unwrap().is_empty());
        let leftovers = t.deps.fs.read_dir(Path::new("/tmp/proxsafe")).unwrap_or_default();
        assert!(leftovers.is_empty(), "leftovers: {:?}", leftovers);
    }

    #[tokio::test]
    async fn test_plain_candidates_are_not_offered() {
        let t = TestDeps::new();
        let manifest = r#"{"ArchivePath":"pve1.tar.gz","EncryptionMode":"none"}"#;
        t.sandbox.put("/opt/proxsafe/backup/pve1.tar.gz", "data");
        t.sandbox.put("/opt/proxsafe/backup/pve1.tar.gz.metadata", manifest);
        t.answers(["1"]);

        let err = run_decrypt_workflow(&t.deps, &CancellationToken::new(), "3.1.0")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoCandidates));
        assert!(t.ui.output().iter().any(|l| l.contains("No usable encrypted backups")));
    }
}
