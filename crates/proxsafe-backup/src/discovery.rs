//! Backup discovery
//!
//! Enumerates restore candidates in the configured sources. A source is a
//! local directory or a remote-object prefix; each may hold bundles
//! (`*.bundle.tar`) and raw triples (`X`, `X.metadata`, `X.sha256`).

use crate::error::{Error, Result};
use crate::extract::read_bundle_manifest;
use crate::manifest::{Manifest, CHECKSUM_SUFFIX, MANIFEST_JSON_SUFFIX, METADATA_SUFFIX};
use crate::remote::{is_remote_reference, RemoteClient, RemoteRef};
use chrono::{DateTime, Utc};
use proxsafe_core::config::RestoreConfig;
use proxsafe_core::ui::select_menu;
use proxsafe_core::Deps;
use std::fmt;
use std::path::{Path, PathBuf};
use tokio_util::io::SyncIoBridge;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Suffix of bundle files
pub const BUNDLE_SUFFIX: &str = ".bundle.tar";

/// Where a source was configured
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Primary,
    Secondary,
    Cloud,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Primary => "local",
            Self::Secondary => "secondary",
            Self::Cloud => "cloud",
        })
    }
}

/// A local path or remote object
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    Local(PathBuf),
    Remote(RemoteRef),
}

impl Location {
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote(_))
    }

    pub fn file_name(&self) -> String {
        match self {
            Self::Local(p) => p
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            Self::Remote(r) => r.basename().to_string(),
        }
    }

    fn child(&self, name: &str) -> Self {
        match self {
            Self::Local(p) => Self::Local(p.join(name)),
            Self::Remote(r) => Self::Remote(r.join(name)),
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local(p) => write!(f, "{}", p.display()),
            Self::Remote(r) => write!(f, "{}", r),
        }
    }
}

/// A configured place to look for backups
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Source {
    pub kind: SourceKind,
    pub location: Location,
}

impl Source {
    pub fn label(&self) -> String {
        format!("{} ({})", self.kind, self.location)
    }
}

/// How a candidate is packaged
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CandidateKind {
    /// One TAR holding archive, metadata and checksum
    Bundle { bundle: Location },
    /// Three sibling files
    Raw {
        archive: Location,
        metadata: Location,
        checksum: Option<Location>,
    },
}

/// A discovered backup with its manifest loaded
#[derive(Debug, Clone)]
pub struct Candidate {
    pub kind: CandidateKind,
    pub source: SourceKind,
    pub manifest: Manifest,
    pub label: String,
}

impl Candidate {
    pub fn is_remote(&self) -> bool {
        match &self.kind {
            CandidateKind::Bundle { bundle } => bundle.is_remote(),
            CandidateKind::Raw { archive, .. } => archive.is_remote(),
        }
    }

    /// Name of the bundle or archive file
    pub fn file_name(&self) -> String {
        match &self.kind {
            CandidateKind::Bundle { bundle } => bundle.file_name(),
            CandidateKind::Raw { archive, .. } => archive.file_name(),
        }
    }

    /// Local directory holding the candidate, if it is local
    pub fn local_dir(&self) -> Option<PathBuf> {
        let loc = match &self.kind {
            CandidateKind::Bundle { bundle } => bundle,
            CandidateKind::Raw { archive, .. } => archive,
        };
        match loc {
            Location::Local(p) => p.parent().map(Path::to_path_buf),
            Location::Remote(_) => None,
        }
    }
}

fn make_label(source: SourceKind, name: &str, manifest: &Manifest) -> String {
    let created = if manifest.created_at.timestamp() == 0 {
        "unknown date".to_string()
    } else {
        manifest.created_at.format("%Y-%m-%d %H:%M:%S UTC").to_string()
    };
    let host = if manifest.hostname.is_empty() {
        String::new()
    } else {
        format!(" {}", manifest.hostname)
    };
    let lock = if manifest.is_encrypted() { " [encrypted]" } else { "" };
    format!(
        "{} [{}] {}{} ({}){}",
        created,
        source,
        name,
        host,
        manifest.system_type(),
        lock
    )
}

/// Sources enabled in the configuration, in menu order.
pub fn configured_sources(config: &RestoreConfig) -> Vec<Source> {
    let mut sources = vec![Source {
        kind: SourceKind::Primary,
        location: Location::Local(config.backup_path.as_std_path().to_path_buf()),
    }];

    if let Some(secondary) = config.secondary() {
        sources.push(Source {
            kind: SourceKind::Secondary,
            location: Location::Local(secondary.into_std_path_buf()),
        });
    }

    if let Some(cloud) = config.cloud() {
        if is_remote_reference(cloud) {
            match RemoteRef::parse(cloud) {
                Ok(remote) => sources.push(Source {
                    kind: SourceKind::Cloud,
                    location: Location::Remote(remote),
                }),
                Err(e) => warn!("Ignoring cloud source: {}", e),
            }
        } else {
            sources.push(Source {
                kind: SourceKind::Cloud,
                location: Location::Local(PathBuf::from(cloud)),
            });
        }
    }
    sources
}

/// Finds candidates in sources.
pub struct Discovery<'a> {
    deps: &'a Deps,
    client: RemoteClient,
}

impl<'a> Discovery<'a> {
    pub fn new(deps: &'a Deps) -> Self {
        Self {
            deps,
            client: RemoteClient::new(deps.cmd.clone(), deps.config.remote_client.clone()),
        }
    }

    /// Candidates in one source, newest first. An unreadable source yields
    /// an empty list after a warning; unusable entries are skipped.
    pub async fn discover(
        &self,
        cancel: &CancellationToken,
        source: &Source,
        encrypted_only: bool,
    ) -> Result<Vec<Candidate>> {
        let names = match self.list(cancel, &source.location).await {
            Ok(names) => names,
            Err(e) if e.is_abort() => return Err(e),
            Err(e) => {
                warn!("Cannot read backup source {}: {}", source.location, e);
                return Ok(Vec::new());
            }
        };

        let mut candidates = Vec::new();
        for name in &names {
            let found = if name.ends_with(BUNDLE_SUFFIX) {
                self.bundle_candidate(cancel, source, name).await
            } else if let Some(archive) = name.strip_suffix(METADATA_SUFFIX) {
                if archive.ends_with(BUNDLE_SUFFIX) || !names.iter().any(|n| n == archive) {
                    continue;
                }
                self.raw_candidate(cancel, source, archive, &names).await
            } else {
                continue;
            };

            match found {
                Ok(candidate) => {
                    if encrypted_only && !candidate.manifest.is_encrypted() {
                        debug!("Skipping unencrypted candidate {}", name);
                        continue;
                    }
                    candidates.push(candidate);
                }
                Err(e) if e.is_abort() => return Err(e),
                Err(e) => warn!("Skipping {} in {}: {}", name, source.location, e),
            }
        }

        sort_newest_first(&mut candidates);
        Ok(candidates)
    }

    async fn list(&self, cancel: &CancellationToken, location: &Location) -> Result<Vec<String>> {
        match location {
            Location::Local(dir) => {
                let entries = self
                    .deps
                    .fs
                    .read_dir(dir)
                    .map_err(|e| Error::path_io("Failed to list", dir, e))?;
                Ok(entries
                    .into_iter()
                    .filter(|p| {
                        self.deps
                            .fs
                            .metadata(p)
                            .map(|m| m.is_file())
                            .unwrap_or(false)
                    })
                    .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
                    .collect())
            }
            Location::Remote(remote) => self.client.list(cancel, remote).await,
        }
    }

    async fn bundle_candidate(
        &self,
        cancel: &CancellationToken,
        source: &Source,
        name: &str,
    ) -> Result<Candidate> {
        let bundle = source.location.child(name);
        let found = match &bundle {
            Location::Local(path) => {
                let file = self
                    .deps
                    .fs
                    .open(path)
                    .map_err(|e| Error::path_io("Failed to open", path, e))?;
                read_bundle_manifest(file)?
            }
            Location::Remote(object) => self.remote_bundle_manifest(cancel, object).await?,
        };
        let (entry, data) = found.ok_or_else(|| Error::manifest(name, "bundle has no manifest entry"))?;
        let base = entry.rsplit('/').next().unwrap_or(&entry);
        let archive_name = base
            .strip_suffix(METADATA_SUFFIX)
            .or_else(|| base.strip_suffix(MANIFEST_JSON_SUFFIX))
            .unwrap_or(base)
            .to_string();
        let manifest = Manifest::parse(&data, &archive_name, name)?;

        Ok(Candidate {
            label: make_label(source.kind, name, &manifest),
            kind: CandidateKind::Bundle { bundle },
            source: source.kind,
            manifest,
        })
    }

    /// Stream a remote bundle until its manifest entry is found, then stop
    /// the download.
    async fn remote_bundle_manifest(
        &self,
        cancel: &CancellationToken,
        object: &RemoteRef,
    ) -> Result<Option<(String, Vec<u8>)>> {
        let stream = self.client.cat(cancel, object).await?;
        let reader = SyncIoBridge::new(stream.stdout);
        let parsed = tokio::task::spawn_blocking(move || read_bundle_manifest(reader));
        let parsed = tokio::select! {
            _ = cancel.cancelled() => {
                stream.waiter.kill().await;
                return Err(proxsafe_core::Error::Cancelled.into());
            }
            joined = parsed => joined.map_err(|e| Error::manifest(object.to_string(), e.to_string()))?,
        };

        match parsed {
            Ok(Some(found)) => {
                // Stopping early makes the client exit non-zero; that is expected
                stream.waiter.kill().await;
                Ok(Some(found))
            }
            Ok(None) => {
                let status = stream.waiter.wait().await?;
                if !status.success() {
                    warn!("{} cat {} exited with {}", self.client.program(), object, status.status_text());
                }
                Ok(None)
            }
            Err(e) => {
                stream.waiter.kill().await;
                Err(e)
            }
        }
    }

    async fn raw_candidate(
        &self,
        cancel: &CancellationToken,
        source: &Source,
        archive_name: &str,
        names: &[String],
    ) -> Result<Candidate> {
        let archive = source.location.child(archive_name);
        let metadata_name = format!("{}{}", archive_name, METADATA_SUFFIX);
        let metadata = source.location.child(&metadata_name);
        let checksum_name = format!("{}{}", archive_name, CHECKSUM_SUFFIX);
        let checksum = if names.iter().any(|n| *n == checksum_name) {
            Some(source.location.child(&checksum_name))
        } else {
            warn!("{} has no {} sidecar; integrity cannot be verified", archive_name, CHECKSUM_SUFFIX);
            None
        };

        let data = match &metadata {
            Location::Local(path) => self
                .deps
                .fs
                .read(path)
                .map_err(|e| Error::path_io("Failed to read", path, e))?,
            Location::Remote(object) => self.client.read(cancel, object).await?,
        };
        let mut manifest = Manifest::parse(&data, &archive.to_string(), &metadata_name)?;
        if manifest.created_at.timestamp() == 0 {
            if let Location::Local(path) = &archive {
                if let Some(modified) = self.deps.fs.metadata(path).ok().and_then(|m| m.modified().ok()) {
                    manifest.created_at = DateTime::<Utc>::from(modified);
                }
            }
        }

        Ok(Candidate {
            label: make_label(source.kind, archive_name, &manifest),
            kind: CandidateKind::Raw {
                archive,
                metadata,
                checksum,
            },
            source: source.kind,
            manifest,
        })
    }
}

pub fn sort_newest_first(candidates: &mut [Candidate]) {
    candidates.sort_by(|a, b| b.manifest.created_at.cmp(&a.manifest.created_at));
}

/// Let the operator pick a source and then a candidate. Sources that turn
/// out to hold nothing usable are dropped from the menu.
pub async fn select_candidate(
    deps: &Deps,
    cancel: &CancellationToken,
    encrypted_only: bool,
) -> Result<Candidate> {
    let discovery = Discovery::new(deps);
    let mut sources = configured_sources(&deps.config);

    loop {
        if sources.is_empty() {
            return Err(Error::NoCandidates);
        }
        let labels: Vec<String> = sources.iter().map(Source::label).collect();
        let idx = select_menu(deps.ui.as_ref(), cancel, "Select backup source:", &labels).await?;

        let candidates = discovery.discover(cancel, &sources[idx], encrypted_only).await?;
        if candidates.is_empty() {
            deps.ui.warn(&format!(
                "No usable {}backups in {}",
                if encrypted_only { "encrypted " } else { "" },
                sources[idx].label()
            ));
            sources.remove(idx);
            continue;
        }

        let labels: Vec<String> = candidates.iter().map(|c| c.label.clone()).collect();
        let pick = select_menu(deps.ui.as_ref(), cancel, "Select backup:", &labels).await?;
        return Ok(candidates[pick].clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::{checksum_bytes, format_sidecar};
    use proxsafe_core::sys::CommandOutput;
    use proxsafe_core::testing::TestDeps;

    const DIR: &str = "/opt/proxsafe/backup";

    fn tar_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
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

    fn manifest_json(archive: &str, encryption: &str, created: &str) -> String {
        format!(
            r#"{{"ArchivePath":"{}","EncryptionMode":"{}","ProxmoxType":"pve","CreatedAt":"{}"}}"#,
            archive, encryption, created
        )
    }

    fn bundle(archive: &str, created: &str) -> Vec<u8> {
        let meta = manifest_json(archive, "none", created);
        let meta_name = format!("{}.metadata", archive);
        let sidecar = format_sidecar(&checksum_bytes(b"payload"), archive);
        let sidecar_name = format!("{}.sha256", archive);
        tar_bytes(&[
            (archive, &b"payload"[..]),
            (meta_name.as_str(), meta.as_bytes()),
            (sidecar_name.as_str(), sidecar.as_bytes()),
        ])
    }

    fn primary() -> Source {
        Source {
            kind: SourceKind::Primary,
            location: Location::Local(PathBuf::from(DIR)),
        }
    }

    /// Two bundles, a corrupt bundle, a raw triple without checksum and an
    /// encrypted raw triple.
    fn populate(t: &TestDeps) {
        t.sandbox.put(format!("{}/a.bundle.tar", DIR), bundle("a.tar.gz", "2024-01-15T08:00:00Z"));
        t.sandbox.put(format!("{}/b.bundle.tar", DIR), bundle("b.tar.gz", "2024-06-15T08:00:00Z"));
        t.sandbox.put(format!("{}/c.bundle.tar", DIR), "definitely not a tar archive");

        t.sandbox.put(format!("{}/r.tar.gz", DIR), "raw payload");
        t.sandbox.put(
            format!("{}/r.tar.gz.metadata", DIR),
            manifest_json("r.tar.gz", "none", "2023-12-01T08:00:00Z"),
        );

        t.sandbox.put(format!("{}/e.tar.gz.age", DIR), "ciphertext");
        t.sandbox.put(
            format!("{}/e.tar.gz.age.metadata", DIR),
            manifest_json("e.tar.gz.age", "age", "2024-03-01T08:00:00Z"),
        );
        t.sandbox.put(
            format!("{}/e.tar.gz.age.sha256", DIR),
            format_sidecar(&checksum_bytes(b"ciphertext"), "e.tar.gz.age"),
        );
    }

    fn names(candidates: &[Candidate]) -> Vec<String> {
        candidates.iter().map(Candidate::file_name).collect()
    }

    #[tokio::test]
    async fn test_discover_sorts_newest_first_and_skips_corrupt_bundle() {
        let t = TestDeps::new();
        populate(&t);

        let found = Discovery::new(&t.deps)
            .discover(&CancellationToken::new(), &primary(), false)
            .await
            .unwrap();

        assert_eq!(names(&found), vec!["b.bundle.tar", "e.tar.gz.age", "a.bundle.tar", "r.tar.gz"]);
        assert!(found.iter().all(|c| c.source == SourceKind::Primary));
    }

    #[tokio::test]
    async fn test_raw_candidate_without_checksum_is_kept() {
        let t = TestDeps::new();
        populate(&t);

        let found = Discovery::new(&t.deps)
            .discover(&CancellationToken::new(), &primary(), false)
            .await
            .unwrap();

        let checksum_of = |name: &str| {
            let candidate = found.iter().find(|c| c.file_name() == name).unwrap();
            match &candidate.kind {
                CandidateKind::Raw { checksum, .. } => checksum.clone(),
                CandidateKind::Bundle { .. } => panic!("{} should be raw", name),
            }
        };
        assert_eq!(checksum_of("r.tar.gz"), None);
        assert_eq!(
            checksum_of("e.tar.gz.age"),
            Some(Location::Local(PathBuf::from(format!("{}/e.tar.gz.age.sha256", DIR))))
        );
    }

    #[tokio::test]
    async fn test_encrypted_only_filters_mixed_source() {
        let t = TestDeps::new();
        populate(&t);

        let found = Discovery::new(&t.deps)
            .discover(&CancellationToken::new(), &primary(), true)
            .await
            .unwrap();

        assert_eq!(names(&found), vec!["e.tar.gz.age"]);
        assert!(found[0].manifest.is_encrypted());
        assert!(found[0].label.contains("[encrypted]"));
    }

    #[tokio::test]
    async fn test_unreadable_source_yields_nothing() {
        let t = TestDeps::new();
        let found = Discovery::new(&t.deps)
            .discover(&CancellationToken::new(), &primary(), false)
            .await
            .unwrap();
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn test_remote_stream_stops_once_manifest_is_read() {
        let t = TestDeps::with_config(RestoreConfig {
            cloud_remote: "gdrive:backups".into(),
            ..RestoreConfig::default()
        });
        t.runner.respond(
            "rclone",
            &["lsf"],
            CommandOutput::ok("a.bundle.tar\nempty.bundle.tar\nnotes/\n"),
        );
        let with_manifest = bundle("a.tar.gz", "2024-01-15T08:00:00Z");
        let without_manifest = tar_bytes(&[("readme.txt", &b"no manifest here"[..])]);
        t.runner.stream_with("rclone", &["cat"], move |args| {
            if args[1].ends_with("/a.bundle.tar") {
                with_manifest.clone()
            } else {
                without_manifest.clone()
            }
        });

        let cloud = configured_sources(&t.deps.config).pop().unwrap();
        assert_eq!(cloud.kind, SourceKind::Cloud);
        let found = Discovery::new(&t.deps)
            .discover(&CancellationToken::new(), &cloud, false)
            .await
            .unwrap();

        assert_eq!(names(&found), vec!["a.bundle.tar"]);
        assert!(found[0].is_remote());
        assert!(t.runner.called("rclone cat gdrive:backups/a.bundle.tar"));
        assert!(t.runner.called("rclone cat gdrive:backups/empty.bundle.tar"));
        // only the stream that yielded a manifest is cut short
        assert_eq!(t.runner.killed_streams(), 1);
    }

    #[tokio::test]
    async fn test_empty_source_is_dropped_from_menu() {
        let t = TestDeps::with_config(RestoreConfig {
            secondary_path: "/srv/secondary".into(),
            ..RestoreConfig::default()
        });
        t.sandbox.put(format!("{}/a.bundle.tar", DIR), bundle("a.tar.gz", "2024-01-15T08:00:00Z"));
        // secondary (empty), then the only remaining source, then its backup
        t.answers(["2", "1", "1"]);

        let picked = select_candidate(&t.deps, &CancellationToken::new(), false)
            .await
            .unwrap();

        assert_eq!(picked.file_name(), "a.bundle.tar");
        let output = t.ui.output();
        assert!(output.iter().any(|l| l.contains("No usable backups in secondary")));
        let last_source_menu = output
            .iter()
            .rposition(|l| l == "Select backup source:")
            .unwrap();
        assert!(!output[last_source_menu..].iter().any(|l| l.contains("[2]") && l.contains("secondary")));
        assert_eq!(t.ui.remaining(), 0);
    }

    #[tokio::test]
    async fn test_no_sources_left_is_no_candidates() {
        let t = TestDeps::new();
        t.answers(["1"]);
        let err = select_candidate(&t.deps, &CancellationToken::new(), false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoCandidates));
    }
}
