//! Backup manifest format and metadata.
//!
//! Every archive travels with a manifest sidecar (`<archive>.metadata`).
//! Current producers write JSON; older ones wrote `KEY=VALUE` lines, which
//! are still accepted.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// Suffix of manifest entries and sidecars
pub const METADATA_SUFFIX: &str = ".metadata";

/// Alternative suffix accepted for manifest entries inside bundles
pub const MANIFEST_JSON_SUFFIX: &str = ".manifest.json";

/// Suffix of checksum sidecars
pub const CHECKSUM_SUFFIX: &str = ".sha256";

/// Suffix of encrypted archives
pub const AGE_SUFFIX: &str = ".age";

/// Proxmox product a backup was taken from (or the host is running)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SystemType {
    Pve,
    Pbs,
    Unknown,
}

impl SystemType {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "pve" => Self::Pve,
            "pbs" => Self::Pbs,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pve => "pve",
            Self::Pbs => "pbs",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for SystemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Encryption applied to the archive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encryption {
    Age,
    None,
}

/// Descriptor of one archive
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(rename = "ArchivePath", default)]
    pub archive_path: String,

    #[serde(rename = "ArchiveSize", default)]
    pub archive_size: i64,

    /// Lowercase hex SHA-256 of the archive
    #[serde(rename = "SHA256", default)]
    pub sha256: String,

    #[serde(rename = "CreatedAt", default = "unix_epoch")]
    pub created_at: DateTime<Utc>,

    #[serde(rename = "EncryptionMode", default)]
    pub encryption_mode: String,

    #[serde(rename = "CompressionType", default)]
    pub compression_type: String,

    #[serde(rename = "CompressionLevel", default)]
    pub compression_level: i32,

    #[serde(rename = "ProxmoxType", default)]
    pub proxmox_type: String,

    #[serde(rename = "ProxmoxTargets", default, deserialize_with = "null_as_empty")]
    pub proxmox_targets: Vec<String>,

    #[serde(rename = "ProxmoxVersion", default)]
    pub proxmox_version: String,

    #[serde(rename = "ClusterMode", default)]
    pub cluster_mode: String,

    #[serde(rename = "Hostname", default)]
    pub hostname: String,

    #[serde(rename = "ScriptVersion", default)]
    pub script_version: String,

    /// Fields this tool does not interpret, kept for read-through
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn unix_epoch() -> DateTime<Utc> {
    DateTime::<Utc>::default()
}

fn null_as_empty<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<String>>::deserialize(deserializer)?.unwrap_or_default())
}

impl Default for Manifest {
    fn default() -> Self {
        Self {
            archive_path: String::new(),
            archive_size: 0,
            sha256: String::new(),
            created_at: unix_epoch(),
            encryption_mode: String::new(),
            compression_type: String::new(),
            compression_level: 0,
            proxmox_type: String::new(),
            proxmox_targets: Vec::new(),
            proxmox_version: String::new(),
            cluster_mode: String::new(),
            hostname: String::new(),
            script_version: String::new(),
            extra: serde_json::Map::new(),
        }
    }
}

impl Manifest {
    /// Parse a manifest body. JSON is tried first; anything that does not
    /// look like a JSON object is read as legacy `KEY=VALUE` metadata.
    pub fn parse(data: &[u8], archive_path: &str, source_name: &str) -> Result<Self> {
        let text = String::from_utf8_lossy(data);
        let trimmed = text.trim_start();
        if trimmed.starts_with('{') {
            Self::from_json(trimmed).map_err(|e| Error::manifest(source_name, e.to_string()))
        } else if trimmed.is_empty() {
            Err(Error::manifest(source_name, "empty manifest"))
        } else {
            Ok(Self::from_legacy(&text, archive_path))
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parse legacy `KEY=VALUE` metadata. Blank lines, comments and lines
    /// that do not parse are ignored.
    pub fn from_legacy(text: &str, archive_path: &str) -> Self {
        let mut manifest = Manifest {
            archive_path: archive_path.to_string(),
            ..Manifest::default()
        };
        let mut encryption = None;

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                tracing::debug!("Ignoring legacy metadata line without '=': {:?}", line);
                continue;
            };
            let value = value.trim().trim_matches('"').to_string();
            match key.trim() {
                "COMPRESSION_TYPE" => manifest.compression_type = value,
                "COMPRESSION_LEVEL" => match value.parse() {
                    Ok(level) => manifest.compression_level = level,
                    Err(_) => tracing::debug!("Ignoring invalid COMPRESSION_LEVEL {:?}", value),
                },
                "PROXMOX_TYPE" => manifest.proxmox_type = value,
                "HOSTNAME" => manifest.hostname = value,
                "SCRIPT_VERSION" => manifest.script_version = value,
                "ENCRYPTION_MODE" => encryption = Some(value),
                other => tracing::debug!("Ignoring unknown legacy metadata key {:?}", other),
            }
        }

        manifest.encryption_mode = encryption.unwrap_or_else(|| {
            if archive_path.ends_with(AGE_SUFFIX) {
                "age".to_string()
            } else {
                "none".to_string()
            }
        });
        manifest
    }

    pub fn encryption(&self) -> Encryption {
        if self.encryption_mode.trim().eq_ignore_ascii_case("age") {
            Encryption::Age
        } else {
            Encryption::None
        }
    }

    pub fn is_encrypted(&self) -> bool {
        self.encryption() == Encryption::Age
    }

    pub fn system_type(&self) -> SystemType {
        SystemType::parse(&self.proxmox_type)
    }

    /// Products covered by the backup; `ProxmoxType` when no targets are listed
    pub fn targets(&self) -> Vec<SystemType> {
        if self.proxmox_targets.is_empty() {
            vec![self.system_type()]
        } else {
            self.proxmox_targets
                .iter()
                .map(|t| SystemType::parse(t))
                .collect()
        }
    }

    pub fn is_cluster_backup(&self) -> bool {
        self.cluster_mode.trim().eq_ignore_ascii_case("cluster")
    }

    /// Archive file name (basename of `ArchivePath`)
    pub fn archive_name(&self) -> &str {
        self.archive_path
            .rsplit('/')
            .next()
            .unwrap_or(&self.archive_path)
    }
}
