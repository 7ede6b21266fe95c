//! Configuration file loading and parsing

use crate::error::{Error, Result};
use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

/// Environment variable that points at an alternate configuration file
pub const CONFIG_ENV_VAR: &str = "PROXSAFE_CONFIG";

/// Default configuration location
pub const DEFAULT_CONFIG_PATH: &str = "/etc/proxsafe/proxsafe.yaml";

/// Operator override for the PBS restore behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PbsBehaviorOverride {
    Clean,
    Merge,
}

/// Network safety envelope settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSettings {
    /// Seconds before the deadman switch rolls network files back
    pub rollback_timeout_secs: u64,

    /// Seconds the operator has to type the commit phrase
    pub commit_window_secs: u64,

    /// Phrase that confirms the new network configuration
    pub commit_phrase: String,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            rollback_timeout_secs: 180,
            commit_window_secs: 120,
            commit_phrase: "COMMIT".to_string(),
        }
    }
}

/// Service manager settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceSettings {
    /// Upper bound for a service to reach `active`
    pub start_timeout_secs: u64,

    /// Poll interval while waiting for a service state
    pub poll_interval_ms: u64,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            start_timeout_secs: 60,
            poll_interval_ms: 500,
        }
    }
}

/// Restore orchestrator configuration (`proxsafe.yaml`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestoreConfig {
    /// Tool name, used for `/tmp/<tool>/` and unit names
    pub tool_name: String,

    /// Primary local backup directory
    pub backup_path: Utf8PathBuf,

    /// Optional secondary backup directory (empty = disabled)
    pub secondary_path: String,

    /// Cloud location: `<remote>:<path>` or an absolute path (empty = disabled)
    pub cloud_remote: String,

    /// Root for scratch directories
    pub temp_root: Utf8PathBuf,

    /// JSON file recording live scratch directories
    pub tempdir_registry: Utf8PathBuf,

    /// Age after which orphaned scratch directories are reaped
    pub tempdir_ttl_hours: u64,

    /// Where export-only categories are written
    pub export_dir: Utf8PathBuf,

    /// Remote-object client binary
    pub remote_client: String,

    /// Plan only, never touch live files
    pub dry_run: bool,

    /// Force clean or merge behavior for PBS restores
    pub pbs_behavior: Option<PbsBehaviorOverride>,

    pub network: NetworkSettings,

    pub services: ServiceSettings,
}

impl Default for RestoreConfig {
    fn default() -> Self {
        Self {
            tool_name: "proxsafe".to_string(),
            backup_path: Utf8PathBuf::from("/opt/proxsafe/backup"),
            secondary_path: String::new(),
            cloud_remote: String::new(),
            temp_root: Utf8PathBuf::from("/tmp/proxsafe"),
            tempdir_registry: Utf8PathBuf::from("/var/lib/proxsafe/tempdirs.json"),
            tempdir_ttl_hours: 24,
            export_dir: Utf8PathBuf::from("/opt/proxsafe/export"),
            remote_client: "rclone".to_string(),
            dry_run: false,
            pbs_behavior: None,
            network: NetworkSettings::default(),
            services: ServiceSettings::default(),
        }
    }
}

impl RestoreConfig {
    /// Load configuration from an explicit path, `$PROXSAFE_CONFIG`, or the
    /// default location. A missing default file yields the defaults.
    pub fn load(path: Option<&Utf8Path>) -> Result<Self> {
        if let Some(p) = path {
            return Self::from_file(p);
        }

        if let Ok(env_path) = std::env::var(CONFIG_ENV_VAR) {
            if !env_path.trim().is_empty() {
                return Self::from_file(Utf8Path::new(env_path.trim()));
            }
        }

        let default_path = Utf8Path::new(DEFAULT_CONFIG_PATH);
        if default_path.exists() {
            Self::from_file(default_path)
        } else {
            tracing::debug!("No configuration file found, using defaults");
            Ok(Self::default())
        }
    }

    /// Load and validate a configuration file
    pub fn from_file(path: &Utf8Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::config_not_found(path.as_str())
            } else {
                Error::Io(e)
            }
        })?;
        Self::from_yaml(&content)
    }

    /// Parse and validate YAML content
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: RestoreConfig = serde_yaml_ng::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check invariants that serde cannot express
    pub fn validate(&self) -> Result<()> {
        if self.tool_name.trim().is_empty() || self.tool_name.contains('/') {
            return Err(Error::invalid_config(format!(
                "tool_name must be a non-empty name without '/': {:?}",
                self.tool_name
            )));
        }
        if self.network.commit_window_secs == 0 {
            return Err(Error::invalid_config(
                "network.commit_window_secs must be greater than zero",
            ));
        }
        if self.network.commit_phrase.trim().is_empty() {
            return Err(Error::invalid_config("network.commit_phrase must not be empty"));
        }
        if self.services.start_timeout_secs == 0 || self.services.poll_interval_ms == 0 {
            return Err(Error::invalid_config(
                "services timeouts must be greater than zero",
            ));
        }
        Ok(())
    }

    /// `/tmp/<tool>`: safety backups, rollback workdirs, pointer files
    pub fn tool_tmp_dir(&self) -> Utf8PathBuf {
        Utf8PathBuf::from("/tmp").join(&self.tool_name)
    }

    /// Secondary path, if enabled
    pub fn secondary(&self) -> Option<Utf8PathBuf> {
        let trimmed = self.secondary_path.trim();
        (!trimmed.is_empty()).then(|| Utf8PathBuf::from(trimmed))
    }

    /// Cloud location token, if enabled (whitespace-only means disabled)
    pub fn cloud(&self) -> Option<&str> {
        let trimmed = self.cloud_remote.trim();
        (!trimmed.is_empty()).then_some(trimmed)
    }

    pub fn tempdir_ttl(&self) -> Duration {
        Duration::from_secs(self.tempdir_ttl_hours.saturating_mul(3600))
    }

    /// Deadman timeout, floored to one second
    pub fn rollback_timeout(&self) -> Duration {
        Duration::from_secs(self.network.rollback_timeout_secs.max(1))
    }

    pub fn commit_window(&self) -> Duration {
        Duration::from_secs(self.network.commit_window_secs)
    }

    pub fn service_start_timeout(&self) -> Duration {
        Duration::from_secs(self.services.start_timeout_secs)
    }

    pub fn service_poll_interval(&self) -> Duration {
        Duration::from_millis(self.services.poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config_is_valid() {
        let config = RestoreConfig::default();
        config.validate().unwrap();
        assert_eq!(config.tool_tmp_dir(), Utf8PathBuf::from("/tmp/proxsafe"));
        assert!(config.secondary().is_none());
        assert!(config.cloud().is_none());
    }

    #[test]
    fn test_parse_partial_config() {
        let yaml = r#"
backup_path: /mnt/backups
cloud_remote: "  gdrive:pve  "
network:
  commit_window_secs: 30
pbs_behavior: merge
"#;
        let config = RestoreConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.backup_path, Utf8PathBuf::from("/mnt/backups"));
        assert_eq!(config.cloud(), Some("gdrive:pve"));
        assert_eq!(config.network.commit_window_secs, 30);
        assert_eq!(config.network.commit_phrase, "COMMIT");
        assert_eq!(config.pbs_behavior, Some(PbsBehaviorOverride::Merge));
    }

    #[test]
    fn test_whitespace_cloud_is_disabled() {
        let config = RestoreConfig::from_yaml("cloud_remote: '   '\n").unwrap();
        assert!(config.cloud().is_none());
    }

    #[test]
    fn test_rollback_timeout_floor() {
        let config = RestoreConfig::from_yaml("network:\n  rollback_timeout_secs: 0\n").unwrap();
        assert_eq!(config.rollback_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn test_invalid_tool_name_rejected() {
        let err = RestoreConfig::from_yaml("tool_name: a/b\n").unwrap_err();
        assert!(err.to_string().contains("tool_name"));
    }

    #[test]
    fn test_load_nonexistent_file() {
        let result = RestoreConfig::from_file(Utf8Path::new("/nonexistent/proxsafe.yaml"));
        assert!(matches!(result, Err(Error::ConfigNotFound { .. })));
    }

    #[test]
    fn test_load_invalid_yaml_syntax() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("proxsafe.yaml");
        std::fs::write(&path, "backup_path: [unclosed").unwrap();
        let path = Utf8PathBuf::from_path_buf(path).unwrap();
        assert!(matches!(
            RestoreConfig::from_file(&path),
            Err(Error::YamlParse(_))
        ));
    }
}
