//! Build identity of the proxsafe binary
//!
//! Besides `proxsafe version`, the identity is stamped into the
//! `ScriptVersion` of every manifest a restore or decrypt refreshes, so a
//! re-packed bundle records which build touched it.

use serde::{Deserialize, Serialize};

/// Versions of the workspace libraries linked into this binary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Libraries {
    pub core: String,
    pub backup: String,
    pub restore: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionInfo {
    pub version: String,
    pub git_sha: Option<String>,
    pub build_date: Option<String>,
    pub target: Option<String>,
    pub libraries: Libraries,
}

impl VersionInfo {
    pub fn current() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            git_sha: option_env!("PROXSAFE_GIT_SHA").map(String::from),
            build_date: option_env!("PROXSAFE_BUILD_DATE").map(String::from),
            target: option_env!("PROXSAFE_TARGET").map(String::from),
            libraries: Libraries {
                core: proxsafe_core::VERSION.to_string(),
                backup: proxsafe_backup::VERSION.to_string(),
                restore: proxsafe_restore::VERSION.to_string(),
            },
        }
    }

    /// Value written to a refreshed manifest's `ScriptVersion`:
    /// `0.9.0`, or `0.9.0+abc1234` when the commit is known.
    pub fn stamp(&self) -> String {
        match &self.git_sha {
            Some(sha) => format!("{}+{}", self.version, sha),
            None => self.version.clone(),
        }
    }

    /// True when a library was built from a different version than the binary.
    pub fn is_mixed(&self) -> bool {
        let l = &self.libraries;
        [&l.core, &l.backup, &l.restore].iter().any(|v| **v != self.version)
    }
}

impl std::fmt::Display for VersionInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "proxsafe {}", self.stamp())?;
        match (&self.build_date, &self.target) {
            (Some(date), Some(target)) => write!(f, " (built {} for {})", date, target),
            (Some(date), None) => write!(f, " (built {})", date),
            (None, Some(target)) => write!(f, " ({})", target),
            (None, None) => Ok(()),
        }
    }
}
