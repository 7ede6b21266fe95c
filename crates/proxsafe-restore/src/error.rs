//! Error types for proxsafe-restore

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using proxsafe-restore's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Diagnostics for network changes the operator did not commit. The
/// deadman timer stays armed and will revert on its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotCommitted {
    pub marker: PathBuf,
    pub log: PathBuf,
    pub deadline: DateTime<Utc>,
    pub interface: Option<String>,
    pub pre_ip: Option<String>,
    pub post_ip: Option<String>,
}

impl fmt::Display for NotCommitted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "rollback fires at {} (marker {}, log {})",
            self.deadline.format("%Y-%m-%d %H:%M:%S UTC"),
            self.marker.display(),
            self.log.display()
        )?;
        if let Some(iface) = &self.interface {
            write!(
                f,
                "; {}: {} -> {}",
                iface,
                self.pre_ip.as_deref().unwrap_or("?"),
                self.post_ip.as_deref().unwrap_or("?")
            )?;
        }
        Ok(())
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Core(#[from] proxsafe_core::Error),

    #[error(transparent)]
    Backup(#[from] proxsafe_backup::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Network changes not committed: {0}")]
    NetworkApplyNotCommitted(Box<NotCommitted>),

    #[error("Service {unit}: {message}")]
    Service { unit: String, message: String },

    #[error("Service unit {0} not found")]
    ServiceNotFound(String),

    #[error("Failed to apply {category}: {message}")]
    Apply { category: String, message: String },

    #[error("Restore aborted by operator")]
    Aborted,
}

impl Error {
    pub fn service(unit: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Service {
            unit: unit.into(),
            message: message.into(),
        }
    }

    pub fn apply(category: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Apply {
            category: category.into(),
            message: message.into(),
        }
    }

    /// Wrap an IO error with the action and path that produced it
    pub fn path_io(
        action: &'static str,
        path: impl AsRef<std::path::Path>,
        source: std::io::Error,
    ) -> Self {
        Self::Core(proxsafe_core::Error::path_io(action, path, source))
    }

    /// True for operator abort and cancellation, in any wrapping
    pub fn is_abort(&self) -> bool {
        match self {
            Self::Aborted => true,
            Self::Core(e) => e.is_abort(),
            Self::Backup(e) => e.is_abort(),
            _ => false,
        }
    }
}
