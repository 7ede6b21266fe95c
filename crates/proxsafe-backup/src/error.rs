//! Error types for proxsafe-backup

use thiserror::Error;

/// Result type alias using proxsafe-backup's Error type
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Core(#[from] proxsafe_core::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Manifest could not be found or parsed
    #[error("Invalid manifest {source_name}: {message}")]
    Manifest {
        source_name: String,
        message: String,
    },

    /// Tar entry would land outside the extraction root
    #[error("Tar entry {entry:?} escapes workdir")]
    EscapesWorkdir { entry: String },

    /// Bundle lacks one of archive, metadata, checksum
    #[error("Bundle is missing its {what}")]
    MissingEntry { what: &'static str },

    #[error("Invalid remote reference {reference:?}: {reason}")]
    InvalidRemote { reference: String, reason: String },

    #[error("Checksum mismatch for {path}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    /// Operator aborted the decryption prompt
    #[error("Decryption aborted by operator")]
    DecryptAborted,

    #[error("Decryption failed: {0}")]
    Decrypt(String),

    #[error("Unsupported compression: {0}")]
    UnsupportedCompression(String),

    #[error("No backup candidates found")]
    NoCandidates,
}

impl Error {
    pub fn manifest(source_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Manifest {
            source_name: source_name.into(),
            message: message.into(),
        }
    }

    pub fn escapes(entry: impl Into<String>) -> Self {
        Self::EscapesWorkdir {
            entry: entry.into(),
        }
    }

    pub fn invalid_remote(reference: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidRemote {
            reference: reference.into(),
            reason: reason.into(),
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
            Self::DecryptAborted => true,
            Self::Core(e) => e.is_abort(),
            _ => false,
        }
    }
}
