//! Proxsafe bundle handling
//!
//! Everything between "a backup exists somewhere" and "its plaintext sits in
//! a private scratch directory":
//!
//! - **Discovery** across the primary path, an optional secondary path and an
//!   optional cloud source (local path or `<remote>:<path>`)
//! - **Manifests** in JSON or the legacy `KEY=VALUE` form
//! - **Preparation**: path-safe bundle extraction, remote download, SHA-256
//!   verification and the interactive age decryption loop
//! - **Safety backups** of live paths before they are overwritten
//! - **Decrypt workflow** producing a plain `.decrypted.bundle.tar`
//!
//! # Examples
//!
//! ```no_run
//! use proxsafe_backup::{prepare_candidate, select_candidate};
//! use proxsafe_core::{Deps, RestoreConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let deps = Deps::system(RestoreConfig::load(None)?);
//!     let cancel = CancellationToken::new();
//!
//!     let candidate = select_candidate(&deps, &cancel, false).await?;
//!     let mut staged = prepare_candidate(&deps, &cancel, &candidate, None).await?;
//!     println!("Plaintext archive at {}", staged.archive.display());
//!     staged.cleanup()?;
//!     Ok(())
//! }
//! ```

pub mod checksum;
pub mod decrypt;
pub mod discovery;
pub mod error;
pub mod extract;
pub mod manifest;
pub mod paths;
pub mod prepare;
pub mod remote;
pub mod snapshot;
pub mod workflow;

// Re-export commonly used types
pub use checksum::calculate_checksum;
pub use discovery::{configured_sources, select_candidate, Candidate, CandidateKind, Location, Source, SourceKind};
pub use error::{Error, Result};
pub use extract::{unpack_archive, Compression};
pub use manifest::{Manifest, SystemType};
pub use paths::PathSelector;
pub use prepare::{prepare_candidate, StagedBundle};
pub use remote::{is_remote_reference, RemoteClient, RemoteRef};
pub use snapshot::{create_safety_backup, restore_safety_backup, SafetyBackup};
pub use workflow::{run_decrypt_workflow, DECRYPTED_BUNDLE_SUFFIX};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_bundle_suffixes() {
        assert_eq!(discovery::BUNDLE_SUFFIX, ".bundle.tar");
        assert!(DECRYPTED_BUNDLE_SUFFIX.ends_with(discovery::BUNDLE_SUFFIX));
    }
}
