//! # proxsafe-core
//!
//! Core library for proxsafe providing:
//! - Capability traits for the filesystem, clock, subprocesses and host
//! - Atomic, mode-enforcing configuration writes
//! - The temp-dir registry for scratch directories
//! - Operator prompts (menus, overwrite decisions, secret entry)
//! - Configuration file parsing (proxsafe.yaml)

pub mod config;
pub mod deps;
pub mod error;
pub mod secret;
pub mod sys;
pub mod tempreg;
pub mod ui;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use config::RestoreConfig;
pub use deps::Deps;
pub use error::{Error, Result};
pub use secret::SecretString;
pub use tempreg::TempDirRegistry;

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
