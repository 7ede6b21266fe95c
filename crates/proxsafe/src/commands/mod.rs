//! CLI command implementations

pub mod categories;
pub mod cleanup;
pub mod decrypt;
pub mod restore;
pub mod snapshot;
pub mod version;

use anyhow::{Context, Result};
use camino::Utf8Path;
use proxsafe_core::RestoreConfig;

/// Load the configuration named on the command line, or the default chain.
pub(crate) fn load_config(path: Option<&Utf8Path>) -> Result<RestoreConfig> {
    RestoreConfig::load(path).context("Failed to load proxsafe configuration")
}
