//! Scratch directory cleanup command

use anyhow::{bail, Context, Result};
use camino::Utf8Path;
use proxsafe_core::{Deps, RestoreConfig};
use std::time::Duration;

use super::load_config;
use crate::cli::CleanupTempArgs;
use crate::output;

fn ttl(args: &CleanupTempArgs, config: &RestoreConfig) -> Duration {
    args.ttl_hours
        .map(|hours| Duration::from_secs(hours.saturating_mul(3600)))
        .unwrap_or_else(|| config.tempdir_ttl())
}

pub fn run(args: CleanupTempArgs, config: Option<&Utf8Path>) -> Result<()> {
    let config = load_config(config)?;
    let ttl = ttl(&args, &config);
    let deps = Deps::system(config);

    let summary = deps
        .registry()
        .cleanup_orphaned(ttl)
        .context("Failed to clean up scratch directories")?;

    for path in &summary.removed {
        output::kv("Removed", &path.display().to_string());
    }
    for (path, reason) in &summary.failed {
        output::error(&format!("{}: {}", path.display(), reason));
    }
    output::info(&format!(
        "{} removed, {} kept, {} failed",
        summary.removed.len(),
        summary.kept,
        summary.failed.len()
    ));

    if !summary.failed.is_empty() {
        bail!("Some scratch directories could not be removed");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_override_and_default() {
        let config = RestoreConfig::default();
        let default = ttl(&CleanupTempArgs { ttl_hours: None }, &config);
        assert_eq!(default, Duration::from_secs(24 * 3600));

        let custom = ttl(&CleanupTempArgs { ttl_hours: Some(2) }, &config);
        assert_eq!(custom, Duration::from_secs(7200));
    }
}
