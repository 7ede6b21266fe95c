//! Decrypt command

use anyhow::{anyhow, Context, Result};
use camino::Utf8Path;
use proxsafe_backup::run_decrypt_workflow;
use proxsafe_core::Deps;
use tokio_util::sync::CancellationToken;

use super::load_config;
use crate::output;
use crate::version::VersionInfo;

pub async fn run(config: Option<&Utf8Path>, cancel: &CancellationToken) -> Result<()> {
    let deps = Deps::system(load_config(config)?);
    output::header("Decrypt Backup");

    match run_decrypt_workflow(&deps, cancel, &VersionInfo::current().stamp()).await {
        Ok(bundle) => {
            output::success(&format!("Decrypted bundle written to {}", bundle.display()));
            Ok(())
        }
        Err(e) if e.is_abort() => Err(anyhow!("Decryption aborted")),
        Err(e) => Err(e).context("Decryption failed"),
    }
}
