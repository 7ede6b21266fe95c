//! Service manager calls
//!
//! Thin wrapper over `systemctl` with a bounded start wait. Time is read
//! from the clock capability, so tests drive the poll loop with a fake clock.

use crate::error::{Error, Result};
use proxsafe_core::sys::{args, CommandOutput};
use proxsafe_core::Deps;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const SYSTEMCTL: &str = "systemctl";

pub const PBS_DAEMON: &str = "proxmox-backup.service";
pub const PBS_PROXY: &str = "proxmox-backup-proxy.service";
pub const PVE_CLUSTER_UNIT: &str = "pve-cluster.service";

fn unit_missing(output: &str) -> bool {
    let lower = output.to_ascii_lowercase();
    lower.contains("not found") || lower.contains("not loaded") || lower.contains("no such unit")
}

pub struct Services<'a> {
    deps: &'a Deps,
    cancel: &'a CancellationToken,
}

impl<'a> Services<'a> {
    pub fn new(deps: &'a Deps, cancel: &'a CancellationToken) -> Self {
        Self { deps, cancel }
    }

    async fn systemctl(&self, argv: &[&str]) -> Result<CommandOutput> {
        Ok(self.deps.cmd.run(self.cancel, SYSTEMCTL, &args(argv)).await?)
    }

    async fn checked(&self, verb: &str, unit: &str, argv: &[&str]) -> Result<()> {
        let out = self.systemctl(argv).await?;
        if out.success() {
            return Ok(());
        }
        if unit_missing(&out.output) {
            return Err(Error::ServiceNotFound(unit.to_string()));
        }
        Err(Error::service(
            unit,
            format!("{} failed ({}): {}", verb, out.status_text(), out.output.trim()),
        ))
    }

    /// Current `is-active` state (`active`, `activating`, `failed`, ...)
    pub async fn state(&self, unit: &str) -> Result<String> {
        let out = self.systemctl(&["is-active", unit]).await?;
        let state = out.output.trim().lines().last().unwrap_or("").trim().to_string();
        Ok(if state.is_empty() { "unknown".to_string() } else { state })
    }

    /// Start `unit` and poll until it reports `active`, bounded by the
    /// configured start timeout.
    pub async fn start_and_wait(&self, unit: &str) -> Result<()> {
        info!("Starting {}", unit);
        self.checked("start", unit, &["start", unit]).await?;

        let timeout = self.deps.config.service_start_timeout();
        let poll = self.deps.config.service_poll_interval().max(Duration::from_millis(1));
        let started = self.deps.clock.now();

        loop {
            let state = self.state(unit).await?;
            match state.as_str() {
                "active" => {
                    debug!("{} is active", unit);
                    return Ok(());
                }
                "failed" => {
                    return Err(Error::service(unit, "entered failed state while starting"));
                }
                other => debug!("{} is {}, waiting", unit, other),
            }

            let elapsed = (self.deps.clock.now() - started).to_std().unwrap_or_default();
            if elapsed >= timeout {
                return Err(Error::service(
                    unit,
                    format!("not active after {}s (last state {})", timeout.as_secs(), state),
                ));
            }
            if self.cancel.is_cancelled() {
                return Err(proxsafe_core::Error::Cancelled.into());
            }
            self.deps.clock.sleep(poll).await;
        }
    }

    pub async fn stop(&self, unit: &str) -> Result<()> {
        info!("Stopping {}", unit);
        self.checked("stop", unit, &["stop", unit]).await
    }

    /// Queue a stop without waiting for the unit to go down.
    pub async fn stop_no_block(&self, unit: &str) -> Result<()> {
        debug!("Queueing stop of {}", unit);
        self.checked("stop", unit, &["stop", "--no-block", unit]).await
    }

    pub async fn restart(&self, unit: &str) -> Result<()> {
        info!("Restarting {}", unit);
        self.checked("restart", unit, &["restart", unit]).await
    }

    pub async fn daemon_reload(&self) -> Result<()> {
        self.checked("daemon-reload", "systemd", &["daemon-reload"]).await
    }

    /// Clear a failed state; a missing unit is not an error here.
    pub async fn reset_failed(&self, unit: &str) {
        match self.systemctl(&["reset-failed", unit]).await {
            Ok(out) if !out.success() => debug!("reset-failed {}: {}", unit, out.output.trim()),
            Ok(_) => {}
            Err(e) => warn!("reset-failed {}: {}", unit, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proxsafe_core::testing::TestDeps;

    #[tokio::test]
    async fn test_start_waits_through_activating() {
        let t = TestDeps::new();
        t.runner.respond_once("systemctl", &["is-active"], CommandOutput::failed(3, "activating\n"));
        t.runner.respond_once("systemctl", &["is-active"], CommandOutput::failed(3, "activating\n"));
        t.runner.respond("systemctl", &["is-active"], CommandOutput::ok("active\n"));

        let cancel = CancellationToken::new();
        Services::new(&t.deps, &cancel).start_and_wait(PBS_DAEMON).await.unwrap();

        let polls = t.runner.lines().iter().filter(|l| l.contains("is-active")).count();
        assert_eq!(polls, 3);
        assert!(t.runner.called("systemctl start proxmox-backup.service"));
    }

    #[tokio::test]
    async fn test_missing_unit_is_fatal() {
        let t = TestDeps::new();
        t.runner.respond(
            "systemctl",
            &["start"],
            CommandOutput::failed(5, "Failed to start x.service: Unit x.service not found."),
        );
        let cancel = CancellationToken::new();
        let err = Services::new(&t.deps, &cancel).start_and_wait("x.service").await.unwrap_err();
        assert!(matches!(err, Error::ServiceNotFound(ref u) if u == "x.service"));
        assert!(!t.runner.called("systemctl is-active"));
    }

    #[tokio::test]
    async fn test_start_times_out() {
        let t = TestDeps::new();
        t.runner.respond("systemctl", &["is-active"], CommandOutput::failed(3, "inactive"));
        let cancel = CancellationToken::new();
        let err = Services::new(&t.deps, &cancel).start_and_wait(PBS_DAEMON).await.unwrap_err();
        assert!(matches!(err, Error::Service { .. }));
        assert!(err.to_string().contains("not active after 60s"));
    }

    #[tokio::test]
    async fn test_failed_state_stops_waiting() {
        let t = TestDeps::new();
        t.runner.respond("systemctl", &["is-active"], CommandOutput::failed(3, "failed"));
        let cancel = CancellationToken::new();
        let err = Services::new(&t.deps, &cancel).start_and_wait(PBS_DAEMON).await.unwrap_err();
        assert!(err.to_string().contains("failed state"));
    }
}
