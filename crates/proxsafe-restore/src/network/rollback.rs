//! Deadman-switch network rollback
//!
//! Before network files change, the current versions are saved into a
//! work directory next to a shell script that puts them back and reloads
//! networking. A marker file arms the script; a timer runs it after the
//! rollback timeout. Committing removes the marker and stops the timer, so
//! a script that fires late finds no marker and exits.

use chrono::{DateTime, Utc};
use proxsafe_core::sys::{args, ensure_dir_all_inherit, DIR_MODE};
use proxsafe_core::Deps;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

const SCRIPT_MODE: u32 = 0o700;
const SYSTEMD_RUN: &str = "systemd-run";

/// Single-quote `s` for `sh`.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

fn quote_path(path: &Path) -> String {
    shell_quote(&path.to_string_lossy())
}

/// One file the rollback puts back. `saved` is `None` when the file did
/// not exist before the change and must be removed again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackEntry {
    pub live: PathBuf,
    pub saved: Option<PathBuf>,
}

/// How the rollback was scheduled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scheduler {
    /// Transient systemd timer with this unit name
    Systemd(String),
    /// Detached `nohup sleep` fallback
    Nohup,
}

/// An armed rollback
#[derive(Debug, Clone)]
pub struct RollbackHandle {
    pub workdir: PathBuf,
    pub script: PathBuf,
    pub marker: PathBuf,
    pub log: PathBuf,
    pub armed_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub scheduler: Scheduler,
}

/// `/tmp/<tool>/network_rollback_<stamp>`, created.
pub fn create_workdir(deps: &Deps) -> Result<PathBuf> {
    let dir = deps
        .config
        .tool_tmp_dir()
        .into_std_path_buf()
        .join(format!("network_rollback_{}", deps.clock.stamp()));
    ensure_dir_all_inherit(deps.fs.as_ref(), deps.host.as_ref(), &dir, DIR_MODE)?;
    Ok(dir)
}

/// Save the current state of `paths` (logical live paths) into the
/// workdir for the rollback script.
pub fn save_originals(deps: &Deps, workdir: &Path, paths: &[PathBuf]) -> Result<Vec<RollbackEntry>> {
    let fs = deps.fs.as_ref();
    let saved_root = workdir.join("saved");
    let mut entries = Vec::new();
    for live in paths {
        let saved = if fs.exists(live) {
            let copy = proxsafe_core::sys::join_under(&saved_root, live);
            let data = fs.read(live).map_err(|e| Error::path_io("Failed to read", live, e))?;
            let mode = fs
                .metadata(live)
                .map(|m| std::os::unix::fs::PermissionsExt::mode(&m.permissions()) & 0o7777)
                .unwrap_or(0o644);
            if let Some(parent) = copy.parent() {
                fs.create_dir_all(parent)
                    .map_err(|e| Error::path_io("Failed to create", parent, e))?;
            }
            fs.write(&copy, &data, mode)
                .map_err(|e| Error::path_io("Failed to write", &copy, e))?;
            Some(copy)
        } else {
            None
        };
        entries.push(RollbackEntry { live: live.clone(), saved });
    }
    Ok(entries)
}

/// Render the rollback script. Paths are real (resolved) paths.
pub fn render_script(marker: &Path, log: &Path, entries: &[RollbackEntry], reload: &str) -> String {
    let mut s = String::new();
    let _ = writeln!(s, "#!/bin/sh");
    let _ = writeln!(s, "MARKER={}", quote_path(marker));
    let _ = writeln!(s, "LOG={}", quote_path(log));
    let _ = writeln!(s, "[ -e \"$MARKER\" ] || exit 0");
    let _ = writeln!(s, "echo \"network rollback started $(date)\" >> \"$LOG\"");
    for entry in entries {
        let live = quote_path(&entry.live);
        match &entry.saved {
            Some(saved) => {
                let _ = writeln!(s, "mkdir -p \"$(dirname {})\"", live);
                let _ = writeln!(s, "cp -p {} {} >> \"$LOG\" 2>&1", quote_path(saved), live);
            }
            None => {
                let _ = writeln!(s, "rm -f {} >> \"$LOG\" 2>&1", live);
            }
        }
    }
    if !reload.is_empty() {
        let _ = writeln!(s, "{} >> \"$LOG\" 2>&1 || echo \"reload failed\" >> \"$LOG\"", reload);
    }
    let _ = writeln!(s, "rm -f \"$MARKER\"");
    let _ = writeln!(s, "echo \"network rollback finished $(date)\" >> \"$LOG\"");
    s
}

/// Write the script and marker, then schedule the script `timeout` from
/// now. Timeouts under one second become one second.
pub async fn arm(
    deps: &Deps,
    cancel: &CancellationToken,
    workdir: &Path,
    entries: &[RollbackEntry],
    reload: &str,
    timeout: Duration,
) -> Result<RollbackHandle> {
    let fs = deps.fs.as_ref();
    let timeout = timeout.max(Duration::from_secs(1));
    let script = workdir.join("rollback.sh");
    let marker = workdir.join("rollback.armed");
    let log = workdir.join("rollback.log");

    let real: Vec<RollbackEntry> = entries
        .iter()
        .map(|e| RollbackEntry {
            live: fs.resolve(&e.live),
            saved: e.saved.as_ref().map(|p| fs.resolve(p)),
        })
        .collect();
    let body = render_script(&fs.resolve(&marker), &fs.resolve(&log), &real, reload);
    fs.write(&script, body.as_bytes(), SCRIPT_MODE)
        .map_err(|e| Error::path_io("Failed to write", &script, e))?;
    fs.write(&marker, b"", 0o600)
        .map_err(|e| Error::path_io("Failed to write", &marker, e))?;

    let secs = timeout.as_secs().max(1);
    let script_real = fs.resolve(&script).to_string_lossy().into_owned();
    let armed_at = deps.clock.now();
    let unit = format!("{}-network-rollback-{}", deps.config.tool_name, deps.clock.stamp());

    let scheduler = if deps.cmd.available(SYSTEMD_RUN) {
        let argv = args([
            format!("--unit={}", unit),
            format!("--on-active={}s", secs),
            "--timer-property=AccuracySec=1s".to_string(),
            "/bin/sh".to_string(),
            script_real.clone(),
        ]);
        let out = deps.cmd.run(cancel, SYSTEMD_RUN, &argv).await?;
        if out.success() {
            Some(Scheduler::Systemd(unit))
        } else {
            warn!("systemd-run failed ({}), using nohup fallback", out.output.trim());
            None
        }
    } else {
        None
    };

    let scheduler = match scheduler {
        Some(s) => s,
        None => {
            let inner = format!("sleep {}; /bin/sh {}", secs, shell_quote(&script_real));
            let detached = format!("nohup sh -c {} >/dev/null 2>&1 &", shell_quote(&inner));
            deps.cmd
                .run(cancel, "sh", &args(["-c", detached.as_str()]))
                .await?
                .check("sh")?;
            Scheduler::Nohup
        }
    };

    let deadline = armed_at
        + chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::seconds(secs as i64));
    info!(
        "Network rollback armed for {} ({:?})",
        deadline.format("%H:%M:%S"),
        scheduler
    );
    Ok(RollbackHandle {
        workdir: workdir.to_path_buf(),
        script,
        marker,
        log,
        armed_at,
        deadline,
        scheduler,
    })
}

impl RollbackHandle {
    /// Remove the marker and stop the timer.
    pub async fn disarm(&self, deps: &Deps, cancel: &CancellationToken) -> Result<()> {
        let fs = deps.fs.as_ref();
        match fs.remove_file(&self.marker) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Rollback marker already gone; the rollback may have run");
            }
            Err(e) => return Err(Error::path_io("Failed to remove", &self.marker, e)),
        }

        if let Scheduler::Systemd(unit) = &self.scheduler {
            let services = crate::services::Services::new(deps, cancel);
            for suffix in ["timer", "service"] {
                let name = format!("{}.{}", unit, suffix);
                if let Err(e) = services.stop(&name).await {
                    debug!("stop {}: {}", name, e);
                }
                services.reset_failed(&name).await;
            }
        }
        info!("Network rollback disarmed");
        Ok(())
    }

    pub fn is_armed(&self, deps: &Deps) -> bool {
        deps.fs.exists(&self.marker)
    }
}
