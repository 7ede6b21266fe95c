//! fstab smart-merge
//!
//! The backup's fstab describes disks of the old machine. Only mounts that
//! can work here are offered: network filesystems, and UUID mounts whose
//! device is present. Whether the offer defaults to yes depends on root and
//! swap matching between the two files.

use proxsafe_core::sys::write_file_atomic;
use proxsafe_core::ui::confirm;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use tracing::{debug, info};

use crate::apply::{ApplyContext, Outcome};
use crate::error::{Error, Result};

const FSTAB: &str = "etc/fstab";
const BY_UUID: &str = "/dev/disk/by-uuid";

const NETWORK_FS: &[&str] = &[
    "nfs", "nfs4", "cifs", "smbfs", "smb3", "glusterfs", "ceph", "fuse.sshfs", "fuse.glusterfs", "9p",
];

/// One non-comment fstab line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FstabEntry {
    pub spec: String,
    pub file: String,
    pub vfstype: String,
    pub raw: String,
}

impl FstabEntry {
    fn is_root(&self) -> bool {
        self.file == "/"
    }

    fn is_swap(&self) -> bool {
        self.vfstype == "swap"
    }

    /// Fields that must agree for root/swap to count as the same
    fn comparable(&self) -> (&str, &str, &str) {
        (&self.spec, &self.file, &self.vfstype)
    }
}

pub fn parse(text: &str) -> Vec<FstabEntry> {
    text.lines()
        .filter_map(|line| {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                return None;
            }
            let mut fields = trimmed.split_whitespace();
            Some(FstabEntry {
                spec: fields.next()?.to_string(),
                file: fields.next()?.to_string(),
                vfstype: fields.next().unwrap_or("auto").to_string(),
                raw: trimmed.to_string(),
            })
        })
        .collect()
}

fn system_entries(entries: &[FstabEntry]) -> Vec<(&str, &str, &str)> {
    let mut out: Vec<_> = entries
        .iter()
        .filter(|e| e.is_root() || e.is_swap())
        .map(FstabEntry::comparable)
        .collect();
    out.sort();
    out
}

/// Root and swap agree between the live and backed-up fstab.
pub fn system_matches(live: &[FstabEntry], backup: &[FstabEntry]) -> bool {
    system_entries(live) == system_entries(backup)
}

/// Why a backed-up mount is or is not offered
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Network,
    Uuid,
    MissingDevice(String),
    BareDevice,
    Unsupported,
}

impl Verdict {
    pub fn offered(&self) -> bool {
        matches!(self, Self::Network | Self::Uuid)
    }
}

pub fn classify(fs: &dyn proxsafe_core::sys::FileSystem, entry: &FstabEntry) -> Verdict {
    if NETWORK_FS.contains(&entry.vfstype.as_str()) {
        return Verdict::Network;
    }
    if let Some(uuid) = entry.spec.strip_prefix("UUID=") {
        let uuid = uuid.trim_matches('"');
        return if fs.exists(&Path::new(BY_UUID).join(uuid)) {
            Verdict::Uuid
        } else {
            Verdict::MissingDevice(uuid.to_string())
        };
    }
    if entry.spec.starts_with("/dev/") {
        return Verdict::BareDevice;
    }
    Verdict::Unsupported
}

/// Backed-up mounts this host lacks that are safe to add.
pub fn proposals<'a>(
    fs: &dyn proxsafe_core::sys::FileSystem,
    live: &[FstabEntry],
    backup: &'a [FstabEntry],
) -> Vec<&'a FstabEntry> {
    backup
        .iter()
        .filter(|e| !e.is_root() && !e.is_swap())
        .filter(|e| !live.iter().any(|l| l.file == e.file))
        .filter(|e| {
            let verdict = classify(fs, e);
            if !verdict.offered() {
                debug!("Not offering {} ({:?})", e.file, verdict);
            }
            verdict.offered()
        })
        .collect()
}

fn markers(tool: &str) -> (String, String) {
    (
        format!("# BEGIN {} restored mounts", tool),
        format!("# END {} restored mounts", tool),
    )
}

/// Live fstab with `added` in a marker block, replacing an earlier block.
pub fn merged(live: &str, added: &[&FstabEntry], tool: &str) -> String {
    let (begin, end) = markers(tool);
    let mut out = String::new();
    let mut inside = false;
    for line in live.lines() {
        if line.trim() == begin {
            inside = true;
            continue;
        }
        if inside {
            if line.trim() == end {
                inside = false;
            }
            continue;
        }
        out.push_str(line);
        out.push('\n');
    }
    out.push_str(&begin);
    out.push('\n');
    for entry in added {
        out.push_str(&entry.raw);
        out.push('\n');
    }
    out.push_str(&end);
    out.push('\n');
    out
}

/// `filesystem` category
pub async fn apply_fstab(ctx: &ApplyContext<'_>) -> Result<Outcome> {
    let fs = ctx.deps.fs.as_ref();
    let ui = ctx.deps.ui.as_ref();
    let Some(staged) = ctx.read_staged(FSTAB)? else {
        return Ok(Outcome::skipped("nothing staged"));
    };
    let live_text = ctx.read_live(FSTAB)?;
    let live = parse(&live_text);
    let backup = parse(&staged);

    let offered = proposals(fs, &live, &backup);
    if offered.is_empty() {
        return Ok(Outcome::skipped("no mounts to add"));
    }

    let same_system = system_matches(&live, &backup);
    if !same_system {
        ui.warn("Root or swap in the backed-up fstab differ from this system");
    }
    ui.println("Mounts from the backup that can be added:");
    for entry in &offered {
        ui.println(&format!("  {}", entry.raw));
    }
    if !confirm(ui, ctx.cancel, "Add these mounts to /etc/fstab?", same_system).await? {
        return Ok(Outcome::skipped("declined by operator"));
    }

    let path = ctx.live(FSTAB);
    let mode = fs
        .metadata(&path)
        .map(|m| m.permissions().mode() & 0o7777)
        .unwrap_or(0o644);
    if fs.exists(&path) {
        let backup_path = ctx.live(&format!("{}.bak-{}", FSTAB, ctx.deps.clock.stamp()));
        fs.write(&backup_path, live_text.as_bytes(), mode)
            .map_err(|e| Error::path_io("Failed to write", &backup_path, e))?;
        info!("Saved current fstab to {}", backup_path.display());
    }

    let text = merged(&live_text, &offered, &ctx.deps.config.tool_name);
    write_file_atomic(fs, ctx.deps.host.as_ref(), &path, text.as_bytes(), mode)?;
    ctx.services().daemon_reload().await?;
    info!("Added {} mount(s) to fstab", offered.len());
    Ok(Outcome::Applied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::categories::{find, FILESYSTEM};
    use crate::plan::{RestoreMode, RestorePlan};
    use proxsafe_backup::{Manifest, SystemType};
    use proxsafe_core::testing::TestDeps;
    use tokio_util::sync::CancellationToken;

    const LIVE: &str = "\
UUID=1111-live / ext4 errors=remount-ro 0 1
/dev/pve/swap none swap sw 0 0
proc /proc proc defaults 0 0
";

    const BACKUP_SAME: &str = "\
UUID=1111-live / ext4 errors=remount-ro 0 1
/dev/pve/swap none swap sw 0 0
nas:/export/backup /mnt/nas nfs defaults,_netdev 0 0
UUID=2222-data /mnt/data ext4 defaults 0 2
UUID=3333-gone /mnt/gone ext4 defaults 0 2
/dev/sdb1 /mnt/usb ext4 defaults 0 0
";

    const BACKUP_OTHER: &str = "\
UUID=9999-old / ext4 errors=remount-ro 0 1
/dev/pve/swap none swap sw 0 0
nas:/export/backup /mnt/nas nfs defaults,_netdev 0 0
";

    fn plan() -> RestorePlan {
        RestorePlan::build(
            &Manifest::default(),
            RestoreMode::Custom,
            &[find(FILESYSTEM).unwrap()],
            SystemType::Pve,
            None,
        )
    }

    fn ctx<'a>(t: &'a TestDeps, cancel: &'a CancellationToken, plan: &'a RestorePlan) -> ApplyContext<'a> {
        ApplyContext {
            deps: &t.deps,
            cancel,
            staging: Path::new("/stage"),
            dest: Path::new("/"),
            plan,
        }
    }

    #[test]
    fn test_proposals_filter() {
        let t = TestDeps::new();
        t.sandbox.put("/dev/disk/by-uuid/2222-data", "");
        let live = parse(LIVE);
        let backup = parse(BACKUP_SAME);
        let offered: Vec<_> = proposals(t.sandbox.fs().as_ref(), &live, &backup)
            .iter()
            .map(|e| e.file.as_str())
            .collect();
        assert_eq!(offered, vec!["/mnt/nas", "/mnt/data"]);
        assert!(system_matches(&live, &backup));
        assert!(!system_matches(&live, &parse(BACKUP_OTHER)));
    }

    #[tokio::test]
    async fn test_mismatch_blank_answer_keeps_fstab() {
        let t = TestDeps::new();
        t.sandbox.put("/etc/fstab", LIVE);
        t.sandbox.put("/stage/etc/fstab", BACKUP_OTHER);
        t.answers([""]);
        let plan = plan();
        let cancel = CancellationToken::new();

        let outcome = apply_fstab(&ctx(&t, &cancel, &plan)).await.unwrap();
        assert!(matches!(outcome, Outcome::Skipped(_)));
        assert_eq!(t.sandbox.get("/etc/fstab"), LIVE);
        assert!(!t.runner.called("systemctl daemon-reload"));
        assert!(t.ui.prompts()[0].contains("[y/N]"));
    }

    #[tokio::test]
    async fn test_accept_writes_marker_block() {
        let t = TestDeps::new();
        t.sandbox.put("/etc/fstab", LIVE);
        t.sandbox.put("/stage/etc/fstab", BACKUP_SAME);
        t.sandbox.put("/dev/disk/by-uuid/2222-data", "");
        t.answers([""]);
        let plan = plan();
        let cancel = CancellationToken::new();

        let outcome = apply_fstab(&ctx(&t, &cancel, &plan)).await.unwrap();
        assert_eq!(outcome, Outcome::Applied);
        let fstab = t.sandbox.get("/etc/fstab");
        assert!(fstab.starts_with(LIVE));
        assert!(fstab.contains("# BEGIN proxsafe restored mounts\nnas:/export/backup /mnt/nas nfs"));
        assert!(!fstab.contains("/mnt/usb"));
        assert_eq!(t.sandbox.get("/etc/fstab.bak-20240501_120000"), LIVE);
        assert!(t.runner.called("systemctl daemon-reload"));
    }

    #[test]
    fn test_merge_replaces_previous_block() {
        let entries = parse("nas:/a /mnt/a nfs defaults 0 0\n");
        let refs: Vec<_> = entries.iter().collect();
        let once = merged(LIVE, &refs, "proxsafe");
        let twice = merged(&once, &refs, "proxsafe");
        assert_eq!(once, twice);
    }
}
