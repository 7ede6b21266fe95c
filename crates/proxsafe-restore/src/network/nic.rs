//! NIC rename mapping
//!
//! The backup carries an inventory of the source host's interfaces. On new
//! hardware the same ports usually come up under different names, so the
//! restored `interfaces(5)` files are rewritten to the names the matching
//! ports have here. Matching uses, in priority order, the permanent MAC,
//! the current MAC, the udev `ID_PATH` and the PCI slot.

use proxsafe_core::sys::{args, join_under, write_file_atomic};
use proxsafe_core::Deps;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Inventory location inside the backup, relative to the root
pub const INVENTORY_PATH: &str = "var/lib/proxsafe/network/nic_inventory.json";

const SYS_CLASS_NET: &str = "/sys/class/net";
const INTERFACES: &str = "etc/network/interfaces";
const INTERFACES_D: &str = "etc/network/interfaces.d";
const UDEV_RULES: &str = "etc/udev/rules.d";
const SYSTEMD_NETWORK: &str = "etc/systemd/network";

static TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z0-9_-]+").expect("token regex is valid"));

/// One interface as recorded in the backup or read from this host
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NicRecord {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permanent_mac: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub udev_id_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pci_slot: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NicInventory {
    #[serde(default)]
    pub interfaces: Vec<NicRecord>,
}

impl NicInventory {
    pub fn parse(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// What identified a renamed interface; declaration order is priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum MatchKind {
    PermanentMac,
    Mac,
    UdevIdPath,
    PciSlot,
}

impl MatchKind {
    pub const ALL: [MatchKind; 4] = [Self::PermanentMac, Self::Mac, Self::UdevIdPath, Self::PciSlot];

    fn backup_key(self, nic: &NicRecord) -> Option<String> {
        match self {
            Self::PermanentMac => nic.permanent_mac.as_deref().map(normalize_mac),
            Self::Mac => nic.mac.as_deref().or(nic.permanent_mac.as_deref()).map(normalize_mac),
            Self::UdevIdPath => nic.udev_id_path.clone(),
            Self::PciSlot => nic.pci_slot.clone(),
        }
        .filter(|k| !k.is_empty())
    }

    fn current_key(self, nic: &NicRecord) -> Option<String> {
        match self {
            Self::PermanentMac => nic.permanent_mac.as_deref().map(normalize_mac),
            Self::Mac => nic.mac.as_deref().map(normalize_mac),
            Self::UdevIdPath => nic.udev_id_path.clone(),
            Self::PciSlot => nic.pci_slot.clone(),
        }
        .filter(|k| !k.is_empty())
    }
}

impl fmt::Display for MatchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::PermanentMac => "permanent-mac",
            Self::Mac => "mac",
            Self::UdevIdPath => "udev-id-path",
            Self::PciSlot => "pci-slot",
        })
    }
}

fn normalize_mac(mac: &str) -> String {
    let mac = mac.trim().to_ascii_lowercase();
    if mac == "00:00:00:00:00:00" {
        String::new()
    } else {
        mac
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NicRename {
    pub old: String,
    pub new: String,
    pub by: MatchKind,
}

impl fmt::Display for NicRename {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {} (by {})", self.old, self.new, self.by)
    }
}

/// Computed mapping: renames safe to apply plus the excluded conflicts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NicMapping {
    pub renames: Vec<NicRename>,
    pub conflicts: Vec<NicRename>,
}

impl NicMapping {
    pub fn is_empty(&self) -> bool {
        self.renames.is_empty() && self.conflicts.is_empty()
    }

    pub fn as_map(&self) -> BTreeMap<String, String> {
        self.renames
            .iter()
            .map(|r| (r.old.clone(), r.new.clone()))
            .collect()
    }
}

/// Match every backed-up interface against the current ones.
///
/// A key shared by several current interfaces is ambiguous, and several
/// old names landing on one new name clash; both end up in `conflicts`.
pub fn compute_mapping(backup: &[NicRecord], current: &[NicRecord]) -> NicMapping {
    let mut candidates: Vec<NicRename> = Vec::new();
    let mut ambiguous: Vec<NicRename> = Vec::new();

    for old in backup {
        if matches_self(old, current) {
            continue;
        }
        for kind in MatchKind::ALL {
            let Some(key) = kind.backup_key(old) else {
                continue;
            };
            let hits: Vec<&NicRecord> = current
                .iter()
                .filter(|c| kind.current_key(c).as_deref() == Some(key.as_str()))
                .collect();
            match hits.as_slice() {
                [] => continue,
                [one] => {
                    if one.name != old.name {
                        candidates.push(NicRename {
                            old: old.name.clone(),
                            new: one.name.clone(),
                            by: kind,
                        });
                    }
                    break;
                }
                many => {
                    debug!("{} matches {} interfaces by {}", old.name, many.len(), kind);
                    ambiguous.extend(many.iter().map(|c| NicRename {
                        old: old.name.clone(),
                        new: c.name.clone(),
                        by: kind,
                    }));
                    break;
                }
            }
        }
    }

    let mut mapping = NicMapping {
        conflicts: ambiguous,
        ..NicMapping::default()
    };
    for rename in &candidates {
        let shared = candidates.iter().filter(|r| r.new == rename.new).count() > 1;
        let ambiguous_old = mapping.conflicts.iter().any(|c| c.old == rename.old);
        if shared || ambiguous_old {
            mapping.conflicts.push(rename.clone());
        } else {
            mapping.renames.push(rename.clone());
        }
    }
    mapping
}

/// The interface kept its name and still has the same hardware address.
fn matches_self(old: &NicRecord, current: &[NicRecord]) -> bool {
    let Some(same) = current.iter().find(|c| c.name == old.name) else {
        return false;
    };
    [MatchKind::PermanentMac, MatchKind::Mac]
        .iter()
        .any(|k| k.backup_key(old).is_some() && k.backup_key(old) == k.current_key(same))
        || (old.mac.is_none() && old.permanent_mac.is_none())
}

/// Rewrite whole-token interface names. `eno1.100` and `eno1:1` follow
/// `eno1`; `eno10` does not.
pub fn rewrite_names(text: &str, map: &BTreeMap<String, String>) -> String {
    TOKEN_RE
        .replace_all(text, |caps: &regex::Captures<'_>| {
            let token = &caps[0];
            map.get(token).cloned().unwrap_or_else(|| token.to_string())
        })
        .into_owned()
}

/// Read the current interfaces from sysfs. Interfaces without a device
/// link (loopback, bridges, bonds, VLANs) are left out.
pub async fn read_current(deps: &Deps, cancel: &CancellationToken) -> Result<Vec<NicRecord>> {
    let fs = deps.fs.as_ref();
    let base = Path::new(SYS_CLASS_NET);
    let entries = match fs.read_dir(base) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(Error::path_io("Failed to list", base, e)),
    };

    let mut nics = Vec::new();
    for dir in entries {
        let Some(name) = dir.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            continue;
        };
        let Ok(device) = fs.read_link(&dir.join("device")) else {
            continue;
        };
        let mac = fs
            .read_to_string(&dir.join("address"))
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        let pci_slot = device.file_name().map(|n| n.to_string_lossy().into_owned());

        nics.push(NicRecord {
            permanent_mac: permanent_mac(deps, cancel, &name).await,
            udev_id_path: udev_id_path(deps, cancel, &name).await,
            name,
            mac,
            pci_slot,
        });
    }
    Ok(nics)
}

async fn permanent_mac(deps: &Deps, cancel: &CancellationToken, iface: &str) -> Option<String> {
    if !deps.cmd.available("ethtool") {
        return None;
    }
    let out = deps.cmd.run(cancel, "ethtool", &args(["-P", iface])).await.ok()?;
    if !out.success() {
        return None;
    }
    out.output
        .lines()
        .find_map(|l| l.trim().strip_prefix("Permanent address:"))
        .map(normalize_mac)
        .filter(|m| !m.is_empty())
}

async fn udev_id_path(deps: &Deps, cancel: &CancellationToken, iface: &str) -> Option<String> {
    if !deps.cmd.available("udevadm") {
        return None;
    }
    let path = format!("{}/{}", SYS_CLASS_NET, iface);
    let out = deps
        .cmd
        .run(cancel, "udevadm", &args(["info", "-q", "property", "-p", path.as_str()]))
        .await
        .ok()?;
    if !out.success() {
        return None;
    }
    out.output
        .lines()
        .find_map(|l| l.trim().strip_prefix("ID_PATH="))
        .map(str::to_string)
        .filter(|s| !s.is_empty())
}

/// Files that pin interface names by MAC address.
pub fn persistent_overrides(deps: &Deps, dest: &Path) -> Vec<PathBuf> {
    let fs = deps.fs.as_ref();
    let mut found = Vec::new();
    let sources: [(&str, &str, &[&str]); 2] = [
        (UDEV_RULES, ".rules", &["ATTR{address}==", "NAME="]),
        (SYSTEMD_NETWORK, ".link", &["MACAddress=", "Name="]),
    ];
    for (dir, ext, needles) in sources {
        let Ok(files) = fs.read_dir(&join_under(dest, Path::new(dir))) else {
            continue;
        };
        for file in files.into_iter().filter(|f| f.to_string_lossy().ends_with(ext)) {
            let Ok(text) = fs.read_to_string(&file) else {
                continue;
            };
            let pins = match ext {
                ".rules" => text
                    .lines()
                    .any(|l| !l.trim_start().starts_with('#') && needles.iter().all(|n| l.contains(n))),
                _ => needles.iter().all(|n| text.contains(n)),
            };
            if pins {
                found.push(file);
            }
        }
    }
    found
}

/// `interfaces` plus every file in `interfaces.d`, as logical live paths.
pub fn interface_files(deps: &Deps, dest: &Path) -> Vec<PathBuf> {
    let fs = deps.fs.as_ref();
    let mut files = Vec::new();
    let main = join_under(dest, Path::new(INTERFACES));
    if fs.exists(&main) {
        files.push(main);
    }
    if let Ok(extra) = fs.read_dir(&join_under(dest, Path::new(INTERFACES_D))) {
        files.extend(
            extra
                .into_iter()
                .filter(|p| fs.symlink_metadata(p).map(|m| m.is_file()).unwrap_or(false)),
        );
    }
    files
}

/// Rewrite the live interface files with `renames`. Originals go to
/// `<workdir>/nic_rename_<stamp>/` first. Returns the files changed.
pub fn apply_renames(deps: &Deps, dest: &Path, workdir: &Path, renames: &[NicRename]) -> Result<Vec<PathBuf>> {
    let fs = deps.fs.as_ref();
    let map: BTreeMap<String, String> = renames.iter().map(|r| (r.old.clone(), r.new.clone())).collect();
    if map.is_empty() {
        return Ok(Vec::new());
    }
    let backup_dir = workdir.join(format!("nic_rename_{}", deps.clock.stamp()));

    let mut changed = Vec::new();
    for path in interface_files(deps, dest) {
        let text = fs
            .read_to_string(&path)
            .map_err(|e| Error::path_io("Failed to read", &path, e))?;
        let rewritten = rewrite_names(&text, &map);
        if rewritten == text {
            continue;
        }
        let mode = fs
            .metadata(&path)
            .map(|m| m.permissions().mode() & 0o7777)
            .unwrap_or(0o644);

        let rel = path.strip_prefix(dest).unwrap_or(&path);
        let saved = join_under(&backup_dir, rel);
        if let Some(parent) = saved.parent() {
            fs.create_dir_all(parent)
                .map_err(|e| Error::path_io("Failed to create", parent, e))?;
        }
        fs.write(&saved, text.as_bytes(), mode)
            .map_err(|e| Error::path_io("Failed to write", &saved, e))?;

        write_file_atomic(fs, deps.host.as_ref(), &path, rewritten.as_bytes(), mode)?;
        info!("Renamed interfaces in {}", path.display());
        changed.push(path);
    }
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proxsafe_core::testing::TestDeps;

    fn nic(name: &str, mac: &str) -> NicRecord {
        NicRecord {
            name: name.into(),
            mac: Some(mac.into()),
            ..NicRecord::default()
        }
    }

    fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(a, b)| (a.to_string(), b.to_string())).collect()
    }

    #[test]
    fn test_rewrite_leaves_longer_names_alone() {
        let text = "auto eno1\niface eno1 inet manual\niface eno10 inet manual\n\
                    auto vmbr0\niface vmbr0 inet static\n\tbridge-ports eno1 eno10\n\
                    iface eno1.20 inet manual\n";
        let out = rewrite_names(text, &map(&[("eno1", "enp3s0")]));
        assert_eq!(
            out,
            "auto enp3s0\niface enp3s0 inet manual\niface eno10 inet manual\n\
             auto vmbr0\niface vmbr0 inet static\n\tbridge-ports enp3s0 eno10\n\
             iface enp3s0.20 inet manual\n"
        );
    }

    #[test]
    fn test_rewrite_swaps_in_one_pass() {
        let out = rewrite_names("bond-slaves eth0 eth1\n", &map(&[("eth0", "eth1"), ("eth1", "eth0")]));
        assert_eq!(out, "bond-slaves eth1 eth0\n");
    }

    #[test]
    fn test_priority_prefers_permanent_mac() {
        let backup = vec![NicRecord {
            name: "eno1".into(),
            mac: Some("02:00:00:00:00:01".into()),
            permanent_mac: Some("AA:BB:CC:DD:EE:FF".into()),
            pci_slot: Some("0000:03:00.0".into()),
            ..NicRecord::default()
        }];
        let current = vec![
            NicRecord {
                name: "enp3s0".into(),
                mac: Some("aa:bb:cc:dd:ee:ff".into()),
                permanent_mac: Some("aa:bb:cc:dd:ee:ff".into()),
                ..NicRecord::default()
            },
            NicRecord {
                name: "enp4s0".into(),
                pci_slot: Some("0000:03:00.0".into()),
                ..NicRecord::default()
            },
        ];
        let mapping = compute_mapping(&backup, &current);
        assert_eq!(
            mapping.renames,
            vec![NicRename { old: "eno1".into(), new: "enp3s0".into(), by: MatchKind::PermanentMac }]
        );
        assert!(mapping.conflicts.is_empty());
    }

    #[test]
    fn test_conflicts_excluded_from_renames() {
        let backup = vec![
            nic("eno1", "aa:aa:aa:aa:aa:01"),
            nic("eno2", "aa:aa:aa:aa:aa:01"),
            nic("eno3", "aa:aa:aa:aa:aa:03"),
        ];
        let current = vec![nic("enp1s0", "aa:aa:aa:aa:aa:01"), nic("enp3s0", "aa:aa:aa:aa:aa:03")];
        let mapping = compute_mapping(&backup, &current);

        let renamed: Vec<_> = mapping.renames.iter().map(|r| r.old.as_str()).collect();
        let conflicted: Vec<_> = mapping.conflicts.iter().map(|r| r.old.as_str()).collect();
        assert_eq!(renamed, vec!["eno3"]);
        assert_eq!(conflicted, vec!["eno1", "eno2"]);
    }

    #[test]
    fn test_unchanged_interface_is_not_renamed() {
        let backup = vec![nic("eno1", "aa:aa:aa:aa:aa:01")];
        let current = vec![nic("eno1", "aa:aa:aa:aa:aa:01")];
        assert!(compute_mapping(&backup, &current).is_empty());
    }

    #[tokio::test]
    async fn test_read_current_skips_virtual() {
        let t = TestDeps::new();
        let fs = t.sandbox.fs();
        t.sandbox.put("/sys/devices/pci0000:00/0000:03:00.0/net/enp3s0/x", "");
        t.sandbox.put("/sys/class/net/enp3s0/address", "aa:bb:cc:dd:ee:ff\n");
        t.sandbox.put("/sys/class/net/lo/address", "00:00:00:00:00:00\n");
        fs.symlink(
            &t.sandbox.root().join("sys/devices/pci0000:00/0000:03:00.0"),
            Path::new("/sys/class/net/enp3s0/device"),
        )
        .unwrap();

        let nics = read_current(&t.deps, &CancellationToken::new()).await.unwrap();
        assert_eq!(nics.len(), 1);
        assert_eq!(nics[0].name, "enp3s0");
        assert_eq!(nics[0].mac.as_deref(), Some("aa:bb:cc:dd:ee:ff"));
        assert_eq!(nics[0].pci_slot.as_deref(), Some("0000:03:00.0"));
    }

    #[test]
    fn test_permanent_mac_rename_rewrites_interfaces() {
        let t = TestDeps::new();
        t.sandbox.put("/etc/network/interfaces", "auto eno1\niface eno1 inet manual\n");
        let backup = NicInventory::parse(
            r#"{"interfaces":[{"name":"eno1","mac":"aa:bb:cc:dd:ee:ff","permanent_mac":"aa:bb:cc:dd:ee:ff"}]}"#,
        )
        .unwrap();
        let current = vec![nic("enp3s0", "aa:bb:cc:dd:ee:ff")];
        let mapping = compute_mapping(&backup.interfaces, &current);
        let workdir = Path::new("/tmp/proxsafe/network_rollback_test");

        let changed = apply_renames(&t.deps, Path::new("/"), workdir, &mapping.renames).unwrap();
        assert_eq!(changed, vec![PathBuf::from("/etc/network/interfaces")]);
        assert_eq!(t.sandbox.get("/etc/network/interfaces"), "auto enp3s0\niface enp3s0 inet manual\n");
        assert_eq!(
            t.sandbox.get("/tmp/proxsafe/network_rollback_test/nic_rename_20240501_120000/etc/network/interfaces"),
            "auto eno1\niface eno1 inet manual\n"
        );
    }

    #[test]
    fn test_persistent_overrides() {
        let t = TestDeps::new();
        t.sandbox.put(
            "/etc/udev/rules.d/70-persistent-net.rules",
            "SUBSYSTEM==\"net\", ATTR{address}==\"aa:bb:cc:dd:ee:ff\", NAME=\"lan0\"\n",
        );
        t.sandbox.put("/etc/udev/rules.d/99-other.rules", "# ATTR{address}== NAME=\n");
        t.sandbox.put("/etc/systemd/network/10-lan.link", "[Match]\nMACAddress=aa:bb:cc:dd:ee:ff\n[Link]\nName=lan0\n");
        let found = persistent_overrides(&t.deps, Path::new("/"));
        assert_eq!(
            found,
            vec![
                PathBuf::from("/etc/udev/rules.d/70-persistent-net.rules"),
                PathBuf::from("/etc/systemd/network/10-lan.link"),
            ]
        );
    }
}
