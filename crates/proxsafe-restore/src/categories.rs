//! Category catalog
//!
//! Catalog order is apply order. Paths are relative to the root and may
//! carry glob segments or a trailing `/` for whole directories.

use proxsafe_backup::SystemType;
use serde::Serialize;
use std::fmt;

pub const NETWORK: &str = "network";
pub const FILESYSTEM: &str = "filesystem";
pub const SSH: &str = "ssh";
pub const CRON: &str = "cron";
pub const SYSTEM: &str = "system";
pub const ZFS: &str = "zfs";
pub const SSL: &str = "ssl";
pub const PVE_CLUSTER: &str = "pve_cluster";
pub const PVE_HOST: &str = "pve_host";
pub const STORAGE_PVE: &str = "storage_pve";
pub const PVE_JOBS: &str = "pve_jobs";
pub const PVE_ACCESS_CONTROL: &str = "pve_access_control";
pub const PVE_FIREWALL: &str = "pve_firewall";
pub const PVE_GUESTS: &str = "pve_guests";
pub const PVE_CEPH: &str = "pve_ceph";
pub const PBS_HOST: &str = "pbs_host";
pub const PBS_NODE: &str = "pbs_node";
pub const PBS_DATASTORE: &str = "pbs_datastore";
pub const PBS_REMOTES: &str = "pbs_remotes";
pub const PBS_JOBS: &str = "pbs_jobs";
pub const PBS_TAPE: &str = "pbs_tape";
pub const PBS_NOTIFICATIONS: &str = "pbs_notifications";
pub const PBS_ACCESS_CONTROL: &str = "pbs_access_control";

/// Which product a category belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CategoryType {
    Common,
    Pve,
    Pbs,
}

impl CategoryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Common => "common",
            Self::Pve => "pve",
            Self::Pbs => "pbs",
        }
    }

    /// Whether categories of this type apply to `system`.
    pub fn fits(&self, system: SystemType) -> bool {
        match self {
            Self::Common => true,
            Self::Pve => system == SystemType::Pve,
            Self::Pbs => system == SystemType::Pbs,
        }
    }
}

impl fmt::Display for CategoryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One restorable slice of configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Category {
    pub id: &'static str,
    pub name: &'static str,
    pub kind: CategoryType,
    /// Never applied to live paths, only exported
    pub export_only: bool,
    /// Restoring it requires the PBS proxy/daemon to be cycled
    pub stops_pbs_services: bool,
    pub paths: &'static [&'static str],
}

impl Category {
    /// Paths as owned patterns
    pub fn patterns(&self) -> Vec<String> {
        self.paths.iter().map(|p| p.to_string()).collect()
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.id)
    }
}

const fn common(id: &'static str, name: &'static str, export_only: bool, paths: &'static [&'static str]) -> Category {
    Category {
        id,
        name,
        kind: CategoryType::Common,
        export_only,
        stops_pbs_services: false,
        paths,
    }
}

const fn pve(id: &'static str, name: &'static str, export_only: bool, paths: &'static [&'static str]) -> Category {
    Category {
        id,
        name,
        kind: CategoryType::Pve,
        export_only,
        stops_pbs_services: false,
        paths,
    }
}

const fn pbs(id: &'static str, name: &'static str, paths: &'static [&'static str]) -> Category {
    Category {
        id,
        name,
        kind: CategoryType::Pbs,
        export_only: false,
        stops_pbs_services: true,
        paths,
    }
}

/// Built-in catalog in apply order
pub static CATALOG: &[Category] = &[
    common(
        NETWORK,
        "Network configuration",
        false,
        &[
            "etc/network/interfaces",
            "etc/network/interfaces.d/",
            "etc/hosts",
            "etc/hostname",
            "etc/resolv.conf",
        ],
    ),
    common(FILESYSTEM, "Filesystem mounts", false, &["etc/fstab"]),
    common(
        SSH,
        "SSH server and keys",
        false,
        &["etc/ssh/sshd_config", "etc/ssh/sshd_config.d/", "root/.ssh/authorized_keys"],
    ),
    common(
        CRON,
        "Scheduled jobs",
        false,
        &["etc/crontab", "etc/cron.d/", "var/spool/cron/crontabs/"],
    ),
    common(
        SYSTEM,
        "System tuning and APT sources",
        false,
        &[
            "etc/sysctl.conf",
            "etc/sysctl.d/",
            "etc/modprobe.d/",
            "etc/apt/sources.list",
            "etc/apt/sources.list.d/",
        ],
    ),
    common(ZFS, "ZFS configuration", true, &["etc/zfs/", "etc/hostid"]),
    common(SSL, "SSL certificates", true, &["etc/ssl/"]),
    pve(
        PVE_CLUSTER,
        "Cluster database and corosync",
        false,
        &["var/lib/pve-cluster/", "etc/corosync/"],
    ),
    pve(
        PVE_HOST,
        "Host boot and kernel settings",
        false,
        &[
            "etc/default/grub",
            "etc/kernel/cmdline",
            "etc/modules",
            "etc/modules-load.d/",
        ],
    ),
    pve(
        STORAGE_PVE,
        "Storage definitions",
        false,
        &["etc/vzdump.conf", "etc/pve/storage.cfg", "etc/pve/datacenter.cfg"],
    ),
    pve(PVE_JOBS, "Backup jobs", false, &["etc/pve/jobs.cfg"]),
    pve(
        PVE_ACCESS_CONTROL,
        "Users, realms, tokens and TFA",
        false,
        &[
            "etc/pve/user.cfg",
            "etc/pve/domains.cfg",
            "etc/pve/priv/shadow.cfg",
            "etc/pve/priv/token.cfg",
            "etc/pve/priv/tfa.cfg",
        ],
    ),
    pve(
        PVE_FIREWALL,
        "Firewall rules",
        false,
        &["etc/pve/firewall/", "etc/pve/nodes/*/host.fw"],
    ),
    pve(
        PVE_GUESTS,
        "Guest configurations",
        true,
        &["etc/pve/qemu-server/", "etc/pve/lxc/"],
    ),
    pve(PVE_CEPH, "Ceph configuration", true, &["etc/ceph/", "etc/pve/ceph.conf"]),
    pbs(
        PBS_HOST,
        "Proxy certificate",
        &["etc/proxmox-backup/proxy.pem", "etc/proxmox-backup/proxy.key"],
    ),
    pbs(
        PBS_NODE,
        "Node settings and ACME accounts",
        &["etc/proxmox-backup/node.cfg", "etc/proxmox-backup/accounts.cfg"],
    ),
    pbs(
        PBS_DATASTORE,
        "Datastores and S3 endpoints",
        &["etc/proxmox-backup/datastore.cfg", "etc/proxmox-backup/s3.cfg"],
    ),
    pbs(PBS_REMOTES, "Remotes", &["etc/proxmox-backup/remote.cfg"]),
    pbs(
        PBS_JOBS,
        "Sync, verify and prune jobs",
        &[
            "etc/proxmox-backup/sync.cfg",
            "etc/proxmox-backup/verification.cfg",
            "etc/proxmox-backup/prune.cfg",
        ],
    ),
    pbs(
        PBS_TAPE,
        "Tape configuration",
        &["etc/proxmox-backup/tape*", "etc/proxmox-backup/media-pool.cfg"],
    ),
    pbs(
        PBS_NOTIFICATIONS,
        "Notifications",
        &[
            "etc/proxmox-backup/notifications.cfg",
            "etc/proxmox-backup/notifications-priv.cfg",
        ],
    ),
    pbs(
        PBS_ACCESS_CONTROL,
        "Users, realms, tokens and TFA",
        &[
            "etc/proxmox-backup/user.cfg",
            "etc/proxmox-backup/domains.cfg",
            "etc/proxmox-backup/acl.cfg",
            "etc/proxmox-backup/token.shadow",
            "etc/proxmox-backup/tfa.json",
            "etc/proxmox-backup/shadow.json",
        ],
    ),
];

pub fn find(id: &str) -> Option<&'static Category> {
    CATALOG.iter().find(|c| c.id == id)
}

/// Position in apply order
pub fn order_of(id: &str) -> usize {
    CATALOG.iter().position(|c| c.id == id).unwrap_or(usize::MAX)
}

/// Categories compatible with `system`
pub fn for_system(system: SystemType) -> Vec<&'static Category> {
    CATALOG.iter().filter(|c| c.kind.fits(system)).collect()
}

/// Categories that may be offered for a backup taken on `backup` and
/// restored onto `detected`. The flag is true when the products differ and
/// only common categories remain.
pub fn offered(backup: SystemType, detected: SystemType) -> (Vec<&'static Category>, bool) {
    let mismatch = backup != SystemType::Unknown && backup != detected;
    if mismatch {
        let common = CATALOG
            .iter()
            .filter(|c| c.kind == CategoryType::Common)
            .collect();
        (common, true)
    } else {
        (for_system(detected), false)
    }
}

/// Flattened path patterns of several categories
pub fn patterns_of<'a, I>(categories: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a &'static Category>,
{
    categories
        .into_iter()
        .flat_map(|c| c.paths.iter().map(|p| p.to_string()))
        .collect()
}
