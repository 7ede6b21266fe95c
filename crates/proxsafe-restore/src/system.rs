//! Detection of the product running on this host

use proxsafe_backup::SystemType;
use proxsafe_core::sys::FileSystem;
use std::path::Path;
use std::sync::Arc;

const PVE_MARKERS: &[&str] = &["/etc/pve", "/usr/bin/pveversion"];
const PBS_MARKERS: &[&str] = &["/etc/proxmox-backup", "/usr/sbin/proxmox-backup-proxy"];

/// Reports which product the host runs.
pub trait SystemDetector: Send + Sync {
    fn detect(&self) -> SystemType;
}

/// Looks for product marker paths.
pub fn detect_system(fs: &dyn FileSystem) -> SystemType {
    let any = |markers: &[&str]| markers.iter().any(|m| fs.exists(Path::new(m)));
    if any(PVE_MARKERS) {
        SystemType::Pve
    } else if any(PBS_MARKERS) {
        SystemType::Pbs
    } else {
        SystemType::Unknown
    }
}

/// [`SystemDetector`] backed by the filesystem capability
pub struct FsDetector {
    fs: Arc<dyn FileSystem>,
}

impl FsDetector {
    pub fn new(fs: Arc<dyn FileSystem>) -> Self {
        Self { fs }
    }
}

impl SystemDetector for FsDetector {
    fn detect(&self) -> SystemType {
        detect_system(self.fs.as_ref())
    }
}

/// Always reports the same product
#[derive(Debug, Clone, Copy)]
pub struct FixedSystem(pub SystemType);

impl SystemDetector for FixedSystem {
    fn detect(&self) -> SystemType {
        self.0
    }
}
