//! Host identity capability (effective uid, hostname, environment, processes)

use nix::errno::Errno;
use nix::sys::signal;
use nix::unistd::Pid;

/// Facts about the running process and host.
pub trait HostInfo: Send + Sync {
    fn euid(&self) -> u32;

    fn pid(&self) -> u32;

    fn hostname(&self) -> String;

    fn env_var(&self, name: &str) -> Option<String>;

    /// True when a process with this pid exists.
    fn pid_alive(&self, pid: u32) -> bool;

    /// Hostname up to the first dot.
    fn short_hostname(&self) -> String {
        let host = self.hostname();
        host.split('.').next().unwrap_or_default().to_string()
    }
}

/// Host information read from the live system.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsHost;

impl HostInfo for OsHost {
    fn euid(&self) -> u32 {
        nix::unistd::geteuid().as_raw()
    }

    fn pid(&self) -> u32 {
        std::process::id()
    }

    fn hostname(&self) -> String {
        nix::unistd::gethostname()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "localhost".to_string())
    }

    fn env_var(&self, name: &str) -> Option<String> {
        std::env::var(name).ok().filter(|v| !v.is_empty())
    }

    fn pid_alive(&self, pid: u32) -> bool {
        let Ok(raw) = i32::try_from(pid) else {
            return false;
        };
        if raw <= 0 {
            return false;
        }
        match signal::kill(Pid::from_raw(raw), None) {
            Ok(()) => true,
            // The process exists but belongs to someone else
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }
}
