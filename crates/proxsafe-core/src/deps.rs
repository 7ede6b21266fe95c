//! Capability bundle threaded through every restore operation

use crate::config::RestoreConfig;
use crate::sys::{Clock, CommandRunner, FileSystem, HostInfo, OsFs, OsHost, OsRunner, SystemClock};
use crate::tempreg::TempDirRegistry;
use crate::ui::{TerminalUi, Ui};
use std::sync::Arc;

/// Everything a restore or decrypt run needs from the outside world.
///
/// Built once at startup; tests assemble one from fakes instead.
#[derive(Clone)]
pub struct Deps {
    pub fs: Arc<dyn FileSystem>,
    pub clock: Arc<dyn Clock>,
    pub cmd: Arc<dyn CommandRunner>,
    pub host: Arc<dyn HostInfo>,
    pub ui: Arc<dyn Ui>,
    pub config: Arc<RestoreConfig>,
}

impl Deps {
    /// Live system capabilities with a terminal UI.
    pub fn system(config: RestoreConfig) -> Self {
        Self {
            fs: Arc::new(OsFs::system()),
            clock: Arc::new(SystemClock),
            cmd: Arc::new(OsRunner),
            host: Arc::new(OsHost),
            ui: Arc::new(TerminalUi::new()),
            config: Arc::new(config),
        }
    }

    /// Registry of scratch directories at the configured location.
    pub fn registry(&self) -> TempDirRegistry {
        TempDirRegistry::new(
            self.fs.clone(),
            self.host.clone(),
            self.clock.clone(),
            self.config.tempdir_registry.as_std_path(),
        )
    }
}

impl std::fmt::Debug for Deps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deps")
            .field("fs", &self.fs)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
