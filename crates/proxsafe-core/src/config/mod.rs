//! Configuration loading and management

mod loader;

pub use loader::{
    NetworkSettings, PbsBehaviorOverride, RestoreConfig, ServiceSettings, CONFIG_ENV_VAR,
    DEFAULT_CONFIG_PATH,
};
