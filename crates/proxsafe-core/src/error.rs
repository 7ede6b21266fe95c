//! Error types for proxsafe-core

use thiserror::Error;

/// Result type alias using proxsafe-core's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for proxsafe
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: String },

    /// Invalid configuration value
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// YAML parsing error
    #[error("YAML parsing error: {0}")]
    YamlParse(#[from] serde_yaml_ng::Error),

    /// JSON parsing error
    #[error("JSON parsing error: {0}")]
    JsonParse(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// IO error with the path that caused it
    #[error("{action} {path}: {source}")]
    PathIo {
        action: &'static str,
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// External binary is not installed
    #[error("Command not found in PATH: {program}")]
    CommandNotFound { program: String },

    /// External binary exited unsuccessfully
    #[error("{program} failed ({status}): {output}")]
    CommandFailed {
        program: String,
        status: String,
        output: String,
    },

    /// Operation was cancelled through its cancellation token
    #[error("Operation cancelled")]
    Cancelled,

    /// Operator entered the abort sentinel
    #[error("Aborted by operator")]
    Aborted,

    /// Terminal input reached end of file
    #[error("Input closed before an answer was given")]
    InputClosed,

    /// Temp-dir registry could not be read or written
    #[error("Temp-dir registry error at {path}: {message}")]
    Registry { path: String, message: String },
}

impl Error {
    /// Create a config not found error
    pub fn config_not_found(path: impl Into<String>) -> Self {
        Self::ConfigNotFound { path: path.into() }
    }

    /// Create an invalid config error
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Wrap an IO error with the action and path that produced it
    pub fn path_io(
        action: &'static str,
        path: impl AsRef<std::path::Path>,
        source: std::io::Error,
    ) -> Self {
        Self::PathIo {
            action,
            path: path.as_ref().display().to_string(),
            source,
        }
    }

    /// Create a command not found error
    pub fn command_not_found(program: impl Into<String>) -> Self {
        Self::CommandNotFound {
            program: program.into(),
        }
    }

    /// Create a command failed error
    pub fn command_failed(
        program: impl Into<String>,
        status: impl Into<String>,
        output: impl Into<String>,
    ) -> Self {
        Self::CommandFailed {
            program: program.into(),
            status: status.into(),
            output: output.into(),
        }
    }

    /// Create a registry error
    pub fn registry(path: impl AsRef<std::path::Path>, message: impl Into<String>) -> Self {
        Self::Registry {
            path: path.as_ref().display().to_string(),
            message: message.into(),
        }
    }

    /// True for the operator abort sentinel and cancellation
    pub fn is_abort(&self) -> bool {
        matches!(self, Self::Aborted | Self::Cancelled)
    }
}
