//! Remote-object references and the client that reaches them
//!
//! A reference has the form `<remote>:<path>`. The client shells out to the
//! configured remote-object tool (`rclone` by default) for `lsf`, `cat` and
//! `copyto`.

use crate::error::{Error, Result};
use proxsafe_core::sys::{args, CommandRunner, CommandStream};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// True when `token` names a remote object rather than a filesystem path.
pub fn is_remote_reference(token: &str) -> bool {
    let token = token.trim();
    !token.is_empty() && token.contains(':') && !token.starts_with('/')
}

/// `<remote>:<path>`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemoteRef {
    pub remote: String,
    pub path: String,
}

impl RemoteRef {
    /// Parse a reference; an empty path denotes the remote's root.
    pub fn parse(token: &str) -> Result<Self> {
        let token = token.trim();
        if !is_remote_reference(token) {
            return Err(Error::invalid_remote(token, "not a <remote>:<path> reference"));
        }
        let (remote, path) = token
            .split_once(':')
            .ok_or_else(|| Error::invalid_remote(token, "missing ':'"))?;
        if remote.is_empty() || !remote.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
            return Err(Error::invalid_remote(token, "remote name must be alphanumeric"));
        }
        Ok(Self {
            remote: remote.to_string(),
            path: path.trim_end_matches('/').to_string(),
        })
    }

    /// Parse a reference that must name an object (non-empty path).
    pub fn parse_object(token: &str) -> Result<Self> {
        let parsed = Self::parse(token)?;
        if parsed.path.is_empty() {
            return Err(Error::invalid_remote(token, "path after ':' is empty"));
        }
        Ok(parsed)
    }

    pub fn join(&self, name: &str) -> Self {
        let path = if self.path.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", self.path, name)
        };
        Self {
            remote: self.remote.clone(),
            path,
        }
    }

    /// Last path segment
    pub fn basename(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }
}

impl fmt::Display for RemoteRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.remote, self.path)
    }
}

/// Thin wrapper over the remote-object command line tool.
#[derive(Clone)]
pub struct RemoteClient {
    cmd: Arc<dyn CommandRunner>,
    program: String,
}

impl RemoteClient {
    pub fn new(cmd: Arc<dyn CommandRunner>, program: impl Into<String>) -> Self {
        Self {
            cmd,
            program: program.into(),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// File names directly under `dir` (directories are skipped).
    pub async fn list(&self, cancel: &CancellationToken, dir: &RemoteRef) -> Result<Vec<String>> {
        let out = self
            .cmd
            .run(cancel, &self.program, &args(["lsf", "--files-only", &dir.to_string()]))
            .await?
            .check(&self.program)?;
        Ok(out
            .output
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.ends_with('/'))
            .map(str::to_string)
            .collect())
    }

    /// Stream an object's bytes.
    pub async fn cat(&self, cancel: &CancellationToken, object: &RemoteRef) -> Result<CommandStream> {
        debug!("Streaming {}", object);
        Ok(self
            .cmd
            .stream(cancel, &self.program, &args(["cat", &object.to_string()]))
            .await?)
    }

    /// Read a whole (small) object into memory.
    pub async fn read(&self, cancel: &CancellationToken, object: &RemoteRef) -> Result<Vec<u8>> {
        let mut stream = self.cat(cancel, object).await?;
        let mut data = Vec::new();
        stream.stdout.read_to_end(&mut data).await?;
        stream.waiter.wait().await?.check(&self.program)?;
        Ok(data)
    }

    /// Download an object to a local (on-disk) path.
    pub async fn copy_to(
        &self,
        cancel: &CancellationToken,
        object: &RemoteRef,
        local: &Path,
    ) -> Result<()> {
        debug!("Downloading {} to {}", object, local.display());
        self.cmd
            .run(
                cancel,
                &self.program,
                &args(["copyto", &object.to_string(), &local.to_string_lossy()]),
            )
            .await?
            .check(&self.program)?;
        Ok(())
    }
}

impl fmt::Debug for RemoteClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteClient")
            .field("program", &self.program)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_remote_reference() {
        assert!(is_remote_reference("gdrive:backups/pve"));
        assert!(is_remote_reference("gdrive:"));
        assert!(!is_remote_reference("/mnt/backups"));
        assert!(!is_remote_reference("/mnt/odd:name"));
        assert!(!is_remote_reference("relative/path"));
        assert!(!is_remote_reference("   "));
    }

    #[test]
    fn test_parse_root_reference() {
        let r = RemoteRef::parse("gdrive:").unwrap();
        assert_eq!(r.remote, "gdrive");
        assert_eq!(r.path, "");
        assert_eq!(r.join("a.bundle.tar").to_string(), "gdrive:a.bundle.tar");
    }

    #[test]
    fn test_object_reference_requires_path() {
        assert!(matches!(
            RemoteRef::parse_object("gdrive:"),
            Err(Error::InvalidRemote { .. })
        ));
        let r = RemoteRef::parse_object("s3:bucket/dir/x.tar.age").unwrap();
        assert_eq!(r.basename(), "x.tar.age");
    }
}
