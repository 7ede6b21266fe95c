//! Subprocess capability
//!
//! External binaries (service manager, product CLIs, network tools, the
//! remote-object client) are reached only through [`CommandRunner`], so tests
//! can script their responses and assert on the invocations.

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` when terminated by a signal
    pub code: Option<i32>,

    /// Combined stdout and stderr
    pub output: String,
}

impl CommandOutput {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            code: Some(0),
            output: output.into(),
        }
    }

    pub fn failed(code: i32, output: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            output: output.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn status_text(&self) -> String {
        match self.code {
            Some(code) => format!("exit status {}", code),
            None => "terminated by signal".to_string(),
        }
    }

    /// Convert a non-zero exit into [`Error::CommandFailed`].
    pub fn check(self, program: &str) -> Result<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(Error::command_failed(
                program,
                self.status_text(),
                self.output.trim().to_string(),
            ))
        }
    }
}

/// Wait continuation of a streaming command.
#[async_trait]
pub trait StreamWait: Send {
    /// Wait for the process to exit; output contains its stderr.
    async fn wait(self: Box<Self>) -> Result<CommandOutput>;

    /// Kill the process early (e.g. once enough of the stream was read).
    async fn kill(self: Box<Self>);
}

/// A running command whose stdout is consumed as a stream.
pub struct CommandStream {
    pub stdout: Box<dyn AsyncRead + Send + Unpin>,
    pub waiter: Box<dyn StreamWait>,
}

/// Runs external programs.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run to completion and collect combined output.
    async fn run(
        &self,
        cancel: &CancellationToken,
        program: &str,
        args: &[String],
    ) -> Result<CommandOutput>;

    /// Start a command and hand back its stdout as a stream.
    async fn stream(
        &self,
        cancel: &CancellationToken,
        program: &str,
        args: &[String],
    ) -> Result<CommandStream>;

    /// Locate a program on `$PATH`.
    fn look_path(&self, program: &str) -> Option<PathBuf>;

    fn available(&self, program: &str) -> bool {
        self.look_path(program).is_some()
    }
}

/// Build an owned argument vector from string slices.
pub fn args<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    items.into_iter().map(|s| s.as_ref().to_string()).collect()
}

/// Runner backed by `tokio::process`.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsRunner;

#[async_trait]
impl CommandRunner for OsRunner {
    async fn run(
        &self,
        cancel: &CancellationToken,
        program: &str,
        args: &[String],
    ) -> Result<CommandOutput> {
        debug!("Running: {} {}", program, args.join(" "));
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| spawn_error(program, e))?;

        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            out = child.wait_with_output() => {
                let out = out?;
                let mut combined = String::from_utf8_lossy(&out.stdout).into_owned();
                combined.push_str(&String::from_utf8_lossy(&out.stderr));
                Ok(CommandOutput {
                    code: out.status.code(),
                    output: combined,
                })
            }
        }
    }

    async fn stream(
        &self,
        cancel: &CancellationToken,
        program: &str,
        args: &[String],
    ) -> Result<CommandStream> {
        debug!("Streaming: {} {}", program, args.join(" "));
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| spawn_error(program, e))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::command_failed(program, "no stdout", ""))?;

        Ok(CommandStream {
            stdout: Box::new(stdout),
            waiter: Box::new(ChildWait {
                child,
                cancel: cancel.clone(),
            }),
        })
    }

    fn look_path(&self, program: &str) -> Option<PathBuf> {
        which::which(program).ok()
    }
}

struct ChildWait {
    child: Child,
    cancel: CancellationToken,
}

#[async_trait]
impl StreamWait for ChildWait {
    async fn wait(mut self: Box<Self>) -> Result<CommandOutput> {
        let mut stderr = String::new();
        if let Some(mut pipe) = self.child.stderr.take() {
            pipe.read_to_string(&mut stderr).await.ok();
        }
        let status = tokio::select! {
            _ = self.cancel.cancelled() => {
                self.child.kill().await.ok();
                return Err(Error::Cancelled);
            }
            status = self.child.wait() => status?,
        };
        Ok(CommandOutput {
            code: status.code(),
            output: stderr,
        })
    }

    async fn kill(mut self: Box<Self>) {
        self.child.kill().await.ok();
    }
}

fn spawn_error(program: &str, err: std::io::Error) -> Error {
    if err.kind() == std::io::ErrorKind::NotFound {
        Error::command_not_found(program)
    } else {
        Error::path_io("Failed to start", program, err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_collects_output() {
        let runner = OsRunner;
        let cancel = CancellationToken::new();
        let out = runner
            .run(&cancel, "sh", &args(["-c", "echo out; echo err >&2; exit 3"]))
            .await
            .unwrap();
        assert_eq!(out.code, Some(3));
        assert!(out.output.contains("out"));
        assert!(out.output.contains("err"));
        assert!(out.check("sh").is_err());
    }

    #[tokio::test]
    async fn test_missing_program_is_command_not_found() {
        let runner = OsRunner;
        let cancel = CancellationToken::new();
        let err = runner
            .run(&cancel, "definitely-not-a-real-binary-xyz", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CommandNotFound { .. }));
    }

    #[tokio::test]
    async fn test_stream_reads_stdout() {
        let runner = OsRunner;
        let cancel = CancellationToken::new();
        let mut stream = runner
            .stream(&cancel, "sh", &args(["-c", "printf hello"]))
            .await
            .unwrap();
        let mut buf = String::new();
        stream.stdout.read_to_string(&mut buf).await.unwrap();
        assert_eq!(buf, "hello");
        let status = stream.waiter.wait().await.unwrap();
        assert!(status.success());
    }

    #[tokio::test]
    async fn test_cancelled_run() {
        let runner = OsRunner;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = runner
            .run(&cancel, "sh", &args(["-c", "sleep 5"]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }
}
