//! Terminal-backed [`Ui`]

use super::Ui;
use crate::error::{Error, Result};
use crate::secret::SecretString;
use async_trait::async_trait;
use console::Term;
use std::io::Write;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Reads answers from stdin and secrets from the controlling terminal.
pub struct TerminalUi {
    lines: Mutex<Lines<BufReader<Stdin>>>,
}

impl TerminalUi {
    pub fn new() -> Self {
        Self {
            lines: Mutex::new(BufReader::new(tokio::io::stdin()).lines()),
        }
    }

    fn prompt(prompt: &str) {
        let mut out = std::io::stdout();
        write!(out, "{}", prompt).ok();
        out.flush().ok();
    }

    async fn next_line(&self, cancel: &CancellationToken) -> Result<String> {
        let mut lines = self.lines.lock().await;
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            line = lines.next_line() => match line? {
                Some(line) => Ok(line),
                None => Err(Error::InputClosed),
            },
        }
    }
}

impl Default for TerminalUi {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Ui for TerminalUi {
    async fn read_line(&self, cancel: &CancellationToken, prompt: &str) -> Result<String> {
        Self::prompt(prompt);
        self.next_line(cancel).await
    }

    async fn read_secret(&self, cancel: &CancellationToken, prompt: &str) -> Result<SecretString> {
        Self::prompt(prompt);
        let read = tokio::task::spawn_blocking(|| Term::stderr().read_secure_line());
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            joined = read => {
                let line = joined
                    .map_err(|e| Error::Io(std::io::Error::other(e)))?
                    .map_err(|e| {
                        if e.kind() == std::io::ErrorKind::UnexpectedEof {
                            Error::InputClosed
                        } else {
                            Error::Io(e)
                        }
                    })?;
                Ok(SecretString::new(line))
            }
        }
    }

    async fn read_line_timeout(
        &self,
        cancel: &CancellationToken,
        prompt: &str,
        timeout: Duration,
    ) -> Result<Option<String>> {
        Self::prompt(prompt);
        match tokio::time::timeout(timeout, self.next_line(cancel)).await {
            Ok(line) => line.map(Some),
            Err(_) => Ok(None),
        }
    }

    fn println(&self, line: &str) {
        println!("{}", line);
    }

    fn warn(&self, line: &str) {
        eprintln!("{} {}", console::style("⚠").yellow().bold(), line);
    }
}
