//! Operator interaction
//!
//! All questions go through the [`Ui`] capability so a scripted driver can
//! stand in for the terminal. The helpers in this module implement the
//! shared prompt loops: menus, confirmations, overwrite decisions and secret
//! entry. Every loop treats `0` as the abort sentinel.

mod terminal;

pub use terminal::TerminalUi;

use crate::error::{Error, Result};
use crate::secret::SecretString;
use crate::sys::FileSystem;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Abort sentinel accepted by every prompt
pub const ABORT: &str = "0";

/// Line-oriented operator I/O.
#[async_trait]
pub trait Ui: Send + Sync {
    /// Read one line; end of input is [`Error::InputClosed`].
    async fn read_line(&self, cancel: &CancellationToken, prompt: &str) -> Result<String>;

    /// Read a line with echo disabled.
    async fn read_secret(&self, cancel: &CancellationToken, prompt: &str) -> Result<SecretString>;

    /// Read a line, giving up after `timeout` (`Ok(None)`).
    async fn read_line_timeout(
        &self,
        cancel: &CancellationToken,
        prompt: &str,
        timeout: Duration,
    ) -> Result<Option<String>>;

    fn println(&self, line: &str);

    fn warn(&self, line: &str) {
        self.println(&format!("WARNING: {}", line));
    }
}

/// Present a numbered menu and return the index of the chosen item.
///
/// Empty, non-numeric or out-of-range input loops; `0` aborts.
pub async fn select_menu(
    ui: &dyn Ui,
    cancel: &CancellationToken,
    title: &str,
    items: &[String],
) -> Result<usize> {
    if items.is_empty() {
        return Err(Error::invalid_config(format!("{}: nothing to choose from", title)));
    }

    loop {
        ui.println(title);
        for (i, item) in items.iter().enumerate() {
            ui.println(&format!("  [{}] {}", i + 1, item));
        }
        ui.println("  [0] Abort");

        let answer = ui.read_line(cancel, "Choice: ").await?;
        let answer = answer.trim();
        if answer == ABORT {
            return Err(Error::Aborted);
        }
        match answer.parse::<usize>() {
            Ok(n) if (1..=items.len()).contains(&n) => return Ok(n - 1),
            _ => ui.println("Invalid choice, try again."),
        }
    }
}

/// Yes/no question. Empty input takes `default`; anything unrecognized loops.
pub async fn confirm(
    ui: &dyn Ui,
    cancel: &CancellationToken,
    question: &str,
    default: bool,
) -> Result<bool> {
    let hint = if default { "[Y/n]" } else { "[y/N]" };
    loop {
        let answer = ui
            .read_line(cancel, &format!("{} {} ", question, hint))
            .await?;
        match answer.trim().to_ascii_lowercase().as_str() {
            "" => return Ok(default),
            "y" | "yes" => return Ok(true),
            "n" | "no" => return Ok(false),
            ABORT => return Err(Error::Aborted),
            _ => ui.println("Please answer 'y' or 'n'."),
        }
    }
}

/// Ask for a path, offering `default` on empty input.
pub async fn read_path(
    ui: &dyn Ui,
    cancel: &CancellationToken,
    prompt: &str,
    default: &Path,
) -> Result<PathBuf> {
    let answer = ui
        .read_line(cancel, &format!("{} [{}]: ", prompt, default.display()))
        .await?;
    let answer = answer.trim();
    if answer == ABORT {
        return Err(Error::Aborted);
    }
    if answer.is_empty() {
        Ok(default.to_path_buf())
    } else {
        Ok(PathBuf::from(answer))
    }
}

/// Resolve a destination that may already exist.
///
/// `1` removes the existing target and reuses the path (a failed removal,
/// e.g. of a non-empty directory, loops back), `2` asks for another path,
/// `0` aborts. Invalid input changes nothing and loops.
pub async fn resolve_overwrite(
    ui: &dyn Ui,
    fs: &dyn FileSystem,
    cancel: &CancellationToken,
    initial: &Path,
) -> Result<PathBuf> {
    let mut target = initial.to_path_buf();
    loop {
        if !fs.exists(&target) {
            return Ok(target);
        }

        ui.println(&format!("{} already exists.", target.display()));
        ui.println("  [1] Overwrite");
        ui.println("  [2] Enter a different path");
        ui.println("  [0] Abort");
        let answer = ui.read_line(cancel, "Choice: ").await?;
        match answer.trim() {
            "1" => {
                let removed = match fs.symlink_metadata(&target) {
                    Ok(meta) if meta.is_dir() => fs.remove_dir(&target),
                    _ => fs.remove_file(&target),
                };
                match removed {
                    Ok(()) => return Ok(target),
                    Err(e) => ui.println(&format!(
                        "Cannot remove {}: {}",
                        target.display(),
                        e
                    )),
                }
            }
            "2" => loop {
                let path = ui.read_line(cancel, "New path: ").await?;
                let path = path.trim();
                if path == ABORT {
                    return Err(Error::Aborted);
                }
                if !path.is_empty() {
                    target = PathBuf::from(path);
                    break;
                }
            },
            ABORT => return Err(Error::Aborted),
            _ => ui.println("Invalid choice, try again."),
        }
    }
}

/// Read a secret, re-prompting on blank input; `0` aborts. The secret is
/// returned as typed, surrounding spaces included.
pub async fn read_secret_loop(
    ui: &dyn Ui,
    cancel: &CancellationToken,
    prompt: &str,
) -> Result<SecretString> {
    loop {
        let secret = ui.read_secret(cancel, prompt).await?;
        let trimmed = secret.trimmed();
        if trimmed.is_empty() {
            ui.println("Input cannot be empty.");
            continue;
        }
        if trimmed.expose() == ABORT {
            return Err(Error::Aborted);
        }
        return Ok(secret);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Sandbox, ScriptedUi};

    #[tokio::test]
    async fn test_menu_loops_on_invalid_input() {
        let ui = ScriptedUi::new(["", "x", "9", "2"]);
        let items = vec!["a".to_string(), "b".to_string()];
        let idx = select_menu(&ui, &CancellationToken::new(), "Pick", &items)
            .await
            .unwrap();
        assert_eq!(idx, 1);
        assert_eq!(ui.prompts().len(), 4);
    }

    #[tokio::test]
    async fn test_menu_abort() {
        let ui = ScriptedUi::new(["0"]);
        let items = vec!["a".to_string()];
        let err = select_menu(&ui, &CancellationToken::new(), "Pick", &items)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Aborted));
    }

    #[tokio::test]
    async fn test_confirm_default_on_empty() {
        let ui = ScriptedUi::new(["", "maybe", "y"]);
        let cancel = CancellationToken::new();
        assert!(!confirm(&ui, &cancel, "Proceed?", false).await.unwrap());
        assert!(confirm(&ui, &cancel, "Proceed?", false).await.unwrap());
    }

    #[tokio::test]
    async fn test_overwrite_invalid_input_leaves_target() {
        let sandbox = Sandbox::new();
        let fs = sandbox.fs();
        fs.write(Path::new("/out.tar"), b"old", 0o600).unwrap();

        let ui = ScriptedUi::new(["", "7", "0"]);
        let err = resolve_overwrite(&ui, fs.as_ref(), &CancellationToken::new(), Path::new("/out.tar"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Aborted));
        assert_eq!(fs.read(Path::new("/out.tar")).unwrap(), b"old");
    }

    #[tokio::test]
    async fn test_overwrite_removes_existing_file() {
        let sandbox = Sandbox::new();
        let fs = sandbox.fs();
        fs.write(Path::new("/out.tar"), b"old", 0o600).unwrap();

        let ui = ScriptedUi::new(["1"]);
        let path = resolve_overwrite(&ui, fs.as_ref(), &CancellationToken::new(), Path::new("/out.tar"))
            .await
            .unwrap();
        assert_eq!(path, PathBuf::from("/out.tar"));
        assert!(!fs.exists(&path));
    }

    #[tokio::test]
    async fn test_overwrite_nonempty_dir_loops_then_new_path() {
        let sandbox = Sandbox::new();
        let fs = sandbox.fs();
        fs.create_dir_all(Path::new("/out/inner")).unwrap();

        let ui = ScriptedUi::new(["1", "2", "", "/other"]);
        let path = resolve_overwrite(&ui, fs.as_ref(), &CancellationToken::new(), Path::new("/out"))
            .await
            .unwrap();
        assert_eq!(path, PathBuf::from("/other"));
        assert!(fs.exists(Path::new("/out/inner")));
    }

    #[tokio::test]
    async fn test_secret_loop_reprompts_on_empty() {
        let ui = ScriptedUi::new(["", "  ", "s3cret"]);
        let secret = read_secret_loop(&ui, &CancellationToken::new(), "Passphrase: ")
            .await
            .unwrap();
        assert_eq!(secret.expose(), "s3cret");
    }

    #[tokio::test]
    async fn test_secret_loop_keeps_surrounding_spaces() {
        let ui = ScriptedUi::new(["  correct horse  "]);
        let secret = read_secret_loop(&ui, &CancellationToken::new(), "Passphrase: ")
            .await
            .unwrap();
        assert_eq!(secret.expose(), "  correct horse  ");
    }

    #[tokio::test]
    async fn test_secret_loop_abort() {
        let ui = ScriptedUi::new(["0"]);
        let err = read_secret_loop(&ui, &CancellationToken::new(), "Passphrase: ")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Aborted));
    }
}
