//! age decryption of staged archives
//!
//! The operator supplies either an `AGE-SECRET-KEY-1…` literal or a
//! passphrase. A passphrase is tried as a native scrypt passphrase and as
//! the seed of two derived X25519 identities (current and legacy).

use crate::error::{Error, Result};
use bech32::{Bech32, Hrp};
use proxsafe_core::sys::FileSystem;
use proxsafe_core::ui::read_secret_loop;
use proxsafe_core::{Deps, SecretString};
use sha2::{Digest, Sha256};
use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use zeroize::Zeroizing;

const SECRET_KEY_PREFIX: &str = "AGE-SECRET-KEY-";

/// Domain separator for the current passphrase-derived identity
const DERIVATION_DOMAIN: &[u8] = b"proxsafe/age-x25519/v2\0";

pub type BoxedIdentity = Box<dyn age::Identity + Send + Sync>;

/// Outcome of one decryption attempt
#[derive(Debug)]
pub enum Attempt {
    Decrypted,
    /// None of the identities unlocked the file
    WrongIdentity,
}

/// X25519 identity from 32 bytes of key material.
fn identity_from_bytes(bytes: &[u8; 32]) -> Result<age::x25519::Identity> {
    let hrp = Hrp::parse("age-secret-key-").map_err(|e| Error::Decrypt(e.to_string()))?;
    let encoded = Zeroizing::new(
        bech32::encode::<Bech32>(hrp, bytes)
            .map_err(|e| Error::Decrypt(e.to_string()))?
            .to_ascii_uppercase(),
    );
    encoded
        .parse::<age::x25519::Identity>()
        .map_err(|e| Error::Decrypt(format!("derived identity rejected: {}", e)))
}

/// Identity derived from a passphrase; `domain` selects the current scheme,
/// `None` the legacy one.
pub fn derive_identity(passphrase: &str, domain: Option<&[u8]>) -> Result<age::x25519::Identity> {
    let mut hasher = Sha256::new();
    if let Some(domain) = domain {
        hasher.update(domain);
    }
    hasher.update(passphrase.as_bytes());
    let digest: Zeroizing<[u8; 32]> = Zeroizing::new(hasher.finalize().into());
    identity_from_bytes(&digest)
}

/// Identities to try for operator input.
pub fn identities_for(secret: &SecretString) -> Result<Vec<BoxedIdentity>> {
    let input = secret.expose();
    let upper = Zeroizing::new(input.trim().to_ascii_uppercase());
    if upper.starts_with(SECRET_KEY_PREFIX) {
        let identity = upper
            .parse::<age::x25519::Identity>()
            .map_err(|e| Error::Decrypt(format!("invalid age secret key: {}", e)))?;
        return Ok(vec![Box::new(identity)]);
    }

    let scrypt = age::scrypt::Identity::new(age::secrecy::SecretString::from(input.to_string()));
    Ok(vec![
        Box::new(scrypt),
        Box::new(derive_identity(input, Some(DERIVATION_DOMAIN))?),
        Box::new(derive_identity(input, None)?),
    ])
}

fn is_wrong_identity(err: &age::DecryptError) -> bool {
    matches!(
        err,
        age::DecryptError::NoMatchingKeys
            | age::DecryptError::DecryptionFailed
            | age::DecryptError::KeyDecryptionFailed
    )
}

/// Reader that fails once `cancel` fires.
struct Cancellable<'a, R> {
    inner: R,
    cancel: &'a CancellationToken,
}

impl<R: Read> Read for Cancellable<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.cancel.is_cancelled() {
            return Err(io::Error::other("decryption cancelled"));
        }
        self.inner.read(buf)
    }
}

/// Decrypt `src` into `dst` with the given identities. The plaintext is
/// written to a temp sibling and renamed into place only when complete;
/// cancellation removes the temp file and yields [`Error::DecryptAborted`].
pub fn decrypt_file(
    fs: &dyn FileSystem,
    cancel: &CancellationToken,
    src: &Path,
    dst: &Path,
    identities: &[BoxedIdentity],
) -> Result<Attempt> {
    let input = fs
        .open(src)
        .map_err(|e| Error::path_io("Failed to open", src, e))?;
    let decryptor = match age::Decryptor::new_buffered(io::BufReader::new(input)) {
        Ok(d) => d,
        Err(e) => return Err(Error::Decrypt(format!("{}: {}", src.display(), e))),
    };
    let identities = identities.iter().map(|i| i.as_ref() as &dyn age::Identity);
    let reader = match decryptor.decrypt(identities) {
        Ok(reader) => reader,
        Err(e) if is_wrong_identity(&e) => return Ok(Attempt::WrongIdentity),
        Err(e) => return Err(Error::Decrypt(e.to_string())),
    };

    let dir = dst
        .parent()
        .ok_or_else(|| Error::Decrypt(format!("no parent for {}", dst.display())))?;
    let (mut out, tmp) = fs
        .create_temp_file(dir, ".decrypt-")
        .map_err(|e| Error::path_io("Failed to create temp file in", dir, e))?;

    let mut reader = Cancellable { inner: reader, cancel };
    let copied = io::copy(&mut reader, &mut out)
        .and_then(|_| out.flush())
        .and_then(|_| out.sync_all());
    drop(out);
    if let Err(e) = copied {
        fs.remove_file(&tmp).ok();
        if cancel.is_cancelled() {
            return Err(Error::DecryptAborted);
        }
        return Err(Error::Decrypt(format!("{}: {}", src.display(), e)));
    }
    fs.rename(&tmp, dst).map_err(|e| {
        fs.remove_file(&tmp).ok();
        Error::path_io("Failed to move decrypted file to", dst, e)
    })?;
    Ok(Attempt::Decrypted)
}

/// Prompt until the archive decrypts. Empty input re-prompts, `0` (or
/// cancellation) is [`Error::DecryptAborted`].
pub async fn decrypt_interactive(
    deps: &Deps,
    cancel: &CancellationToken,
    src: &Path,
    dst: &Path,
) -> Result<()> {
    loop {
        let secret = match read_secret_loop(
            deps.ui.as_ref(),
            cancel,
            "Enter age secret key or passphrase (0 to abort): ",
        )
        .await
        {
            Ok(secret) => secret,
            Err(e) if e.is_abort() => return Err(Error::DecryptAborted),
            Err(e) => return Err(e.into()),
        };

        let identities = match identities_for(&secret) {
            Ok(ids) => ids,
            Err(Error::Decrypt(msg)) => {
                deps.ui.println(&format!("{}, try again.", msg));
                continue;
            }
            Err(e) => return Err(e),
        };
        drop(secret);

        let fs = Arc::clone(&deps.fs);
        let (src_owned, dst_owned) = (src.to_path_buf(), dst.to_path_buf());
        let token = cancel.clone();
        let mut handle = tokio::task::spawn_blocking(move || {
            decrypt_file(fs.as_ref(), &token, &src_owned, &dst_owned, &identities)
        });
        let joined = tokio::select! {
            joined = &mut handle => joined,
            _ = cancel.cancelled() => {
                // The copy loop sees the token and drops its temp file
                let _ = handle.await;
                return Err(Error::DecryptAborted);
            }
        };
        let attempt = joined.map_err(|e| Error::Decrypt(e.to_string()))??;

        match attempt {
            Attempt::Decrypted => {
                info!("Decrypted {}", src.display());
                return Ok(());
            }
            Attempt::WrongIdentity => {
                debug!("No identity matched {}", src.display());
                deps.ui.println("Incorrect key or passphrase, try again.");
            }
        }
    }
}
