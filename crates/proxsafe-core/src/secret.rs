//! Secret input handling
//!
//! Passphrases and key material read from the operator live in
//! [`SecretString`], which is zeroed on drop and never printed.

use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// A string that is wiped from memory when dropped
#[derive(Clone, Default, Zeroize, ZeroizeOnDrop)]
pub struct SecretString {
    inner: String,
}

impl SecretString {
    pub fn new(value: String) -> Self {
        Self { inner: value }
    }

    /// Expose the value (use with caution)
    pub fn expose(&self) -> &str {
        &self.inner
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Copy of the value with surrounding whitespace removed
    pub fn trimmed(&self) -> SecretString {
        SecretString::new(self.inner.trim().to_string())
    }
}

impl From<String> for SecretString {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&str> for SecretString {
    fn from(s: &str) -> Self {
        Self::new(s.to_string())
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretString([REDACTED {} bytes])", self.len())
    }
}

impl fmt::Display for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_is_redacted() {
        let secret = SecretString::from("hunter2");
        assert_eq!(format!("{}", secret), "[REDACTED]");
        assert!(!format!("{:?}", secret).contains("hunter2"));
        assert_eq!(secret.expose(), "hunter2");
    }

    #[test]
    fn test_trimmed() {
        let secret = SecretString::from("  pass \n");
        assert_eq!(secret.trimmed().expose(), "pass");
    }
}
