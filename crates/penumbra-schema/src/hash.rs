//! Validated SHA-256 digests for artifact verification.

use serde::{Deserialize, Deserializer, Serialize};

/// Errors produced when parsing a [`Sha256Digest`].
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DigestError {
    /// The hex portion is not exactly 64 characters long.
    #[error("Invalid SHA256 digest: expected 64 hex characters, got {0}")]
    InvalidLength(usize),

    /// The digest contains characters outside `[0-9a-fA-F]`.
    #[error("Invalid SHA256 digest: contains non-hex characters in '{0}'")]
    NonHex(String),
}

/// A validated SHA256 digest (64 lowercase hex characters).
///
/// Release hosts publish digests as `sha256:<hex>`; the prefix is accepted and
/// stripped so every digest in the system compares byte-for-byte.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Sha256Digest(String);

impl Sha256Digest {
    /// Create a new `Sha256Digest`, validating the input.
    ///
    /// Accepts strings with or without a `sha256:` prefix.
    ///
    /// # Errors
    ///
    /// Returns [`DigestError`] if the hex portion is not exactly 64 ASCII hex characters.
    pub fn new(s: impl Into<String>) -> Result<Self, DigestError> {
        let s = s.into();
        let hex = s.strip_prefix("sha256:").unwrap_or(&s);

        if hex.len() != 64 {
            return Err(DigestError::InvalidLength(hex.len()));
        }
        if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(DigestError::NonHex(s.clone()));
        }

        Ok(Self(hex.to_lowercase()))
    }

    /// Get the digest as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<'de> Deserialize<'de> for Sha256Digest {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::new(s).map_err(serde::de::Error::custom)
    }
}

impl std::fmt::Display for Sha256Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Sha256Digest {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EMPTY: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn test_prefix_is_stripped_and_lowercased() {
        let upper = format!("sha256:{}", EMPTY.to_uppercase());
        let digest = Sha256Digest::new(upper).unwrap();
        assert_eq!(digest.as_str(), EMPTY);
    }

    #[test]
    fn test_rejects_bad_digests() {
        assert_eq!(
            Sha256Digest::new("abc"),
            Err(DigestError::InvalidLength(3))
        );
        let bad = "z".repeat(64);
        assert!(matches!(
            Sha256Digest::new(bad),
            Err(DigestError::NonHex(_))
        ));
    }

    #[test]
    fn test_deserialize_validates() {
        let ok: Sha256Digest = serde_json::from_str(&format!("\"{EMPTY}\"")).unwrap();
        assert_eq!(ok.to_string(), EMPTY);
        assert!(serde_json::from_str::<Sha256Digest>("\"nope\"").is_err());
    }
}
