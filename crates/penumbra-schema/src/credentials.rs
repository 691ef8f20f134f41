//! Persisted credential configuration.
//!
//! The record is shared by the session layer (which reads [`KeySource`]) and
//! the download layer (which reads the optional access token).

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Where the device-bridge signing key comes from.
///
/// Exactly one variant is active at a time. Switching to one clears the other.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KeySource {
    /// No key configured; the host bridge falls back to its own default key.
    #[default]
    Unset,
    /// A private key copied into managed storage.
    LocalCopy {
        /// Path of the managed copy.
        stored_path: PathBuf,
        /// File name the user originally supplied.
        original_filename: String,
    },
    /// A remote signing server that answers authentication challenges.
    RemoteServer {
        /// Absolute `http(s)` URL of the signing endpoint.
        url: String,
    },
}

impl KeySource {
    /// Short human-readable label.
    pub fn describe(&self) -> String {
        match self {
            Self::Unset => "default host key".to_string(),
            Self::LocalCopy {
                original_filename, ..
            } => format!("local key '{original_filename}'"),
            Self::RemoteServer { url } => format!("remote signer at {url}"),
        }
    }
}

/// The single persisted credential record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialConfig {
    /// Device signing-key source.
    #[serde(default)]
    pub key_source: KeySource,

    /// Optional bearer token for the artifact host.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_token: Option<String>,
}

impl CredentialConfig {
    /// Whether an artifact-host token is configured.
    pub fn has_token(&self) -> bool {
        self.download_token.is_some()
    }
}
