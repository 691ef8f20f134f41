//! Device access.
//!
//! [`Transport`] enumerates attached devices and opens a [`DeviceLink`] to
//! one of them. The link is deliberately small (shell, push, reboot); the
//! package-manager vocabulary lives in [`DeviceSession`], which also
//! serializes operations and observes cancellation.

pub mod adb;
pub mod session;
pub mod signer;

mod commands;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;

pub use commands::{DeviceSession, InstallOutcome};
pub use session::DeviceSessionManager;
pub use signer::RemoteSigner;

/// Bridge-reported state of one attached device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceState {
    Device,
    Unauthorized,
    Offline,
    Other(String),
}

impl DeviceState {
    pub fn parse(s: &str) -> Self {
        match s {
            "device" => Self::Device,
            "unauthorized" => Self::Unauthorized,
            "offline" => Self::Offline,
            other => Self::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEntry {
    pub serial: String,
    pub state: DeviceState,
}

/// Credential material for establishing a session.
#[derive(Debug, Clone)]
pub enum SessionCredential {
    /// The host bridge's own key.
    HostDefault,
    /// A private key file to offer to the device.
    KeyFile(PathBuf),
    /// Challenges are signed by a remote server.
    Remote(RemoteSigner),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShellOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ShellOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// stdout followed by stderr, trimmed.
    pub fn combined(&self) -> String {
        let mut text = self.stdout.trim().to_string();
        let err = self.stderr.trim();
        if !err.is_empty() {
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str(err);
        }
        text
    }
}

#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Every device the bridge can see, in any state.
    async fn devices(&self) -> Result<Vec<DeviceEntry>>;

    /// Open a link to `device` using `credential`.
    async fn connect(
        &self,
        device: &DeviceEntry,
        credential: &SessionCredential,
    ) -> Result<Arc<dyn DeviceLink>>;
}

#[async_trait]
pub trait DeviceLink: Send + Sync + fmt::Debug {
    fn serial(&self) -> &str;

    async fn shell(&self, command: &str) -> Result<ShellOutput>;

    async fn push(&self, local: &Path, remote: &str) -> Result<()>;

    async fn reboot(&self) -> Result<()>;
}

/// Quote a string for the device's POSIX shell.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("/sdcard/a b"), "'/sdcard/a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn test_combined_output() {
        let out = ShellOutput {
            stdout: "Performing Streamed Install\n".into(),
            stderr: "Failure [INSTALL_FAILED_INVALID_APK]\n".into(),
            exit_code: 1,
        };
        assert!(!out.success());
        assert_eq!(
            out.combined(),
            "Performing Streamed Install\nFailure [INSTALL_FAILED_INVALID_APK]"
        );
    }
}
