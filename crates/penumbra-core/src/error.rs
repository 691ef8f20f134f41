//! Error type shared by every engine component.

use penumbra_schema::{CatalogError, ErrorKind, JobId, RepoStatus};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Device unreachable: {0}")]
    DeviceUnreachable(String),

    #[error("{0} devices connected; disconnect all but one")]
    DeviceAmbiguous(usize),

    #[error("Authorization failed: {0}")]
    AuthorizationFailed(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Download failed: {0}")]
    DownloadFailed(String),

    #[error("Checksum mismatch for {file}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        file: String,
        expected: String,
        actual: String,
    },

    #[error("Install failed for {package}: {reason}")]
    InstallFailed { package: String, reason: String },

    #[error("Another job is already running ({0})")]
    JobInProgress(JobId),

    #[error("Cancelled")]
    Cancelled,

    #[error("Invalid catalog: {0}")]
    Catalog(#[from] CatalogError),

    #[error("Invalid catalog: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Create an [`Error::InstallFailed`] for a package or step.
    pub fn install_failed(package: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::InstallFailed {
            package: package.into(),
            reason: reason.to_string(),
        }
    }

    /// Stable classification for status reporting. Wrapped internal errors
    /// surface as `InstallFailed`, except HTTP transport errors which are
    /// download failures.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::DeviceUnreachable(_) => ErrorKind::DeviceUnreachable,
            Self::DeviceAmbiguous(_) => ErrorKind::DeviceAmbiguous,
            Self::AuthorizationFailed(_) => ErrorKind::AuthorizationFailed,
            Self::InvalidInput(_) | Self::Catalog(_) | Self::Toml(_) => ErrorKind::InvalidInput,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::RateLimited(_) => ErrorKind::RateLimited,
            Self::DownloadFailed(_) | Self::Http(_) => ErrorKind::DownloadFailed,
            Self::ChecksumMismatch { .. } => ErrorKind::ChecksumMismatch,
            Self::InstallFailed { .. } | Self::Io(_) | Self::Json(_) => ErrorKind::InstallFailed,
            Self::JobInProgress(_) => ErrorKind::JobInProgress,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Terminal repository status recording this error.
    pub fn as_status(&self) -> RepoStatus {
        match self {
            Self::Cancelled => RepoStatus::Cancelled,
            other => RepoStatus::Failed {
                kind: other.kind(),
                reason: other.to_string(),
            },
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_internal_errors_surface_as_install_failed() {
        let io = Error::from(std::io::Error::other("disk gone"));
        assert_eq!(io.kind(), ErrorKind::InstallFailed);
        assert_eq!(
            Error::from(CatalogError::NoRepositories).kind(),
            ErrorKind::InvalidInput
        );
        assert_eq!(Error::Cancelled.kind(), ErrorKind::Cancelled);
    }

    #[test]
    fn test_install_failed_message() {
        let err = Error::install_failed("com.penumbraos.pinitd", "INSTALL_FAILED_INVALID_APK");
        assert_eq!(
            err.to_string(),
            "Install failed for com.penumbraos.pinitd: INSTALL_FAILED_INVALID_APK"
        );
    }
}
