//! Job, per-repository status and progress event types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Monotonic identifier of an installation job within one process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

/// What a job does to the selected repositories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Download, push, install and enable.
    Install,
    /// Disable and remove.
    Uninstall,
    /// Populate the local cache only; no device is needed.
    DownloadOnly,
}

impl Operation {
    /// Whether this operation talks to the device.
    pub fn needs_device(self) -> bool {
        !matches!(self, Self::DownloadOnly)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Install => "install",
            Self::Uninstall => "uninstall",
            Self::DownloadOnly => "download",
        })
    }
}

/// Lifecycle of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Accepted, not yet started.
    Pending,
    /// Looking up releases.
    Resolving,
    /// Fetching artifacts into the cache.
    Downloading,
    /// Driving per-repository device work.
    Installing,
    /// Finished; at least one repository succeeded.
    Completed,
    /// Stopped by a cancellation request.
    Cancelled,
    /// Every requested repository failed, or the job could not start.
    Failed,
}

impl JobState {
    /// Terminal states release the single job slot.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pending => "pending",
            Self::Resolving => "resolving",
            Self::Downloading => "downloading",
            Self::Installing => "installing",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        })
    }
}

/// Stable classification of failures, shared with callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// No device reachable.
    DeviceUnreachable,
    /// More than one device attached.
    DeviceAmbiguous,
    /// Signing key rejected or signing server unreachable.
    AuthorizationFailed,
    /// Caller supplied a malformed value.
    InvalidInput,
    /// Repository, release or asset missing.
    NotFound,
    /// Artifact host throttled the request.
    RateLimited,
    /// Network or write failure while fetching.
    DownloadFailed,
    /// Downloaded bytes did not match the published digest or size.
    ChecksumMismatch,
    /// An on-device step failed.
    InstallFailed,
    /// Another job is active.
    JobInProgress,
    /// The job was cancelled.
    Cancelled,
}

/// Per-repository state machine position.
///
/// Install walks `Pending -> Downloaded -> Pushed -> Installed -> Enabled -> Done`,
/// uninstall walks `Pending -> Disabled -> Removed -> Done`. Download-only jobs
/// stop at `Downloaded` and then report `Done`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RepoStatus {
    /// Not started.
    Pending,
    /// All artifacts are in the cache.
    Downloaded,
    /// Files and packages staged on the device.
    Pushed,
    /// Packages installed (or already current).
    Installed,
    /// Permissions, app ops and configuration applied.
    Enabled,
    /// Bundle packages disabled ahead of removal.
    Disabled,
    /// Packages and files removed.
    Removed,
    /// Finished successfully.
    Done,
    /// Stopped with an error.
    Failed {
        /// Classification of the failure.
        kind: ErrorKind,
        /// Diagnostic message.
        reason: String,
    },
    /// Stopped by cancellation before finishing.
    Cancelled,
}

impl RepoStatus {
    /// `Done`, `Failed` and `Cancelled` never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed { .. } | Self::Cancelled)
    }

    /// Whether the repository finished successfully.
    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done)
    }

    /// Whether the repository failed.
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

impl fmt::Display for RepoStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => f.write_str("pending"),
            Self::Downloaded => f.write_str("downloaded"),
            Self::Pushed => f.write_str("pushed"),
            Self::Installed => f.write_str("installed"),
            Self::Enabled => f.write_str("enabled"),
            Self::Disabled => f.write_str("disabled"),
            Self::Removed => f.write_str("removed"),
            Self::Done => f.write_str("done"),
            Self::Failed { reason, .. } => write!(f, "failed: {reason}"),
            Self::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Result retained once a job reaches a terminal state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSummary {
    /// Job identifier.
    pub job_id: JobId,
    /// Operation performed.
    pub operation: Operation,
    /// Terminal job state.
    pub state: JobState,
    /// Final status of every repository the job covered.
    pub repositories: BTreeMap<String, RepoStatus>,
    /// Whether the device was rebooted at the end of the job.
    #[serde(default)]
    pub rebooted: bool,
}

impl JobSummary {
    /// Status of one repository, if the job covered it.
    pub fn status(&self, repository: &str) -> Option<&RepoStatus> {
        self.repositories.get(repository)
    }
}

/// Severity of a [`ProgressEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    /// Normal progress.
    Info,
    /// Logged but non-fatal condition.
    Warn,
    /// Failure of a step or repository.
    Error,
}

/// One entry of a job's ordered progress stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// Wall-clock time the event was emitted.
    pub timestamp: DateTime<Utc>,
    /// Job that emitted the event.
    pub job_id: JobId,
    /// Repository the event concerns, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
    /// Human-readable message.
    pub message: String,
    /// Severity.
    pub level: Level,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(JobState::Cancelled.is_terminal());
        assert!(!JobState::Installing.is_terminal());
        assert!(RepoStatus::Cancelled.is_terminal());
        assert!(!RepoStatus::Installed.is_terminal());
    }

    #[test]
    fn test_failed_status_serializes_kind() {
        let status = RepoStatus::Failed {
            kind: ErrorKind::RateLimited,
            reason: "slow down".into(),
        };
        let json = serde_json::to_string(&status).unwrap();
        assert_eq!(
            json,
            r#"{"status":"failed","kind":"rate_limited","reason":"slow down"}"#
        );
    }
}
