//! Streaming artifact download with SHA256 and size verification.
//!
//! Bytes go to a caller-supplied temporary path; the caller decides whether
//! to rename it into the cache or discard it. Cancellation is observed
//! between chunks and while waiting on the network.

use std::path::Path;

use futures::StreamExt;
use penumbra_schema::ArtifactReference;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

use crate::bus::ProgressBus;
use crate::error::Error;
use crate::github::{ReleaseHost, check_status};

/// Download failures. Cloneable so one in-flight download can hand its
/// outcome to every caller waiting on the same artifact.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DownloadError {
    #[error("download cancelled")]
    Cancelled,

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0}")]
    RateLimited(String),

    #[error("checksum mismatch for {file}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        file: String,
        expected: String,
        actual: String,
    },

    #[error("size mismatch for {file}: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        file: String,
        expected: u64,
        actual: u64,
    },

    #[error("{0}")]
    Failed(String),
}

impl From<std::io::Error> for DownloadError {
    fn from(err: std::io::Error) -> Self {
        Self::Failed(format!("IO error: {err}"))
    }
}

impl From<reqwest::Error> for DownloadError {
    fn from(err: reqwest::Error) -> Self {
        Self::Failed(format!("HTTP error: {err}"))
    }
}

impl From<Error> for DownloadError {
    fn from(err: Error) -> Self {
        match err {
            Error::Cancelled => Self::Cancelled,
            Error::NotFound(what) => Self::NotFound(what),
            Error::RateLimited(msg) => Self::RateLimited(msg),
            other => Self::Failed(other.to_string()),
        }
    }
}

impl From<DownloadError> for Error {
    fn from(err: DownloadError) -> Self {
        match err {
            DownloadError::Cancelled => Error::Cancelled,
            DownloadError::NotFound(what) => Error::NotFound(what),
            DownloadError::RateLimited(msg) => Error::RateLimited(msg),
            DownloadError::ChecksumMismatch {
                file,
                expected,
                actual,
            } => Error::ChecksumMismatch {
                file,
                expected,
                actual,
            },
            DownloadError::SizeMismatch {
                file,
                expected,
                actual,
            } => Error::ChecksumMismatch {
                file,
                expected: format!("{expected} bytes"),
                actual: format!("{actual} bytes"),
            },
            DownloadError::Failed(msg) => Error::DownloadFailed(msg),
        }
    }
}

/// Request for a download operation
#[derive(Debug)]
pub struct DownloadRequest<'a> {
    pub host: &'a ReleaseHost,
    pub artifact: &'a ArtifactReference,
    pub dest: &'a Path,
    pub bus: &'a ProgressBus,
}

impl<'a> DownloadRequest<'a> {
    pub fn new(
        host: &'a ReleaseHost,
        artifact: &'a ArtifactReference,
        dest: &'a Path,
        bus: &'a ProgressBus,
    ) -> Self {
        Self {
            host,
            artifact,
            dest,
            bus,
        }
    }

    /// Stream the artifact to `dest` and verify it. Returns the SHA256 hex
    /// digest of the written bytes. On error `dest` may hold partial data.
    pub async fn execute(self) -> Result<String, DownloadError> {
        let Self {
            host,
            artifact,
            dest,
            bus,
        } = self;
        let cancel = bus.token();
        let what = format!("{}/{}", artifact.repository, artifact.filename);

        let response = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(DownloadError::Cancelled),
            resp = host.get(&artifact.url).send() => resp?,
        };
        let response = check_status(response, &what, host.has_token())?;

        let total = artifact.expected_size.or(response.content_length());
        let mut file = File::create(dest).await?;
        let mut stream = response.bytes_stream();
        let mut hasher = Sha256::new();
        let mut downloaded: u64 = 0;

        bus.downloading(&artifact.repository, &artifact.filename, 0, total);
        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(DownloadError::Cancelled),
                next = stream.next() => next,
            };
            let Some(chunk) = next else { break };
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            hasher.update(&chunk);
            downloaded += chunk.len() as u64;
            bus.downloading(&artifact.repository, &artifact.filename, downloaded, total);
        }

        file.flush().await?;
        file.sync_all().await?;
        let actual_hash = hex::encode(hasher.finalize());

        if let Some(expected) = artifact.expected_size
            && expected != downloaded
        {
            return Err(DownloadError::SizeMismatch {
                file: artifact.filename.clone(),
                expected,
                actual: downloaded,
            });
        }
        if let Some(expected) = &artifact.expected_sha256
            && expected.as_str() != actual_hash
        {
            return Err(DownloadError::ChecksumMismatch {
                file: artifact.filename.clone(),
                expected: expected.to_string(),
                actual: actual_hash,
            });
        }

        Ok(actual_hash)
    }
}
