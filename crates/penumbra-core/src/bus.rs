//! Progress and cancellation bus.
//!
//! One bus exists per job. Every component of the job reports through it
//! and polls it for cancellation. Events are mirrored to `tracing` so a log
//! file sees the same stream a front end does.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use penumbra_schema::{JobId, Level, ProgressEvent, RepoStatus};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::reporter::{NullReporter, Reporter};

#[derive(Clone)]
pub struct ProgressBus {
    job_id: JobId,
    reporter: Arc<dyn Reporter>,
    cancel: CancellationToken,
    // Stamping and delivery happen under one lock so timestamps follow
    // delivery order across concurrent repositories.
    order: Arc<Mutex<()>>,
}

impl fmt::Debug for ProgressBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressBus")
            .field("job_id", &self.job_id)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl ProgressBus {
    pub fn new(job_id: JobId, reporter: Arc<dyn Reporter>, cancel: CancellationToken) -> Self {
        Self {
            job_id,
            reporter,
            cancel,
            order: Arc::new(Mutex::new(())),
        }
    }

    /// A bus nobody listens to, with its own cancellation token.
    pub fn detached(job_id: JobId) -> Self {
        Self::new(job_id, Arc::new(NullReporter), CancellationToken::new())
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Fails with [`Error::Cancelled`] once cancellation was requested.
    pub fn checkpoint(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    pub fn emit(&self, level: Level, repository: Option<&str>, message: impl Into<String>) {
        let message = message.into();
        let repo = repository.unwrap_or("-");
        match level {
            Level::Info => tracing::info!(job = %self.job_id, repo, "{message}"),
            Level::Warn => tracing::warn!(job = %self.job_id, repo, "{message}"),
            Level::Error => tracing::error!(job = %self.job_id, repo, "{message}"),
        }

        let _order = self.order.lock().unwrap_or_else(PoisonError::into_inner);
        let event = ProgressEvent {
            timestamp: Utc::now(),
            job_id: self.job_id,
            repository: repository.map(str::to_string),
            message,
            level,
        };
        self.reporter.event(&event);
    }

    pub fn info(&self, repository: Option<&str>, message: impl Into<String>) {
        self.emit(Level::Info, repository, message);
    }

    pub fn warn(&self, repository: Option<&str>, message: impl Into<String>) {
        self.emit(Level::Warn, repository, message);
    }

    pub fn error(&self, repository: Option<&str>, message: impl Into<String>) {
        self.emit(Level::Error, repository, message);
    }

    /// Record a repository state change. Emits exactly one event.
    pub fn transition(&self, repository: &str, status: &RepoStatus) {
        let level = match status {
            RepoStatus::Failed { .. } => Level::Error,
            RepoStatus::Cancelled => Level::Warn,
            _ => Level::Info,
        };
        self.emit(level, Some(repository), format!("{repository}: {status}"));
        self.reporter.status(self.job_id, repository, status);
    }

    pub fn downloading(&self, repository: &str, filename: &str, current: u64, total: Option<u64>) {
        self.reporter
            .downloading(self.job_id, repository, filename, current, total);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reporter::ChannelReporter;

    #[test]
    fn test_transition_emits_one_event() {
        let (reporter, mut rx) = ChannelReporter::new();
        let bus = ProgressBus::new(JobId(7), Arc::new(reporter), CancellationToken::new());

        bus.transition("pinitd", &RepoStatus::Downloaded);

        let event = rx.try_recv().unwrap();
        assert_eq!(event.job_id, JobId(7));
        assert_eq!(event.repository.as_deref(), Some("pinitd"));
        assert_eq!(event.message, "pinitd: downloaded");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_cancellation_is_monotonic() {
        let bus = ProgressBus::detached(JobId(1));
        assert!(bus.checkpoint().is_ok());
        bus.token().cancel();
        assert!(matches!(bus.checkpoint(), Err(Error::Cancelled)));
        assert!(bus.clone().is_cancelled());
    }
}
