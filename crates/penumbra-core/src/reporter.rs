//! Reporter trait for dependency injection
//!
//! This trait allows the engine to report progress and status without
//! being coupled to a specific TUI or GUI implementation. Reporters are
//! fire-and-forget: a consumer that goes away never affects the job.

use penumbra_schema::{JobId, ProgressEvent, RepoStatus};
use tokio::sync::mpsc;

pub trait Reporter: Send + Sync {
    /// Receives every progress event of a job, in emission order.
    fn event(&self, event: &ProgressEvent);

    /// A repository moved to a new state.
    fn status(&self, _job: JobId, _repository: &str, _status: &RepoStatus) {}

    /// Byte-level download progress. Not part of the event stream.
    fn downloading(
        &self,
        _job: JobId,
        _repository: &str,
        _filename: &str,
        _current: u64,
        _total: Option<u64>,
    ) {
    }
}

impl<T: Reporter + ?Sized> Reporter for std::sync::Arc<T> {
    fn event(&self, event: &ProgressEvent) {
        (**self).event(event);
    }
    fn status(&self, job: JobId, repository: &str, status: &RepoStatus) {
        (**self).status(job, repository, status);
    }
    fn downloading(
        &self,
        job: JobId,
        repository: &str,
        filename: &str,
        current: u64,
        total: Option<u64>,
    ) {
        (**self).downloading(job, repository, filename, current, total);
    }
}

/// A reporter that does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullReporter;

impl Reporter for NullReporter {
    fn event(&self, _event: &ProgressEvent) {}
}

/// Forwards events into an unbounded channel.
///
/// The producer never blocks; once the receiver is dropped events are
/// silently discarded.
#[derive(Debug, Clone)]
pub struct ChannelReporter {
    tx: mpsc::UnboundedSender<ProgressEvent>,
}

impl ChannelReporter {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Reporter for ChannelReporter {
    fn event(&self, event: &ProgressEvent) {
        let _ = self.tx.send(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use penumbra_schema::Level;

    fn event(msg: &str) -> ProgressEvent {
        ProgressEvent {
            timestamp: Utc::now(),
            job_id: JobId(1),
            repository: None,
            message: msg.to_string(),
            level: Level::Info,
        }
    }

    #[test]
    fn test_channel_reporter_preserves_order() {
        let (reporter, mut rx) = ChannelReporter::new();
        reporter.event(&event("one"));
        reporter.event(&event("two"));
        assert_eq!(rx.try_recv().unwrap().message, "one");
        assert_eq!(rx.try_recv().unwrap().message, "two");
    }

    #[test]
    fn test_detached_consumer_is_ignored() {
        let (reporter, rx) = ChannelReporter::new();
        drop(rx);
        reporter.event(&event("nobody listening"));
    }
}
