//! Line-oriented progress output for jobs.

use std::collections::HashMap;
use std::io::Write;
use std::sync::{Mutex, PoisonError};

use crossterm::style::Stylize;
use penumbra_core::Reporter;
use penumbra_schema::{JobId, ProgressEvent, RepoStatus};

use super::theme::{Theme, format_size};

/// Download progress is printed in steps of this many percent.
const PROGRESS_STEP: u64 = 25;

/// Prints job events to stderr so stdout stays free for summaries.
#[derive(Debug, Default)]
pub struct ConsoleReporter {
    theme: Theme,
    // Last printed progress step per (repository, file).
    downloads: Mutex<HashMap<(String, String), u64>>,
}

impl ConsoleReporter {
    pub fn new() -> Self {
        Self::default()
    }
}

fn line(text: &str) {
    let mut err = std::io::stderr().lock();
    let _ = writeln!(err, "{text}");
}

impl Reporter for ConsoleReporter {
    fn event(&self, event: &ProgressEvent) {
        // Status transitions get their own styled line.
        if event.repository.is_some() && is_transition(&event.message) {
            return;
        }
        let time = event.timestamp.with_timezone(&chrono::Local).format("%H:%M:%S");
        let color = self.theme.level_color(event.level);
        let text = match &event.repository {
            Some(repo) => format!("{repo}: {}", event.message),
            None => event.message.clone(),
        };
        line(&format!(
            "{} {}",
            time.to_string().dark_grey(),
            text.with(color)
        ));
    }

    fn status(&self, _job: JobId, repository: &str, status: &RepoStatus) {
        let (icon, color) = self.theme.status_style(status);
        line(&format!(
            "  {} {:<20} {}",
            icon.with(color),
            repository.bold(),
            status.to_string().with(color)
        ));
    }

    fn downloading(
        &self,
        _job: JobId,
        repository: &str,
        filename: &str,
        current: u64,
        total: Option<u64>,
    ) {
        let Some(total) = total.filter(|&t| t > 0) else {
            return;
        };
        let step = (current.min(total) * 100 / total) / PROGRESS_STEP * PROGRESS_STEP;
        {
            let mut downloads = self.downloads.lock().unwrap_or_else(PoisonError::into_inner);
            let last = downloads
                .entry((repository.to_string(), filename.to_string()))
                .or_insert(0);
            if step <= *last {
                return;
            }
            *last = step;
        }
        line(&format!(
            "    {} {} {}",
            filename.dark_grey(),
            format!("{step:>3}%").with(self.theme.colors.active),
            format!("of {}", format_size(total)).dark_grey()
        ));
    }
}

/// Messages of the form `repo: <status>` emitted for every transition.
fn is_transition(message: &str) -> bool {
    message.split_once(": ").is_some_and(|(_, status)| {
        status.starts_with("failed: ")
            || matches!(
                status,
                "pending"
                    | "downloaded"
                    | "pushed"
                    | "installed"
                    | "enabled"
                    | "disabled"
                    | "removed"
                    | "done"
                    | "cancelled"
            )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_transition() {
        assert!(is_transition("pinitd: downloaded"));
        assert!(is_transition("mabl: done"));
        assert!(is_transition("mabl: failed: no releases published"));
        assert!(!is_transition("Installing pinitd.apk"));
        assert!(!is_transition("pinitd: installing core.apk"));
    }

    #[test]
    fn test_download_progress_is_throttled() {
        let reporter = ConsoleReporter::new();
        reporter.downloading(JobId(1), "pinitd", "pinitd.apk", 10, Some(100));
        reporter.downloading(JobId(1), "pinitd", "pinitd.apk", 30, Some(100));
        reporter.downloading(JobId(1), "pinitd", "pinitd.apk", 40, Some(100));
        let downloads = reporter.downloads.lock().unwrap();
        assert_eq!(downloads[&("pinitd".to_string(), "pinitd.apk".to_string())], 25);
    }
}
