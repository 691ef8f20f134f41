//! Job bookkeeping: the single active-job slot, per-repository status and
//! dependency ordering.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use penumbra_schema::{JobId, JobState, Operation, RepoStatus, Repository};
use tokio_util::sync::CancellationToken;

use crate::bus::ProgressBus;
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
struct ActiveJob {
    id: JobId,
    operation: Operation,
    state: JobState,
    cancel: CancellationToken,
}

/// Admits at most one job at a time.
#[derive(Debug, Default)]
pub struct JobSlot {
    next: AtomicU64,
    active: Mutex<Option<ActiveJob>>,
}

impl JobSlot {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Claim the slot, or fail with [`Error::JobInProgress`].
    pub fn begin(self: &Arc<Self>, operation: Operation) -> Result<JobTicket> {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(job) = active.as_ref() {
            return Err(Error::JobInProgress(job.id));
        }
        let id = JobId(self.next.fetch_add(1, Ordering::Relaxed) + 1);
        let cancel = CancellationToken::new();
        *active = Some(ActiveJob {
            id,
            operation,
            state: JobState::Pending,
            cancel: cancel.clone(),
        });
        Ok(JobTicket {
            slot: Arc::clone(self),
            id,
            cancel,
        })
    }

    /// Signal the active job. Returns its id, or `None` when idle.
    pub fn cancel(&self) -> Option<JobId> {
        let active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        active.as_ref().map(|job| {
            job.cancel.cancel();
            job.id
        })
    }

    /// Id, operation and current phase of the running job.
    pub fn active(&self) -> Option<(JobId, Operation, JobState)> {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|job| (job.id, job.operation, job.state))
    }
}

/// Proof of holding the job slot; releases it on drop.
#[derive(Debug)]
pub struct JobTicket {
    slot: Arc<JobSlot>,
    id: JobId,
    cancel: CancellationToken,
}

impl JobTicket {
    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn set_state(&self, state: JobState) {
        let mut active = self
            .slot
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(job) = active.as_mut().filter(|job| job.id == self.id) {
            job.state = state;
        }
    }
}

impl Drop for JobTicket {
    fn drop(&mut self) {
        let mut active = self
            .slot
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if active.as_ref().is_some_and(|job| job.id == self.id) {
            *active = None;
        }
    }
}

/// Per-repository status map of one job.
///
/// Every change goes through [`StatusBoard::set`], which emits the
/// transition on the bus. Terminal statuses are final.
#[derive(Debug)]
pub struct StatusBoard {
    bus: ProgressBus,
    statuses: Mutex<BTreeMap<String, RepoStatus>>,
}

impl StatusBoard {
    pub fn new<'a>(bus: ProgressBus, repositories: impl IntoIterator<Item = &'a str>) -> Self {
        let statuses = repositories
            .into_iter()
            .map(|name| (name.to_string(), RepoStatus::Pending))
            .collect();
        Self {
            bus,
            statuses: Mutex::new(statuses),
        }
    }

    /// Move `repository` to `status`. Ignored once the repository is
    /// terminal; returns whether the change was applied.
    pub fn set(&self, repository: &str, status: RepoStatus) -> bool {
        {
            let mut statuses = self.statuses.lock().unwrap_or_else(PoisonError::into_inner);
            match statuses.get_mut(repository) {
                Some(current) if !current.is_terminal() && *current != status => {
                    *current = status.clone();
                }
                _ => return false,
            }
        }
        self.bus.transition(repository, &status);
        true
    }

    pub fn get(&self, repository: &str) -> Option<RepoStatus> {
        self.statuses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(repository)
            .cloned()
    }

    /// Fail every repository that has not finished.
    pub fn fail_remaining(&self, err: &Error) {
        for name in self.unfinished() {
            self.set(&name, err.as_status());
        }
    }

    /// Mark every repository that has not finished as cancelled.
    pub fn cancel_remaining(&self) {
        for name in self.unfinished() {
            self.set(&name, RepoStatus::Cancelled);
        }
    }

    fn unfinished(&self) -> Vec<String> {
        self.statuses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, s)| !s.is_terminal())
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn snapshot(&self) -> BTreeMap<String, RepoStatus> {
        self.statuses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Group `repositories` into levels: every repository's dependencies (among
/// the ones given) sit in earlier levels. Declaration order is kept within a
/// level.
pub fn dependency_levels(repositories: &[Repository]) -> Vec<Vec<Repository>> {
    let selected: HashSet<&str> = repositories.iter().map(|r| r.name.as_str()).collect();
    let mut pending: HashMap<&str, usize> = repositories
        .iter()
        .map(|r| {
            let deps = r
                .depends_on
                .iter()
                .filter(|d| selected.contains(d.as_str()))
                .count();
            (r.name.as_str(), deps)
        })
        .collect();

    let mut levels = Vec::new();
    let mut remaining: Vec<&Repository> = repositories.iter().collect();
    while !remaining.is_empty() {
        let (ready, blocked): (Vec<&Repository>, Vec<&Repository>) = remaining
            .into_iter()
            .partition(|r| pending.get(r.name.as_str()).copied().unwrap_or(0) == 0);

        if ready.is_empty() {
            // Only reachable with a cycle, which catalog validation rejects.
            levels.push(blocked.into_iter().cloned().collect());
            break;
        }

        for repo in &blocked {
            let satisfied = repo
                .depends_on
                .iter()
                .filter(|d| ready.iter().any(|r| &r.name == *d))
                .count();
            if let Some(count) = pending.get_mut(repo.name.as_str()) {
                *count = count.saturating_sub(satisfied);
            }
        }
        levels.push(ready.into_iter().cloned().collect());
        remaining = blocked;
    }
    levels
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reporter::ChannelReporter;

    fn repo(name: &str, deps: &[&str]) -> Repository {
        toml::from_str(&format!(
            "name = \"{name}\"\nowner = \"o\"\nrepo = \"{name}\"\nrelease_assets = [\"*.apk\"]\ndepends_on = {deps:?}\n"
        ))
        .unwrap()
    }

    fn names(levels: &[Vec<Repository>]) -> Vec<Vec<&str>> {
        levels
            .iter()
            .map(|l| l.iter().map(|r| r.name.as_str()).collect())
            .collect()
    }

    #[test]
    fn test_single_job_slot() {
        let slot = JobSlot::new();
        let ticket = slot.begin(Operation::Install).unwrap();
        assert_eq!(
            slot.active(),
            Some((ticket.id(), Operation::Install, JobState::Pending))
        );
        ticket.set_state(JobState::Downloading);
        assert_eq!(slot.active().map(|(_, _, s)| s), Some(JobState::Downloading));

        let err = slot.begin(Operation::Uninstall).unwrap_err();
        assert!(matches!(err, Error::JobInProgress(id) if id == ticket.id()));

        assert_eq!(slot.cancel(), Some(ticket.id()));
        assert!(ticket.token().is_cancelled());

        let first = ticket.id();
        drop(ticket);
        assert_eq!(slot.active(), None);
        assert_eq!(slot.cancel(), None);
        let next = slot.begin(Operation::DownloadOnly).unwrap();
        assert_ne!(next.id(), first);
        assert!(!next.token().is_cancelled());
    }

    #[test]
    fn test_terminal_status_is_final() {
        let (reporter, mut rx) = ChannelReporter::new();
        let bus = ProgressBus::new(JobId(1), Arc::new(reporter), CancellationToken::new());
        let board = StatusBoard::new(bus, ["pinitd", "mabl"]);

        assert!(board.set("pinitd", RepoStatus::Downloaded));
        assert!(board.set("pinitd", RepoStatus::Done));
        assert!(!board.set("pinitd", RepoStatus::Cancelled));
        board.cancel_remaining();

        let snapshot = board.snapshot();
        assert_eq!(snapshot["pinitd"], RepoStatus::Done);
        assert_eq!(snapshot["mabl"], RepoStatus::Cancelled);

        let messages: Vec<String> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|e| e.message)
            .collect();
        assert_eq!(
            messages,
            vec!["pinitd: downloaded", "pinitd: done", "mabl: cancelled"]
        );
    }

    #[test]
    fn test_dependency_levels() {
        let repos = vec![
            repo("pinitd", &[]),
            repo("sdk", &["pinitd"]),
            repo("mabl", &["sdk"]),
            repo("tools", &[]),
        ];
        assert_eq!(
            names(&dependency_levels(&repos)),
            vec![vec!["pinitd", "tools"], vec!["sdk"], vec!["mabl"]]
        );
    }

    #[test]
    fn test_dependencies_outside_selection_are_ignored() {
        let repos = vec![repo("mabl", &["sdk"])];
        assert_eq!(names(&dependency_levels(&repos)), vec![vec!["mabl"]]);
    }
}
