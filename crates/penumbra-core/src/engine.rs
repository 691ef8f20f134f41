//! The installation engine: the public entry point tying the registry,
//! credential store, device sessions, cache and executor together.
//!
//! A job runs in phases:
//!
//! 1. claim the job slot (`JobInProgress` if another job holds it)
//! 2. acquire the device session (install and uninstall only)
//! 3. resolve releases and download artifacts into the cache
//! 4. run global setup, then repositories level by level in dependency order
//! 5. reboot when a finished repository asks for it
//!
//! Per-repository failures are recorded on the status board and never stop
//! sibling repositories.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use futures::future::join_all;
use penumbra_schema::{
    ArtifactReference, Catalog, ConnectionState, CredentialConfig, DeviceInfo, InstalledPackage,
    JobId, JobState, JobSummary, Operation, RepoStatus, Repository, RepositoryDescriptor,
};
use reqwest::Client;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info};

use crate::bus::ProgressBus;
use crate::credentials::CredentialStore;
use crate::device::{DeviceSession, DeviceSessionManager, Transport};
use crate::error::{Error, Result};
use crate::executor::{Executor, ExecutorOptions};
use crate::github::{self, ReleaseHost};
use crate::io::cache::ArtifactCache;
use crate::io::download::DownloadError;
use crate::job::{JobSlot, JobTicket, StatusBoard, dependency_levels};
use crate::paths::Layout;
use crate::pattern::PatternSet;
use crate::registry::{RepositoryRegistry, ResolvedRelease};
use crate::reporter::Reporter;

/// Concurrent artifact downloads per job.
const DOWNLOAD_CONCURRENCY: usize = 4;

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub layout: Layout,
    pub catalog: Catalog,
    pub api_base: String,
    pub raw_base: String,
    pub executor: ExecutorOptions,
}

impl EngineOptions {
    pub fn new(layout: Layout, catalog: Catalog) -> Self {
        Self {
            layout,
            catalog,
            api_base: github::API_BASE.to_string(),
            raw_base: github::RAW_BASE.to_string(),
            executor: ExecutorOptions::default(),
        }
    }

    /// Point release lookups and raw downloads at another host.
    pub fn with_base_urls(mut self, api_base: impl Into<String>, raw_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self.raw_base = raw_base.into();
        self
    }
}

#[derive(Debug)]
pub struct InstallationEngine {
    layout: Layout,
    registry: RepositoryRegistry,
    credentials: Arc<CredentialStore>,
    sessions: DeviceSessionManager,
    cache: Arc<ArtifactCache>,
    client: Client,
    api_base: String,
    raw_base: String,
    executor_options: ExecutorOptions,
    jobs: Arc<JobSlot>,
    last_summary: Mutex<Option<JobSummary>>,
}

impl InstallationEngine {
    pub async fn open(options: EngineOptions, transport: Arc<dyn Transport>) -> Result<Self> {
        let EngineOptions {
            layout,
            catalog,
            api_base,
            raw_base,
            executor,
        } = options;
        catalog.validate()?;

        let client = github::build_client()?;
        let credentials = Arc::new(CredentialStore::open(&layout));
        let sessions = DeviceSessionManager::new(transport, Arc::clone(&credentials), client.clone());
        let cache = Arc::new(ArtifactCache::open(layout.cache_dir()).await?);
        debug!(root = %layout.root().display(), catalog = %catalog.name, "engine ready");

        Ok(Self {
            layout,
            registry: RepositoryRegistry::new(catalog),
            credentials,
            sessions,
            cache,
            client,
            api_base,
            raw_base,
            executor_options: executor,
            jobs: JobSlot::new(),
            last_summary: Mutex::new(None),
        })
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn registry(&self) -> &RepositoryRegistry {
        &self.registry
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    pub fn cache(&self) -> &ArtifactCache {
        &self.cache
    }

    // ---- queries -------------------------------------------------------

    pub fn get_available_repositories(&self) -> Vec<RepositoryDescriptor> {
        self.registry.list_available()
    }

    /// Probe the device. Never fails; problems are reported in the result.
    pub async fn check_device_connection(&self) -> DeviceInfo {
        self.sessions.probe().await
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.sessions.state()
    }

    /// Bundle packages present on the device with their `versionName`.
    pub async fn list_installed_packages(&self) -> Result<Vec<InstalledPackage>> {
        let session = self.sessions.acquire().await?;
        let patterns = PatternSet::new(&self.registry.catalog().package_patterns())?;

        let mut names: Vec<String> = session
            .list_packages()
            .await?
            .into_iter()
            .filter(|p| patterns.matches(p))
            .collect();
        names.sort();

        let mut packages = Vec::with_capacity(names.len());
        for name in names {
            let version = session.package_version(&name).await?;
            packages.push(InstalledPackage { name, version });
        }
        Ok(packages)
    }

    /// Save a snapshot of the device log, by default under the layout's
    /// log directory.
    pub async fn dump_logs(&self, dir: Option<&Path>) -> Result<PathBuf> {
        let session = self.sessions.acquire().await?;
        let dir = dir.map_or_else(|| self.layout.log_dir(), Path::to_path_buf);
        crate::logs::dump_logs(&session, &dir).await
    }

    // ---- credentials ---------------------------------------------------

    pub fn load_credentials(&self) -> CredentialConfig {
        self.credentials.load()
    }

    pub fn set_key_from_local_file(&self, path: &Path) -> Result<CredentialConfig> {
        self.credentials.set_key_from_local_file(path)
    }

    pub fn set_key_from_bytes(&self, filename: &str, bytes: &[u8]) -> Result<CredentialConfig> {
        self.credentials.set_key_from_bytes(filename, bytes)
    }

    pub fn set_key_remote(&self, url: &str) -> Result<CredentialConfig> {
        self.credentials.set_key_remote(url)
    }

    pub fn clear_key(&self) -> Result<CredentialConfig> {
        self.credentials.clear_key()
    }

    pub fn set_download_token(&self, token: Option<&str>) -> Result<CredentialConfig> {
        self.credentials.set_download_token(token)
    }

    // ---- jobs ----------------------------------------------------------

    /// Install `names` (empty means every repository).
    pub async fn install_repositories(
        &self,
        names: &[String],
        reporter: Arc<dyn Reporter>,
    ) -> Result<JobSummary> {
        self.run_job(Operation::Install, names, Arc::clone(&self.cache), reporter)
            .await
    }

    pub async fn uninstall_repositories(
        &self,
        names: &[String],
        reporter: Arc<dyn Reporter>,
    ) -> Result<JobSummary> {
        self.run_job(Operation::Uninstall, names, Arc::clone(&self.cache), reporter)
            .await
    }

    /// Populate a cache without touching the device. `cache_dir` defaults to
    /// the engine's own cache.
    pub async fn download_only(
        &self,
        names: &[String],
        cache_dir: Option<&Path>,
        reporter: Arc<dyn Reporter>,
    ) -> Result<JobSummary> {
        let cache = match cache_dir {
            Some(dir) if dir != self.cache.root() => Arc::new(ArtifactCache::open(dir).await?),
            _ => Arc::clone(&self.cache),
        };
        self.run_job(Operation::DownloadOnly, names, cache, reporter)
            .await
    }

    /// Ask the active job to stop. Returns whether a job was running.
    pub fn cancel_installation(&self) -> bool {
        match self.jobs.cancel() {
            Some(id) => {
                info!(job = %id, "cancellation requested");
                true
            }
            None => false,
        }
    }

    pub fn active_job(&self) -> Option<(JobId, Operation, JobState)> {
        self.jobs.active()
    }

    /// Result of the most recently finished job.
    pub fn last_summary(&self) -> Option<JobSummary> {
        self.last_summary
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn run_job(
        &self,
        operation: Operation,
        names: &[String],
        cache: Arc<ArtifactCache>,
        reporter: Arc<dyn Reporter>,
    ) -> Result<JobSummary> {
        let ticket = self.jobs.begin(operation)?;
        let repos = self.registry.select(names)?;
        let bus = ProgressBus::new(ticket.id(), reporter, ticket.token().clone());
        let board = Arc::new(StatusBoard::new(
            bus.clone(),
            repos.iter().map(|r| r.name.as_str()),
        ));

        let listed: Vec<&str> = repos.iter().map(|r| r.name.as_str()).collect();
        bus.info(None, format!("Starting {operation}: {}", listed.join(", ")));

        let rebooted = match self.drive(operation, &ticket, &repos, &cache, &bus, &board).await {
            Ok(rebooted) => rebooted,
            Err(_) if bus.is_cancelled() => false,
            Err(e) => {
                bus.error(None, e.to_string());
                board.fail_remaining(&e);
                false
            }
        };
        if bus.is_cancelled() {
            board.cancel_remaining();
        } else {
            board.fail_remaining(&Error::install_failed(
                operation.to_string(),
                "job ended before this repository finished",
            ));
        }

        let repositories = board.snapshot();
        let state = if bus.is_cancelled() {
            JobState::Cancelled
        } else if !repositories.is_empty() && repositories.values().all(RepoStatus::is_failed) {
            JobState::Failed
        } else {
            JobState::Completed
        };
        ticket.set_state(state);
        match state {
            JobState::Completed => bus.info(None, format!("Job {state}")),
            JobState::Cancelled => bus.warn(None, format!("Job {state}")),
            _ => bus.error(None, format!("Job {state}")),
        }

        let summary = JobSummary {
            job_id: ticket.id(),
            operation,
            state,
            repositories,
            rebooted,
        };
        *self
            .last_summary
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(summary.clone());
        Ok(summary)
    }

    /// Run the job's phases. Returns whether the device was rebooted.
    async fn drive(
        &self,
        operation: Operation,
        ticket: &JobTicket,
        repos: &[Repository],
        cache: &Arc<ArtifactCache>,
        bus: &ProgressBus,
        board: &Arc<StatusBoard>,
    ) -> Result<bool> {
        let session = if operation.needs_device() {
            let session = tokio::select! {
                biased;
                () = bus.token().cancelled() => return Err(Error::Cancelled),
                session = self.sessions.acquire() => session?,
            };
            bus.info(None, format!("Connected to {}", session.serial()));
            Some(session.with_cancel(bus.token().clone()))
        } else {
            None
        };

        if operation == Operation::Uninstall {
            let Some(session) = session else {
                return Ok(false);
            };
            ticket.set_state(JobState::Installing);
            let executor = self.executor(session, bus, board);
            let mut levels = dependency_levels(repos);
            levels.reverse();
            self.run_levels(levels, Arc::default(), &executor, operation, bus, board)
                .await;
            return Ok(false);
        }

        ticket.set_state(JobState::Resolving);
        let host = self.release_host();
        let resolved = self.resolve(&host, repos, bus, board).await?;

        ticket.set_state(JobState::Downloading);
        let artifacts = self.download(&host, cache, resolved, bus, board).await?;

        let Some(session) = session else {
            for repo in repos {
                if artifacts.contains_key(&repo.name) {
                    board.set(&repo.name, RepoStatus::Done);
                }
            }
            return Ok(false);
        };

        ticket.set_state(JobState::Installing);
        let executor = self.executor(session, bus, board);
        executor
            .run_global_setup(&self.registry.catalog().global_setup)
            .await?;

        let installable: Vec<Repository> = repos
            .iter()
            .filter(|r| artifacts.contains_key(&r.name))
            .cloned()
            .collect();
        self.run_levels(
            dependency_levels(&installable),
            Arc::new(artifacts),
            &executor,
            operation,
            bus,
            board,
        )
        .await;

        bus.checkpoint()?;
        let reboot = repos
            .iter()
            .any(|r| r.reboot_after_completion && board.get(&r.name).is_some_and(|s| s.is_done()));
        if reboot {
            bus.info(None, "Rebooting device");
            executor.session().reboot().await?;
        }
        Ok(reboot)
    }

    fn executor(&self, session: DeviceSession, bus: &ProgressBus, board: &Arc<StatusBoard>) -> Executor {
        Executor::new(
            session,
            bus.clone(),
            Arc::clone(board),
            self.executor_options.clone(),
        )
    }

    fn release_host(&self) -> ReleaseHost {
        ReleaseHost::new(self.client.clone(), self.credentials.download_token())
            .with_base_urls(&self.api_base, &self.raw_base)
    }

    /// Look up every repository's release concurrently. Repositories that
    /// cannot be resolved are marked failed and left out.
    async fn resolve(
        &self,
        host: &ReleaseHost,
        repos: &[Repository],
        bus: &ProgressBus,
        board: &StatusBoard,
    ) -> Result<Vec<ResolvedRelease>> {
        let lookups = repos.iter().map(|repo| async move {
            (repo, self.registry.resolve_artifacts(host, repo).await)
        });
        let results = tokio::select! {
            biased;
            () = bus.token().cancelled() => return Err(Error::Cancelled),
            results = join_all(lookups) => results,
        };

        let mut resolved = Vec::with_capacity(results.len());
        for (repo, result) in results {
            match result {
                Ok(release) => {
                    bus.info(
                        Some(&repo.name),
                        format!(
                            "Resolved {} ({} files)",
                            release.version,
                            release.artifacts.len()
                        ),
                    );
                    resolved.push(release);
                }
                Err(e) => {
                    board.set(&repo.name, e.as_status());
                }
            }
        }
        Ok(resolved)
    }

    /// Fetch every resolved artifact through `cache`. Returns the artifacts
    /// of each fully downloaded repository, with `cache_path` filled in.
    async fn download(
        &self,
        host: &ReleaseHost,
        cache: &Arc<ArtifactCache>,
        resolved: Vec<ResolvedRelease>,
        bus: &ProgressBus,
        board: &StatusBoard,
    ) -> Result<HashMap<String, Vec<ArtifactReference>>> {
        let semaphore = Arc::new(Semaphore::new(DOWNLOAD_CONCURRENCY));
        let mut set: JoinSet<(String, usize, Result<PathBuf, DownloadError>)> = JoinSet::new();
        let mut paths: HashMap<String, Vec<Option<PathBuf>>> = HashMap::new();

        for release in &resolved {
            paths.insert(release.repository.clone(), vec![None; release.artifacts.len()]);
            for (index, artifact) in release.artifacts.iter().enumerate() {
                let cache = Arc::clone(cache);
                let host = host.clone();
                let bus = bus.clone();
                let semaphore = Arc::clone(&semaphore);
                let artifact = artifact.clone();

                // Tasks are drained rather than aborted on cancellation: each
                // download observes the token and removes its partial file.
                set.spawn(async move {
                    let result = match semaphore.acquire_owned().await {
                        Ok(_permit) => cache.fetch(&host, &artifact, &bus).await,
                        Err(_) => Err(DownloadError::Cancelled),
                    };
                    (artifact.repository, index, result)
                });
            }
        }

        let mut errors: HashMap<String, DownloadError> = HashMap::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((repo, index, Ok(path))) => {
                    if let Some(slot) = paths.get_mut(&repo).and_then(|v| v.get_mut(index)) {
                        *slot = Some(path);
                    }
                }
                Ok((repo, _, Err(e))) => {
                    errors.entry(repo).or_insert(e);
                }
                Err(e) => bus.error(None, format!("Internal error: {e}")),
            }
        }
        bus.checkpoint()?;

        let mut ready = HashMap::new();
        for mut release in resolved {
            let name = release.repository.clone();
            if let Some(err) = errors.remove(&name) {
                board.set(&name, Error::from(err).as_status());
                continue;
            }
            let slots = paths.remove(&name).unwrap_or_default();
            if slots.iter().any(Option::is_none) {
                board.set(
                    &name,
                    Error::DownloadFailed("download did not complete".to_string()).as_status(),
                );
                continue;
            }
            for (artifact, path) in release.artifacts.iter_mut().zip(slots) {
                artifact.cache_path = path;
            }
            board.set(&name, RepoStatus::Downloaded);
            ready.insert(name, release.artifacts);
        }
        Ok(ready)
    }

    /// Run each level on the bounded pool, one level after another.
    async fn run_levels(
        &self,
        levels: Vec<Vec<Repository>>,
        artifacts: Arc<HashMap<String, Vec<ArtifactReference>>>,
        executor: &Executor,
        operation: Operation,
        bus: &ProgressBus,
        board: &Arc<StatusBoard>,
    ) {
        let semaphore = Arc::new(Semaphore::new(self.executor_options.workers.max(1)));

        for level in levels {
            if bus.is_cancelled() {
                break;
            }
            let mut set = JoinSet::new();
            for repo in level {
                if board.get(&repo.name).is_some_and(|s| s.is_terminal()) {
                    continue;
                }
                if operation == Operation::Install
                    && let Some(dep) = repo
                        .depends_on
                        .iter()
                        .find(|d| board.get(d).is_some_and(|s| !s.is_done()))
                {
                    let err = Error::install_failed(
                        repo.name.clone(),
                        format!("dependency '{dep}' did not complete"),
                    );
                    board.set(&repo.name, err.as_status());
                    continue;
                }

                let executor = executor.clone();
                let semaphore = Arc::clone(&semaphore);
                let artifacts = Arc::clone(&artifacts);
                set.spawn(async move {
                    let Ok(_permit) = semaphore.acquire_owned().await else {
                        return;
                    };
                    if operation == Operation::Uninstall {
                        executor.uninstall(&repo).await;
                    } else {
                        let files = artifacts
                            .get(&repo.name)
                            .map(Vec::as_slice)
                            .unwrap_or_default();
                        executor.install(&repo, files).await;
                    }
                });
            }
            while let Some(joined) = set.join_next().await {
                if let Err(e) = joined {
                    bus.error(None, format!("Internal error: {e}"));
                }
            }
        }
    }
}
