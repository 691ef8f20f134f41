//! Artifact cache keyed by `(repository, version, filename)`.
//!
//! ```text
//! <root>/
//! ├── .partial/                 # in-flight downloads, swept on open
//! └── <repository>/<version>/<filename>
//! ```
//!
//! A file under `<repository>/<version>/` is always complete: downloads are
//! written under `.partial/` on the same filesystem and renamed into place
//! only after verification. Concurrent fetches of one artifact share a single
//! download; the first caller becomes the leader and everyone else waits for
//! its result.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use penumbra_schema::ArtifactReference;
use rand::Rng;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::bus::ProgressBus;
use crate::github::ReleaseHost;
use crate::io::download::{DownloadError, DownloadRequest};
use crate::paths::sanitize_component;

const PARTIAL_DIR: &str = ".partial";

type FetchResult = Result<PathBuf, DownloadError>;
type CacheKey = (String, String, String);

#[derive(Debug)]
pub struct ArtifactCache {
    root: PathBuf,
    inflight: Mutex<HashMap<CacheKey, broadcast::Sender<FetchResult>>>,
    downloads: AtomicU64,
}

enum Role {
    Leader(broadcast::Sender<FetchResult>),
    Follower(broadcast::Receiver<FetchResult>),
}

/// Removes the in-flight entry even if the leader's future is dropped.
struct InflightGuard<'a> {
    cache: &'a ArtifactCache,
    key: CacheKey,
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        self.cache
            .inflight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

impl ArtifactCache {
    /// Open (creating if needed) a cache at `root` and discard leftovers of
    /// interrupted downloads.
    pub async fn open(root: impl Into<PathBuf>) -> std::io::Result<Self> {
        let root = root.into();
        let partial = root.join(PARTIAL_DIR);
        tokio::fs::create_dir_all(&partial).await?;

        let mut entries = tokio::fs::read_dir(&partial).await?;
        let mut swept = 0;
        while let Some(entry) = entries.next_entry().await? {
            if let Err(e) = tokio::fs::remove_file(entry.path()).await {
                warn!(path = %entry.path().display(), "cannot remove stale partial: {e}");
            } else {
                swept += 1;
            }
        }
        if swept > 0 {
            debug!(swept, "removed stale partial downloads");
        }

        Ok(Self {
            root,
            inflight: Mutex::new(HashMap::new()),
            downloads: AtomicU64::new(0),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Number of network downloads this cache has started.
    pub fn downloads_started(&self) -> u64 {
        self.downloads.load(Ordering::Relaxed)
    }

    pub fn entry_path(&self, artifact: &ArtifactReference) -> PathBuf {
        self.repository_dir(&artifact.repository)
            .join(sanitize_component(&artifact.version))
            .join(sanitize_component(&artifact.filename))
    }

    pub fn repository_dir(&self, repository: &str) -> PathBuf {
        self.root.join(sanitize_component(repository))
    }

    /// Path of a complete entry, if present.
    pub async fn lookup(&self, artifact: &ArtifactReference) -> Option<PathBuf> {
        let path = self.entry_path(artifact);
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => match artifact.expected_size {
                Some(size) if size != meta.len() => {
                    warn!(path = %path.display(), "cached entry has wrong size, refetching");
                    None
                }
                _ => Some(path),
            },
            _ => None,
        }
    }

    /// Return the cached entry, downloading it first on a miss.
    pub async fn fetch(
        &self,
        host: &ReleaseHost,
        artifact: &ArtifactReference,
        bus: &ProgressBus,
    ) -> FetchResult {
        if let Some(path) = self.lookup(artifact).await {
            debug!(file = %artifact.filename, "cache hit");
            return Ok(path);
        }

        let key = (
            artifact.repository.clone(),
            artifact.version.clone(),
            artifact.filename.clone(),
        );
        let role = {
            let mut inflight = self.inflight.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(tx) = inflight.get(&key) {
                Role::Follower(tx.subscribe())
            } else {
                let (tx, _) = broadcast::channel(1);
                inflight.insert(key.clone(), tx.clone());
                Role::Leader(tx)
            }
        };

        match role {
            Role::Follower(mut rx) => {
                debug!(file = %artifact.filename, "joining in-flight download");
                tokio::select! {
                    biased;
                    () = bus.token().cancelled() => Err(DownloadError::Cancelled),
                    result = rx.recv() => result.unwrap_or_else(|_| {
                        Err(DownloadError::Failed(format!(
                            "in-flight download of {} was abandoned",
                            artifact.filename
                        )))
                    }),
                }
            }
            Role::Leader(tx) => {
                let guard = InflightGuard { cache: self, key };
                // Another leader may have finished between our lookup and
                // taking the slot.
                let result = match self.lookup(artifact).await {
                    Some(path) => Ok(path),
                    None => self.download(host, artifact, bus).await,
                };
                drop(guard);
                let _ = tx.send(result.clone());
                result
            }
        }
    }

    async fn download(
        &self,
        host: &ReleaseHost,
        artifact: &ArtifactReference,
        bus: &ProgressBus,
    ) -> FetchResult {
        self.downloads.fetch_add(1, Ordering::Relaxed);
        let dest = self.entry_path(artifact);
        let partial = self.root.join(PARTIAL_DIR).join(format!(
            "{}-{}.{:016x}.part",
            sanitize_component(&artifact.repository),
            sanitize_component(&artifact.filename),
            rand::rng().random::<u64>()
        ));

        let outcome = DownloadRequest::new(host, artifact, &partial, bus)
            .execute()
            .await;

        let finish = async {
            let digest = outcome?;
            if let Some(parent) = dest.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::rename(&partial, &dest).await?;
            debug!(file = %artifact.filename, sha256 = %digest, "cached");
            Ok::<_, DownloadError>(dest.clone())
        };

        let result = finish.await;
        if result.is_err() {
            tokio::fs::remove_file(&partial).await.ok();
        }
        result
    }
}
