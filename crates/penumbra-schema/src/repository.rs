//! Repository descriptors and the artifacts resolved for them.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::hash::Sha256Digest;

/// Public description of an installable repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryDescriptor {
    /// Unique name within the catalog (e.g. "pinitd").
    pub name: String,
    /// Owner on the artifact host.
    pub owner: String,
    /// Repository name on the artifact host.
    pub repo: String,
    /// Optional one-line description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// How an artifact was located on the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ArtifactKind {
    /// An asset attached to a release.
    ReleaseAsset,
    /// A file from the source tree at the release tag.
    RepoFile {
        /// Path of the file inside the repository.
        path: String,
    },
}

/// One downloadable artifact of a resolved release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactReference {
    /// Name of the owning repository.
    pub repository: String,
    /// Release tag the artifact belongs to.
    pub version: String,
    /// File name used for the cache entry.
    pub filename: String,
    /// Download URL.
    pub url: String,
    /// Digest published by the host, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_sha256: Option<Sha256Digest>,
    /// Size in bytes published by the host, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_size: Option<u64>,
    /// Release asset or source-tree file.
    pub kind: ArtifactKind,
    /// Set once the artifact is present in the cache.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_path: Option<PathBuf>,
}

impl ArtifactReference {
    /// Cache key `(repository, version, filename)`.
    pub fn cache_key(&self) -> (&str, &str, &str) {
        (&self.repository, &self.version, &self.filename)
    }

    /// Whether this artifact is an Android package.
    pub fn is_apk(&self) -> bool {
        std::path::Path::new(&self.filename)
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("apk"))
    }
}
