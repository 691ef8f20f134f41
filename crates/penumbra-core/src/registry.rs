//! Repository registry: the catalog's repositories and their release artifacts.

use std::collections::HashSet;
use std::sync::Arc;

use penumbra_schema::{ArtifactKind, ArtifactReference, Catalog, Repository, RepositoryDescriptor, Sha256Digest};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::github::{Asset, ReleaseHost};
use crate::paths::filename_from_url;
use crate::pattern::PatternSet;

/// A repository pinned to a concrete release.
#[derive(Debug, Clone)]
pub struct ResolvedRelease {
    pub repository: String,
    pub version: String,
    pub artifacts: Vec<ArtifactReference>,
}

#[derive(Debug, Clone)]
pub struct RepositoryRegistry {
    catalog: Arc<Catalog>,
}

impl RepositoryRegistry {
    pub fn new(catalog: Catalog) -> Self {
        Self {
            catalog: Arc::new(catalog),
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Every repository, in declaration order.
    pub fn list_available(&self) -> Vec<RepositoryDescriptor> {
        self.catalog.descriptors()
    }

    pub fn get(&self, name: &str) -> Result<&Repository> {
        self.catalog
            .repository(name)
            .ok_or_else(|| Error::NotFound(format!("repository '{name}'")))
    }

    /// Resolve a caller selection. Empty means every repository; the result
    /// is always in declaration order without duplicates.
    pub fn select(&self, names: &[String]) -> Result<Vec<Repository>> {
        if names.is_empty() {
            return Ok(self.catalog.repositories.clone());
        }
        let wanted: HashSet<&str> = names.iter().map(String::as_str).collect();
        if let Some(unknown) = wanted.iter().find(|n| self.catalog.repository(n).is_none()) {
            return Err(Error::NotFound(format!("repository '{unknown}'")));
        }
        Ok(self
            .catalog
            .repositories
            .iter()
            .filter(|r| wanted.contains(r.name.as_str()))
            .cloned()
            .collect())
    }

    /// Look up the release for `repo` and list the artifacts to fetch.
    pub async fn resolve_artifacts(
        &self,
        host: &ReleaseHost,
        repo: &Repository,
    ) -> Result<ResolvedRelease> {
        let release = if repo.tracks_latest() {
            host.latest_release(&repo.owner, &repo.repo).await?
        } else {
            host.release_by_tag(&repo.owner, &repo.repo, &repo.version)
                .await?
        };
        let version = release.tag_name.clone();
        debug!(repo = %repo.name, %version, "resolved release");

        let mut artifacts = Vec::new();
        if !repo.release_assets.is_empty() {
            let include = PatternSet::new(&repo.release_assets)?;
            let exclude = PatternSet::new(&repo.apk_exclude_patterns())?;

            for asset in &release.assets {
                if include.matches(&asset.name) && !exclude.matches(&asset.name) {
                    artifacts.push(asset_reference(&repo.name, &version, asset));
                }
            }
            if artifacts.is_empty() {
                return Err(Error::NotFound(format!(
                    "no assets of {}/{}@{version} match {:?}",
                    repo.owner, repo.repo, repo.release_assets
                )));
            }
        }

        for path in &repo.repo_files {
            artifacts.extend(self.resolve_repo_file(host, repo, &version, path).await?);
        }

        Ok(ResolvedRelease {
            repository: repo.name.clone(),
            version,
            artifacts,
        })
    }

    async fn resolve_repo_file(
        &self,
        host: &ReleaseHost,
        repo: &Repository,
        version: &str,
        path: &str,
    ) -> Result<Vec<ArtifactReference>> {
        let reference = |path: &str| ArtifactReference {
            repository: repo.name.clone(),
            version: version.to_string(),
            filename: filename_from_url(path).to_string(),
            url: host.raw_url(&repo.owner, &repo.repo, version, path),
            expected_sha256: None,
            expected_size: None,
            kind: ArtifactKind::RepoFile {
                path: path.to_string(),
            },
            cache_path: None,
        };

        if !path.contains('*') {
            return Ok(vec![reference(path)]);
        }

        let (dir, file_pattern) = path.rsplit_once('/').unwrap_or(("", path));
        if dir.contains('*') {
            return Err(Error::InvalidInput(format!(
                "repo file '{path}': globs are only supported in the file name"
            )));
        }
        let pattern = PatternSet::new(&[file_pattern])?;
        let entries = host
            .list_directory(&repo.owner, &repo.repo, version, dir)
            .await?;

        let matched: Vec<_> = entries
            .iter()
            .filter(|e| e.kind == "file" && pattern.matches(&e.name))
            .map(|e| reference(&e.path))
            .collect();
        if matched.is_empty() {
            warn!(repo = %repo.name, path, "repo file pattern matched nothing");
        }
        Ok(matched)
    }
}

fn asset_reference(repository: &str, version: &str, asset: &Asset) -> ArtifactReference {
    let expected_sha256 = asset.digest.as_deref().and_then(|d| match Sha256Digest::new(d) {
        Ok(digest) => Some(digest),
        Err(e) => {
            // Only sha256 digests are verifiable here; anything else is ignored.
            debug!(asset = %asset.name, "ignoring digest: {e}");
            None
        }
    });

    ArtifactReference {
        repository: repository.to_string(),
        version: version.to_string(),
        filename: asset.name.clone(),
        url: asset.browser_download_url.clone(),
        expected_sha256,
        expected_size: asset.size,
        kind: ArtifactKind::ReleaseAsset,
        cache_path: None,
    }
}
