//! Credential store.
//!
//! Holds the device signing-key source and the optional artifact-host token.
//! The record lives in `credentials.json`; key files are copied into a
//! managed `keys/` directory so the original can be moved or deleted.
//!
//! Every setter validates, writes the new record (temp file + rename) and
//! only then swaps the in-memory snapshot, all under one write lock. A
//! concurrent [`CredentialStore::load`] therefore sees either the old or the
//! new record, never a mix.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use penumbra_schema::{CredentialConfig, KeySource};
use reqwest::Url;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::paths::{Layout, sanitize_component};

#[derive(Debug)]
pub struct CredentialStore {
    file: PathBuf,
    keys_dir: PathBuf,
    current: RwLock<CredentialConfig>,
}

impl CredentialStore {
    /// Open the store. Never fails: a missing or unreadable record yields
    /// the default (no key, no token).
    pub fn open(layout: &Layout) -> Self {
        let file = layout.credentials_file();
        let keys_dir = layout.keys_dir();
        let current = read_record(&file);
        Self {
            file,
            keys_dir,
            current: RwLock::new(current),
        }
    }

    /// Snapshot of the current record.
    pub fn load(&self) -> CredentialConfig {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn download_token(&self) -> Option<String> {
        self.load().download_token
    }

    /// Copy a key file into managed storage and make it the active source.
    pub fn set_key_from_local_file(&self, path: &Path) -> Result<CredentialConfig> {
        let meta = fs::metadata(path).map_err(|e| {
            Error::InvalidInput(format!("cannot read key file {}: {e}", path.display()))
        })?;
        if !meta.is_file() {
            return Err(Error::InvalidInput(format!(
                "{} is not a file",
                path.display()
            )));
        }
        let bytes = fs::read(path).map_err(|e| {
            Error::InvalidInput(format!("cannot read key file {}: {e}", path.display()))
        })?;
        let filename = path
            .file_name()
            .map_or_else(|| "adbkey".to_string(), |n| n.to_string_lossy().into_owned());

        self.set_key_from_bytes(&filename, &bytes)
    }

    /// Same as [`Self::set_key_from_local_file`] for in-memory content.
    pub fn set_key_from_bytes(&self, filename: &str, bytes: &[u8]) -> Result<CredentialConfig> {
        if bytes.is_empty() {
            return Err(Error::InvalidInput("key content is empty".to_string()));
        }
        let original = filename.trim();
        let original = if original.is_empty() { "adbkey" } else { original };

        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);

        fs::create_dir_all(&self.keys_dir)?;
        let stored_name = format!(
            "adb_key_{}_{}",
            chrono::Utc::now().format("%Y%m%d%H%M%S%3f"),
            sanitize_component(original)
        );
        let stored_path = self.keys_dir.join(stored_name);
        write_atomic(&self.keys_dir, &stored_path, bytes)?;

        let mut next = guard.clone();
        let previous = std::mem::replace(
            &mut next.key_source,
            KeySource::LocalCopy {
                stored_path: stored_path.clone(),
                original_filename: original.to_string(),
            },
        );

        if let Err(e) = self.persist(&next) {
            fs::remove_file(&stored_path).ok();
            return Err(e);
        }
        *guard = next.clone();
        drop(guard);

        self.discard_key_copy(&previous, Some(&stored_path));
        debug!(path = %stored_path.display(), "stored signing key");
        Ok(next)
    }

    /// Switch to a remote signing server.
    pub fn set_key_remote(&self, url: &str) -> Result<CredentialConfig> {
        let url = validate_signer_url(url)?;
        self.replace_key(KeySource::RemoteServer { url })
    }

    pub fn clear_key(&self) -> Result<CredentialConfig> {
        self.replace_key(KeySource::Unset)
    }

    /// Store or clear the artifact-host token. Whitespace-only clears it.
    /// The token is not checked against the host.
    pub fn set_download_token(&self, token: Option<&str>) -> Result<CredentialConfig> {
        let token = token
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string);

        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = guard.clone();
        next.download_token = token;
        self.persist(&next)?;
        *guard = next.clone();
        Ok(next)
    }

    fn replace_key(&self, source: KeySource) -> Result<CredentialConfig> {
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = guard.clone();
        let previous = std::mem::replace(&mut next.key_source, source);
        self.persist(&next)?;
        *guard = next.clone();
        drop(guard);

        self.discard_key_copy(&previous, None);
        Ok(next)
    }

    fn persist(&self, config: &CredentialConfig) -> Result<()> {
        let dir = self
            .file
            .parent()
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        fs::create_dir_all(&dir)?;
        let json = serde_json::to_vec_pretty(config)?;
        write_atomic(&dir, &self.file, &json)
    }

    /// Remove a superseded managed key copy. Files outside `keys/` are
    /// never touched.
    fn discard_key_copy(&self, previous: &KeySource, keep: Option<&Path>) {
        if let KeySource::LocalCopy { stored_path, .. } = previous
            && stored_path.starts_with(&self.keys_dir)
            && Some(stored_path.as_path()) != keep
            && let Err(e) = fs::remove_file(stored_path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(path = %stored_path.display(), "failed to remove old key copy: {e}");
        }
    }
}

fn read_record(file: &Path) -> CredentialConfig {
    let raw = match fs::read(file) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return CredentialConfig::default(),
        Err(e) => {
            warn!(path = %file.display(), "cannot read credentials, using defaults: {e}");
            return CredentialConfig::default();
        }
    };

    let mut config: CredentialConfig = match serde_json::from_slice(&raw) {
        Ok(config) => config,
        Err(e) => {
            warn!(path = %file.display(), "corrupt credentials, using defaults: {e}");
            return CredentialConfig::default();
        }
    };

    if let KeySource::LocalCopy { stored_path, .. } = &config.key_source
        && !stored_path.is_file()
    {
        warn!(path = %stored_path.display(), "stored key is missing, treating key as unset");
        config.key_source = KeySource::Unset;
    }
    config
}

fn write_atomic(dir: &Path, dest: &Path, bytes: &[u8]) -> Result<()> {
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(dest).map_err(|e| Error::Io(e.error))?;
    Ok(())
}

fn validate_signer_url(raw: &str) -> Result<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(Error::InvalidInput(
            "signing server URL cannot be empty".to_string(),
        ));
    }
    let url = Url::parse(raw)
        .map_err(|e| Error::InvalidInput(format!("invalid signing server URL '{raw}': {e}")))?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(Error::InvalidInput(format!(
            "signing server URL must be an absolute http(s) URL: '{raw}'"
        )));
    }
    Ok(url.to_string())
}
