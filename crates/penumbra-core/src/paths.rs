use dirs::home_dir;
use std::path::{Path, PathBuf};

/// Environment variable overriding the installer home.
pub const HOME_ENV: &str = "PENUMBRA_HOME";

/// Returns the installer home directory, or None if the user's home cannot be resolved.
pub fn try_penumbra_home() -> Option<PathBuf> {
    if let Ok(val) = std::env::var(HOME_ENV) {
        return Some(PathBuf::from(val));
    }
    home_dir().map(|h| h.join(".penumbra"))
}

/// On-disk layout rooted at the installer home (`~/.penumbra`).
///
/// ```text
/// ~/.penumbra/
/// ├── credentials.json   # key source + download token
/// ├── keys/              # managed copies of signing keys
/// ├── cache/             # artifacts by repository/version
/// └── logs/              # device log dumps
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Layout at `$PENUMBRA_HOME` or `~/.penumbra`.
    pub fn from_env() -> Option<Self> {
        try_penumbra_home().map(Self::new)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Credential record: ~/.penumbra/credentials.json
    pub fn credentials_file(&self) -> PathBuf {
        self.root.join("credentials.json")
    }

    /// Managed key copies: ~/.penumbra/keys
    pub fn keys_dir(&self) -> PathBuf {
        self.root.join("keys")
    }

    /// Artifact cache: ~/.penumbra/cache
    pub fn cache_dir(&self) -> PathBuf {
        self.root.join("cache")
    }

    /// Log dumps: ~/.penumbra/logs
    pub fn log_dir(&self) -> PathBuf {
        self.root.join("logs")
    }
}

/// Extract the filename from a URL.
pub fn filename_from_url(url: &str) -> &str {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.split('/').next_back().unwrap_or("")
}

/// Make a string safe to use as a single path component.
pub fn sanitize_component(s: &str) -> String {
    let cleaned: String = s
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' => '_',
            c => c,
        })
        .collect();
    match cleaned.as_str() {
        "" | "." | ".." => format!("_{cleaned}"),
        _ => cleaned,
    }
}
