//! Bundle catalog: the declarative description of what gets installed.
//!
//! A catalog is a TOML document listing repositories in install order, the
//! steps that put each one on the device and the steps that take it off
//! again. String fields may contain `{{ variable }}` placeholders that are
//! substituted before a job runs.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::repository::RepositoryDescriptor;

/// Errors found while validating a [`Catalog`].
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CatalogError {
    /// The catalog declares no repositories.
    #[error("Catalog must have at least one repository")]
    NoRepositories,

    /// Two repositories share a name.
    #[error("Duplicate repository name: {0}")]
    DuplicateRepository(String),

    /// A repository is missing its owner or repo field.
    #[error("Repository '{0}' must have owner and repo")]
    MissingSource(String),

    /// A repository declares nothing to download.
    #[error("Repository '{0}' must have at least one release asset or repo file")]
    NoArtifacts(String),

    /// A `depends_on` entry names an unknown repository.
    #[error("Repository '{repository}' depends on unknown repository '{dependency}'")]
    UnknownDependency {
        /// Repository declaring the dependency.
        repository: String,
        /// The unknown name.
        dependency: String,
    },

    /// Dependencies form a cycle.
    #[error("Dependency cycle involving repository '{0}'")]
    DependencyCycle(String),

    /// An optional variable has no default value.
    #[error("Optional variable '{0}' must define a default value")]
    VariableWithoutDefault(String),
}

/// Root of a catalog document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Catalog {
    /// Display name of the bundle.
    pub name: String,

    /// Variables that may be referenced as `{{ name }}`.
    #[serde(default)]
    pub variables: Vec<Variable>,

    /// Repositories in declaration order.
    pub repositories: Vec<Repository>,

    /// Steps run once before any repository during install.
    #[serde(default)]
    pub global_setup: Vec<InstallStep>,
}

/// A substitutable catalog variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variable {
    /// Placeholder name.
    pub name: String,
    /// Shown by front ends.
    #[serde(default)]
    pub description: Option<String>,
    /// Whether the caller must supply a value.
    #[serde(default)]
    pub required: bool,
    /// Value used when the caller supplies none.
    #[serde(default)]
    pub default: Option<String>,
}

fn latest() -> String {
    "latest".to_string()
}

/// One installable repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
    /// Unique name.
    pub name: String,
    /// Owner on the artifact host.
    pub owner: String,
    /// Repository name on the artifact host.
    pub repo: String,
    /// Optional one-line description.
    #[serde(default)]
    pub description: Option<String>,
    /// `"latest"` or a pinned release tag.
    #[serde(default = "latest")]
    pub version: String,
    /// Reboot the device once the install job finishes.
    #[serde(default)]
    pub reboot_after_completion: bool,
    /// Repositories that must be installed before this one.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Package-name patterns this repository owns on the device.
    #[serde(default)]
    pub packages: Vec<String>,
    /// Glob patterns selecting release assets.
    #[serde(default)]
    pub release_assets: Vec<String>,
    /// Source-tree paths fetched at the release tag. `*` globs are allowed
    /// in the final path segment.
    #[serde(default)]
    pub repo_files: Vec<String>,
    /// Steps that remove this repository from the device.
    #[serde(default)]
    pub cleanup: Vec<CleanupStep>,
    /// Steps that put this repository on the device.
    #[serde(default)]
    pub installation: Vec<InstallStep>,
}

impl Repository {
    /// Whether the repository tracks the newest release.
    pub fn tracks_latest(&self) -> bool {
        self.version == "latest"
    }

    /// APK exclude patterns declared by this repository's install steps.
    pub fn apk_exclude_patterns(&self) -> Vec<&str> {
        self.installation
            .iter()
            .filter_map(|step| match step {
                InstallStep::InstallApks {
                    exclude_patterns, ..
                } => Some(exclude_patterns.iter().map(String::as_str)),
                _ => None,
            })
            .flatten()
            .collect()
    }

    /// Public view of this repository.
    pub fn descriptor(&self) -> RepositoryDescriptor {
        RepositoryDescriptor {
            name: self.name.clone(),
            owner: self.owner.clone(),
            repo: self.repo.clone(),
            description: self.description.clone(),
        }
    }
}

/// Steps that remove a repository's footprint from the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum CleanupStep {
    /// Uninstall every package matching any pattern.
    UninstallPackages {
        /// Package-name patterns.
        patterns: Vec<String>,
    },
    /// Remove directories recursively.
    RemoveDirectories {
        /// Device paths.
        paths: Vec<String>,
    },
    /// Remove directories only when they are empty.
    RemoveDirectoriesIfEmpty {
        /// Device paths.
        paths: Vec<String>,
    },
    /// Remove individual files.
    RemoveFiles {
        /// Device paths.
        paths: Vec<String>,
    },
}

/// Steps that put a repository on the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum InstallStep {
    /// Create directories on the device.
    CreateDirectories {
        /// Device paths.
        paths: Vec<String>,
    },
    /// Install the repository's APK artifacts.
    InstallApks {
        /// Filename patterns installed first, in order; unmatched APKs follow.
        #[serde(default)]
        priority_order: Vec<String>,
        /// Log a failed APK and carry on instead of failing the repository.
        #[serde(default)]
        allow_failures: bool,
        /// Filename patterns never installed (nor downloaded).
        #[serde(default)]
        exclude_patterns: Vec<String>,
    },
    /// Push downloaded files to the device.
    PushFiles {
        /// Individual push rules.
        files: Vec<FilePush>,
    },
    /// Grant runtime permissions.
    GrantPermissions {
        /// Package/permission pairs.
        grants: Vec<PermissionGrant>,
    },
    /// Set app-op modes.
    SetAppOps {
        /// Package/op/mode triples.
        ops: Vec<AppOpGrant>,
    },
    /// Run an arbitrary shell command on the device.
    RunCommand {
        /// Shell command line.
        command: String,
        /// Log a failure instead of failing the repository.
        #[serde(default)]
        ignore_failure: bool,
    },
    /// Make an activity the home launcher.
    SetLauncher {
        /// `package/.Activity` component.
        component: String,
    },
    /// Write a text file on the device.
    CreateConfig {
        /// Device path.
        path: String,
        /// File contents.
        content: String,
        /// Leave an existing file untouched.
        #[serde(default)]
        only_if_missing: bool,
    },
}

/// A local-to-device push rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilePush {
    /// Glob over the repository's downloaded files.
    pub local: String,
    /// Device destination; a trailing `/` keeps the local file name.
    pub remote: String,
    /// Optional `chmod` mode applied after the push.
    #[serde(default)]
    pub chmod: Option<String>,
}

/// A runtime permission grant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionGrant {
    /// Target package.
    pub package: String,
    /// Permission name.
    pub permission: String,
}

/// An app-op mode assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppOpGrant {
    /// Target package.
    pub package: String,
    /// App-op name.
    pub operation: String,
    /// Mode, e.g. `allow`.
    pub mode: String,
}

impl Catalog {
    /// Checks structural invariants.
    ///
    /// # Errors
    ///
    /// Returns the first [`CatalogError`] found.
    pub fn validate(&self) -> Result<(), CatalogError> {
        for variable in &self.variables {
            if !variable.required && variable.default.is_none() {
                return Err(CatalogError::VariableWithoutDefault(variable.name.clone()));
            }
        }

        if self.repositories.is_empty() {
            return Err(CatalogError::NoRepositories);
        }

        let mut names = HashSet::new();
        for repo in &self.repositories {
            if !names.insert(repo.name.as_str()) {
                return Err(CatalogError::DuplicateRepository(repo.name.clone()));
            }
            if repo.owner.is_empty() || repo.repo.is_empty() {
                return Err(CatalogError::MissingSource(repo.name.clone()));
            }
            if repo.release_assets.is_empty() && repo.repo_files.is_empty() {
                return Err(CatalogError::NoArtifacts(repo.name.clone()));
            }
        }

        for repo in &self.repositories {
            if let Some(dep) = repo.depends_on.iter().find(|d| !names.contains(d.as_str())) {
                return Err(CatalogError::UnknownDependency {
                    repository: repo.name.clone(),
                    dependency: dep.clone(),
                });
            }
        }

        self.check_acyclic()
    }

    fn check_acyclic(&self) -> Result<(), CatalogError> {
        let mut indegree: HashMap<&str, usize> = self
            .repositories
            .iter()
            .map(|r| (r.name.as_str(), r.depends_on.len()))
            .collect();

        let mut ready: Vec<&str> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(n, _)| *n)
            .collect();
        let mut visited = 0;

        while let Some(name) = ready.pop() {
            visited += 1;
            for repo in &self.repositories {
                if repo.depends_on.iter().any(|d| d == name)
                    && let Some(d) = indegree.get_mut(repo.name.as_str())
                {
                    *d -= 1;
                    if *d == 0 {
                        ready.push(repo.name.as_str());
                    }
                }
            }
        }

        if visited == self.repositories.len() {
            return Ok(());
        }

        let stuck = self
            .repositories
            .iter()
            .find(|r| indegree.get(r.name.as_str()).is_some_and(|d| *d > 0))
            .map(|r| r.name.clone())
            .unwrap_or_default();
        Err(CatalogError::DependencyCycle(stuck))
    }

    /// Look up a repository by name.
    pub fn repository(&self, name: &str) -> Option<&Repository> {
        self.repositories.iter().find(|r| r.name == name)
    }

    /// Public descriptors in declaration order.
    pub fn descriptors(&self) -> Vec<RepositoryDescriptor> {
        self.repositories.iter().map(Repository::descriptor).collect()
    }

    /// Union of every repository's package patterns.
    pub fn package_patterns(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.repositories
            .iter()
            .flat_map(|r| r.packages.iter().map(String::as_str))
            .filter(|p| seen.insert(*p))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
name = "Test"

[[repositories]]
name = "pinitd"
owner = "PenumbraOS"
repo = "pinitd"
release_assets = ["*.apk"]

[[repositories.installation]]
type = "InstallApks"
priority_order = ["*"]
exclude_patterns = ["*debug*"]

[[repositories]]
name = "mabl"
owner = "PenumbraOS"
repo = "mabl"
depends_on = ["pinitd"]
repo_files = ["config/*.json"]
"#;

    fn parse(src: &str) -> Catalog {
        toml::from_str(src).unwrap()
    }

    #[test]
    fn test_minimal_catalog_is_valid() {
        let catalog = parse(MINIMAL);
        catalog.validate().unwrap();
        assert_eq!(catalog.repositories[0].version, "latest");
        assert!(catalog.repositories[0].tracks_latest());
        assert_eq!(
            catalog.repositories[0].apk_exclude_patterns(),
            vec!["*debug*"]
        );
        let names: Vec<_> = catalog.descriptors().into_iter().map(|d| d.name).collect();
        assert_eq!(names, ["pinitd", "mabl"]);
    }

    #[test]
    fn test_empty_catalog_rejected() {
        let catalog = parse("name = \"Test\"\nrepositories = []\n");
        assert_eq!(catalog.validate(), Err(CatalogError::NoRepositories));
    }

    #[test]
    fn test_duplicate_and_missing_artifacts_rejected() {
        let mut catalog = parse(MINIMAL);
        catalog.repositories[1].name = "pinitd".into();
        assert_eq!(
            catalog.validate(),
            Err(CatalogError::DuplicateRepository("pinitd".into()))
        );

        let mut catalog = parse(MINIMAL);
        catalog.repositories[1].repo_files.clear();
        assert_eq!(
            catalog.validate(),
            Err(CatalogError::NoArtifacts("mabl".into()))
        );
    }

    #[test]
    fn test_dependency_errors() {
        let mut catalog = parse(MINIMAL);
        catalog.repositories[1].depends_on = vec!["ghost".into()];
        assert!(matches!(
            catalog.validate(),
            Err(CatalogError::UnknownDependency { .. })
        ));

        let mut catalog = parse(MINIMAL);
        catalog.repositories[0].depends_on = vec!["mabl".into()];
        assert!(matches!(
            catalog.validate(),
            Err(CatalogError::DependencyCycle(_))
        ));
    }

    #[test]
    fn test_optional_variable_needs_default() {
        let mut catalog = parse(MINIMAL);
        catalog.variables.push(Variable {
            name: "backend".into(),
            description: None,
            required: false,
            default: None,
        });
        assert_eq!(
            catalog.validate(),
            Err(CatalogError::VariableWithoutDefault("backend".into()))
        );
    }
}
