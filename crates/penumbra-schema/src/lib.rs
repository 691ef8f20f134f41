//! Shared data model for the Penumbra installer.
//!
//! These types cross the boundary between the orchestration engine and its
//! front ends (CLI, desktop shell). Everything here is plain data with serde
//! support; behaviour lives in `penumbra-core`.

pub mod catalog;
pub mod credentials;
pub mod device;
pub mod hash;
pub mod job;
pub mod repository;

// Re-exports
pub use catalog::{Catalog, CatalogError, CleanupStep, InstallStep, Repository};
pub use credentials::{CredentialConfig, KeySource};
pub use device::{ConnectionState, DeviceInfo, InstalledPackage};
pub use hash::{DigestError, Sha256Digest};
pub use job::{ErrorKind, JobId, JobState, JobSummary, Level, Operation, ProgressEvent, RepoStatus};
pub use repository::{ArtifactKind, ArtifactReference, RepositoryDescriptor};
