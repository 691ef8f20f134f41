pub mod bus;
pub mod catalog;
pub mod credentials;
pub mod device;
pub mod engine;
pub mod error;
pub mod executor;
pub mod github;
pub mod io;
pub mod job;
pub mod logs;
pub mod paths;
pub mod pattern;
pub mod registry;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub mod reporter;

pub use engine::{EngineOptions, InstallationEngine};
pub use error::{Error, Result};
pub use io::download::DownloadError;
pub use paths::*;
pub use reporter::{ChannelReporter, NullReporter, Reporter};

/// User Agent string for requests to the release host
pub const USER_AGENT: &str = concat!("penumbra-installer/", env!("CARGO_PKG_VERSION"));
