//! penumbra - PenumbraOS bundle installer
#![allow(missing_docs)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::doc_markdown)]
//!
//! Installs, updates and removes the PenumbraOS bundle on a tethered device
//! through the host debug bridge.
//!
//! # Directory Layout
//!
//! ```text
//! ~/.penumbra/
//! ├── credentials.json   # key source + download token
//! ├── keys/              # managed copies of signing keys
//! ├── cache/             # release artifacts by repository/version
//! └── logs/              # device log dumps
//! ```

pub mod cmd;
pub mod context;
pub mod ui;

pub use penumbra_core::USER_AGENT;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "penumbra")]
#[command(author, version, about = "penumbra - install the PenumbraOS bundle")]
pub struct Cli {
    /// Installer home (credentials, cache, logs)
    #[arg(long, global = true, env = "PENUMBRA_HOME")]
    pub home: Option<PathBuf>,

    /// Bundle catalog to use instead of the built-in one (file path or URL)
    #[arg(long, global = true, env = "PENUMBRA_CATALOG")]
    pub catalog: Option<String>,

    /// Override a catalog variable (repeatable)
    #[arg(long = "var", value_name = "NAME=VALUE", global = true)]
    pub vars: Vec<String>,

    /// Path to the adb binary (defaults to the one on PATH)
    #[arg(long, global = true, env = "PENUMBRA_ADB")]
    pub adb: Option<PathBuf>,

    /// Show debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Install or update repositories (all of them if none are named)
    Install {
        /// Repository names
        repositories: Vec<String>,
        /// Print the final summary as JSON
        #[arg(long)]
        json: bool,
    },
    /// Remove repositories from the device (all of them if none are named)
    Uninstall {
        /// Repository names
        repositories: Vec<String>,
        /// Skip confirmation prompt
        #[arg(long, short = 'y')]
        yes: bool,
        /// Print the final summary as JSON
        #[arg(long)]
        json: bool,
    },
    /// Fetch release artifacts into the cache without a device
    Download {
        /// Repository names
        repositories: Vec<String>,
        /// Cache directory to populate
        #[arg(long)]
        dir: Option<PathBuf>,
    },
    /// Show the attached device
    Devices,
    /// List bundle packages installed on the device
    Packages,
    /// List repositories in the catalog
    Repos,
    /// Manage the device signing key
    Key {
        #[command(subcommand)]
        command: KeyCommands,
    },
    /// Manage the release host access token
    Token {
        #[command(subcommand)]
        command: TokenCommands,
    },
    /// Save the device log buffer to a file
    #[command(name = "dump-logs")]
    DumpLogs {
        /// Directory to write the log into
        #[arg(long)]
        dir: Option<PathBuf>,
    },
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}

#[derive(Debug, Subcommand)]
pub enum KeyCommands {
    /// Copy a private key file into managed storage and use it
    File {
        /// Path to the private key
        path: PathBuf,
    },
    /// Use a remote signing server
    Remote {
        /// Signing endpoint URL
        url: String,
    },
    /// Forget the configured key and fall back to the host default
    Clear,
    /// Show the configured key source
    Show,
}

#[derive(Debug, Subcommand)]
pub enum TokenCommands {
    /// Store an access token for the release host
    Set {
        /// Token value
        #[arg(env = "PENUMBRA_TOKEN", hide_env_values = true)]
        token: String,
    },
    /// Remove the stored token
    Clear,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_install_with_vars() {
        let cli = Cli::parse_from([
            "penumbra",
            "install",
            "pinitd",
            "mabl",
            "--var",
            "launcher=mabl",
        ]);
        assert_eq!(cli.vars, ["launcher=mabl"]);
        match cli.command {
            Commands::Install { repositories, json } => {
                assert_eq!(repositories, ["pinitd", "mabl"]);
                assert!(!json);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_parse_key_remote() {
        let cli = Cli::parse_from(["penumbra", "key", "remote", "https://signer.example.com"]);
        assert!(matches!(
            cli.command,
            Commands::Key {
                command: KeyCommands::Remote { .. }
            }
        ));
    }
}
