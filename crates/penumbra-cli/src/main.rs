//! penumbra - PenumbraOS bundle installer CLI

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use penumbra_cli::cmd;
use penumbra_cli::context::open_engine;
use penumbra_cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over --verbose
    let default = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Commands::Completions { shell } = cli.command {
        cmd::completions::completions(shell);
        return Ok(());
    }

    let engine = open_engine(&cli).await?;

    match cli.command {
        Commands::Install { repositories, json } => {
            cmd::install::install(&engine, &repositories, json).await
        }
        Commands::Uninstall {
            repositories,
            yes,
            json,
        } => cmd::uninstall::uninstall(&engine, &repositories, yes, json).await,
        Commands::Download { repositories, dir } => {
            cmd::download::download(&engine, &repositories, dir.as_deref()).await
        }
        Commands::Devices => {
            cmd::devices::devices(&engine).await;
            Ok(())
        }
        Commands::Packages => cmd::packages::packages(&engine).await,
        Commands::Repos => {
            cmd::repos::repos(&engine);
            Ok(())
        }
        Commands::Key { command } => cmd::key::key(&engine, command),
        Commands::Token { command } => cmd::token::token(&engine, command),
        Commands::DumpLogs { dir } => cmd::logs::dump_logs(&engine, dir.as_deref()).await,
        Commands::Completions { .. } => Ok(()),
    }
}
