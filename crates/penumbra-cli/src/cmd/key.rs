//! Signing key management.

use anyhow::Result;
use penumbra_core::InstallationEngine;
use penumbra_schema::CredentialConfig;

use crate::KeyCommands;

pub fn key(engine: &InstallationEngine, command: KeyCommands) -> Result<()> {
    let config = match command {
        KeyCommands::File { path } => engine.set_key_from_local_file(&path)?,
        KeyCommands::Remote { url } => engine.set_key_remote(&url)?,
        KeyCommands::Clear => engine.clear_key()?,
        KeyCommands::Show => engine.load_credentials(),
    };
    show(&config);
    Ok(())
}

fn show(config: &CredentialConfig) {
    println!("Signing key:  {}", config.key_source.describe());
    let token = if config.has_token() { "set" } else { "not set" };
    println!("Access token: {token}");
}
