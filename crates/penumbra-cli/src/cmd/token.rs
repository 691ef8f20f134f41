use anyhow::Result;
use penumbra_core::InstallationEngine;

use crate::TokenCommands;

/// Store or remove the release host token
pub fn token(engine: &InstallationEngine, command: TokenCommands) -> Result<()> {
    match command {
        TokenCommands::Set { token } => {
            engine.set_download_token(Some(&token))?;
            println!("Access token saved.");
        }
        TokenCommands::Clear => {
            engine.set_download_token(None)?;
            println!("Access token removed.");
        }
    }
    Ok(())
}
