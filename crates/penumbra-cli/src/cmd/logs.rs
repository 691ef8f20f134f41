use std::path::Path;

use anyhow::{Context, Result};
use penumbra_core::InstallationEngine;

/// Save the device log buffer
pub async fn dump_logs(engine: &InstallationEngine, dir: Option<&Path>) -> Result<()> {
    let path = engine
        .dump_logs(dir)
        .await
        .context("Failed to dump device logs")?;
    println!("Saved device log to {}", path.display());
    Ok(())
}
