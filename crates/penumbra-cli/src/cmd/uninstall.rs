use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use penumbra_core::InstallationEngine;

use crate::ui::ConsoleReporter;

/// Remove repositories from the attached device
pub async fn uninstall(
    engine: &InstallationEngine,
    repositories: &[String],
    yes: bool,
    json: bool,
) -> Result<()> {
    let targets = engine.registry().select(repositories)?;
    if !yes {
        let names: Vec<&str> = targets.iter().map(|r| r.name.as_str()).collect();
        print!("Remove {} from the device? [y/N] ", names.join(", "));
        std::io::stdout().flush()?;
        let mut answer = String::new();
        std::io::stdin()
            .read_line(&mut answer)
            .context("Failed to read confirmation")?;
        if !matches!(answer.trim(), "y" | "Y" | "yes") {
            println!("Aborted.");
            return Ok(());
        }
    }

    let reporter = Arc::new(ConsoleReporter::new());
    let summary = super::run_interruptible(
        engine,
        engine.uninstall_repositories(repositories, reporter),
    )
    .await?;
    super::report(&summary, json)
}
