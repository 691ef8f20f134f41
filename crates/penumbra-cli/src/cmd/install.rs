use std::sync::Arc;

use anyhow::Result;
use penumbra_core::InstallationEngine;

use crate::ui::ConsoleReporter;

/// Install or update repositories on the attached device
pub async fn install(engine: &InstallationEngine, repositories: &[String], json: bool) -> Result<()> {
    let reporter = Arc::new(ConsoleReporter::new());
    let summary = super::run_interruptible(
        engine,
        engine.install_repositories(repositories, reporter),
    )
    .await?;
    super::report(&summary, json)
}
