use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use penumbra_core::InstallationEngine;

use crate::ui::ConsoleReporter;

/// Populate the artifact cache without a device
pub async fn download(
    engine: &InstallationEngine,
    repositories: &[String],
    dir: Option<&Path>,
) -> Result<()> {
    let reporter = Arc::new(ConsoleReporter::new());
    let summary = super::run_interruptible(
        engine,
        engine.download_only(repositories, dir, reporter),
    )
    .await?;
    let location = dir.unwrap_or_else(|| engine.cache().root());
    println!("Artifacts cached in {}", location.display());
    super::report(&summary, false)
}
