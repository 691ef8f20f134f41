use anyhow::Result;
use penumbra_core::InstallationEngine;

use crate::ui::table::package_table;

/// List bundle packages present on the device
pub async fn packages(engine: &InstallationEngine) -> Result<()> {
    let packages = engine.list_installed_packages().await?;
    if packages.is_empty() {
        println!();
        println!("  No bundle packages installed.");
        println!("  Run 'penumbra install' to get started.");
        return Ok(());
    }
    println!("{}", package_table(&packages));
    Ok(())
}
