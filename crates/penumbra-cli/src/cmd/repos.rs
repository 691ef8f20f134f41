use penumbra_core::InstallationEngine;

use crate::ui::table::repository_table;

/// List the repositories the catalog offers
pub fn repos(engine: &InstallationEngine) {
    let repositories = engine.get_available_repositories();
    println!("{}", engine.registry().catalog().name);
    println!("{}", repository_table(&repositories));
}
