use penumbra_core::InstallationEngine;

use crate::ui::table::device_table;

/// Probe the debug bridge and show what is attached
pub async fn devices(engine: &InstallationEngine) {
    let info = engine.check_device_connection().await;
    println!("{}", device_table(&info));
    println!(
        "Signing key: {}",
        engine.load_credentials().key_source.describe()
    );
}
