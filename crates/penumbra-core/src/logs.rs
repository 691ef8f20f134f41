//! Device log snapshots.

use std::path::{Path, PathBuf};

use tracing::info;

use crate::device::DeviceSession;
use crate::error::Result;

/// Write the device's current log buffer to a timestamped file in `dir`.
pub async fn dump_logs(session: &DeviceSession, dir: &Path) -> Result<PathBuf> {
    let contents = session.dump_logs().await?;
    tokio::fs::create_dir_all(dir).await?;

    let name = format!(
        "penumbra_log_dump_{}.log",
        chrono::Local::now().format("%Y%m%d_%H%M%S")
    );
    let path = dir.join(name);
    tokio::fs::write(&path, contents).await?;
    info!(path = %path.display(), serial = session.serial(), "saved device log");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{SessionCredential, Transport};
    use crate::testing::FakeTransport;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_dump_logs_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let transport = FakeTransport::new();
        let entry = transport.devices().await.unwrap().remove(0);
        let link = transport
            .connect(&entry, &SessionCredential::HostDefault)
            .await
            .unwrap();
        let session = DeviceSession::new(link, Arc::new(tokio::sync::Mutex::new(())));

        let path = dump_logs(&session, &dir.path().join("logs")).await.unwrap();
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("penumbra_log_dump_"));
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.starts_with("--------- beginning of main"));
    }
}
