//! [`Transport`] backed by the host `adb` executable.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{DeviceEntry, DeviceLink, DeviceState, SessionCredential, ShellOutput, Transport};
use crate::error::{Error, Result};

/// Upper bound for one bridge invocation. Large APK installs on a slow
/// device stay well below this.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug)]
pub struct AdbTransport {
    program: PathBuf,
    // Key the running adb server was started with.
    vendor_keys: Mutex<Option<PathBuf>>,
}

impl AdbTransport {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            vendor_keys: Mutex::new(None),
        }
    }

    /// Find `adb` on `PATH`.
    pub fn locate() -> Result<Self> {
        let program = which::which("adb").map_err(|_| {
            Error::DeviceUnreachable(
                "'adb' not found. Install Android platform-tools and make sure adb is on PATH"
                    .to_string(),
            )
        })?;
        debug!(adb = %program.display(), "using adb");
        Ok(Self::new(program))
    }

    /// Restart the bridge server so it offers `key` to devices.
    ///
    /// The restart drops every open bridge connection. The session manager
    /// never connects while a job still holds a session, so this only runs
    /// between jobs.
    async fn use_key(&self, key: &Path) -> Result<()> {
        let mut current = self.vendor_keys.lock().await;
        if current.as_deref() == Some(key) {
            return Ok(());
        }
        if !key.is_file() {
            return Err(Error::AuthorizationFailed(format!(
                "signing key {} is missing",
                key.display()
            )));
        }

        info!(key = %key.display(), "restarting adb server with signing key");
        run(&self.program, &["kill-server"], None).await?;
        let out = run(&self.program, &["start-server"], Some(key)).await?;
        if !out.success() {
            return Err(Error::DeviceUnreachable(format!(
                "adb start-server failed: {}",
                out.combined()
            )));
        }
        *current = Some(key.to_path_buf());
        Ok(())
    }
}

#[async_trait]
impl Transport for AdbTransport {
    async fn devices(&self) -> Result<Vec<DeviceEntry>> {
        let out = run(&self.program, &["devices"], None).await?;
        if !out.success() {
            return Err(Error::DeviceUnreachable(format!(
                "adb devices failed: {}",
                out.combined()
            )));
        }
        Ok(parse_devices(&out.stdout))
    }

    async fn connect(
        &self,
        device: &DeviceEntry,
        credential: &SessionCredential,
    ) -> Result<Arc<dyn DeviceLink>> {
        let state = match credential {
            SessionCredential::HostDefault => device.state.clone(),
            SessionCredential::KeyFile(key) => {
                self.use_key(key).await?;
                // The restarted server re-enumerates; read the state again.
                self.devices()
                    .await?
                    .into_iter()
                    .find(|d| d.serial == device.serial)
                    .map_or(DeviceState::Offline, |d| d.state)
            }
            SessionCredential::Remote(signer) => {
                signer.probe().await?;
                device.state.clone()
            }
        };

        match state {
            DeviceState::Device => Ok(Arc::new(AdbLink {
                program: self.program.clone(),
                serial: device.serial.clone(),
            })),
            DeviceState::Unauthorized => Err(Error::AuthorizationFailed(format!(
                "device {} rejected the signing key; confirm the prompt on the device",
                device.serial
            ))),
            DeviceState::Offline => Err(Error::DeviceUnreachable(format!(
                "device {} is offline",
                device.serial
            ))),
            DeviceState::Other(s) => Err(Error::DeviceUnreachable(format!(
                "device {} is in state '{s}'",
                device.serial
            ))),
        }
    }
}

#[derive(Debug)]
struct AdbLink {
    program: PathBuf,
    serial: String,
}

#[async_trait]
impl DeviceLink for AdbLink {
    fn serial(&self) -> &str {
        &self.serial
    }

    async fn shell(&self, command: &str) -> Result<ShellOutput> {
        run(&self.program, &["-s", &self.serial, "shell", command], None).await
    }

    async fn push(&self, local: &Path, remote: &str) -> Result<()> {
        let local_str = local.to_string_lossy();
        let out = run(
            &self.program,
            &["-s", &self.serial, "push", &local_str, remote],
            None,
        )
        .await?;
        if out.success() {
            Ok(())
        } else {
            let name = local
                .file_name()
                .map_or_else(|| local_str.to_string(), |n| n.to_string_lossy().into_owned());
            Err(Error::install_failed(
                name,
                format!("push to {remote} failed: {}", out.combined()),
            ))
        }
    }

    async fn reboot(&self) -> Result<()> {
        let out = run(&self.program, &["-s", &self.serial, "reboot"], None).await?;
        if out.success() {
            Ok(())
        } else {
            Err(Error::DeviceUnreachable(format!(
                "reboot failed: {}",
                out.combined()
            )))
        }
    }
}

async fn run(program: &Path, args: &[&str], vendor_keys: Option<&Path>) -> Result<ShellOutput> {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(key) = vendor_keys {
        cmd.env("ADB_VENDOR_KEYS", key);
    }

    let output = match tokio::time::timeout(COMMAND_TIMEOUT, cmd.output()).await {
        Ok(Ok(o)) => o,
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(Error::DeviceUnreachable(format!(
                "'{}' not found",
                program.display()
            )));
        }
        Ok(Err(e)) => {
            return Err(Error::DeviceUnreachable(format!("failed to spawn adb: {e}")));
        }
        Err(_) => {
            return Err(Error::DeviceUnreachable(format!(
                "adb {} timed out after {}s",
                args.join(" "),
                COMMAND_TIMEOUT.as_secs()
            )));
        }
    };

    Ok(ShellOutput {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        exit_code: output.status.code().unwrap_or(-1),
    })
}

/// Parse `adb devices` output.
fn parse_devices(stdout: &str) -> Vec<DeviceEntry> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('*') && !l.starts_with("List of devices"))
        .filter_map(|l| {
            let mut parts = l.split_whitespace();
            let serial = parts.next()?;
            let state = parts.next()?;
            Some(DeviceEntry {
                serial: serial.to_string(),
                state: DeviceState::parse(state),
            })
        })
        .collect()
}
