use std::fmt;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use regex::Regex;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{DeviceLink, ShellOutput, shell_quote};
use crate::error::{Error, Result};

/// Result of installing one package.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
    Installed,
    /// The package manager reported the same version already present.
    AlreadyCurrent,
}

/// An established device session.
///
/// Clones share the underlying link and one operation lock, so device
/// operations from concurrent tasks run one at a time. The lock is held for
/// a single operation only.
#[derive(Clone)]
pub struct DeviceSession {
    link: Arc<dyn DeviceLink>,
    lock: Arc<Mutex<()>>,
    cancel: Option<CancellationToken>,
}

impl fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceSession")
            .field("serial", &self.link.serial())
            .finish_non_exhaustive()
    }
}

impl DeviceSession {
    pub fn new(link: Arc<dyn DeviceLink>, lock: Arc<Mutex<()>>) -> Self {
        Self {
            link,
            lock,
            cancel: None,
        }
    }

    /// A handle whose operations fail with [`Error::Cancelled`] once `token`
    /// fires, aborting whatever is in flight.
    pub fn with_cancel(&self, token: CancellationToken) -> Self {
        Self {
            link: Arc::clone(&self.link),
            lock: Arc::clone(&self.lock),
            cancel: Some(token),
        }
    }

    /// A handle that ignores cancellation, for cleanup that must still run
    /// after a job was cancelled.
    pub fn uncancellable(&self) -> Self {
        Self {
            link: Arc::clone(&self.link),
            lock: Arc::clone(&self.lock),
            cancel: None,
        }
    }

    pub fn serial(&self) -> &str {
        self.link.serial()
    }

    async fn guarded<T>(&self, op: impl Future<Output = Result<T>>) -> Result<T> {
        let serialized = async {
            let _guard = self.lock.lock().await;
            op.await
        };
        match &self.cancel {
            Some(token) => {
                if token.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                tokio::select! {
                    biased;
                    () = token.cancelled() => Err(Error::Cancelled),
                    result = serialized => result,
                }
            }
            None => serialized.await,
        }
    }

    pub async fn shell(&self, command: &str) -> Result<ShellOutput> {
        debug!(serial = self.serial(), command, "shell");
        self.guarded(self.link.shell(command)).await
    }

    /// Run a command that must succeed; returns trimmed stdout.
    pub async fn run(&self, command: &str) -> Result<String> {
        let out = self.shell(command).await?;
        if out.success() {
            Ok(out.stdout.trim().to_string())
        } else {
            Err(Error::install_failed(
                command,
                format!("exit {}: {}", out.exit_code, out.combined()),
            ))
        }
    }

    pub async fn push(&self, local: &Path, remote: &str) -> Result<()> {
        debug!(serial = self.serial(), local = %local.display(), remote, "push");
        self.guarded(self.link.push(local, remote)).await
    }

    pub async fn reboot(&self) -> Result<()> {
        self.guarded(self.link.reboot()).await
    }

    /// Install an APK already pushed to `remote_apk`.
    pub async fn install_staged(&self, remote_apk: &str) -> Result<InstallOutcome> {
        let out = self
            .shell(&format!("pm install -r {}", shell_quote(remote_apk)))
            .await?;
        parse_install_output(remote_apk, &out)
    }

    /// Uninstall for user 0, falling back to a full uninstall.
    pub async fn uninstall_package(&self, package: &str) -> Result<()> {
        let quoted = shell_quote(package);
        let out = self.shell(&format!("pm uninstall --user 0 {quoted}")).await?;
        if out.success() && out.stdout.contains("Success") {
            return Ok(());
        }
        let out = self.shell(&format!("pm uninstall {quoted}")).await?;
        if out.success() && out.stdout.contains("Success") {
            Ok(())
        } else {
            Err(Error::install_failed(package, out.combined()))
        }
    }

    pub async fn disable_package(&self, package: &str) -> Result<()> {
        self.run(&format!("pm disable-user --user 0 {}", shell_quote(package)))
            .await
            .map(|_| ())
    }

    /// Every installed package name.
    pub async fn list_packages(&self) -> Result<Vec<String>> {
        let out = self.run("pm list packages").await?;
        Ok(out
            .lines()
            .filter_map(|l| l.trim().strip_prefix("package:"))
            .map(str::to_string)
            .collect())
    }

    /// `versionName` of an installed package, `None` when not installed.
    pub async fn package_version(&self, package: &str) -> Result<Option<String>> {
        let out = self
            .shell(&format!("dumpsys package {}", shell_quote(package)))
            .await?;
        if out.stdout.contains("Unable to find package") {
            return Ok(None);
        }
        let re = Regex::new(r"versionName=(\S+)").map_err(|e| Error::install_failed(package, e))?;
        Ok(re.captures(&out.stdout).map(|c| c[1].to_string()))
    }

    pub async fn grant_permission(&self, package: &str, permission: &str) -> Result<()> {
        self.run(&format!(
            "pm grant {} {}",
            shell_quote(package),
            shell_quote(permission)
        ))
        .await
        .map(|_| ())
    }

    pub async fn set_app_op(&self, package: &str, operation: &str, mode: &str) -> Result<()> {
        self.run(&format!(
            "appops set {} {} {}",
            shell_quote(package),
            shell_quote(operation),
            shell_quote(mode)
        ))
        .await
        .map(|_| ())
    }

    pub async fn set_launcher(&self, component: &str) -> Result<()> {
        self.run(&format!(
            "cmd package set-home-activity {}",
            shell_quote(component)
        ))
        .await
        .map(|_| ())
    }

    pub async fn create_directory(&self, path: &str) -> Result<()> {
        self.run(&format!("mkdir -p {}", shell_quote(path)))
            .await
            .map(|_| ())
    }

    pub async fn remove_directory(&self, path: &str) -> Result<()> {
        self.run(&format!("rm -rf {}", shell_quote(path)))
            .await
            .map(|_| ())
    }

    pub async fn remove_file(&self, path: &str) -> Result<()> {
        self.run(&format!("rm -f {}", shell_quote(path)))
            .await
            .map(|_| ())
    }

    pub async fn chmod(&self, mode: &str, path: &str) -> Result<()> {
        self.run(&format!("chmod {} {}", shell_quote(mode), shell_quote(path)))
            .await
            .map(|_| ())
    }

    /// A missing directory counts as empty.
    pub async fn is_directory_empty(&self, path: &str) -> Result<bool> {
        let out = self.shell(&format!("ls -A {}", shell_quote(path))).await?;
        Ok(out.stdout.trim().is_empty())
    }

    pub async fn file_exists(&self, path: &str) -> Result<bool> {
        let out = self
            .shell(&format!("[ -f {} ] && echo exists", shell_quote(path)))
            .await?;
        Ok(out.stdout.trim() == "exists")
    }

    pub async fn write_file(&self, path: &str, content: &str) -> Result<()> {
        self.run(&format!(
            "printf '%s' {} > {}",
            shell_quote(content),
            shell_quote(path)
        ))
        .await
        .map(|_| ())
    }

    /// Snapshot of the device log buffer.
    pub async fn dump_logs(&self) -> Result<String> {
        let out = self.shell("logcat -d").await?;
        if out.success() {
            Ok(out.stdout)
        } else {
            Err(Error::DeviceUnreachable(format!(
                "logcat failed: {}",
                out.combined()
            )))
        }
    }
}

fn parse_install_output(apk: &str, out: &ShellOutput) -> Result<InstallOutcome> {
    let text = out.combined();
    if text.contains("INSTALL_FAILED_ALREADY_EXISTS") {
        return Ok(InstallOutcome::AlreadyCurrent);
    }
    if text.lines().any(|l| l.trim() == "Success") {
        return Ok(InstallOutcome::Installed);
    }
    let reason = text
        .lines()
        .find(|l| l.contains("Failure"))
        .unwrap_or(text.as_str())
        .trim()
        .to_string();
    let name = Path::new(apk)
        .file_name()
        .map_or_else(|| apk.to_string(), |n| n.to_string_lossy().into_owned());
    Err(Error::install_failed(name, reason))
}
