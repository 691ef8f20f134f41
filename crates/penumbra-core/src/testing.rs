//! In-memory [`Transport`] for tests.
//!
//! [`FakeTransport`] simulates a single device's package manager and file
//! system closely enough for the executor's command vocabulary, and records
//! every shell command and push for assertions.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::device::{DeviceEntry, DeviceLink, DeviceState, SessionCredential, ShellOutput, Transport};
use crate::error::{Error, Result};

pub const FAKE_SERIAL: &str = "FAKE0001";

#[derive(Debug)]
struct Model {
    device_count: usize,
    state: DeviceState,
    packages: BTreeMap<String, String>,
    disabled: BTreeSet<String>,
    // APK filename -> (package, versionName)
    apks: HashMap<String, (String, String)>,
    files: BTreeMap<String, String>,
    dirs: BTreeSet<String>,
    commands: Vec<String>,
    pushes: Vec<(String, String)>,
    failing: Vec<String>,
    shell_delay: Duration,
    reboots: usize,
    listing_error: Option<String>,
    connects: usize,
}

/// Cloneable handle to one simulated device.
#[derive(Debug, Clone)]
pub struct FakeTransport {
    model: Arc<Mutex<Model>>,
}

impl Default for FakeTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeTransport {
    /// One authorized device with nothing installed.
    pub fn new() -> Self {
        Self {
            model: Arc::new(Mutex::new(Model {
                device_count: 1,
                state: DeviceState::Device,
                packages: BTreeMap::new(),
                disabled: BTreeSet::new(),
                apks: HashMap::new(),
                files: BTreeMap::new(),
                dirs: BTreeSet::new(),
                commands: Vec::new(),
                pushes: Vec::new(),
                failing: Vec::new(),
                shell_delay: Duration::ZERO,
                reboots: 0,
                listing_error: None,
                connects: 0,
            })),
        }
    }

    fn with<T>(&self, f: impl FnOnce(&mut Model) -> T) -> T {
        f(&mut self.model.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn set_device_count(&self, count: usize) {
        self.with(|m| m.device_count = count);
    }

    pub fn set_device_state(&self, state: DeviceState) {
        self.with(|m| m.state = state);
    }

    /// Make device enumeration itself fail, as when `adb` is missing.
    pub fn fail_device_listing(&self, message: &str) {
        self.with(|m| m.listing_error = Some(message.to_string()));
    }

    /// Declare which package and version an APK filename installs.
    pub fn register_apk(&self, filename: &str, package: &str, version: &str) {
        self.with(|m| {
            m.apks
                .insert(filename.to_string(), (package.to_string(), version.to_string()));
        });
    }

    /// Pre-install a package.
    pub fn install_package(&self, package: &str, version: &str) {
        self.with(|m| {
            m.packages.insert(package.to_string(), version.to_string());
        });
    }

    /// Commands containing `needle` exit non-zero.
    pub fn fail_commands_containing(&self, needle: &str) {
        self.with(|m| m.failing.push(needle.to_string()));
    }

    /// Delay every shell command, to widen cancellation windows.
    pub fn set_shell_delay(&self, delay: Duration) {
        self.with(|m| m.shell_delay = delay);
    }

    pub fn packages(&self) -> BTreeMap<String, String> {
        self.with(|m| m.packages.clone())
    }

    pub fn is_disabled(&self, package: &str) -> bool {
        self.with(|m| m.disabled.contains(package))
    }

    pub fn file(&self, path: &str) -> Option<String> {
        self.with(|m| m.files.get(path).cloned())
    }

    pub fn has_dir(&self, path: &str) -> bool {
        self.with(|m| m.dirs.contains(path))
    }

    pub fn commands(&self) -> Vec<String> {
        self.with(|m| m.commands.clone())
    }

    /// `(local filename, remote path)` of every push.
    pub fn pushes(&self) -> Vec<(String, String)> {
        self.with(|m| m.pushes.clone())
    }

    pub fn reboots(&self) -> usize {
        self.with(|m| m.reboots)
    }

    /// Number of sessions established.
    pub fn connects(&self) -> usize {
        self.with(|m| m.connects)
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn devices(&self) -> Result<Vec<DeviceEntry>> {
        if let Some(message) = self.with(|m| m.listing_error.clone()) {
            return Err(Error::DeviceUnreachable(message));
        }
        Ok(self.with(|m| {
            (0..m.device_count)
                .map(|i| DeviceEntry {
                    serial: if i == 0 {
                        FAKE_SERIAL.to_string()
                    } else {
                        format!("FAKE{:04}", i + 1)
                    },
                    state: m.state.clone(),
                })
                .collect()
        }))
    }

    async fn connect(
        &self,
        device: &DeviceEntry,
        credential: &SessionCredential,
    ) -> Result<Arc<dyn DeviceLink>> {
        match credential {
            SessionCredential::HostDefault => {}
            SessionCredential::KeyFile(path) => {
                if !path.is_file() {
                    return Err(Error::AuthorizationFailed(format!(
                        "signing key {} is missing",
                        path.display()
                    )));
                }
            }
            SessionCredential::Remote(signer) => signer.probe().await?,
        }
        match &device.state {
            DeviceState::Device => {
                self.with(|m| m.connects += 1);
                Ok(Arc::new(FakeLink {
                    serial: device.serial.clone(),
                    transport: self.clone(),
                }))
            }
            DeviceState::Unauthorized => Err(Error::AuthorizationFailed(format!(
                "device {} rejected the signing key",
                device.serial
            ))),
            other => Err(Error::DeviceUnreachable(format!(
                "device {} is {other:?}",
                device.serial
            ))),
        }
    }
}

#[derive(Debug)]
struct FakeLink {
    serial: String,
    transport: FakeTransport,
}

#[async_trait]
impl DeviceLink for FakeLink {
    fn serial(&self) -> &str {
        &self.serial
    }

    async fn shell(&self, command: &str) -> Result<ShellOutput> {
        // Recorded on entry so tests can observe commands still in flight.
        let delay = self.transport.with(|m| {
            m.commands.push(command.to_string());
            m.shell_delay
        });
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(self.transport.with(|m| m.execute(command)))
    }

    async fn push(&self, local: &Path, remote: &str) -> Result<()> {
        let bytes = tokio::fs::read(local).await?;
        let name = local
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.transport.with(|m| {
            m.pushes.push((name, remote.to_string()));
            m.files
                .insert(remote.to_string(), String::from_utf8_lossy(&bytes).into_owned());
        });
        Ok(())
    }

    async fn reboot(&self) -> Result<()> {
        self.transport.with(|m| m.reboots += 1);
        Ok(())
    }
}

fn ok(stdout: impl Into<String>) -> ShellOutput {
    ShellOutput {
        stdout: stdout.into(),
        stderr: String::new(),
        exit_code: 0,
    }
}

fn fail(stderr: impl Into<String>) -> ShellOutput {
    ShellOutput {
        stdout: String::new(),
        stderr: stderr.into(),
        exit_code: 1,
    }
}

impl Model {
    fn execute(&mut self, command: &str) -> ShellOutput {
        if self.failing.iter().any(|n| command.contains(n.as_str())) {
            return if command.starts_with("pm install") {
                ok("Failure [INSTALL_FAILED_INJECTED]")
            } else {
                fail("injected failure")
            };
        }

        let words = split_words(command);
        let words: Vec<&str> = words.iter().map(String::as_str).collect();
        match words.as_slice() {
            ["pm", "install", "-r", path] => self.pm_install(path),
            ["pm", "uninstall", "--user", "0", pkg] | ["pm", "uninstall", pkg] => {
                if self.packages.remove(*pkg).is_some() {
                    self.disabled.remove(*pkg);
                    ok("Success")
                } else {
                    ok("Failure [DELETE_FAILED_INTERNAL_ERROR]")
                }
            }
            ["pm", "disable-user", "--user", "0", pkg] => {
                if self.packages.contains_key(*pkg) {
                    self.disabled.insert((*pkg).to_string());
                    ok(format!("Package {pkg} new state: disabled-user"))
                } else {
                    fail(format!("Unknown package: {pkg}"))
                }
            }
            ["pm", "list", "packages"] => ok(self
                .packages
                .keys()
                .map(|p| format!("package:{p}\n"))
                .collect::<String>()),
            ["dumpsys", "package", pkg] => match self.packages.get(*pkg) {
                Some(version) => ok(format!(
                    "Packages:\n  Package [{pkg}] (1a2b3c):\n    versionCode=1 minSdk=28\n    versionName={version}\n"
                )),
                None => ok(format!("Unable to find package: {pkg}\n")),
            },
            ["pm", "grant", pkg, _] | ["appops", "set", pkg, _, _] => {
                if self.packages.contains_key(*pkg) {
                    ok("")
                } else {
                    fail(format!("Unknown package: {pkg}"))
                }
            }
            ["mkdir", "-p", path] => {
                self.dirs.insert(trim_slash(path));
                ok("")
            }
            ["rm", "-rf", path] => {
                let path = trim_slash(path);
                let prefix = format!("{path}/");
                self.dirs.retain(|d| *d != path && !d.starts_with(&prefix));
                self.files.retain(|f, _| !f.starts_with(&prefix));
                ok("")
            }
            ["rm", "-f", path] => {
                self.files.remove(*path);
                ok("")
            }
            ["chmod", _, path] => {
                if self.files.contains_key(*path) {
                    ok("")
                } else {
                    fail(format!("chmod: {path}: No such file or directory"))
                }
            }
            ["ls", "-A", path] => {
                let prefix = format!("{}/", trim_slash(path));
                let entries: BTreeSet<&str> = self
                    .files
                    .keys()
                    .chain(self.dirs.iter())
                    .filter_map(|p| p.strip_prefix(prefix.as_str()))
                    .filter_map(|rest| rest.split('/').next())
                    .filter(|name| !name.is_empty())
                    .collect();
                ok(entries.into_iter().map(|e| format!("{e}\n")).collect::<String>())
            }
            ["[", "-f", path, "]", "&&", "echo", "exists"] => {
                if self.files.contains_key(*path) {
                    ok("exists\n")
                } else {
                    ShellOutput {
                        exit_code: 1,
                        ..ShellOutput::default()
                    }
                }
            }
            ["printf", "%s", content, ">", path] => {
                self.files.insert((*path).to_string(), (*content).to_string());
                ok("")
            }
            ["logcat", "-d"] => ok(format!(
                "--------- beginning of main\n{}",
                self.commands
                    .iter()
                    .map(|c| format!("I/fake: {c}\n"))
                    .collect::<String>()
            )),
            _ => ok(""),
        }
    }

    fn pm_install(&mut self, path: &str) -> ShellOutput {
        if !self.files.contains_key(path) {
            return ok(format!("Failure [INSTALL_FAILED_INVALID_URI: {path} not found]"));
        }
        let filename = path.rsplit('/').next().unwrap_or(path);
        let Some((package, version)) = self.apks.get(filename).cloned() else {
            return ok("Failure [INSTALL_FAILED_INVALID_APK]");
        };
        if self.packages.get(&package) == Some(&version) {
            return ok(format!(
                "Failure [INSTALL_FAILED_ALREADY_EXISTS: Attempt to re-install {package} without first uninstalling.]"
            ));
        }
        self.packages.insert(package, version);
        ok("Performing Streamed Install\nSuccess\n")
    }
}

fn trim_slash(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    let trimmed = if trimmed.is_empty() { "/" } else { trimmed };
    trimmed.to_string()
}

/// Split a command line into words, honoring single quotes and backslash
/// escapes the way a POSIX shell does.
fn split_words(command: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quoted = false;
    let mut chars = command.chars();

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                quoted = !quoted;
                in_word = true;
            }
            '\\' if !quoted => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
                in_word = true;
            }
            c if c.is_whitespace() && !quoted => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            c => {
                current.push(c);
                in_word = true;
            }
        }
    }
    if in_word {
        words.push(current);
    }
    words
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::shell_quote;

    #[test]
    fn test_split_words_round_trips_shell_quote() {
        let tricky = "it's a \"config\"";
        let line = format!("printf '%s' {} > {}", shell_quote(tricky), shell_quote("/sdcard/a b"));
        assert_eq!(
            split_words(&line),
            vec!["printf", "%s", tricky, ">", "/sdcard/a b"]
        );
    }

    #[tokio::test]
    async fn test_same_version_install_reports_already_exists() {
        let transport = FakeTransport::new();
        transport.register_apk("app.apk", "com.example.app", "1.0");
        transport.install_package("com.example.app", "1.0");
        transport.with(|m| {
            m.files.insert("/t/app.apk".into(), String::new());
        });

        let out = transport.with(|m| m.execute("pm install -r '/t/app.apk'"));
        assert!(out.stdout.contains("INSTALL_FAILED_ALREADY_EXISTS"));
    }
}
