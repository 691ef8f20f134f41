//! Per-repository install and uninstall state machines.
//!
//! ```text
//! install:   Pending -> Downloaded -> Pushed -> Installed -> Enabled -> Done
//! uninstall: Pending -> Disabled -> Removed -> Done
//! ```
//!
//! `Downloaded` is reached by the engine before the executor runs. Any error
//! ends the repository in `Failed`, or `Cancelled` when the job's token fired.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use penumbra_schema::catalog::{AppOpGrant, FilePush, PermissionGrant};
use penumbra_schema::{ArtifactReference, CleanupStep, InstallStep, RepoStatus, Repository};

use crate::bus::ProgressBus;
use crate::device::{DeviceSession, InstallOutcome};
use crate::error::{Error, Result};
use crate::job::StatusBoard;
use crate::pattern::{PatternSet, sort_by_priority};

/// Tunables for the executor.
#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    /// Repositories processed concurrently.
    pub workers: usize,
    /// How often app-op changes are applied. Some ops are reset by the
    /// system shortly after a package install.
    pub app_op_passes: usize,
    pub app_op_delay: Duration,
    /// Device directory APKs are staged in before installation.
    pub staging_dir: String,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            workers: num_cpus::get().clamp(1, 4),
            app_op_passes: 3,
            app_op_delay: Duration::from_secs(5),
            staging_dir: "/data/local/tmp/penumbra".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Executor {
    session: DeviceSession,
    bus: ProgressBus,
    board: Arc<StatusBoard>,
    options: ExecutorOptions,
}

impl Executor {
    /// `session` should already observe the bus's cancellation token.
    pub fn new(
        session: DeviceSession,
        bus: ProgressBus,
        board: Arc<StatusBoard>,
        options: ExecutorOptions,
    ) -> Self {
        Self {
            session,
            bus,
            board,
            options,
        }
    }

    pub fn session(&self) -> &DeviceSession {
        &self.session
    }

    /// Install one repository from its downloaded artifacts. Returns the
    /// terminal status, which is also recorded on the board.
    pub async fn install(&self, repo: &Repository, artifacts: &[ArtifactReference]) -> RepoStatus {
        let result = self.try_install(repo, artifacts).await;
        self.finish(&repo.name, result)
    }

    pub async fn uninstall(&self, repo: &Repository) -> RepoStatus {
        let result = self.try_uninstall(repo).await;
        self.finish(&repo.name, result)
    }

    fn finish(&self, name: &str, result: Result<()>) -> RepoStatus {
        let status = match result {
            Ok(()) => RepoStatus::Done,
            Err(_) if self.bus.is_cancelled() => RepoStatus::Cancelled,
            Err(e) => e.as_status(),
        };
        self.board.set(name, status.clone());
        status
    }

    async fn try_install(&self, repo: &Repository, artifacts: &[ArtifactReference]) -> Result<()> {
        let name = repo.name.as_str();
        self.bus.checkpoint()?;

        if !repo.cleanup.is_empty() {
            self.bus.info(Some(name), "Removing previous installation");
            self.run_cleanup(name, &repo.cleanup).await?;
        }

        // Pushed: directories, file pushes and APK staging.
        for step in &repo.installation {
            self.bus.checkpoint()?;
            match step {
                InstallStep::CreateDirectories { paths } => self.create_directories(name, paths).await?,
                InstallStep::PushFiles { files } => {
                    for rule in files {
                        self.push_files(name, rule, artifacts).await?;
                    }
                }
                _ => {}
            }
        }
        // Installed. Staged APKs are removed even when staging or
        // installation failed or was cancelled part way.
        let installed = self.stage_and_install(repo, artifacts).await;
        if has_apk_step(repo) {
            self.remove_staging(name).await;
        }
        installed?;
        self.board.set(name, RepoStatus::Installed);

        // Enabled
        for step in &repo.installation {
            self.bus.checkpoint()?;
            self.enable_step(name, step).await?;
        }
        self.board.set(name, RepoStatus::Enabled);
        Ok(())
    }

    async fn try_uninstall(&self, repo: &Repository) -> Result<()> {
        let name = repo.name.as_str();
        self.bus.checkpoint()?;

        let patterns = PatternSet::new(&repo.packages)?;
        if !patterns.is_empty() {
            for package in self.session.list_packages().await? {
                if !patterns.matches(&package) {
                    continue;
                }
                match self.session.disable_package(&package).await {
                    Ok(()) => self.bus.info(Some(name), format!("Disabled {package}")),
                    Err(Error::Cancelled) => return Err(Error::Cancelled),
                    Err(e) => self
                        .bus
                        .warn(Some(name), format!("Could not disable {package}: {e}")),
                }
            }
        }
        self.board.set(name, RepoStatus::Disabled);

        if repo.cleanup.is_empty() {
            self.bus.info(Some(name), "No cleanup steps defined");
        } else {
            self.run_cleanup(name, &repo.cleanup).await?;
        }
        self.board.set(name, RepoStatus::Removed);
        Ok(())
    }

    /// Catalog-wide steps run once before any repository.
    pub async fn run_global_setup(&self, steps: &[InstallStep]) -> Result<()> {
        for step in steps {
            self.bus.checkpoint()?;
            match step {
                InstallStep::CreateDirectories { paths } => self.create_directories("global", paths).await?,
                InstallStep::InstallApks { .. } | InstallStep::PushFiles { .. } => {
                    self.bus
                        .warn(None, "Global setup has no artifacts; skipping file step");
                }
                other => self.enable_step("global", other).await?,
            }
        }
        Ok(())
    }

    async fn run_cleanup(&self, name: &str, steps: &[CleanupStep]) -> Result<()> {
        for step in steps {
            self.bus.checkpoint()?;
            match step {
                CleanupStep::UninstallPackages { patterns } => {
                    let patterns = PatternSet::new(patterns)?;
                    for package in self.session.list_packages().await? {
                        if patterns.matches(&package) {
                            self.bus.info(Some(name), format!("Uninstalling {package}"));
                            self.session.uninstall_package(&package).await?;
                        }
                    }
                }
                CleanupStep::RemoveDirectories { paths } => {
                    for path in paths {
                        self.bus.info(Some(name), format!("Removing directory {path}"));
                        self.session.remove_directory(path).await?;
                    }
                }
                CleanupStep::RemoveDirectoriesIfEmpty { paths } => {
                    for path in paths {
                        if self.session.is_directory_empty(path).await? {
                            self.bus
                                .info(Some(name), format!("Removing empty directory {path}"));
                            self.session.remove_directory(path).await?;
                        } else {
                            self.bus
                                .warn(Some(name), format!("Directory not empty, keeping {path}"));
                        }
                    }
                }
                CleanupStep::RemoveFiles { paths } => {
                    for path in paths {
                        self.bus.info(Some(name), format!("Removing file {path}"));
                        self.session.remove_file(path).await?;
                    }
                }
            }
        }
        Ok(())
    }

    async fn create_directories(&self, name: &str, paths: &[String]) -> Result<()> {
        for path in paths {
            self.bus.info(Some(name), format!("Creating directory {path}"));
            self.session.create_directory(path).await?;
        }
        Ok(())
    }

    async fn push_files(&self, name: &str, rule: &FilePush, artifacts: &[ArtifactReference]) -> Result<()> {
        let pattern = PatternSet::new(&[rule.local.as_str()])?;
        let matched: Vec<(&ArtifactReference, &PathBuf)> = artifacts
            .iter()
            .filter(|a| pattern.matches(&a.filename))
            .filter_map(|a| a.cache_path.as_ref().map(|p| (a, p)))
            .collect();

        if matched.is_empty() {
            return Err(Error::NotFound(format!(
                "no downloaded file of {name} matches '{}'",
                rule.local
            )));
        }
        let into_dir = rule.remote.ends_with('/');
        if matched.len() > 1 && !into_dir {
            return Err(Error::InvalidInput(format!(
                "'{}' matches {} files but '{}' is not a directory",
                rule.local,
                matched.len(),
                rule.remote
            )));
        }

        for (artifact, local) in matched {
            let remote = if into_dir {
                format!("{}{}", rule.remote, artifact.filename)
            } else {
                rule.remote.clone()
            };
            self.bus
                .info(Some(name), format!("Pushing {} to {remote}", artifact.filename));
            self.session.push(local, &remote).await?;
            if let Some(mode) = &rule.chmod {
                self.session.chmod(mode, &remote).await?;
            }
        }
        Ok(())
    }

    fn staging_dir(&self, name: &str) -> String {
        format!("{}/{name}", self.options.staging_dir.trim_end_matches('/'))
    }

    /// Push the APKs selected by the repository's `InstallApks` steps to the
    /// staging directory, in installation order.
    async fn stage_apks(&self, repo: &Repository, artifacts: &[ArtifactReference]) -> Result<Vec<(String, String)>> {
        let Some(InstallStep::InstallApks { priority_order, .. }) = repo
            .installation
            .iter()
            .find(|s| matches!(s, InstallStep::InstallApks { .. }))
        else {
            return Ok(Vec::new());
        };

        let exclude = PatternSet::new(&repo.apk_exclude_patterns())?;
        let priority = PatternSet::new(priority_order)?;
        let mut apks: Vec<&ArtifactReference> = artifacts
            .iter()
            .filter(|a| a.is_apk() && !exclude.matches(&a.filename))
            .collect();
        sort_by_priority(&mut apks, &priority, |a| a.filename.as_str());

        if apks.is_empty() {
            self.bus.info(Some(&repo.name), "No APK files to install");
            return Ok(Vec::new());
        }

        let dir = self.staging_dir(&repo.name);
        self.session.create_directory(&dir).await?;
        let mut staged = Vec::with_capacity(apks.len());
        for apk in apks {
            self.bus.checkpoint()?;
            let local = apk.cache_path.as_ref().ok_or_else(|| {
                Error::NotFound(format!("{} was not downloaded", apk.filename))
            })?;
            let remote = format!("{dir}/{}", apk.filename);
            self.bus
                .info(Some(&repo.name), format!("Staging {}", apk.filename));
            self.session.push(local, &remote).await?;
            staged.push((apk.filename.clone(), remote));
        }
        Ok(staged)
    }

    async fn stage_and_install(&self, repo: &Repository, artifacts: &[ArtifactReference]) -> Result<()> {
        let staged = self.stage_apks(repo, artifacts).await?;
        self.board.set(&repo.name, RepoStatus::Pushed);
        self.install_staged(repo, &staged).await
    }

    async fn install_staged(&self, repo: &Repository, staged: &[(String, String)]) -> Result<()> {
        let allow_failures = repo.installation.iter().any(|s| {
            matches!(
                s,
                InstallStep::InstallApks {
                    allow_failures: true,
                    ..
                }
            )
        });
        let name = Some(repo.name.as_str());

        for (filename, remote) in staged {
            self.bus.checkpoint()?;
            self.bus.info(name, format!("Installing {filename}"));
            match self.session.install_staged(remote).await {
                Ok(InstallOutcome::Installed) => self.bus.info(name, format!("Installed {filename}")),
                Ok(InstallOutcome::AlreadyCurrent) => self
                    .bus
                    .info(name, format!("{filename} is already installed at this version")),
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) if allow_failures => self
                    .bus
                    .warn(name, format!("Failed to install {filename} (continuing): {e}")),
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn remove_staging(&self, name: &str) {
        let session = self.session.uncancellable();
        if let Err(e) = session.remove_directory(&self.staging_dir(name)).await {
            self.bus
                .warn(Some(name), format!("Could not remove staged APKs: {e}"));
        }
    }

    async fn enable_step(&self, name: &str, step: &InstallStep) -> Result<()> {
        match step {
            InstallStep::GrantPermissions { grants } => self.grant_permissions(name, grants).await,
            InstallStep::SetAppOps { ops } => self.set_app_ops(name, ops).await,
            InstallStep::SetLauncher { component } => {
                self.bus.info(Some(name), format!("Setting launcher {component}"));
                self.session.set_launcher(component).await
            }
            InstallStep::CreateConfig {
                path,
                content,
                only_if_missing,
            } => {
                if *only_if_missing && self.session.file_exists(path).await? {
                    self.bus
                        .info(Some(name), format!("Keeping existing config {path}"));
                    return Ok(());
                }
                if let Some((parent, _)) = path.rsplit_once('/')
                    && !parent.is_empty()
                {
                    self.session.create_directory(parent).await?;
                }
                self.bus.info(Some(name), format!("Writing config {path}"));
                self.session.write_file(path, content).await
            }
            InstallStep::RunCommand {
                command,
                ignore_failure,
            } => {
                self.bus.info(Some(name), format!("Running {command}"));
                match self.session.run(command).await {
                    Ok(output) => {
                        if !output.is_empty() {
                            self.bus.info(Some(name), output);
                        }
                        Ok(())
                    }
                    Err(Error::Cancelled) => Err(Error::Cancelled),
                    Err(e) if *ignore_failure => {
                        self.bus
                            .warn(Some(name), format!("Command failed (ignored): {e}"));
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
            InstallStep::CreateDirectories { .. }
            | InstallStep::PushFiles { .. }
            | InstallStep::InstallApks { .. } => Ok(()),
        }
    }

    async fn grant_permissions(&self, name: &str, grants: &[PermissionGrant]) -> Result<()> {
        for grant in grants {
            self.bus.info(
                Some(name),
                format!("Granting {} to {}", grant.permission, grant.package),
            );
            self.session
                .grant_permission(&grant.package, &grant.permission)
                .await?;
        }
        Ok(())
    }

    async fn set_app_ops(&self, name: &str, ops: &[AppOpGrant]) -> Result<()> {
        for pass in 0..self.options.app_op_passes.max(1) {
            if pass > 0 {
                let token = self.bus.token();
                tokio::select! {
                    biased;
                    () = token.cancelled() => return Err(Error::Cancelled),
                    () = tokio::time::sleep(self.options.app_op_delay) => {}
                }
            }
            for op in ops {
                self.bus.checkpoint()?;
                self.bus.info(
                    Some(name),
                    format!("Setting app op {} {} {}", op.package, op.operation, op.mode),
                );
                self.session
                    .set_app_op(&op.package, &op.operation, &op.mode)
                    .await?;
            }
        }
        Ok(())
    }
}

fn has_apk_step(repo: &Repository) -> bool {
    repo.installation
        .iter()
        .any(|s| matches!(s, InstallStep::InstallApks { .. }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::StatusBoard;
    use crate::reporter::ChannelReporter;
    use crate::testing::FakeTransport;
    use penumbra_schema::{ArtifactKind, ErrorKind, JobId};
    use tokio_util::sync::CancellationToken;

    struct Fixture {
        _dir: tempfile::TempDir,
        device: FakeTransport,
        executor: Executor,
        board: Arc<StatusBoard>,
        artifacts: Vec<ArtifactReference>,
        token: CancellationToken,
    }

    async fn fixture(repo: &str, files: &[&str]) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let artifacts = files
            .iter()
            .map(|f| {
                let path = dir.path().join(f);
                std::fs::write(&path, format!("contents of {f}")).unwrap();
                ArtifactReference {
                    repository: repo.to_string(),
                    version: "v1".to_string(),
                    filename: (*f).to_string(),
                    url: format!("https://example.invalid/{f}"),
                    expected_sha256: None,
                    expected_size: None,
                    kind: ArtifactKind::ReleaseAsset,
                    cache_path: Some(path),
                }
            })
            .collect();

        let device = FakeTransport::new();
        let transport: Arc<dyn crate::device::Transport> = Arc::new(device.clone());
        let entry = transport.devices().await.unwrap().remove(0);
        let link = transport
            .connect(&entry, &crate::device::SessionCredential::HostDefault)
            .await
            .unwrap();

        let token = CancellationToken::new();
        let (reporter, _rx) = ChannelReporter::new();
        let bus = ProgressBus::new(JobId(1), Arc::new(reporter), token.clone());
        let board = Arc::new(StatusBoard::new(bus.clone(), [repo]));
        let session = DeviceSession::new(link, Arc::new(tokio::sync::Mutex::new(()))).with_cancel(token.clone());
        let options = ExecutorOptions {
            app_op_delay: Duration::from_millis(10),
            ..ExecutorOptions::default()
        };
        Fixture {
            _dir: dir,
            device,
            executor: Executor::new(session, bus, Arc::clone(&board), options),
            board,
            artifacts,
            token,
        }
    }

    fn repository(src: &str) -> Repository {
        toml::from_str(src).unwrap()
    }

    const SDK: &str = r#"
name = "sdk"
owner = "PenumbraOS"
repo = "sdk"
packages = ["com.penumbraos.bridge*"]
release_assets = ["*.apk", "*.unit"]

[[cleanup]]
type = "UninstallPackages"
patterns = ["com.penumbraos.bridge*"]

[[installation]]
type = "PushFiles"
[[installation.files]]
local = "*.unit"
remote = "/sdcard/etc/"

[[installation]]
type = "InstallApks"
priority_order = ["*core*"]
exclude_patterns = ["*debug*"]

[[installation]]
type = "GrantPermissions"
[[installation.grants]]
package = "com.penumbraos.bridge_core"
permission = "android.permission.WRITE_SECURE_SETTINGS"

[[installation]]
type = "SetAppOps"
[[installation.ops]]
package = "com.penumbraos.bridge_core"
operation = "SYSTEM_ALERT_WINDOW"
mode = "allow"

[[installation]]
type = "CreateConfig"
path = "/sdcard/etc/sdk.conf"
content = "enabled=1"
only_if_missing = true
"#;

    #[tokio::test]
    async fn test_install_walks_every_stage() {
        let f = fixture("sdk", &["bridge-shell.apk", "bridge-core.apk", "bridge.unit"]).await;
        f.device
            .register_apk("bridge-core.apk", "com.penumbraos.bridge_core", "1.0");
        f.device
            .register_apk("bridge-shell.apk", "com.penumbraos.bridge_shell", "1.0");
        f.board.set("sdk", RepoStatus::Downloaded);

        let status = f.executor.install(&repository(SDK), &f.artifacts).await;
        assert_eq!(status, RepoStatus::Done);

        let packages = f.device.packages();
        assert_eq!(packages["com.penumbraos.bridge_core"], "1.0");
        assert_eq!(packages["com.penumbraos.bridge_shell"], "1.0");
        assert_eq!(f.device.file("/sdcard/etc/bridge.unit").as_deref(), Some("contents of bridge.unit"));
        assert_eq!(f.device.file("/sdcard/etc/sdk.conf").as_deref(), Some("enabled=1"));

        let installs: Vec<String> = f
            .device
            .commands()
            .into_iter()
            .filter(|c| c.starts_with("pm install"))
            .collect();
        assert_eq!(installs.len(), 2);
        assert!(installs[0].contains("bridge-core.apk"));

        let app_ops = f
            .device
            .commands()
            .iter()
            .filter(|c| c.starts_with("appops set"))
            .count();
        assert_eq!(app_ops, 3);
        assert!(!f.device.has_dir("/data/local/tmp/penumbra/sdk"));
    }

    #[tokio::test]
    async fn test_existing_config_is_kept() {
        let f = fixture("sdk", &["bridge-core.apk", "bridge.unit"]).await;
        f.device
            .register_apk("bridge-core.apk", "com.penumbraos.bridge_core", "1.0");
        f.executor
            .session()
            .write_file("/sdcard/etc/sdk.conf", "user edited")
            .await
            .unwrap();

        let status = f.executor.install(&repository(SDK), &f.artifacts).await;
        assert_eq!(status, RepoStatus::Done);
        assert_eq!(f.device.file("/sdcard/etc/sdk.conf").as_deref(), Some("user edited"));
    }

    #[tokio::test]
    async fn test_failed_apk_fails_repository() {
        let f = fixture("sdk", &["bridge-core.apk", "bridge.unit"]).await;
        // No package registered for the APK: the fake rejects it as invalid.
        let status = f.executor.install(&repository(SDK), &f.artifacts).await;
        match status {
            RepoStatus::Failed { kind, reason } => {
                assert_eq!(kind, ErrorKind::InstallFailed);
                assert!(reason.contains("INSTALL_FAILED_INVALID_APK"), "{reason}");
            }
            other => panic!("unexpected status {other:?}"),
        }
        assert!(f.board.get("sdk").is_some_and(|s| s.is_failed()));
        assert!(!f.device.has_dir("/data/local/tmp/penumbra/sdk"));
    }

    #[tokio::test]
    async fn test_allow_failures_continues() {
        let f = fixture("mabl", &["mabl.apk", "plugin-demo.apk", "plugin-bad.apk"]).await;
        f.device.register_apk("mabl.apk", "com.penumbraos.mabl", "2.0");
        let repo = repository(
            r#"
name = "mabl"
owner = "PenumbraOS"
repo = "mabl"
release_assets = ["*.apk"]

[[installation]]
type = "InstallApks"
allow_failures = true
exclude_patterns = ["*demo*"]
"#,
        );

        assert_eq!(f.executor.install(&repo, &f.artifacts).await, RepoStatus::Done);
        assert_eq!(f.device.packages()["com.penumbraos.mabl"], "2.0");
        assert!(
            f.device
                .pushes()
                .iter()
                .all(|(name, _)| !name.contains("demo"))
        );
    }

    #[tokio::test]
    async fn test_uninstall_disables_then_cleans_up() {
        let f = fixture("sdk", &[]).await;
        f.device.install_package("com.penumbraos.bridge_core", "1.0");
        f.device.install_package("com.android.settings", "14");

        let status = f.executor.uninstall(&repository(SDK)).await;
        assert_eq!(status, RepoStatus::Done);
        let packages = f.device.packages();
        assert!(!packages.contains_key("com.penumbraos.bridge_core"));
        assert!(packages.contains_key("com.android.settings"));
        assert!(
            f.device
                .commands()
                .iter()
                .any(|c| c.contains("disable-user") && c.contains("bridge_core"))
        );
    }

    #[tokio::test]
    async fn test_cancel_during_install_removes_staged_apks() {
        let f = fixture("mabl", &["mabl.apk"]).await;
        f.device.register_apk("mabl.apk", "com.penumbraos.mabl", "2.0");
        f.device.set_shell_delay(Duration::from_millis(300));
        let repo = repository(
            r#"
name = "mabl"
owner = "PenumbraOS"
repo = "mabl"
release_assets = ["*.apk"]

[[installation]]
type = "InstallApks"
"#,
        );

        let token = f.token.clone();
        let device = f.device.clone();
        let canceller = tokio::spawn(async move {
            while !device.commands().iter().any(|c| c.starts_with("pm install")) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            token.cancel();
        });

        let status = f.executor.install(&repo, &f.artifacts).await;
        canceller.await.unwrap();
        assert_eq!(status, RepoStatus::Cancelled);
        assert_eq!(f.board.get("mabl"), Some(RepoStatus::Cancelled));
        assert!(f.device.file("/data/local/tmp/penumbra/mabl/mabl.apk").is_none());
        assert!(!f.device.has_dir("/data/local/tmp/penumbra/mabl"));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let f = fixture("sdk", &["bridge-core.apk"]).await;
        f.token.cancel();
        let status = f.executor.install(&repository(SDK), &f.artifacts).await;
        assert_eq!(status, RepoStatus::Cancelled);
        assert!(f.device.commands().is_empty());
    }
}
