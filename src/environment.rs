//! Remote environment provisioning.
//!
//! An environment lives in `<work_dir>/envs/<content_id>` and holds the
//! package archive plus a virtual environment with the package's
//! requirements. A ready marker written last makes a later build with the
//! same content identifier a no-op.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{BuildStep, ClusterError, Result};
use crate::package::Package;
use crate::session::{quote, quote_all, quote_path, Channel, CommandOutput};
use crate::sync::LockedDir;
use crate::target::{EnvironmentStrategy, ExecutionTarget, SharedMount, TargetKind};

pub const READY_MARKER: &str = ".clusterfn-ready";
pub const ARCHIVE_NAME: &str = "package.tar.gz";

const RETRY_DELAY: Duration = Duration::from_secs(1);

/// The tool that populated an environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Installer {
    Uv,
    Pip,
    System,
}

/// A provisioned environment on a target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteEnvironmentHandle {
    pub env_dir: PathBuf,
    pub jobs_dir: PathBuf,
    pub archive: PathBuf,
    /// Interpreter to run jobs with.
    pub python: String,
    /// Shell command that activates the environment, if it is a venv.
    pub activate: Option<String>,
    pub installer: Installer,
    pub installed: Vec<String>,
    pub content_id: String,
    pub created_at: DateTime<Utc>,
    /// The environment already existed.
    pub reused: bool,
    /// Interpreter and requirements are set up inside the job instead.
    pub deferred: bool,
}

impl RemoteEnvironmentHandle {
    pub fn venv_dir(&self) -> PathBuf {
        self.env_dir.join("venv")
    }

    pub fn marker(&self) -> PathBuf {
        self.env_dir.join(READY_MARKER)
    }

    /// Contents of the ready marker for this environment.
    pub fn marker_json(&self) -> Result<String> {
        let marker = ReadyMarker {
            content_id: self.content_id.clone(),
            python: self.python.clone(),
            activate: self.activate.clone(),
            installer: self.installer,
            installed: self.installed.clone(),
            created_at: self.created_at,
        };
        Ok(serde_json::to_string(&marker)?)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ReadyMarker {
    content_id: String,
    python: String,
    activate: Option<String>,
    installer: Installer,
    installed: Vec<String>,
    created_at: DateTime<Utc>,
}

/// Builds environments on one target through its channel.
pub struct EnvironmentBuilder {
    target: Arc<ExecutionTarget>,
    channel: Arc<dyn Channel>,
}

impl EnvironmentBuilder {
    pub fn new(target: Arc<ExecutionTarget>, channel: Arc<dyn Channel>) -> Self {
        Self { target, channel }
    }

    pub fn env_dir(&self, content_id: &str) -> PathBuf {
        self.target.resolve("envs").join(content_id)
    }

    pub fn jobs_dir(&self) -> PathBuf {
        self.target.resolve("jobs")
    }

    /// Provisions the environment for `package`, or reuses a ready one.
    pub async fn build(&self, package: &Package) -> Result<RemoteEnvironmentHandle> {
        let content_id = package.content_id().to_string();
        let env_dir = self.env_dir(&content_id);
        let jobs_dir = self.jobs_dir();
        info!(target = %self.target.name, content_id = %content_id, "Preparing environment");

        self.exec_step(
            BuildStep::WorkDir,
            &format!(
                "mkdir -p {} {}",
                quote_path(env_dir.parent().unwrap_or(&env_dir)),
                quote_path(&jobs_dir)
            ),
        )
        .await?;

        let lock = LockedDir::acquire(
            self.channel.clone(),
            env_dir.with_extension("lock"),
            self.target.options.command_timeout(),
        )
        .await
        .map_err(|e| ClusterError::build(BuildStep::WorkDir, e))?;
        let result = self.build_locked(package, &env_dir, &jobs_dir).await;
        if let Err(e) = lock.release().await {
            warn!(env = %env_dir.display(), error = %e, "Failed to release environment lock");
        }

        match result {
            Ok(handle) => Ok(handle),
            Err(e) => {
                if self.target.options.keep_remote {
                    warn!(env = %env_dir.display(), "Keeping partial environment for inspection");
                } else if let Err(cleanup) = self.remove_dir(&env_dir).await {
                    warn!(env = %env_dir.display(), error = %cleanup, "Failed to remove partial environment");
                }
                Err(e)
            }
        }
    }

    async fn build_locked(
        &self,
        package: &Package,
        env_dir: &Path,
        jobs_dir: &Path,
    ) -> Result<RemoteEnvironmentHandle> {
        let content_id = package.content_id();
        if self.target.options.cache_environments {
            if let Some(marker) = self.read_marker(env_dir).await? {
                if marker.content_id == content_id {
                    info!(content_id, "Reusing environment");
                    return Ok(RemoteEnvironmentHandle {
                        env_dir: env_dir.to_path_buf(),
                        jobs_dir: jobs_dir.to_path_buf(),
                        archive: env_dir.join(ARCHIVE_NAME),
                        python: marker.python,
                        activate: marker.activate,
                        installer: marker.installer,
                        installed: marker.installed,
                        content_id: content_id.to_string(),
                        created_at: marker.created_at,
                        reused: true,
                        deferred: false,
                    });
                }
            }
        }

        self.exec_step(BuildStep::WorkDir, &format!("mkdir -p {}", quote_path(env_dir)))
            .await?;
        let archive = env_dir.join(ARCHIVE_NAME);
        self.transfer(&archive, &package.archive).await?;

        let installed: Vec<String> = package
            .manifest
            .requirements
            .iter()
            .map(|r| r.to_string())
            .collect();
        let venv = env_dir.join("venv");
        let venv_python = venv.join("bin").join("python").to_string_lossy().into_owned();
        let activate = Some(format!(". {}", quote_path(&venv.join("bin").join("activate"))));

        if self.target.kind == TargetKind::Kubernetes {
            // The pod provisions the venv on the shared volume on first run.
            debug!(content_id, "Deferring interpreter setup to the job");
            return Ok(RemoteEnvironmentHandle {
                env_dir: env_dir.to_path_buf(),
                jobs_dir: jobs_dir.to_path_buf(),
                archive,
                python: venv_python,
                activate,
                installer: Installer::Pip,
                installed,
                content_id: content_id.to_string(),
                created_at: Utc::now(),
                reused: false,
                deferred: true,
            });
        }

        let installer = self.interpreter(&venv).await?;
        let (python, activate) = match installer {
            Installer::System => (self.target.python.clone(), None),
            _ => (venv_python, activate),
        };
        self.install(installer, &python, &installed).await?;

        let handle = RemoteEnvironmentHandle {
            env_dir: env_dir.to_path_buf(),
            jobs_dir: jobs_dir.to_path_buf(),
            archive,
            python,
            activate,
            installer,
            installed,
            content_id: content_id.to_string(),
            created_at: Utc::now(),
            reused: false,
            deferred: false,
        };
        self.write_marker(&handle).await?;
        info!(content_id, installer = ?installer, packages = handle.installed.len(), "Environment ready");
        Ok(handle)
    }

    /// Creates the interpreter environment and reports which tool did it.
    async fn interpreter(&self, venv: &Path) -> Result<Installer> {
        let python = quote(&self.target.python);
        let installer = match self.target.environment {
            EnvironmentStrategy::System => return Ok(Installer::System),
            EnvironmentStrategy::Uv => Installer::Uv,
            EnvironmentStrategy::Venv => Installer::Pip,
            EnvironmentStrategy::Auto => {
                let has_uv = self
                    .exec_raw(BuildStep::Interpreter, "command -v uv >/dev/null 2>&1")
                    .await?;
                if has_uv.success() {
                    Installer::Uv
                } else {
                    Installer::Pip
                }
            }
        };
        let script = match installer {
            Installer::Uv => format!("uv venv --quiet --python {} {}", python, quote_path(venv)),
            _ => format!("{} -m venv {}", python, quote_path(venv)),
        };
        self.exec_step(BuildStep::Interpreter, &script).await?;
        Ok(installer)
    }

    async fn install(&self, installer: Installer, python: &str, requirements: &[String]) -> Result<()> {
        if requirements.is_empty() {
            return Ok(());
        }
        let packages = quote_all(requirements);
        let script = match installer {
            Installer::Uv => format!("uv pip install --quiet --python {} {}", quote(python), packages),
            Installer::Pip => format!(
                "{} -m pip install --quiet --disable-pip-version-check {}",
                quote(python),
                packages
            ),
            Installer::System => format!(
                "{} -m pip install --quiet --user --disable-pip-version-check {}",
                quote(python),
                packages
            ),
        };
        info!(target = %self.target.name, packages = %packages, "Installing requirements");
        self.exec_step(BuildStep::Install, &script).await?;
        Ok(())
    }

    async fn transfer(&self, archive: &Path, contents: &[u8]) -> Result<()> {
        if let Some(local) = self.shared_path(archive).await {
            debug!(path = %local.display(), "Writing archive through shared mount");
            if let Some(parent) = local.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| ClusterError::build(BuildStep::Transfer, e))?;
            }
            return tokio::fs::write(&local, contents)
                .await
                .map_err(|e| ClusterError::build(BuildStep::Transfer, e));
        }
        let mut attempt = 1;
        loop {
            match self.channel.write_file(archive, contents).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && attempt < 2 => {
                    warn!(step = %BuildStep::Transfer, error = %e, "Retrying");
                    tokio::time::sleep(RETRY_DELAY).await;
                    attempt += 1;
                }
                Err(e) => return Err(ClusterError::build(BuildStep::Transfer, e)),
            }
        }
    }

    /// Local path of `remote` if it is under a mount proven to be shared.
    async fn shared_path(&self, remote: &Path) -> Option<PathBuf> {
        for mount in &self.target.shared_mounts {
            let relative = match remote.strip_prefix(&mount.remote) {
                Ok(relative) => relative,
                Err(_) => continue,
            };
            if self.is_shared(mount).await {
                return Some(mount.local.join(relative));
            }
        }
        None
    }

    /// Writes a token locally and reads it back through the channel.
    async fn is_shared(&self, mount: &SharedMount) -> bool {
        let name = format!(".clusterfn-shared-{}", uuid::Uuid::new_v4());
        let token = uuid::Uuid::new_v4().to_string();
        let local = mount.local.join(&name);
        if tokio::fs::write(&local, &token).await.is_err() {
            return false;
        }
        let seen = self.channel.read_file(&mount.remote.join(&name)).await;
        let _ = tokio::fs::remove_file(&local).await;
        match seen {
            Ok(Some(contents)) => contents == token.as_bytes(),
            Ok(None) => false,
            Err(e) => {
                debug!(mount = %mount.remote.display(), error = %e, "Shared mount check failed");
                false
            }
        }
    }

    async fn read_marker(&self, env_dir: &Path) -> Result<Option<ReadyMarker>> {
        let contents = self
            .channel
            .read_file(&env_dir.join(READY_MARKER))
            .await
            .map_err(|e| ClusterError::build(BuildStep::WorkDir, e))?;
        Ok(contents.and_then(|bytes| match serde_json::from_slice(&bytes) {
            Ok(marker) => Some(marker),
            Err(e) => {
                warn!(env = %env_dir.display(), error = %e, "Ignoring unreadable ready marker");
                None
            }
        }))
    }

    async fn write_marker(&self, handle: &RemoteEnvironmentHandle) -> Result<()> {
        let contents = handle.marker_json()?;
        self.channel
            .write_file(&handle.marker(), contents.as_bytes())
            .await
            .map_err(|e| ClusterError::build(BuildStep::Install, e))
    }

    /// Removes the environment unless it is kept for reuse or debugging.
    pub async fn teardown(&self, handle: &RemoteEnvironmentHandle) -> Result<()> {
        let options = &self.target.options;
        if options.keep_remote || options.cache_environments {
            return Ok(());
        }
        info!(env = %handle.env_dir.display(), "Removing environment");
        self.remove_dir(&handle.env_dir).await
    }

    pub async fn remove_dir(&self, dir: &Path) -> Result<()> {
        let output = self.channel.exec(&format!("rm -rf {}", quote_path(dir))).await?;
        if output.success() {
            Ok(())
        } else {
            Err(ClusterError::Orchestration(format!(
                "removing {} failed: {}",
                dir.display(),
                output.describe_failure()
            )))
        }
    }

    /// Runs a step's command, retrying once if the channel hiccups. A
    /// non-zero exit fails the step.
    async fn exec_step(&self, step: BuildStep, script: &str) -> Result<CommandOutput> {
        let output = self.exec_raw(step, script).await?;
        if output.success() {
            Ok(output)
        } else {
            Err(ClusterError::build(step, output.describe_failure()))
        }
    }

    async fn exec_raw(&self, step: BuildStep, script: &str) -> Result<CommandOutput> {
        let mut attempt = 1;
        loop {
            match self.channel.exec(script).await {
                Ok(output) => return Ok(output),
                Err(e) if e.is_transient() && attempt < 2 => {
                    warn!(step = %step, error = %e, "Retrying");
                    tokio::time::sleep(RETRY_DELAY).await;
                    attempt += 1;
                }
                Err(e) => return Err(ClusterError::build(step, e)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;

    use crate::analyzer::{analyze, FunctionRef};
    use crate::error::ChannelError;
    use crate::package::{self, CallArguments};
    use crate::session::LocalChannel;

    /// Runs commands locally but fakes the interpreter tools, counting
    /// installs.
    struct FakeToolsChannel {
        inner: LocalChannel,
        installs: AtomicUsize,
        fail_install: bool,
        drop_on_unlock: AtomicBool,
    }

    #[async_trait]
    impl Channel for FakeToolsChannel {
        fn name(&self) -> &str {
            "fake"
        }

        async fn exec(&self, script: &str) -> std::result::Result<CommandOutput, ChannelError> {
            if script.starts_with("rmdir") && self.drop_on_unlock.load(Ordering::SeqCst) {
                return Err(ChannelError::Closed("connection reset".to_string()));
            }
            if script.contains("pip install") {
                self.installs.fetch_add(1, Ordering::SeqCst);
                return Ok(CommandOutput {
                    status: Some(if self.fail_install { 1 } else { 0 }),
                    stdout: vec![],
                    stderr: if self.fail_install { b"no matching distribution".to_vec() } else { vec![] },
                });
            }
            if script.contains("-m venv") || script.starts_with("uv venv") || script.starts_with("command -v uv") {
                return Ok(CommandOutput {
                    status: Some(0),
                    ..CommandOutput::default()
                });
            }
            self.inner.exec(script).await
        }

        async fn write_file(&self, path: &Path, contents: &[u8]) -> std::result::Result<(), ChannelError> {
            self.inner.write_file(path, contents).await
        }
    }

    fn fixture(fail_install: bool) -> (tempfile::TempDir, Arc<ExecutionTarget>, Arc<FakeToolsChannel>, Package) {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        std::fs::create_dir_all(&src).unwrap();
        let file = src.join("job.py");
        std::fs::write(&file, "import numpy\n\ndef f(x):\n    return numpy.sum(x)\n").unwrap();
        let target = Arc::new(
            ExecutionTarget::ssh(crate::target::Connection::new("fake"), dir.path().join("work"))
                .with_environment(EnvironmentStrategy::Venv),
        );
        let graph = analyze(&FunctionRef::new(&file, "f")).unwrap();
        let package = package::build(&graph, &target, CallArguments::new()).unwrap();
        let channel = Arc::new(FakeToolsChannel {
            inner: LocalChannel::new("fake", Duration::from_secs(30)),
            installs: AtomicUsize::new(0),
            fail_install,
            drop_on_unlock: AtomicBool::new(false),
        });
        (dir, target, channel, package)
    }

    #[tokio::test]
    async fn test_second_build_reuses_environment() {
        let (_dir, target, channel, package) = fixture(false);
        let builder = EnvironmentBuilder::new(target, channel.clone());

        let first = builder.build(&package).await.unwrap();
        assert!(!first.reused);
        assert_eq!(first.installed, vec!["numpy".to_string()]);
        assert!(first.archive.is_file());
        assert!(first.marker().is_file());

        let second = builder.build(&package).await.unwrap();
        assert!(second.reused);
        assert_eq!(second.env_dir, first.env_dir);
        assert_eq!(channel.installs.load(Ordering::SeqCst), 1);
        assert!(!first.env_dir.with_extension("lock").exists());
    }

    #[tokio::test]
    async fn test_lock_release_failure_keeps_the_build() {
        let (_dir, target, channel, package) = fixture(false);
        channel.drop_on_unlock.store(true, Ordering::SeqCst);
        let builder = EnvironmentBuilder::new(target, channel.clone());
        let handle = builder.build(&package).await.unwrap();
        assert!(!handle.reused);
        assert!(handle.marker().is_file());
        assert_eq!(channel.installs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_install_names_step_and_cleans_up() {
        let (_dir, target, channel, package) = fixture(true);
        let builder = EnvironmentBuilder::new(target, channel);
        let err = builder.build(&package).await.unwrap_err();
        match err {
            ClusterError::EnvironmentBuildFailed { step, reason } => {
                assert_eq!(step, BuildStep::Install);
                assert!(reason.contains("no matching distribution"));
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert!(!builder.env_dir(package.content_id()).exists());
    }

    #[tokio::test]
    async fn test_shared_mount_is_detected() {
        let (dir, target, channel, package) = fixture(false);
        let work = target.work_dir.clone();
        std::fs::create_dir_all(&work).unwrap();
        let shared = Arc::new(
            ExecutionTarget::clone(&target).with_shared_mount(SharedMount {
                local: work.clone(),
                remote: work.clone(),
            }),
        );
        let builder = EnvironmentBuilder::new(shared, channel);
        let handle = builder.build(&package).await.unwrap();
        assert!(handle.archive.is_file());
        assert!(!std::fs::read_dir(&work)
            .unwrap()
            .any(|e| e.unwrap().file_name().to_string_lossy().starts_with(".clusterfn-shared")));
        drop(dir);
    }
}
