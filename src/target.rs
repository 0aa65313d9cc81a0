//! Execution targets.
//!
//! A target says where a job runs: this machine, an SSH host, or a batch
//! scheduler reached through a login host. Targets are immutable once built
//! and are shared between calls as `Arc<ExecutionTarget>`.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use void::Void;

use crate::error::ClusterError;
use crate::serde::string_or_mapping;

/// Default working directory on remote machines.
const DEFAULT_REMOTE_WORK_DIR: &str = "/tmp/clusterfn";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    Local,
    Ssh,
    Slurm,
    Pbs,
    Sge,
    Kubernetes,
}

impl TargetKind {
    /// Whether jobs go through a batch scheduler rather than a plain process.
    pub fn is_scheduler(self) -> bool {
        !matches!(self, TargetKind::Local | TargetKind::Ssh)
    }
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            TargetKind::Local => "local",
            TargetKind::Ssh => "ssh",
            TargetKind::Slurm => "slurm",
            TargetKind::Pbs => "pbs",
            TargetKind::Sge => "sge",
            TargetKind::Kubernetes => "kubernetes",
        };
        f.write_str(name)
    }
}

/// SSH connection parameters. Authentication itself is left to `ssh`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Connection {
    pub host: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub identity_file: Option<PathBuf>,
}

impl Connection {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            user: None,
            port: None,
            identity_file: None,
        }
    }

    /// `user@host:port` form, for logs.
    pub fn destination(&self) -> String {
        let mut destination = String::new();
        if let Some(user) = &self.user {
            destination.push_str(user);
            destination.push('@');
        }
        destination.push_str(&self.host);
        if let Some(port) = self.port {
            destination.push_str(&format!(":{}", port));
        }
        destination
    }
}

impl FromStr for Connection {
    type Err = Void;

    /// Parses `[user@]host[:port]`. A port that is not a number is kept as
    /// part of the host name.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (user, rest) = match s.split_once('@') {
            Some((user, rest)) => (Some(user.to_string()), rest),
            None => (None, s),
        };
        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port)) => match port.parse::<u16>() {
                Ok(port) => (host.to_string(), Some(port)),
                Err(_) => (rest.to_string(), None),
            },
            None => (rest.to_string(), None),
        };
        Ok(Self {
            host,
            user,
            port,
            identity_file: None,
        })
    }
}

/// Resources requested from a scheduler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceRequest {
    #[serde(default)]
    pub cores: Option<u32>,
    /// Memory such as `512M`, `4G`, or `16GB`.
    #[serde(default)]
    pub memory: Option<String>,
    /// Wall time as `[D-]HH:MM:SS`, `MM:SS`, or plain minutes.
    #[serde(default)]
    pub time: Option<String>,
    /// Queue (PBS, SGE) or partition (SLURM).
    #[serde(default, alias = "partition")]
    pub queue: Option<String>,
    /// Kubernetes namespace.
    #[serde(default)]
    pub namespace: Option<String>,
    /// Container image for Kubernetes jobs.
    #[serde(default)]
    pub image: Option<String>,
    /// Persistent volume claim that holds the work directory (Kubernetes).
    #[serde(default)]
    pub volume_claim: Option<String>,
    /// Passed verbatim to the submission command.
    #[serde(default)]
    pub extra_args: Vec<String>,
}

impl ResourceRequest {
    pub fn cores(&self) -> u32 {
        self.cores.unwrap_or(1).max(1)
    }

    /// Fields set in `overrides` win over fields set here.
    pub fn merged(&self, overrides: &ResourceRequest) -> ResourceRequest {
        ResourceRequest {
            cores: overrides.cores.or(self.cores),
            memory: overrides.memory.clone().or_else(|| self.memory.clone()),
            time: overrides.time.clone().or_else(|| self.time.clone()),
            queue: overrides.queue.clone().or_else(|| self.queue.clone()),
            namespace: overrides
                .namespace
                .clone()
                .or_else(|| self.namespace.clone()),
            image: overrides.image.clone().or_else(|| self.image.clone()),
            volume_claim: overrides
                .volume_claim
                .clone()
                .or_else(|| self.volume_claim.clone()),
            extra_args: if overrides.extra_args.is_empty() {
                self.extra_args.clone()
            } else {
                overrides.extra_args.clone()
            },
        }
    }

    /// Requested memory in mebibytes, rounded up.
    pub fn memory_mib(&self) -> Result<Option<u64>, ClusterError> {
        self.memory.as_deref().map(parse_memory_mib).transpose()
    }

    /// Requested wall time in seconds.
    pub fn time_seconds(&self) -> Result<Option<u64>, ClusterError> {
        self.time.as_deref().map(parse_wall_time).transpose()
    }

    /// Wall time normalized to `HH:MM:SS`.
    pub fn wall_time(&self) -> Result<Option<String>, ClusterError> {
        Ok(self.time_seconds()?.map(|secs| {
            format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
        }))
    }
}

fn parse_memory_mib(memory: &str) -> Result<u64, ClusterError> {
    let trimmed = memory.trim();
    let split = trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(split);
    let value: f64 = number
        .parse()
        .map_err(|_| ClusterError::Config(format!("invalid memory request '{}'", memory)))?;
    let factor = match unit.trim().to_ascii_uppercase().as_str() {
        "" | "M" | "MB" | "MI" | "MIB" => 1.0,
        "K" | "KB" | "KI" | "KIB" => 1.0 / 1024.0,
        "G" | "GB" | "GI" | "GIB" => 1024.0,
        "T" | "TB" | "TI" | "TIB" => 1024.0 * 1024.0,
        _ => {
            return Err(ClusterError::Config(format!(
                "invalid memory unit in '{}'",
                memory
            )))
        }
    };
    Ok((value * factor).ceil() as u64)
}

fn parse_wall_time(time: &str) -> Result<u64, ClusterError> {
    let invalid = || ClusterError::Config(format!("invalid wall time '{}'", time));
    let (days, clock) = match time.trim().split_once('-') {
        Some((days, clock)) => (days.parse::<u64>().map_err(|_| invalid())?, clock),
        None => (0, time.trim()),
    };
    let parts = clock
        .split(':')
        .map(|p| p.parse::<u64>().map_err(|_| invalid()))
        .collect::<Result<Vec<_>, _>>()?;
    let units: &[u64] = match parts.len() {
        1 => &[60],
        2 => &[60, 1],
        3 => &[3600, 60, 1],
        _ => return Err(invalid()),
    };
    parts
        .iter()
        .zip(units)
        .chain(std::iter::once((&days, &86_400)))
        .try_fold(0u64, |total, (value, unit)| {
            value.checked_mul(*unit)?.checked_add(total)
        })
        .ok_or_else(|| ClusterError::Config(format!("wall time '{}' is too long", time)))
}

/// How the Python environment on the target is prepared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvironmentStrategy {
    /// `uv` if the target has it, otherwise `python -m venv`.
    #[default]
    Auto,
    Uv,
    Venv,
    /// Use the interpreter as-is and install nothing into a venv.
    System,
}

/// A directory visible both here and on the target.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SharedMount {
    pub local: PathBuf,
    pub remote: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TargetOptions {
    /// Keep job and environment directories after the job, for debugging.
    pub keep_remote: bool,
    /// Keep provisioned environments so later calls with the same content
    /// identifier skip provisioning.
    pub cache_environments: bool,
    pub max_package_bytes: u64,
    pub command_timeout_secs: u64,
    pub poll_interval_ms: u64,
    pub max_poll_interval_ms: u64,
    pub job_timeout_secs: u64,
}

impl Default for TargetOptions {
    fn default() -> Self {
        Self {
            keep_remote: false,
            cache_environments: true,
            max_package_bytes: 64 * 1024 * 1024,
            command_timeout_secs: 300,
            poll_interval_ms: 500,
            max_poll_interval_ms: 30_000,
            job_timeout_secs: 24 * 3600,
        }
    }
}

impl TargetOptions {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn max_poll_interval(&self) -> Duration {
        Duration::from_millis(self.max_poll_interval_ms.max(self.poll_interval_ms))
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionTarget {
    pub name: String,
    pub kind: TargetKind,
    /// `None` means commands run on this machine.
    pub connection: Option<Connection>,
    /// Root of all environments and job directories on the target.
    pub work_dir: PathBuf,
    /// Default resources, overridable per call.
    pub resources: ResourceRequest,
    /// Interpreter command on the target.
    pub python: String,
    pub environment: EnvironmentStrategy,
    pub shared_mounts: Vec<SharedMount>,
    pub options: TargetOptions,
}

impl ExecutionTarget {
    pub fn local(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            name: "local".to_string(),
            kind: TargetKind::Local,
            connection: None,
            work_dir: work_dir.into(),
            resources: ResourceRequest::default(),
            python: "python3".to_string(),
            environment: EnvironmentStrategy::default(),
            shared_mounts: vec![],
            options: TargetOptions::default(),
        }
    }

    pub fn ssh(connection: Connection, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            name: connection.host.clone(),
            kind: TargetKind::Ssh,
            connection: Some(connection),
            ..Self::local(work_dir)
        }
    }

    /// A scheduler target. Without a connection, the scheduler's commands
    /// run on this machine.
    pub fn scheduler(
        kind: TargetKind,
        connection: Option<Connection>,
        work_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: kind.to_string(),
            kind,
            connection,
            ..Self::local(work_dir)
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_resources(mut self, resources: ResourceRequest) -> Self {
        self.resources = resources;
        self
    }

    pub fn with_python(mut self, python: impl Into<String>) -> Self {
        self.python = python.into();
        self
    }

    pub fn with_environment(mut self, environment: EnvironmentStrategy) -> Self {
        self.environment = environment;
        self
    }

    pub fn with_options(mut self, options: TargetOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_shared_mount(mut self, mount: SharedMount) -> Self {
        self.shared_mounts.push(mount);
        self
    }

    /// Whether filesystem operations must go through the channel.
    pub fn is_remote(&self) -> bool {
        self.kind != TargetKind::Local
    }

    /// Resolves a user path against the working directory.
    pub fn resolve(&self, path: impl AsRef<Path>) -> PathBuf {
        self.work_dir.join(path)
    }

    pub fn validate(&self) -> Result<(), ClusterError> {
        match (self.kind, &self.connection) {
            (TargetKind::Local, Some(_)) => {
                return Err(ClusterError::Config(format!(
                    "target '{}' is local but has connection parameters",
                    self.name
                )))
            }
            (TargetKind::Ssh, None) => {
                return Err(ClusterError::Config(format!(
                    "target '{}' is an SSH target without a host",
                    self.name
                )))
            }
            _ => {}
        }
        if self.is_remote() && !self.work_dir.is_absolute() {
            return Err(ClusterError::Config(format!(
                "target '{}' needs an absolute work_dir, got {}",
                self.name,
                self.work_dir.display()
            )));
        }
        if self.kind == TargetKind::Kubernetes && self.resources.volume_claim.is_none() {
            return Err(ClusterError::Config(format!(
                "kubernetes target '{}' needs resources.volume_claim for its work_dir",
                self.name
            )));
        }
        self.resources.memory_mib()?;
        self.resources.time_seconds()?;
        Ok(())
    }
}

impl fmt::Display for ExecutionTarget {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.connection {
            Some(connection) => write!(
                f,
                "[{} ({} via {})]",
                self.name,
                self.kind,
                connection.destination()
            ),
            None => write!(f, "[{} ({})]", self.name, self.kind),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TargetSpec(#[serde(deserialize_with = "string_or_mapping")] TargetSpecInner);

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct TargetSpecInner {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    kind: Option<TargetKind>,
    #[serde(default)]
    host: Option<String>,
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    port: Option<u16>,
    #[serde(default)]
    identity_file: Option<PathBuf>,
    #[serde(default)]
    work_dir: Option<String>,
    #[serde(default)]
    resources: ResourceRequest,
    #[serde(default)]
    python: Option<String>,
    #[serde(default)]
    environment: EnvironmentStrategy,
    #[serde(default)]
    shared_mounts: Vec<SharedMount>,
    #[serde(default)]
    options: TargetOptions,
    /// Extra values available to the `work_dir` template.
    #[serde(default)]
    params: HashMap<String, String>,
}

impl FromStr for TargetSpecInner {
    type Err = Void;

    /// A bare string is either `local` or an SSH destination.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "local" {
            return Ok(Self {
                kind: Some(TargetKind::Local),
                ..Self::default()
            });
        }
        let connection = Connection::from_str(s)?;
        Ok(Self {
            kind: Some(TargetKind::Ssh),
            host: Some(connection.host),
            user: connection.user,
            port: connection.port,
            ..Self::default()
        })
    }
}

impl TargetSpecInner {
    fn into_target(
        self,
        registry: &handlebars::Handlebars,
    ) -> Result<ExecutionTarget, ClusterError> {
        let kind = self.kind.unwrap_or(if self.host.is_some() {
            TargetKind::Ssh
        } else {
            TargetKind::Local
        });
        let connection = self.host.clone().map(|host| Connection {
            host,
            user: self.user.clone(),
            port: self.port,
            identity_file: self.identity_file.clone(),
        });
        let name = self
            .name
            .clone()
            .or_else(|| self.host.clone())
            .unwrap_or_else(|| kind.to_string());

        // Fill in the work directory template.
        let mut params = self.params.clone();
        params.insert("name".to_string(), name.clone());
        if let Some(host) = &self.host {
            params.insert("host".to_string(), host.clone());
        }
        let user = self
            .user
            .clone()
            .or_else(|| std::env::var("USER").ok())
            .unwrap_or_default();
        params.insert("user".to_string(), user);
        let work_dir = match &self.work_dir {
            Some(template) => PathBuf::from(registry.render_template(template, &params)?),
            None if connection.is_none() => std::env::temp_dir().join("clusterfn"),
            None => PathBuf::from(DEFAULT_REMOTE_WORK_DIR),
        };

        let target = ExecutionTarget {
            name,
            kind,
            connection,
            work_dir,
            resources: self.resources,
            python: self.python.unwrap_or_else(|| "python3".to_string()),
            environment: self.environment,
            shared_mounts: self.shared_mounts,
            options: self.options,
        };
        target.validate()?;
        Ok(target)
    }
}

/// Parses a targets file.
pub fn parse_targets(yaml: &str) -> Result<Vec<ExecutionTarget>, ClusterError> {
    let specs: Vec<TargetSpec> = serde_yaml::from_str(yaml)
        .map_err(|e| ClusterError::Config(format!("failed to parse targets: {}", e)))?;
    let mut registry = handlebars::Handlebars::new();
    registry.register_escape_fn(handlebars::no_escape);
    handlebars_misc_helpers::register(&mut registry);
    specs
        .into_iter()
        .map(|TargetSpec(spec)| spec.into_target(&registry))
        .collect()
}

/// Loads every target in a targets file.
pub fn load_targets(targets_file: &Path) -> Result<Vec<ExecutionTarget>, ClusterError> {
    let yaml = std::fs::read_to_string(targets_file)?;
    let targets = parse_targets(&yaml)?;
    tracing::debug!(file = %targets_file.display(), count = targets.len(), "Targets loaded");
    Ok(targets)
}

/// Picks a target by name; the first one when no name is given.
pub fn select_target(
    targets: Vec<ExecutionTarget>,
    name: Option<&str>,
) -> Result<ExecutionTarget, ClusterError> {
    match name {
        Some(name) => targets
            .into_iter()
            .find(|target| target.name == name)
            .ok_or_else(|| ClusterError::Config(format!("no target named '{}'", name))),
        None => targets
            .into_iter()
            .next()
            .ok_or_else(|| ClusterError::Config("the targets file is empty".to_string())),
    }
}
