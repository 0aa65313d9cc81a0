use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Failures of the command channel itself, as opposed to failures of the
/// commands it carries.
#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("Failed to connect SSH session or execute SSH command: {0}")]
    Ssh(#[from] openssh::Error),
    #[error("Failed to execute local command: {0}")]
    LocalCommand(#[from] std::io::Error),
    #[error("Command on {target} timed out after {timeout:?}")]
    Timeout { target: String, timeout: Duration },
    #[error("Channel to {0} is closed")]
    Closed(String),
    #[error("{0}")]
    Failed(String),
}

impl ChannelError {
    /// Connection-level failures that a retry may cure.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ChannelError::Ssh(_) | ChannelError::Timeout { .. } | ChannelError::Closed(_)
        )
    }
}

/// Filesystem accessor errors. `NotFound` means the path was checked and is
/// absent; `Connectivity` means it could not be checked at all.
#[derive(Error, Debug)]
pub enum FsError {
    #[error("No such file or directory: {0}")]
    NotFound(PathBuf),
    #[error("Not a directory: {0}")]
    NotADirectory(PathBuf),
    #[error("Could not reach target: {0}")]
    Connectivity(#[from] ChannelError),
    #[error("Invalid pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        source: globset::Error,
    },
    #[error("Unexpected output from `{command}`: {output}")]
    UnexpectedOutput { command: String, output: String },
    #[error("Local filesystem error: {0}")]
    Io(#[from] std::io::Error),
}

/// The environment build steps, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStep {
    WorkDir,
    Transfer,
    Interpreter,
    Install,
}

impl fmt::Display for BuildStep {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            BuildStep::WorkDir => "create working directory",
            BuildStep::Transfer => "transfer archive",
            BuildStep::Interpreter => "create interpreter environment",
            BuildStep::Install => "install dependencies",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("Source of function '{function}' is unavailable: {reason}")]
    SourceUnavailable { function: String, reason: String },
    #[error("Function '{function}' cannot be defined without unresolved name '{name}'")]
    UnresolvedDependency { function: String, name: String },
    #[error("Package is {size} bytes, exceeding the limit of {limit} bytes")]
    PackageTooLarge { size: u64, limit: u64 },
    #[error("Connectivity error: {0}")]
    Connectivity(#[from] ChannelError),
    #[error("Environment build failed at step '{step}': {reason}")]
    EnvironmentBuildFailed { step: BuildStep, reason: String },
    #[error("Filesystem error: {0}")]
    Fs(#[from] FsError),
    #[error("Submission rejected by {scheduler}: {reason}")]
    SubmissionRejected { scheduler: String, reason: String },
    #[error("Remote function raised {kind}: {message}")]
    RemoteExecutionFailed {
        kind: String,
        message: String,
        traceback: String,
    },
    #[error("Job {job} was lost: {reason}")]
    Lost { job: String, reason: String },
    #[error("Job was cancelled")]
    Cancelled,
    #[error("Orchestration failed: {0}")]
    Orchestration(String),
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("Failed to render template: {0}")]
    Template(#[from] handlebars::RenderError),
    #[error("Invalid template: {0}")]
    TemplateSyntax(#[from] handlebars::TemplateError),
    #[error("Failed to (de)serialize JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Local I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClusterError {
    /// True when the user's function itself raised, false when the machinery
    /// around it failed.
    pub fn is_remote_failure(&self) -> bool {
        matches!(self, ClusterError::RemoteExecutionFailed { .. })
    }

    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ClusterError::Connectivity(e) | ClusterError::Fs(FsError::Connectivity(e)) => {
                e.is_transient()
            }
            _ => false,
        }
    }

    pub(crate) fn build(step: BuildStep, reason: impl ToString) -> Self {
        ClusterError::EnvironmentBuildFailed {
            step,
            reason: reason.to_string(),
        }
    }
}

pub type Result<T, E = ClusterError> = std::result::Result<T, E>;
