//! Jobs: what is submitted, how its state evolves, and what it leaves behind.

use std::fmt;
use std::path::PathBuf;

use serde::Deserialize;
use serde_json::Value;

use crate::error::{BuildStep, ClusterError, Result};
use crate::target::ResourceRequest;

/// Per-job copy of the package manifest, carrying the call's arguments.
pub const JOB_MANIFEST: &str = "manifest.json";
pub const RESULT_FILE: &str = "result.json";
pub const ERROR_FILE: &str = "error.json";
/// Written by `job.sh` with the bootstrap's exit status.
pub const EXIT_CODE_FILE: &str = ".exit_code";
/// Scheduler-side output of the job script.
pub const SCHEDULER_LOG: &str = "scheduler.log";

/// Error kind reported by in-job provisioning.
pub const ENVIRONMENT_FAILURE_KIND: &str = "EnvironmentBuildFailed";

/// Everything an adapter needs to submit one job.
#[derive(Debug, Clone)]
pub struct JobSpec {
    /// Unique, scheduler-safe name; also the job directory's name.
    pub name: String,
    pub job_dir: PathBuf,
    /// Path of `job.sh` inside the job directory.
    pub script: PathBuf,
    pub resources: ResourceRequest,
}

impl JobSpec {
    pub fn new(name: impl Into<String>, job_dir: PathBuf, resources: ResourceRequest) -> Self {
        let script = job_dir.join("job.sh");
        Self {
            name: name.into(),
            job_dir,
            script,
            resources,
        }
    }

    pub fn log(&self) -> PathBuf {
        self.job_dir.join(SCHEDULER_LOG)
    }
}

/// Identifier the scheduler assigned, plus where the job's artifacts live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobId {
    pub id: String,
    pub job_dir: PathBuf,
}

impl JobId {
    pub fn new(id: impl Into<String>, job_dir: PathBuf) -> Self {
        Self {
            id: id.into(),
            job_dir,
        }
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.id)
    }
}

/// What a scheduler reports about a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// The orchestrator's view of a job.
///
/// `Submitted -> Running -> {Succeeded, Failed}`, and `Lost` from any
/// non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Submitted,
    Running,
    Succeeded,
    Failed,
    Lost,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed | JobState::Lost)
    }

    /// Applies a status report. Terminal states never change, and a
    /// running job never goes back to submitted.
    pub fn advance(self, status: JobStatus) -> JobState {
        if self.is_terminal() {
            return self;
        }
        match status {
            JobStatus::Pending => self,
            JobStatus::Running => JobState::Running,
            JobStatus::Completed => JobState::Succeeded,
            JobStatus::Failed => JobState::Failed,
        }
    }

    pub fn lose(self) -> JobState {
        if self.is_terminal() {
            self
        } else {
            JobState::Lost
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            JobState::Submitted => "submitted",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Lost => "lost",
        };
        f.write_str(name)
    }
}

/// Outcome of the remote function.
#[derive(Debug, Clone, PartialEq)]
pub enum JobResult {
    Success(Value),
    Failure {
        kind: String,
        message: String,
        traceback: String,
    },
}

impl JobResult {
    /// The returned value, or the remote failure as an error.
    pub fn into_value(self) -> Result<Value> {
        match self {
            JobResult::Success(value) => Ok(value),
            JobResult::Failure { kind, message, .. } if kind == ENVIRONMENT_FAILURE_KIND => {
                Err(ClusterError::build(BuildStep::Install, message))
            }
            JobResult::Failure {
                kind,
                message,
                traceback,
            } => Err(ClusterError::RemoteExecutionFailed {
                kind,
                message,
                traceback,
            }),
        }
    }
}

#[derive(Deserialize)]
struct ResultArtifact {
    value: Value,
}

#[derive(Deserialize)]
struct ErrorArtifact {
    kind: String,
    message: String,
    #[serde(default)]
    traceback: String,
}

/// Raw contents of the artifact files, if present.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Artifacts {
    pub result: Option<Vec<u8>>,
    pub error: Option<Vec<u8>>,
}

impl Artifacts {
    /// Exactly one artifact must exist.
    pub fn decode(self, job: &JobId) -> Result<JobResult> {
        match (self.result, self.error) {
            (Some(result), None) => {
                let artifact: ResultArtifact = serde_json::from_slice(&result).map_err(|e| {
                    ClusterError::Orchestration(format!("job {} wrote an unreadable {}: {}", job, RESULT_FILE, e))
                })?;
                Ok(JobResult::Success(artifact.value))
            }
            (None, Some(error)) => {
                let artifact: ErrorArtifact = serde_json::from_slice(&error).map_err(|e| {
                    ClusterError::Orchestration(format!("job {} wrote an unreadable {}: {}", job, ERROR_FILE, e))
                })?;
                Ok(JobResult::Failure {
                    kind: artifact.kind,
                    message: artifact.message,
                    traceback: artifact.traceback,
                })
            }
            (None, None) => Err(ClusterError::Lost {
                job: job.to_string(),
                reason: format!("neither {} nor {} was written", RESULT_FILE, ERROR_FILE),
            }),
            (Some(_), Some(_)) => Err(ClusterError::Orchestration(format!(
                "job {} wrote both {} and {}",
                job, RESULT_FILE, ERROR_FILE
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn job() -> JobId {
        JobId::new("42", PathBuf::from("/work/jobs/f-1"))
    }

    #[test]
    fn test_state_transitions() {
        let state = JobState::Submitted.advance(JobStatus::Pending);
        assert_eq!(state, JobState::Submitted);
        let state = state.advance(JobStatus::Running);
        assert_eq!(state, JobState::Running);
        assert_eq!(state.advance(JobStatus::Pending), JobState::Running);
        let done = state.advance(JobStatus::Completed);
        assert_eq!(done, JobState::Succeeded);
        assert_eq!(done.advance(JobStatus::Failed), JobState::Succeeded);
        assert_eq!(done.lose(), JobState::Succeeded);
        assert_eq!(JobState::Running.lose(), JobState::Lost);
        assert_eq!(JobState::Submitted.advance(JobStatus::Failed), JobState::Failed);
    }

    #[test]
    fn test_decode_success() {
        let artifacts = Artifacts {
            result: Some(br#"{"value": [1, 2]}"#.to_vec()),
            error: None,
        };
        assert_eq!(artifacts.decode(&job()).unwrap(), JobResult::Success(json!([1, 2])));
    }

    #[test]
    fn test_decode_failure_is_remote() {
        let artifacts = Artifacts {
            result: None,
            error: Some(
                br#"{"kind": "ValueError", "message": "bad input", "traceback": "Traceback (most recent call last)"}"#
                    .to_vec(),
            ),
        };
        let err = artifacts.decode(&job()).unwrap().into_value().unwrap_err();
        assert!(err.is_remote_failure());
        match err {
            ClusterError::RemoteExecutionFailed { kind, traceback, .. } => {
                assert_eq!(kind, "ValueError");
                assert!(!traceback.is_empty());
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_in_job_provisioning_failure() {
        let result = JobResult::Failure {
            kind: ENVIRONMENT_FAILURE_KIND.to_string(),
            message: "install dependencies failed".to_string(),
            traceback: String::new(),
        };
        let err = result.into_value().unwrap_err();
        assert!(matches!(
            err,
            ClusterError::EnvironmentBuildFailed {
                step: BuildStep::Install,
                ..
            }
        ));
    }

    #[test]
    fn test_missing_or_conflicting_artifacts() {
        let lost = Artifacts::default().decode(&job()).unwrap_err();
        assert!(matches!(lost, ClusterError::Lost { .. }));
        let both = Artifacts {
            result: Some(b"{}".to_vec()),
            error: Some(b"{}".to_vec()),
        };
        assert!(matches!(
            both.decode(&job()).unwrap_err(),
            ClusterError::Orchestration(_)
        ));
    }
}
