//! Scheduler adapters.
//!
//! Every backend submits the same `job.sh` from a job directory and is
//! polled until it reports completion. Which adapter serves a target is
//! decided once, from its kind.

mod kubernetes;
mod pbs;
mod process;
mod sge;
mod slurm;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::error::{ClusterError, Result};
use crate::job::{Artifacts, JobId, JobSpec, JobStatus, ERROR_FILE, RESULT_FILE};
use crate::session::{Channel, CommandOutput};
use crate::target::{ExecutionTarget, TargetKind};

pub use kubernetes::KubernetesAdapter;
pub use pbs::PbsAdapter;
pub use process::ProcessAdapter;
pub use sge::SgeAdapter;
pub use slurm::SlurmAdapter;

#[async_trait]
pub trait SchedulerAdapter: Send + Sync {
    fn name(&self) -> &str;

    /// Channel to the machine the scheduler's commands run on.
    fn channel(&self) -> &Arc<dyn Channel>;

    async fn submit(&self, job: &JobSpec) -> Result<JobId>;

    async fn poll_status(&self, job: &JobId) -> Result<JobStatus>;

    /// Reads whichever of `result.json` and `error.json` exist.
    async fn fetch_artifacts(&self, job: &JobId) -> Result<Artifacts> {
        let channel = self.channel();
        let result = channel.read_file(&job.job_dir.join(RESULT_FILE)).await?;
        let error = channel.read_file(&job.job_dir.join(ERROR_FILE)).await?;
        Ok(Artifacts { result, error })
    }

    async fn cancel(&self, job: &JobId) -> Result<()>;
}

/// The adapters this crate ships.
pub enum Scheduler {
    Process(ProcessAdapter),
    Slurm(SlurmAdapter),
    Pbs(PbsAdapter),
    Sge(SgeAdapter),
    Kubernetes(KubernetesAdapter),
}

impl Scheduler {
    pub fn for_target(target: Arc<ExecutionTarget>, channel: Arc<dyn Channel>) -> Self {
        match target.kind {
            TargetKind::Local | TargetKind::Ssh => Scheduler::Process(ProcessAdapter::new(channel)),
            TargetKind::Slurm => Scheduler::Slurm(SlurmAdapter::new(channel)),
            TargetKind::Pbs => Scheduler::Pbs(PbsAdapter::new(channel)),
            TargetKind::Sge => Scheduler::Sge(SgeAdapter::new(channel)),
            TargetKind::Kubernetes => Scheduler::Kubernetes(KubernetesAdapter::new(target, channel)),
        }
    }

    fn adapter(&self) -> &dyn SchedulerAdapter {
        match self {
            Scheduler::Process(adapter) => adapter,
            Scheduler::Slurm(adapter) => adapter,
            Scheduler::Pbs(adapter) => adapter,
            Scheduler::Sge(adapter) => adapter,
            Scheduler::Kubernetes(adapter) => adapter,
        }
    }
}

#[async_trait]
impl SchedulerAdapter for Scheduler {
    fn name(&self) -> &str {
        self.adapter().name()
    }

    fn channel(&self) -> &Arc<dyn Channel> {
        self.adapter().channel()
    }

    async fn submit(&self, job: &JobSpec) -> Result<JobId> {
        self.adapter().submit(job).await
    }

    async fn poll_status(&self, job: &JobId) -> Result<JobStatus> {
        self.adapter().poll_status(job).await
    }

    async fn fetch_artifacts(&self, job: &JobId) -> Result<Artifacts> {
        self.adapter().fetch_artifacts(job).await
    }

    async fn cancel(&self, job: &JobId) -> Result<()> {
        self.adapter().cancel(job).await
    }
}

/// Runs a submission command; anything but a clean exit is a rejection.
async fn submit_with(channel: &dyn Channel, scheduler: &str, script: &str) -> Result<String> {
    debug!(scheduler, script, "Submitting");
    let output = channel.exec(script).await?;
    if !output.success() {
        return Err(rejected(scheduler, &output));
    }
    Ok(output.stdout_lossy().trim().to_string())
}

fn rejected(scheduler: &str, output: &CommandOutput) -> ClusterError {
    ClusterError::SubmissionRejected {
        scheduler: scheduler.to_string(),
        reason: output.describe_failure(),
    }
}

/// Runs a command whose failure is not fatal, such as a cancellation.
async fn best_effort(channel: &dyn Channel, script: &str) -> Result<()> {
    let output = channel.exec(script).await?;
    if !output.success() {
        debug!(script, error = %output.describe_failure(), "Command failed");
    }
    Ok(())
}
