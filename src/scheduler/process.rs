//! Jobs as background processes, on this machine or an SSH host.

use std::sync::Arc;

use async_trait::async_trait;

use super::{best_effort, submit_with, SchedulerAdapter};
use crate::error::{ClusterError, Result};
use crate::job::{JobId, JobSpec, JobStatus, EXIT_CODE_FILE};
use crate::session::{quote_path, Channel};

pub struct ProcessAdapter {
    channel: Arc<dyn Channel>,
}

impl ProcessAdapter {
    pub fn new(channel: Arc<dyn Channel>) -> Self {
        Self { channel }
    }
}

#[async_trait]
impl SchedulerAdapter for ProcessAdapter {
    fn name(&self) -> &str {
        "process"
    }

    fn channel(&self) -> &Arc<dyn Channel> {
        &self.channel
    }

    async fn submit(&self, job: &JobSpec) -> Result<JobId> {
        let script = format!(
            "cd {} && nohup sh {} > {} 2>&1 < /dev/null & echo $!",
            quote_path(&job.job_dir),
            quote_path(&job.script),
            quote_path(&job.log()),
        );
        let pid = submit_with(self.channel.as_ref(), self.name(), &script).await?;
        if pid.is_empty() || !pid.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ClusterError::SubmissionRejected {
                scheduler: self.name().to_string(),
                reason: format!("expected a process id, got '{}'", pid),
            });
        }
        Ok(JobId::new(pid, job.job_dir.clone()))
    }

    async fn poll_status(&self, job: &JobId) -> Result<JobStatus> {
        // The exit code file is checked first: an exited child that was
        // never reaped still answers `kill -0`.
        let exit_code = quote_path(&job.job_dir.join(EXIT_CODE_FILE));
        let script = format!(
            "if [ -f {f} ]; then cat {f}; elif kill -0 {pid} 2>/dev/null; then echo running; else echo gone; fi",
            f = exit_code,
            pid = job.id
        );
        let output = self.channel.exec(&script).await?;
        Ok(parse_status(&output.stdout_lossy()))
    }

    async fn cancel(&self, job: &JobId) -> Result<()> {
        let script = format!(
            "pkill -TERM -P {pid} 2>/dev/null; kill -TERM {pid} 2>/dev/null; true",
            pid = job.id
        );
        best_effort(self.channel.as_ref(), &script).await
    }
}

fn parse_status(output: &str) -> JobStatus {
    match output.trim() {
        "running" => JobStatus::Running,
        "0" => JobStatus::Completed,
        _ => JobStatus::Failed,
    }
}
