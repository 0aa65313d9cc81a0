//! SLURM through `sbatch`, `squeue`, `sacct` and `scancel`.

use std::sync::Arc;

use async_trait::async_trait;

use super::{best_effort, submit_with, SchedulerAdapter};
use crate::error::{ClusterError, Result};
use crate::job::{JobId, JobSpec, JobStatus};
use crate::session::{quote, quote_all, quote_path, Channel};
use crate::target::ResourceRequest;

pub struct SlurmAdapter {
    channel: Arc<dyn Channel>,
}

impl SlurmAdapter {
    pub fn new(channel: Arc<dyn Channel>) -> Self {
        Self { channel }
    }
}

fn submit_args(job: &JobSpec, resources: &ResourceRequest) -> Result<Vec<String>> {
    let mut args = vec![
        "sbatch".to_string(),
        "--parsable".to_string(),
        format!("--job-name={}", job.name),
        format!("--output={}", job.log().display()),
        format!("--chdir={}", job.job_dir.display()),
        format!("--cpus-per-task={}", resources.cores()),
    ];
    if let Some(mib) = resources.memory_mib()? {
        args.push(format!("--mem={}M", mib));
    }
    if let Some(time) = resources.wall_time()? {
        args.push(format!("--time={}", time));
    }
    if let Some(partition) = &resources.queue {
        args.push(format!("--partition={}", partition));
    }
    args.extend(resources.extra_args.iter().cloned());
    args.push(job.script.to_string_lossy().into_owned());
    Ok(args)
}

/// `--parsable` prints `id` or `id;cluster`.
fn parse_job_id(stdout: &str) -> Option<&str> {
    let id = stdout.trim().split(';').next()?.trim();
    (!id.is_empty() && id.bytes().all(|b| b.is_ascii_digit() || b == b'_')).then_some(id)
}

/// State of a job still known to `squeue`.
fn queue_state(state: &str) -> Option<JobStatus> {
    match state.trim() {
        "" => None,
        "PENDING" | "CONFIGURING" | "REQUEUED" | "RESV_DEL_HOLD" | "SUSPENDED" => Some(JobStatus::Pending),
        "RUNNING" | "COMPLETING" | "STAGE_OUT" | "SIGNALING" => Some(JobStatus::Running),
        "COMPLETED" => Some(JobStatus::Completed),
        _ => Some(JobStatus::Failed),
    }
}

/// Final state from `sacct`. Unknown jobs count as completed so that the
/// artifacts decide.
fn accounting_state(output: &str) -> JobStatus {
    let state = output.lines().next().unwrap_or_default().trim();
    // `CANCELLED by 1000`
    match state.split_whitespace().next() {
        None | Some("COMPLETED") => JobStatus::Completed,
        Some("PENDING") => JobStatus::Pending,
        Some("RUNNING") | Some("COMPLETING") => JobStatus::Running,
        Some(_) => JobStatus::Failed,
    }
}

#[async_trait]
impl SchedulerAdapter for SlurmAdapter {
    fn name(&self) -> &str {
        "slurm"
    }

    fn channel(&self) -> &Arc<dyn Channel> {
        &self.channel
    }

    async fn submit(&self, job: &JobSpec) -> Result<JobId> {
        let args = submit_args(job, &job.resources)?;
        let script = format!(
            "cd {} && {}",
            quote_path(&job.job_dir),
            quote_all(&args)
        );
        let stdout = submit_with(self.channel.as_ref(), self.name(), &script).await?;
        let id = parse_job_id(&stdout).ok_or_else(|| ClusterError::SubmissionRejected {
            scheduler: self.name().to_string(),
            reason: format!("unexpected sbatch output '{}'", stdout),
        })?;
        Ok(JobId::new(id, job.job_dir.clone()))
    }

    async fn poll_status(&self, job: &JobId) -> Result<JobStatus> {
        let queued = self
            .channel
            .exec(&format!("squeue -h -j {} -o %T 2>/dev/null", quote(&job.id)))
            .await?;
        if let Some(status) = queue_state(&queued.stdout_lossy()) {
            return Ok(status);
        }
        let accounted = self
            .channel
            .exec(&format!("sacct -n -X -P -j {} -o State 2>/dev/null", quote(&job.id)))
            .await?;
        Ok(accounting_state(&accounted.stdout_lossy()))
    }

    async fn cancel(&self, job: &JobId) -> Result<()> {
        best_effort(self.channel.as_ref(), &format!("scancel {}", quote(&job.id))).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_submit_args() {
        let resources = ResourceRequest {
            cores: Some(4),
            memory: Some("2G".to_string()),
            time: Some("90".to_string()),
            queue: Some("short".to_string()),
            extra_args: vec!["--gres=gpu:1".to_string()],
            ..Default::default()
        };
        let job = JobSpec::new("f-1", PathBuf::from("/work/jobs/f-1"), resources.clone());
        let args = submit_args(&job, &resources).unwrap();
        assert_eq!(
            args,
            vec![
                "sbatch",
                "--parsable",
                "--job-name=f-1",
                "--output=/work/jobs/f-1/scheduler.log",
                "--chdir=/work/jobs/f-1",
                "--cpus-per-task=4",
                "--mem=2048M",
                "--time=01:30:00",
                "--partition=short",
                "--gres=gpu:1",
                "/work/jobs/f-1/job.sh",
            ]
        );
    }

    #[test]
    fn test_parse_job_id() {
        assert_eq!(parse_job_id("12345\n"), Some("12345"));
        assert_eq!(parse_job_id("12345;cluster\n"), Some("12345"));
        assert_eq!(parse_job_id("Submitted batch job 1"), None);
        assert_eq!(parse_job_id(""), None);
    }

    #[test]
    fn test_states() {
        assert_eq!(queue_state("PENDING\n"), Some(JobStatus::Pending));
        assert_eq!(queue_state("RUNNING\n"), Some(JobStatus::Running));
        assert_eq!(queue_state(""), None);
        assert_eq!(accounting_state("COMPLETED\n"), JobStatus::Completed);
        assert_eq!(accounting_state("CANCELLED by 1000\n"), JobStatus::Failed);
        assert_eq!(accounting_state("OUT_OF_MEMORY\n"), JobStatus::Failed);
        assert_eq!(accounting_state(""), JobStatus::Completed);
    }
}
