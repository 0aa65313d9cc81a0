//! Grid Engine through `qsub -terse`, `qstat`, `qacct` and `qdel`.

use std::sync::Arc;

use async_trait::async_trait;

use super::{best_effort, submit_with, SchedulerAdapter};
use crate::error::{ClusterError, Result};
use crate::job::{JobId, JobSpec, JobStatus};
use crate::session::{quote, quote_all, quote_path, Channel};
use crate::target::ResourceRequest;

/// Parallel environment used for multi-core jobs.
const PARALLEL_ENVIRONMENT: &str = "smp";

pub struct SgeAdapter {
    channel: Arc<dyn Channel>,
}

impl SgeAdapter {
    pub fn new(channel: Arc<dyn Channel>) -> Self {
        Self { channel }
    }
}

fn submit_args(job: &JobSpec, resources: &ResourceRequest) -> Result<Vec<String>> {
    let mut args: Vec<String> = [
        "qsub",
        "-terse",
        "-cwd",
        "-S",
        "/bin/sh",
        "-j",
        "y",
        "-N",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    args.push(job.name.clone());
    args.push("-o".to_string());
    args.push(job.log().to_string_lossy().into_owned());
    if resources.cores() > 1 {
        args.push("-pe".to_string());
        args.push(PARALLEL_ENVIRONMENT.to_string());
        args.push(resources.cores().to_string());
    }
    if let Some(mib) = resources.memory_mib()? {
        args.push("-l".to_string());
        args.push(format!("h_vmem={}M", mib));
    }
    if let Some(time) = resources.wall_time()? {
        args.push("-l".to_string());
        args.push(format!("h_rt={}", time));
    }
    if let Some(queue) = &resources.queue {
        args.push("-q".to_string());
        args.push(queue.clone());
    }
    args.extend(resources.extra_args.iter().cloned());
    args.push(job.script.to_string_lossy().into_owned());
    Ok(args)
}

/// The state column of this job's row in `qstat`, if it is listed.
fn qstat_state(output: &str, id: &str) -> Option<JobStatus> {
    let state = output.lines().find_map(|line| {
        let mut fields = line.split_whitespace();
        if fields.next()? != id {
            return None;
        }
        // job-ID prior name user state
        fields.nth(3)
    })?;
    Some(if state.contains('E') {
        JobStatus::Failed
    } else if state.contains('r') || state.contains('t') {
        JobStatus::Running
    } else {
        JobStatus::Pending
    })
}

/// Final state from `qacct -j`. Without accounting, completion is assumed
/// and the artifacts decide.
fn qacct_state(output: &str) -> JobStatus {
    let failed = output.lines().any(|line| {
        let mut fields = line.split_whitespace();
        match (fields.next(), fields.next()) {
            (Some("exit_status"), Some(code)) | (Some("failed"), Some(code)) => code != "0",
            _ => false,
        }
    });
    if failed {
        JobStatus::Failed
    } else {
        JobStatus::Completed
    }
}

#[async_trait]
impl SchedulerAdapter for SgeAdapter {
    fn name(&self) -> &str {
        "sge"
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
        // Array jobs print `id.1-10:1`.
        let id = stdout.split('.').next().unwrap_or_default().trim().to_string();
        if id.is_empty() || !id.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ClusterError::SubmissionRejected {
                scheduler: self.name().to_string(),
                reason: format!("unexpected qsub output '{}'", stdout),
            });
        }
        Ok(JobId::new(id, job.job_dir.clone()))
    }

    async fn poll_status(&self, job: &JobId) -> Result<JobStatus> {
        let listed = self.channel.exec("qstat 2>/dev/null").await?;
        if let Some(status) = qstat_state(&listed.stdout_lossy(), &job.id) {
            return Ok(status);
        }
        let accounted = self
            .channel
            .exec(&format!("qacct -j {} 2>/dev/null", quote(&job.id)))
            .await?;
        Ok(qacct_state(&accounted.stdout_lossy()))
    }

    async fn cancel(&self, job: &JobId) -> Result<()> {
        best_effort(self.channel.as_ref(), &format!("qdel {}", quote(&job.id))).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    const QSTAT: &str = "\
job-ID  prior   name       user         state submit/start at     queue                          slots ja-task-ID
-----------------------------------------------------------------------------------------------------------------
    101 0.55500 f-1        alice        r     01/01/2025 10:00:00 all.q@node01                       1
    102 0.00000 f-2        alice        qw    01/01/2025 10:00:01                                    1
    103 0.00000 f-3        alice        Eqw   01/01/2025 10:00:02                                    1
";

    #[test]
    fn test_qstat_state() {
        assert_eq!(qstat_state(QSTAT, "101"), Some(JobStatus::Running));
        assert_eq!(qstat_state(QSTAT, "102"), Some(JobStatus::Pending));
        assert_eq!(qstat_state(QSTAT, "103"), Some(JobStatus::Failed));
        assert_eq!(qstat_state(QSTAT, "104"), None);
    }

    #[test]
    fn test_qacct_state() {
        assert_eq!(qacct_state("failed       0\nexit_status  0\n"), JobStatus::Completed);
        assert_eq!(qacct_state("failed       0\nexit_status  1\n"), JobStatus::Failed);
        assert_eq!(qacct_state("failed       100 : assumedly after job\nexit_status  0\n"), JobStatus::Failed);
        assert_eq!(qacct_state(""), JobStatus::Completed);
    }

    #[test]
    fn test_single_core_jobs_skip_parallel_environment() {
        let resources = ResourceRequest::default();
        let job = JobSpec::new("f-1", PathBuf::from("/w/jobs/f-1"), resources.clone());
        let args = submit_args(&job, &resources).unwrap();
        assert!(!args.contains(&"-pe".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("/w/jobs/f-1/job.sh"));

        let parallel = ResourceRequest {
            cores: Some(4),
            ..Default::default()
        };
        let args = submit_args(&job, &parallel).unwrap();
        let pe = args.iter().position(|a| a == "-pe").unwrap();
        assert_eq!(args[pe + 1..pe + 3], ["smp".to_string(), "4".to_string()]);
    }
}
