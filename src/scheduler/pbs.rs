//! PBS (OpenPBS, PBS Pro, Torque) through `qsub`, `qstat` and `qdel`.

use std::sync::Arc;

use async_trait::async_trait;

use super::{best_effort, submit_with, SchedulerAdapter};
use crate::error::{ClusterError, Result};
use crate::job::{JobId, JobSpec, JobStatus};
use crate::session::{quote, quote_all, quote_path, Channel};
use crate::target::ResourceRequest;

pub struct PbsAdapter {
    channel: Arc<dyn Channel>,
}

impl PbsAdapter {
    pub fn new(channel: Arc<dyn Channel>) -> Self {
        Self { channel }
    }
}

fn submit_args(job: &JobSpec, resources: &ResourceRequest) -> Result<Vec<String>> {
    let mut select = format!("select=1:ncpus={}", resources.cores());
    if let Some(mib) = resources.memory_mib()? {
        select.push_str(&format!(":mem={}mb", mib));
    }
    let mut args = vec![
        "qsub".to_string(),
        "-N".to_string(),
        pbs_name(&job.name),
        "-o".to_string(),
        job.log().to_string_lossy().into_owned(),
        "-j".to_string(),
        "oe".to_string(),
        "-l".to_string(),
        select,
    ];
    if let Some(time) = resources.wall_time()? {
        args.push("-l".to_string());
        args.push(format!("walltime={}", time));
    }
    if let Some(queue) = &resources.queue {
        args.push("-q".to_string());
        args.push(queue.clone());
    }
    args.extend(resources.extra_args.iter().cloned());
    args.push(job.script.to_string_lossy().into_owned());
    Ok(args)
}

/// Job names are at most 15 characters and start with a letter on older
/// servers.
fn pbs_name(name: &str) -> String {
    let mut out: String = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .take(15)
        .collect();
    if !out.starts_with(|c: char| c.is_ascii_alphabetic()) {
        out.insert(0, 'j');
        out.truncate(15);
    }
    out
}

/// Reads `job_state` and `Exit_status` out of `qstat -f`.
fn parse_qstat(output: &str) -> JobStatus {
    let mut state = None;
    let mut exit_status = None;
    for line in output.lines() {
        if let Some((key, value)) = line.split_once('=') {
            match key.trim() {
                "job_state" => state = Some(value.trim().to_string()),
                "Exit_status" | "exit_status" => exit_status = value.trim().parse::<i32>().ok(),
                _ => {}
            }
        }
    }
    match state.as_deref() {
        Some("Q") | Some("H") | Some("W") | Some("T") | Some("S") => JobStatus::Pending,
        Some("R") | Some("E") | Some("B") => JobStatus::Running,
        // Finished, or already purged from the server.
        _ => match exit_status {
            Some(code) if code != 0 => JobStatus::Failed,
            _ => JobStatus::Completed,
        },
    }
}

#[async_trait]
impl SchedulerAdapter for PbsAdapter {
    fn name(&self) -> &str {
        "pbs"
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
        let id = submit_with(self.channel.as_ref(), self.name(), &script).await?;
        if id.is_empty() || id.contains(char::is_whitespace) {
            return Err(ClusterError::SubmissionRejected {
                scheduler: self.name().to_string(),
                reason: format!("unexpected qsub output '{}'", id),
            });
        }
        Ok(JobId::new(id, job.job_dir.clone()))
    }

    async fn poll_status(&self, job: &JobId) -> Result<JobStatus> {
        // `-x` includes finished jobs where the server keeps history.
        let script = format!(
            "qstat -f -x {id} 2>/dev/null || qstat -f {id} 2>/dev/null || true",
            id = quote(&job.id)
        );
        let output = self.channel.exec(&script).await?;
        Ok(parse_qstat(&output.stdout_lossy()))
    }

    async fn cancel(&self, job: &JobId) -> Result<()> {
        best_effort(self.channel.as_ref(), &format!("qdel {}", quote(&job.id))).await
    }
}
