//! Runs jobs against a provisioned environment and reconciles their results.

pub mod partition;

use std::path::Path;
use std::sync::Arc;

use futures::future::join_all;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::bootstrap::Renderer;
use crate::environment::RemoteEnvironmentHandle;
use crate::error::{ClusterError, Result};
use crate::job::{JobId, JobSpec, JobState};
use crate::package::{ArgumentSlot, PackageManifest, Partition};
use crate::scheduler::SchedulerAdapter;
use crate::session::{quote_path, Channel};
use crate::sync::Cancellation;
use crate::target::{ExecutionTarget, ResourceRequest};

/// Consecutive failed polls tolerated before the connection error is
/// returned to the caller.
const MAX_POLL_FAILURES: u32 = 3;

/// How a call's top-level loop is spread over jobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopPartitioning {
    pub parameter: String,
    pub slot: ArgumentSlot,
    pub partitions: usize,
}

#[derive(Clone)]
pub struct Orchestrator {
    target: Arc<ExecutionTarget>,
    channel: Arc<dyn Channel>,
    scheduler: Arc<dyn SchedulerAdapter>,
    renderer: Arc<Renderer>,
    cancellation: Cancellation,
}

impl Orchestrator {
    pub fn new(
        target: Arc<ExecutionTarget>,
        channel: Arc<dyn Channel>,
        scheduler: Arc<dyn SchedulerAdapter>,
    ) -> Result<Self> {
        Ok(Self {
            target,
            channel,
            scheduler,
            renderer: Arc::new(Renderer::new()?),
            cancellation: Cancellation::new(),
        })
    }

    /// Observe `cancellation` while jobs are pending.
    pub fn with_cancellation(mut self, cancellation: Cancellation) -> Self {
        self.cancellation = cancellation;
        self
    }

    /// Runs one job with the manifest's own arguments.
    pub async fn run(
        &self,
        env: &RemoteEnvironmentHandle,
        manifest: &PackageManifest,
        resources: &ResourceRequest,
    ) -> Result<Value> {
        self.run_job(env, manifest, resources, &Cancellation::new())
            .await
    }

    /// Runs one job per slice of the partitioned argument and concatenates
    /// their lists in slice order.
    pub async fn run_partitioned(
        &self,
        env: &RemoteEnvironmentHandle,
        manifest: &PackageManifest,
        resources: &ResourceRequest,
        partitioning: &LoopPartitioning,
    ) -> Result<Value> {
        let items = match manifest.arguments.get(&partitioning.slot) {
            Some(Value::Array(items)) => items,
            _ => {
                return Err(ClusterError::Config(format!(
                    "argument '{}' must be a list to be partitioned",
                    partitioning.parameter
                )))
            }
        };
        let slices = partition::split(items, partitioning.partitions);
        let count = slices.len();
        info!(
            function = %manifest.function,
            items = items.len(),
            partitions = count,
            "Running partitioned loop"
        );

        // Completions arrive in whatever order the jobs finish.
        let abort = Cancellation::new();
        let (completion_tx, completion_rx) = flume::unbounded::<(usize, Result<Value>)>();
        let mut tasks = Vec::with_capacity(count);
        for (index, slice) in slices.into_iter().enumerate() {
            let job_manifest = manifest.for_job(
                manifest
                    .arguments
                    .replaced(&partitioning.slot, Value::Array(slice)),
                Some(Partition {
                    index,
                    count,
                    parameter: partitioning.parameter.clone(),
                }),
            );
            let this = self.clone();
            let env = env.clone();
            let resources = resources.clone();
            let abort = abort.clone();
            let completion_tx = completion_tx.clone();
            tasks.push(tokio::spawn(async move {
                let result = this.run_job(&env, &job_manifest, &resources, &abort).await;
                let _ = completion_tx.send_async((index, result)).await;
            }));
        }
        drop(completion_tx);

        let join = async {
            let mut results = Vec::with_capacity(count);
            while let Ok((index, result)) = completion_rx.recv_async().await {
                match result {
                    Ok(value) => {
                        debug!(partition = index, "Partition finished");
                        results.push((index, value));
                    }
                    Err(e) => {
                        warn!(partition = index, error = %e, "Partition failed, cancelling the rest");
                        abort.cancel();
                        return Err(e);
                    }
                }
            }
            Ok(results)
        };
        let timeout = self.target.options.job_timeout();
        let outcome = match tokio::time::timeout(timeout, join).await {
            Ok(outcome) => outcome,
            Err(_) => {
                abort.cancel();
                Err(ClusterError::Lost {
                    job: format!("{} ({} partitions)", manifest.function, count),
                    reason: format!("partitions did not finish within {:?}", timeout),
                })
            }
        };
        // Cancelled partitions still cancel their jobs and clean up.
        join_all(tasks).await;

        let results = outcome?;
        if results.len() != count {
            return Err(ClusterError::Orchestration(format!(
                "only {} of {} partitions reported a result",
                results.len(),
                count
            )));
        }
        partition::concat(results)
    }

    async fn run_job(
        &self,
        env: &RemoteEnvironmentHandle,
        manifest: &PackageManifest,
        resources: &ResourceRequest,
        abort: &Cancellation,
    ) -> Result<Value> {
        let name = job_name(&manifest.function, manifest.partition.as_ref());
        let job_dir = env.jobs_dir.join(&name);
        let result = self
            .execute(&name, &job_dir, env, manifest, resources, abort)
            .await;
        self.cleanup(&job_dir).await;
        result
    }

    async fn execute(
        &self,
        name: &str,
        job_dir: &Path,
        env: &RemoteEnvironmentHandle,
        manifest: &PackageManifest,
        resources: &ResourceRequest,
        abort: &Cancellation,
    ) -> Result<Value> {
        if self.cancellation.is_cancelled() || abort.is_cancelled() {
            return Err(ClusterError::Cancelled);
        }
        let files = self
            .renderer
            .render(name, job_dir, &self.target, env, manifest)?;
        for (file, contents) in files {
            self.channel.write_file(&job_dir.join(file), &contents).await?;
        }

        let spec = JobSpec::new(name, job_dir.to_path_buf(), resources.clone());
        let id = self.scheduler.submit(&spec).await?;
        info!(target = %self.target.name, job = %id, job_name = name, "Submitted job");

        let state = self.wait(&id, abort).await?;
        let result = self.scheduler.fetch_artifacts(&id).await?.decode(&id)?;
        info!(job = %id, state = %state, "Job finished");
        result.into_value()
    }

    /// Polls until the job reaches a terminal state, backing off between
    /// polls while nothing changes.
    async fn wait(&self, id: &JobId, abort: &Cancellation) -> Result<JobState> {
        let options = &self.target.options;
        let deadline = Instant::now() + options.job_timeout();
        let mut interval = options.poll_interval();
        let mut state = JobState::Submitted;
        let mut failures = 0;
        loop {
            match self.scheduler.poll_status(id).await {
                Ok(status) => {
                    failures = 0;
                    let next = state.advance(status);
                    if next != state {
                        debug!(job = %id, state = %next, "Job state changed");
                        interval = options.poll_interval();
                    }
                    state = next;
                }
                Err(e) if e.is_transient() && failures + 1 < MAX_POLL_FAILURES => {
                    failures += 1;
                    warn!(job = %id, error = %e, failures, "Polling failed, will retry");
                }
                Err(e) => {
                    warn!(job = %id, error = %e, "Polling failed, giving up");
                    return Err(e);
                }
            }
            if state.is_terminal() {
                return Ok(state);
            }

            let now = Instant::now();
            if now >= deadline {
                state = state.lose();
                warn!(job = %id, state = %state, "Job timed out, cancelling");
                self.cancel_job(id).await;
                return Err(ClusterError::Lost {
                    job: id.to_string(),
                    reason: format!("no result within {:?}", options.job_timeout()),
                });
            }
            tokio::select! {
                _ = tokio::time::sleep(interval.min(deadline - now)) => {}
                _ = self.cancellation.cancelled() => {
                    self.cancel_job(id).await;
                    return Err(ClusterError::Cancelled);
                }
                _ = abort.cancelled() => {
                    self.cancel_job(id).await;
                    return Err(ClusterError::Cancelled);
                }
            }
            interval = (interval * 2).min(options.max_poll_interval());
        }
    }

    async fn cancel_job(&self, id: &JobId) {
        info!(job = %id, "Cancelling job");
        if let Err(e) = self.scheduler.cancel(id).await {
            warn!(job = %id, error = %e, "Failed to cancel job");
        }
    }

    async fn cleanup(&self, job_dir: &Path) {
        if self.target.options.keep_remote {
            info!(job_dir = %job_dir.display(), "Keeping job directory");
            return;
        }
        match self
            .channel
            .exec(&format!("rm -rf {}", quote_path(job_dir)))
            .await
        {
            Ok(output) if output.success() => {}
            Ok(output) => {
                warn!(job_dir = %job_dir.display(), error = %output.describe_failure(), "Failed to remove job directory")
            }
            Err(e) => warn!(job_dir = %job_dir.display(), error = %e, "Failed to remove job directory"),
        }
    }
}

/// `<function>-<random>`, with the partition index appended.
fn job_name(function: &str, partition: Option<&Partition>) -> String {
    let random = uuid::Uuid::new_v4().simple().to_string();
    let mut name = format!("{}-{}", function, &random[..8]);
    if let Some(partition) = partition {
        name.push_str(&format!("-p{}", partition.index));
    }
    name
}
