//! Kubernetes batch/v1 Jobs through `kubectl`.
//!
//! Pods mount the target's volume claim at the work directory, so the job
//! directory and environment are the same paths inside and outside the pod.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use super::{best_effort, submit_with, SchedulerAdapter};
use crate::error::{ChannelError, ClusterError, Result};
use crate::job::{JobId, JobSpec, JobStatus};
use crate::session::{quote, quote_path, Channel};
use crate::target::ExecutionTarget;

const DEFAULT_IMAGE: &str = "python:3.11-slim";
const WORK_VOLUME: &str = "work";
/// Finished Jobs are garbage collected after this long.
const TTL_AFTER_FINISHED_SECS: u64 = 600;
const MAX_NAME_LEN: usize = 63;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct JobManifest {
    api_version: &'static str,
    kind: &'static str,
    metadata: Metadata,
    spec: BatchJobSpec,
}

#[derive(Serialize)]
struct Metadata {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    namespace: Option<String>,
    labels: Labels,
}

#[derive(Serialize)]
struct Labels {
    #[serde(rename = "app.kubernetes.io/managed-by")]
    managed_by: &'static str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BatchJobSpec {
    backoff_limit: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    active_deadline_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ttl_seconds_after_finished: Option<u64>,
    template: PodTemplate,
}

#[derive(Serialize)]
struct PodTemplate {
    spec: PodSpec,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PodSpec {
    restart_policy: &'static str,
    containers: Vec<Container>,
    volumes: Vec<Volume>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Container {
    name: &'static str,
    image: String,
    command: Vec<String>,
    working_dir: String,
    resources: ContainerResources,
    volume_mounts: Vec<VolumeMount>,
}

#[derive(Serialize)]
struct ContainerResources {
    requests: Quantities,
    limits: Quantities,
}

#[derive(Clone, Serialize)]
struct Quantities {
    cpu: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    memory: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct VolumeMount {
    name: &'static str,
    mount_path: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Volume {
    name: &'static str,
    persistent_volume_claim: ClaimSource,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ClaimSource {
    claim_name: String,
}

pub struct KubernetesAdapter {
    target: Arc<ExecutionTarget>,
    channel: Arc<dyn Channel>,
}

impl KubernetesAdapter {
    pub fn new(target: Arc<ExecutionTarget>, channel: Arc<dyn Channel>) -> Self {
        Self { target, channel }
    }

    fn namespace_args(&self, namespace: Option<&str>) -> String {
        match namespace.or(self.target.resources.namespace.as_deref()) {
            Some(namespace) => format!(" -n {}", quote(namespace)),
            None => String::new(),
        }
    }

    fn manifest(&self, job: &JobSpec) -> Result<JobManifest> {
        let resources = &job.resources;
        let claim = resources.volume_claim.clone().ok_or_else(|| {
            ClusterError::Config(format!(
                "kubernetes target '{}' has no volume claim",
                self.target.name
            ))
        })?;
        let quantities = Quantities {
            cpu: resources.cores().to_string(),
            memory: resources.memory_mib()?.map(|mib| format!("{}Mi", mib)),
        };
        Ok(JobManifest {
            api_version: "batch/v1",
            kind: "Job",
            metadata: Metadata {
                name: object_name(&job.name),
                namespace: resources.namespace.clone(),
                labels: Labels {
                    managed_by: "clusterfn",
                },
            },
            spec: BatchJobSpec {
                backoff_limit: 0,
                active_deadline_seconds: resources.time_seconds()?,
                ttl_seconds_after_finished: (!self.target.options.keep_remote)
                    .then_some(TTL_AFTER_FINISHED_SECS),
                template: PodTemplate {
                    spec: PodSpec {
                        restart_policy: "Never",
                        containers: vec![Container {
                            name: "job",
                            image: resources
                                .image
                                .clone()
                                .unwrap_or_else(|| DEFAULT_IMAGE.to_string()),
                            command: vec!["sh".to_string(), job.script.to_string_lossy().into_owned()],
                            working_dir: job.job_dir.to_string_lossy().into_owned(),
                            resources: ContainerResources {
                                requests: quantities.clone(),
                                limits: quantities,
                            },
                            volume_mounts: vec![VolumeMount {
                                name: WORK_VOLUME,
                                mount_path: self.target.work_dir.to_string_lossy().into_owned(),
                            }],
                        }],
                        volumes: vec![Volume {
                            name: WORK_VOLUME,
                            persistent_volume_claim: ClaimSource { claim_name: claim },
                        }],
                    },
                },
            },
        })
    }
}

/// A DNS-1123 label derived from the job name. Long names lose the middle
/// of the function name; the `-<random>[-pN]` tail always survives.
fn object_name(name: &str) -> String {
    let label: String = name
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    let label = label.trim_matches('-');
    if label.len() <= MAX_NAME_LEN {
        return if label.is_empty() {
            "clusterfn-job".to_string()
        } else {
            label.to_string()
        };
    }
    let tail_at = tail_start(label);
    let tail = &label[tail_at..];
    let keep = MAX_NAME_LEN.saturating_sub(tail.len());
    let head = label[..tail_at.min(keep)].trim_end_matches('-');
    let mut out = format!("{}{}", head, tail);
    out.truncate(MAX_NAME_LEN);
    out.trim_matches('-').to_string()
}

/// Start of the `-<hex>` or `-<hex>-p<N>` suffix the orchestrator appends.
fn tail_start(label: &str) -> usize {
    let mut parts = label.rsplitn(3, '-');
    let last = parts.next().unwrap_or_default();
    let is_partition = last.len() > 1
        && last.starts_with('p')
        && last[1..].bytes().all(|b| b.is_ascii_digit());
    let suffix = if is_partition {
        match parts.next() {
            Some(random) => random.len() + last.len() + 2,
            None => last.len() + 1,
        }
    } else {
        last.len() + 1
    };
    label.len().saturating_sub(suffix)
}

/// Parses `{.status.active} {.status.succeeded} {.status.failed}`; absent
/// counters print as empty strings.
fn parse_status(output: &str) -> JobStatus {
    let mut counts = [0u32; 3];
    for (slot, field) in counts.iter_mut().zip(output.split(' ')) {
        *slot = field.trim().parse().unwrap_or(0);
    }
    match counts {
        [_, succeeded, _] if succeeded > 0 => JobStatus::Completed,
        [_, _, failed] if failed > 0 => JobStatus::Failed,
        [active, _, _] if active > 0 => JobStatus::Running,
        _ => JobStatus::Pending,
    }
}

#[async_trait]
impl SchedulerAdapter for KubernetesAdapter {
    fn name(&self) -> &str {
        "kubernetes"
    }

    fn channel(&self) -> &Arc<dyn Channel> {
        &self.channel
    }

    async fn submit(&self, job: &JobSpec) -> Result<JobId> {
        let manifest = self.manifest(job)?;
        let yaml = serde_yaml::to_string(&manifest)
            .map_err(|e| ClusterError::Orchestration(format!("failed to encode job manifest: {}", e)))?;
        let path = job.job_dir.join("job.yaml");
        self.channel.write_file(&path, yaml.as_bytes()).await?;
        let script = format!("kubectl create -f {} -o name", quote_path(&path));
        // `job.batch/<name>`
        let created = submit_with(self.channel.as_ref(), self.name(), &script).await?;
        let name = created.rsplit('/').next().unwrap_or_default().trim();
        if name.is_empty() {
            return Err(ClusterError::SubmissionRejected {
                scheduler: self.name().to_string(),
                reason: format!("unexpected kubectl output '{}'", created),
            });
        }
        let id = match &manifest.metadata.namespace {
            Some(namespace) => format!("{}/{}", namespace, name),
            None => name.to_string(),
        };
        Ok(JobId::new(id, job.job_dir.clone()))
    }

    async fn poll_status(&self, job: &JobId) -> Result<JobStatus> {
        let (namespace, name) = split_id(&job.id);
        let script = format!(
            "kubectl get job {}{} -o jsonpath='{{.status.active}} {{.status.succeeded}} {{.status.failed}}'",
            quote(name),
            self.namespace_args(namespace)
        );
        let output = self.channel.exec(&script).await?;
        if output.success() {
            return Ok(parse_status(&output.stdout_lossy()));
        }
        let stderr = output.stderr_lossy();
        if is_not_found(&stderr) {
            // Deleted or expired; the artifacts decide.
            return Ok(JobStatus::Completed);
        }
        Err(ChannelError::Failed(format!(
            "kubectl get job {} failed: {}",
            name,
            output.describe_failure()
        ))
        .into())
    }

    async fn cancel(&self, job: &JobId) -> Result<()> {
        let (namespace, name) = split_id(&job.id);
        let script = format!(
            "kubectl delete job {}{} --ignore-not-found --wait=false",
            quote(name),
            self.namespace_args(namespace)
        );
        best_effort(self.channel.as_ref(), &script).await
    }
}

fn is_not_found(stderr: &str) -> bool {
    stderr.contains("(NotFound)")
}

fn split_id(id: &str) -> (Option<&str>, &str) {
    match id.split_once('/') {
        Some((namespace, name)) => (Some(namespace), name),
        None => (None, id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;

    use crate::session::LocalChannel;
    use crate::target::{ResourceRequest, TargetKind};

    fn adapter() -> KubernetesAdapter {
        let resources = ResourceRequest {
            cores: Some(2),
            memory: Some("1G".to_string()),
            namespace: Some("science".to_string()),
            volume_claim: Some("shared-work".to_string()),
            ..Default::default()
        };
        let target = ExecutionTarget::scheduler(TargetKind::Kubernetes, None, "/mnt/work").with_resources(resources);
        KubernetesAdapter::new(
            Arc::new(target),
            Arc::new(LocalChannel::new("kube", Duration::from_secs(5))),
        )
    }

    #[test]
    fn test_manifest() {
        let adapter = adapter();
        let job = JobSpec::new(
            "Process_Data-1",
            PathBuf::from("/mnt/work/jobs/Process_Data-1"),
            adapter.target.resources.clone(),
        );
        let yaml = serde_yaml::to_string(&adapter.manifest(&job).unwrap()).unwrap();
        let value: serde_yaml::Value = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(value["apiVersion"].as_str(), Some("batch/v1"));
        assert_eq!(value["metadata"]["name"].as_str(), Some("process-data-1"));
        assert_eq!(value["metadata"]["namespace"].as_str(), Some("science"));
        let pod = &value["spec"]["template"]["spec"];
        assert_eq!(pod["restartPolicy"].as_str(), Some("Never"));
        let container = &pod["containers"][0];
        assert_eq!(container["image"].as_str(), Some(DEFAULT_IMAGE));
        assert_eq!(container["resources"]["limits"]["memory"].as_str(), Some("1024Mi"));
        assert_eq!(container["volumeMounts"][0]["mountPath"].as_str(), Some("/mnt/work"));
        assert_eq!(
            pod["volumes"][0]["persistentVolumeClaim"]["claimName"].as_str(),
            Some("shared-work")
        );
        assert_eq!(value["spec"]["ttlSecondsAfterFinished"].as_u64(), Some(600));
    }

    #[test]
    fn test_parse_status() {
        assert_eq!(parse_status("1  "), JobStatus::Running);
        assert_eq!(parse_status(" 1 "), JobStatus::Completed);
        assert_eq!(parse_status("  1"), JobStatus::Failed);
        assert_eq!(parse_status("  "), JobStatus::Pending);
        assert_eq!(parse_status(""), JobStatus::Pending);
    }

    #[test]
    fn test_object_name_and_ids() {
        assert_eq!(object_name("--My.Job--"), "my-job");
        assert_eq!(object_name(&"x".repeat(80)).len(), MAX_NAME_LEN);
        assert_eq!(object_name("square-1a2b3c4d-p0"), "square-1a2b3c4d-p0");
        assert_eq!(split_id("science/f-1"), (Some("science"), "f-1"));
        assert_eq!(split_id("f-1"), (None, "f-1"));
    }

    #[test]
    fn test_long_names_keep_their_suffix() {
        let function = "a".repeat(56);
        let first = object_name(&format!("{}-1a2b3c4d-p0", function));
        let second = object_name(&format!("{}-1a2b3c4d-p1", function));
        assert_ne!(first, second);
        assert!(first.len() <= MAX_NAME_LEN && second.len() <= MAX_NAME_LEN);
        assert!(first.ends_with("-1a2b3c4d-p0"));
        assert!(second.ends_with("-1a2b3c4d-p1"));

        let single = object_name(&format!("{}-1a2b3c4d", "b".repeat(70)));
        assert!(single.len() <= MAX_NAME_LEN);
        assert!(single.ends_with("-1a2b3c4d"));
    }

    #[test]
    fn test_missing_job_is_not_a_connection_failure() {
        assert!(is_not_found(
            r#"Error from server (NotFound): jobs.batch "f-1" not found"#
        ));
        assert!(!is_not_found(
            "The connection to the server 10.0.0.1:6443 was refused"
        ));
    }

    #[tokio::test]
    async fn test_poll_failure_is_a_connectivity_error() {
        let adapter = adapter();
        let job = JobId::new("science/f-1", PathBuf::from("/mnt/work/jobs/f-1"));
        // No kubectl here, or no cluster behind it: either way not a NotFound.
        match adapter.poll_status(&job).await {
            Err(ClusterError::Connectivity(ChannelError::Failed(_))) => {}
            Ok(status) => panic!("unexpected status {:?}", status),
            Err(e) => panic!("unexpected error {:?}", e),
        }
    }
}
