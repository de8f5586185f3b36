//! Cluster workload API abstraction.
//!
//! This module provides:
//!
//! - [`ClusterApi`]: Trait over the cluster's workload objects (recurring
//!   jobs, one-shot jobs, pods)
//! - [`JobSummary`]: The observed state of one job object, flattened to what
//!   classification and persistence need
//! - [`kube`]: Kubernetes-backed implementation
//! - [`memory`]: In-memory fake for testing
//!
//! ## Design Principles
//!
//! - **Backend agnostic**: The engine reconciles against the trait; tests
//!   run against the in-memory cluster
//! - **Flattened observations**: Implementations do the object spelunking
//!   (conditions, container statuses, termination messages) once, up front
//! - **Best-effort enrichment**: Pod-level details are optional; a missing
//!   pod never fails a list or watch

pub mod facade;
pub mod kube;
pub mod memory;
pub mod template;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use k8s_openapi::api::batch::v1::{CronJob, Job};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use crate::classify::TerminationSignal;
use crate::error::Result;
use crate::model::{DeploymentSnapshot, ExecutionType, ResourceProfile};

/// Label vocabulary the engine stamps on its cluster objects.
pub mod labels {
    /// Object kind discriminator.
    pub const JOB_TYPE: &str = "drover.dev/type";
    /// The [`JOB_TYPE`] value for data-job workloads.
    pub const TYPE_DATA_JOB: &str = "data-job";
    /// Name of the owning data job.
    pub const JOB_NAME: &str = "drover.dev/name";
    /// Built-in label the cluster stamps on pods spawned by a job object.
    pub const POD_JOB_NAME: &str = "job-name";
}

/// Annotation vocabulary the engine stamps on its cluster objects.
pub mod annotations {
    /// How the execution was triggered (`MANUAL` / `SCHEDULED`).
    pub const EXECUTION_TYPE: &str = "drover.dev/execution-type";
    /// Correlation ID of the operation that started the execution.
    pub const OP_ID: &str = "drover.dev/op-id";
    /// Principal that started a manual execution.
    pub const STARTED_BY: &str = "drover.dev/started-by";
    /// Schedule expression the job was deployed with.
    pub const SCHEDULE: &str = "drover.dev/schedule";
    /// Principal that performed the deployment.
    pub const DEPLOYED_BY: &str = "drover.dev/deployed-by";
    /// When the deployment completed (RFC 3339).
    pub const DEPLOYED_DATE: &str = "drover.dev/deployed-date";
    /// Source version of the deployed job code.
    pub const JOB_VERSION: &str = "drover.dev/job-version";
    /// Version of the job runtime baked into the image.
    pub const RUNTIME_VERSION: &str = "drover.dev/runtime-version";
}

/// The label selector matching every data-job one-shot job object.
#[must_use]
pub fn data_job_selector() -> String {
    format!("{}={}", labels::JOB_TYPE, labels::TYPE_DATA_JOB)
}

/// Observed state of one one-shot job object, flattened for the engine.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobSummary {
    /// Cluster object name; doubles as the execution ID.
    pub name: String,
    /// Owning data job name, from the object's labels.
    pub job_name: String,
    /// How the execution was triggered, from annotations.
    pub execution_type: Option<ExecutionType>,
    /// Correlation ID, from annotations.
    pub op_id: Option<String>,
    /// Whether the object carries any completion condition.
    ///
    /// A job is still running until it acquires one; this intentionally
    /// counts the brief `active == 0` window during pod startup as running.
    pub has_conditions: bool,
    /// Terminal verdict: `Some(true)` complete, `Some(false)` failed,
    /// `None` while undecided.
    pub succeeded: Option<bool>,
    /// When the job's first pod started.
    pub start_time: Option<DateTime<Utc>>,
    /// When the job reached its completion condition.
    pub completion_time: Option<DateTime<Utc>>,
    /// Reason from the job-level completion condition.
    pub condition_reason: Option<String>,
    /// Reason from the main container's terminated state.
    pub container_reason: Option<String>,
    /// Termination payload written by the job runtime, if any.
    pub termination_payload: Option<String>,
    /// Resources of the main container.
    pub resources: Option<ResourceProfile>,
    /// Deployment snapshot fields carried on the object.
    pub deployment: Option<DeploymentSnapshot>,
}

impl JobSummary {
    /// True while the object has no completion condition.
    #[must_use]
    pub const fn is_running(&self) -> bool {
        !self.has_conditions
    }

    /// The raw termination signal for classification.
    #[must_use]
    pub fn termination_signal(&self) -> TerminationSignal {
        TerminationSignal {
            succeeded: self.succeeded,
            payload: self.termination_payload.clone(),
            job_reason: self.condition_reason.clone(),
            container_reason: self.container_reason.clone(),
            start_time: self.start_time,
        }
    }
}

/// One delivery from an incremental watch.
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    /// The object was added or modified.
    Applied(JobSummary),
    /// The object was deleted.
    Deleted(JobSummary),
}

/// Result of listing job objects.
#[derive(Debug, Clone, Default)]
pub struct JobList {
    /// Flattened summaries.
    pub items: Vec<JobSummary>,
    /// Resource version to start an incremental watch from.
    pub resource_version: Option<String>,
}

/// Server response to a cascading delete.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeleteOutcome {
    /// Status summary reported by the server (`Success` / `Failure`), when
    /// any response was received at all.
    pub status: Option<String>,
    /// HTTP-level status code.
    pub code: Option<u16>,
    /// Machine-readable reason.
    pub reason: Option<String>,
    /// Human-readable message.
    pub message: Option<String>,
}

impl DeleteOutcome {
    /// A successful deletion response.
    #[must_use]
    pub fn success() -> Self {
        Self {
            status: Some("Success".to_string()),
            code: Some(200),
            reason: None,
            message: None,
        }
    }

    /// True if the server reported success (2xx or an explicit `Success`).
    #[must_use]
    pub fn is_success(&self) -> bool {
        if self.status.as_deref() == Some("Success") {
            return true;
        }
        self.code.is_some_and(|code| (200..300).contains(&code))
    }
}

/// A stream of watch deliveries.
pub type JobEventStream = BoxStream<'static, Result<JobEvent>>;

/// Raw operations against the cluster's workload objects.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Lists one-shot job objects matching a label selector.
    async fn list_jobs(&self, label_selector: &str) -> Result<JobList>;

    /// Opens an incremental watch on one-shot job objects.
    ///
    /// The watch starts at `resource_version` (from a preceding list) and
    /// runs for at most `timeout` before the server closes the stream.
    async fn watch_jobs(
        &self,
        label_selector: &str,
        resource_version: &str,
        timeout: Duration,
    ) -> Result<JobEventStream>;

    /// Reads a recurring-job object. Returns `None` if absent.
    async fn get_cron_job(&self, name: &str) -> Result<Option<CronJob>>;

    /// Creates a recurring-job object.
    async fn create_cron_job(&self, cron_job: &CronJob) -> Result<()>;

    /// Replaces a recurring-job object.
    async fn update_cron_job(&self, cron_job: &CronJob) -> Result<()>;

    /// Deletes a recurring-job object; absence is tolerated.
    async fn delete_cron_job(&self, name: &str) -> Result<()>;

    /// Creates a one-shot job object.
    async fn create_job(&self, job: &Job) -> Result<()>;

    /// Deletes a one-shot job object and its pods by label selector.
    ///
    /// Absent resources are tolerated and reported as success; other
    /// failures are reported through the outcome, not as errors, so the
    /// caller can classify them.
    async fn delete_job_cascade(&self, name: &str) -> Result<DeleteOutcome>;

    /// Finds a pod spawned by the given job object. Best-effort.
    async fn get_pod_for_job(&self, job_name: &str) -> Result<Option<Pod>>;

    /// Reads a pod's logs. Returns an empty string if the pod is missing.
    async fn pod_logs(&self, pod_name: &str) -> Result<String>;
}

/// Flattens a job object (plus its pod, when available) into a summary.
#[must_use]
pub fn summarize_job(job: &Job, pod: Option<&Pod>) -> JobSummary {
    let name = job.metadata.name.clone().unwrap_or_default();
    let empty = BTreeMap::new();
    let job_labels = job.metadata.labels.as_ref().unwrap_or(&empty);
    let job_annotations = job.metadata.annotations.as_ref().unwrap_or(&empty);

    let status = job.status.as_ref();
    let conditions = status
        .and_then(|s| s.conditions.as_deref())
        .unwrap_or_default();

    let terminal = conditions.iter().find(|condition| {
        condition.status == "True" && (condition.type_ == "Complete" || condition.type_ == "Failed")
    });
    let succeeded = terminal.map(|condition| condition.type_ == "Complete");

    let completion_time = status
        .and_then(|s| s.completion_time.as_ref())
        .map(|t| t.0)
        .or_else(|| terminal.and_then(|c| c.last_transition_time.as_ref()).map(|t| t.0));

    let (container_reason, termination_payload) = pod
        .map(terminated_container_state)
        .unwrap_or((None, None));

    let main_container = job
        .spec
        .as_ref()
        .and_then(|spec| spec.template.spec.as_ref())
        .and_then(|pod_spec| pod_spec.containers.first());

    let resources = main_container
        .and_then(|container| container.resources.as_ref())
        .map(|requirements| ResourceProfile {
            cpu_request: quantity(requirements.requests.as_ref(), "cpu")
                .and_then(|q| parse_cpu(&q))
                .unwrap_or_default(),
            cpu_limit: quantity(requirements.limits.as_ref(), "cpu")
                .and_then(|q| parse_cpu(&q))
                .unwrap_or_default(),
            memory_request_mi: quantity(requirements.requests.as_ref(), "memory")
                .and_then(|q| parse_memory_mi(&q))
                .unwrap_or_default(),
            memory_limit_mi: quantity(requirements.limits.as_ref(), "memory")
                .and_then(|q| parse_memory_mi(&q))
                .unwrap_or_default(),
        });

    let deployment = main_container.map(|container| DeploymentSnapshot {
        image: container.image.clone().unwrap_or_default(),
        schedule: job_annotations
            .get(annotations::SCHEDULE)
            .cloned()
            .unwrap_or_default(),
        resources: resources.unwrap_or_default(),
        runtime_version: job_annotations.get(annotations::RUNTIME_VERSION).cloned(),
        job_version: job_annotations.get(annotations::JOB_VERSION).cloned(),
        deployed_by: job_annotations.get(annotations::DEPLOYED_BY).cloned(),
        deployed_date: job_annotations
            .get(annotations::DEPLOYED_DATE)
            .and_then(|raw| raw.parse::<DateTime<Utc>>().ok()),
    });

    JobSummary {
        name,
        job_name: job_labels.get(labels::JOB_NAME).cloned().unwrap_or_default(),
        execution_type: job_annotations
            .get(annotations::EXECUTION_TYPE)
            .and_then(|raw| match raw.to_ascii_uppercase().as_str() {
                "MANUAL" => Some(ExecutionType::Manual),
                "SCHEDULED" => Some(ExecutionType::Scheduled),
                _ => None,
            }),
        op_id: job_annotations.get(annotations::OP_ID).cloned(),
        has_conditions: !conditions.is_empty(),
        succeeded,
        start_time: status.and_then(|s| s.start_time.as_ref()).map(|t| t.0),
        completion_time,
        condition_reason: terminal.and_then(|condition| condition.reason.clone()),
        container_reason,
        termination_payload,
        resources,
        deployment,
    }
}

/// Extracts the main container's terminated reason and message from a pod.
///
/// Falls back to `last_state` so a restarted container's verdict is not
/// lost.
fn terminated_container_state(pod: &Pod) -> (Option<String>, Option<String>) {
    let Some(statuses) = pod
        .status
        .as_ref()
        .and_then(|status| status.container_statuses.as_deref())
    else {
        return (None, None);
    };

    for container in statuses {
        let terminated = container
            .state
            .as_ref()
            .and_then(|state| state.terminated.as_ref())
            .or_else(|| {
                container
                    .last_state
                    .as_ref()
                    .and_then(|state| state.terminated.as_ref())
            });
        if let Some(terminated) = terminated {
            return (terminated.reason.clone(), terminated.message.clone());
        }
    }

    (None, None)
}

fn quantity(map: Option<&BTreeMap<String, Quantity>>, key: &str) -> Option<Quantity> {
    map.and_then(|m| m.get(key)).cloned()
}

/// Parses a CPU quantity into cores (`500m` → 0.5, `2` → 2.0).
#[must_use]
pub fn parse_cpu(quantity: &Quantity) -> Option<f64> {
    let raw = quantity.0.trim();
    if let Some(milli) = raw.strip_suffix('m') {
        return milli.parse::<f64>().ok().map(|value| value / 1000.0);
    }
    raw.parse::<f64>().ok()
}

/// Parses a memory quantity into MiB (`4Gi` → 4096, `512Mi` → 512).
#[must_use]
pub fn parse_memory_mi(quantity: &Quantity) -> Option<i64> {
    const MI: f64 = 1024.0 * 1024.0;
    let raw = quantity.0.trim();

    let suffixes: [(&str, f64); 9] = [
        ("Ki", 1024.0),
        ("Mi", MI),
        ("Gi", 1024.0 * MI),
        ("Ti", 1024.0 * 1024.0 * MI),
        ("k", 1e3),
        ("K", 1e3),
        ("M", 1e6),
        ("G", 1e9),
        ("T", 1e12),
    ];

    for (suffix, factor) in suffixes {
        if let Some(value) = raw.strip_suffix(suffix) {
            #[allow(clippy::cast_possible_truncation)]
            return value
                .parse::<f64>()
                .ok()
                .map(|value| (value * factor / MI).round() as i64);
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    raw.parse::<f64>().ok().map(|bytes| (bytes / MI).round() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::batch::v1::{JobCondition, JobSpec, JobStatus};
    use k8s_openapi::api::core::v1::{
        Container, ContainerState, ContainerStateTerminated, ContainerStatus, PodStatus,
        PodTemplateSpec,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn job_object(name: &str, conditions: Vec<JobCondition>) -> Job {
        let mut job = Job::default();
        job.metadata.name = Some(name.to_string());
        job.metadata.labels = Some(BTreeMap::from([
            (labels::JOB_TYPE.to_string(), labels::TYPE_DATA_JOB.to_string()),
            (labels::JOB_NAME.to_string(), "ingest".to_string()),
        ]));
        job.metadata.annotations = Some(BTreeMap::from([(
            annotations::EXECUTION_TYPE.to_string(),
            "MANUAL".to_string(),
        )]));
        job.spec = Some(JobSpec {
            template: PodTemplateSpec {
                spec: Some(k8s_openapi::api::core::v1::PodSpec {
                    containers: vec![Container {
                        name: "data-job".to_string(),
                        image: Some("registry.example.com/ingest:1".to_string()),
                        ..Container::default()
                    }],
                    ..k8s_openapi::api::core::v1::PodSpec::default()
                }),
                ..PodTemplateSpec::default()
            },
            ..JobSpec::default()
        });
        job.status = Some(JobStatus {
            conditions: Some(conditions),
            start_time: Some(Time(Utc::now())),
            ..JobStatus::default()
        });
        job
    }

    fn complete_condition() -> JobCondition {
        JobCondition {
            type_: "Complete".to_string(),
            status: "True".to_string(),
            last_transition_time: Some(Time(Utc::now())),
            ..JobCondition::default()
        }
    }

    fn failed_condition(reason: &str) -> JobCondition {
        JobCondition {
            type_: "Failed".to_string(),
            status: "True".to_string(),
            reason: Some(reason.to_string()),
            last_transition_time: Some(Time(Utc::now())),
            ..JobCondition::default()
        }
    }

    #[test]
    fn running_job_has_no_verdict() {
        let summary = summarize_job(&job_object("ingest-1", vec![]), None);
        assert!(summary.is_running());
        assert_eq!(summary.succeeded, None);
        assert_eq!(summary.job_name, "ingest");
        assert_eq!(summary.execution_type, Some(ExecutionType::Manual));
    }

    #[test]
    fn complete_condition_yields_success() {
        let summary = summarize_job(&job_object("ingest-1", vec![complete_condition()]), None);
        assert!(!summary.is_running());
        assert_eq!(summary.succeeded, Some(true));
        assert!(summary.completion_time.is_some());
    }

    #[test]
    fn failed_condition_carries_reason_and_transition_time() {
        let summary = summarize_job(
            &job_object("ingest-1", vec![failed_condition("DeadlineExceeded")]),
            None,
        );
        assert_eq!(summary.succeeded, Some(false));
        assert_eq!(summary.condition_reason.as_deref(), Some("DeadlineExceeded"));
        // Failed jobs have no completion time; the condition transition
        // time stands in for it.
        assert!(summary.completion_time.is_some());
    }

    #[test]
    fn pod_contributes_container_verdict() {
        let mut pod = Pod::default();
        pod.status = Some(PodStatus {
            container_statuses: Some(vec![ContainerStatus {
                name: "data-job".to_string(),
                state: Some(ContainerState {
                    terminated: Some(ContainerStateTerminated {
                        exit_code: 137,
                        reason: Some("OOMKilled".to_string()),
                        message: Some(r#"{"status":"Platform error"}"#.to_string()),
                        ..ContainerStateTerminated::default()
                    }),
                    ..ContainerState::default()
                }),
                ..ContainerStatus::default()
            }]),
            ..PodStatus::default()
        });

        let summary = summarize_job(
            &job_object("ingest-1", vec![failed_condition("BackoffLimitExceeded")]),
            Some(&pod),
        );
        assert_eq!(summary.container_reason.as_deref(), Some("OOMKilled"));
        assert_eq!(
            summary.termination_payload.as_deref(),
            Some(r#"{"status":"Platform error"}"#)
        );

        let signal = summary.termination_signal();
        assert_eq!(signal.succeeded, Some(false));
        assert_eq!(signal.container_reason.as_deref(), Some("OOMKilled"));
    }

    #[test]
    fn cpu_quantities_parse() {
        assert_eq!(parse_cpu(&Quantity("500m".to_string())), Some(0.5));
        assert_eq!(parse_cpu(&Quantity("2".to_string())), Some(2.0));
        assert_eq!(parse_cpu(&Quantity("bogus".to_string())), None);
    }

    #[test]
    fn memory_quantities_parse_to_mi() {
        assert_eq!(parse_memory_mi(&Quantity("512Mi".to_string())), Some(512));
        assert_eq!(parse_memory_mi(&Quantity("4Gi".to_string())), Some(4096));
        assert_eq!(parse_memory_mi(&Quantity("1048576Ki".to_string())), Some(1024));
        assert_eq!(parse_memory_mi(&Quantity("1G".to_string())), Some(954));
    }

    #[test]
    fn delete_outcome_success_detection() {
        assert!(DeleteOutcome::success().is_success());
        assert!(DeleteOutcome {
            status: None,
            code: Some(200),
            reason: None,
            message: None,
        }
        .is_success());
        assert!(!DeleteOutcome {
            status: Some("Failure".to_string()),
            code: Some(409),
            reason: Some("Conflict".to_string()),
            message: None,
        }
        .is_success());
        assert!(!DeleteOutcome::default().is_success());
    }
}
