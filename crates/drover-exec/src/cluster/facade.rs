//! High-level operations on data-job workload objects.
//!
//! [`WorkloadFacade`] is the single place where recurring-job and one-shot
//! job objects are built, mutated, and torn down. It owns the template
//! merge rules:
//!
//! - containers, init containers, and volumes are replaced **wholesale**
//! - annotations and labels are **merged** into the template's existing maps
//! - blank image-pull-secret entries are filtered out before attaching
//! - `suspend` is the inverse of the job's enabled flag
//!
//! Everything below the facade speaks raw cluster objects via
//! [`ClusterApi`]; everything above it speaks the domain model.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::batch::v1::{CronJob, Job};
use k8s_openapi::api::core::v1::{Container, EnvVar, LocalObjectReference, Volume};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use drover_core::ExecutionId;

use super::template::{validate, TemplateSet};
use super::{annotations, labels, ClusterApi, JobEventStream, JobList};
use crate::error::{Error, Result};

/// Marker the main container's command must contain for argument injection.
///
/// The last command element invokes the job runtime; extra arguments are
/// appended to that invocation as a JSON-encoded map.
pub const DEFAULT_RUN_COMMAND_MARKER: &str = "drover run";

/// Default TTL for finished one-shot job objects, in seconds.
pub const DEFAULT_FINISHED_JOB_TTL_SECS: i32 = 600;

/// Everything needed to build or update one recurring job.
#[derive(Debug, Clone, Default)]
pub struct RecurringJobRequest {
    /// Data job name; doubles as the object name.
    pub name: String,
    /// Container image reference for the main container.
    pub image: String,
    /// Five-field cron schedule expression.
    pub schedule: String,
    /// Whether scheduled runs are enabled (`suspend` is the inverse).
    pub enabled: bool,
    /// Main container spec; its image is overwritten with `image`.
    pub main_container: Container,
    /// Optional init container, replacing the template's wholesale.
    pub init_container: Option<Container>,
    /// Volumes, replacing the template's wholesale.
    pub volumes: Vec<Volume>,
    /// Annotations merged into the template's map.
    pub annotations: BTreeMap<String, String>,
    /// Labels merged into the template's map.
    pub labels: BTreeMap<String, String>,
    /// Image pull secret names; blank entries are dropped.
    pub image_pull_secrets: Vec<String>,
}

/// High-level facade over the cluster workload API.
pub struct WorkloadFacade {
    api: Arc<dyn ClusterApi>,
    templates: TemplateSet,
    run_command_marker: String,
    finished_job_ttl_secs: i32,
}

impl WorkloadFacade {
    /// Creates a facade with default marker and TTL settings.
    #[must_use]
    pub fn new(api: Arc<dyn ClusterApi>, templates: TemplateSet) -> Self {
        Self {
            api,
            templates,
            run_command_marker: DEFAULT_RUN_COMMAND_MARKER.to_string(),
            finished_job_ttl_secs: DEFAULT_FINISHED_JOB_TTL_SECS,
        }
    }

    /// Overrides the run-command marker.
    #[must_use]
    pub fn with_run_command_marker(mut self, marker: impl Into<String>) -> Self {
        self.run_command_marker = marker.into();
        self
    }

    /// Overrides the finished-job TTL.
    #[must_use]
    pub const fn with_finished_job_ttl(mut self, ttl_secs: i32) -> Self {
        self.finished_job_ttl_secs = ttl_secs;
        self
    }

    /// Creates the recurring-job object for a data job.
    ///
    /// # Errors
    ///
    /// [`Error::DefinitionShape`] if the merged object is structurally
    /// incomplete or the schedule expression is invalid; [`Error::ClusterApi`]
    /// on cluster failures.
    pub async fn create_recurring_job(&self, request: &RecurringJobRequest) -> Result<()> {
        let cron_job = self.build_recurring_job(request)?;
        self.api.create_cron_job(&cron_job).await
    }

    /// Replaces the recurring-job object for a data job.
    ///
    /// # Errors
    ///
    /// Same contract as [`Self::create_recurring_job`].
    pub async fn update_recurring_job(&self, request: &RecurringJobRequest) -> Result<()> {
        let cron_job = self.build_recurring_job(request)?;
        self.api.update_cron_job(&cron_job).await
    }

    /// Deletes the recurring-job object; absence is tolerated.
    ///
    /// # Errors
    ///
    /// [`Error::ClusterApi`] on cluster failures other than absence.
    pub async fn delete_recurring_job(&self, name: &str) -> Result<()> {
        self.api.delete_cron_job(name).await
    }

    /// Builds the merged recurring-job object for a request.
    ///
    /// # Errors
    ///
    /// [`Error::DefinitionShape`] if the result is structurally incomplete
    /// after template fallback, or the schedule expression is invalid.
    pub fn build_recurring_job(&self, request: &RecurringJobRequest) -> Result<CronJob> {
        validate_schedule(&request.schedule)?;

        let mut cron_job = self.templates.cron_job();
        cron_job.metadata.name = Some(request.name.clone());
        merge_into(
            cron_job.metadata.labels.get_or_insert_with(BTreeMap::new),
            &engine_labels(&request.name),
        );
        merge_into(
            cron_job.metadata.labels.get_or_insert_with(BTreeMap::new),
            &request.labels,
        );
        merge_into(
            cron_job
                .metadata
                .annotations
                .get_or_insert_with(BTreeMap::new),
            &request.annotations,
        );

        let spec = cron_job
            .spec
            .as_mut()
            .ok_or_else(|| Error::definition_shape("recurring-job template has no spec"))?;
        spec.schedule.clone_from(&request.schedule);
        spec.suspend = Some(!request.enabled);

        let job_metadata = spec
            .job_template
            .metadata
            .get_or_insert_with(ObjectMeta::default);
        merge_into(
            job_metadata.labels.get_or_insert_with(BTreeMap::new),
            &engine_labels(&request.name),
        );
        // Spawned job objects carry the schedule they were deployed with, so
        // execution records can snapshot it without another lookup.
        job_metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(annotations::SCHEDULE.to_string(), request.schedule.clone());

        let job_spec = spec
            .job_template
            .spec
            .as_mut()
            .ok_or_else(|| Error::definition_shape("recurring-job template has no job spec"))?;

        let pod_metadata = job_spec
            .template
            .metadata
            .get_or_insert_with(ObjectMeta::default);
        merge_into(
            pod_metadata.labels.get_or_insert_with(BTreeMap::new),
            &engine_labels(&request.name),
        );
        merge_into(
            pod_metadata.labels.get_or_insert_with(BTreeMap::new),
            &request.labels,
        );

        let pod_spec = job_spec
            .template
            .spec
            .as_mut()
            .ok_or_else(|| Error::definition_shape("recurring-job template has no pod spec"))?;

        let mut main_container = request.main_container.clone();
        main_container.image = Some(request.image.clone());
        pod_spec.containers = vec![main_container];
        pod_spec.init_containers = request
            .init_container
            .clone()
            .map(|init_container| vec![init_container]);
        pod_spec.volumes = if request.volumes.is_empty() {
            None
        } else {
            Some(request.volumes.clone())
        };

        let pull_secrets: Vec<LocalObjectReference> = request
            .image_pull_secrets
            .iter()
            .filter(|secret| !secret.trim().is_empty())
            .map(|secret| LocalObjectReference {
                name: secret.clone(),
            })
            .collect();
        pod_spec.image_pull_secrets = if pull_secrets.is_empty() {
            None
        } else {
            Some(pull_secrets)
        };

        validate(&cron_job)?;
        Ok(cron_job)
    }

    /// Starts one execution of a deployed data job.
    ///
    /// Derives a one-shot job object from the recurring job's embedded job
    /// template: `extra_annotations` are merged into existing annotations,
    /// `extra_env` is appended to the main container's environment, and a
    /// non-empty `extra_arguments` map is JSON-encoded and appended to the
    /// runtime invocation in the main container's command.
    ///
    /// # Errors
    ///
    /// [`Error::ClusterApi`] if the recurring job or its template sub-objects
    /// are missing ("does not exist or is not properly defined");
    /// [`Error::DefinitionShape`] if arguments were supplied but the command
    /// carries no run-command marker.
    pub async fn start_execution(
        &self,
        cron_name: &str,
        execution_id: &ExecutionId,
        extra_annotations: &BTreeMap<String, String>,
        extra_env: &[EnvVar],
        extra_arguments: Option<&serde_json::Map<String, serde_json::Value>>,
        job_name: &str,
    ) -> Result<()> {
        let not_defined = || {
            Error::cluster_api(format!(
                "data job {cron_name} does not exist or is not properly defined"
            ))
        };

        let cron_job = self.api.get_cron_job(cron_name).await?.ok_or_else(not_defined)?;
        let spec = cron_job.spec.ok_or_else(not_defined)?;
        let job_template = spec.job_template;
        let mut job_spec = job_template.spec.ok_or_else(not_defined)?;
        job_spec.ttl_seconds_after_finished = Some(self.finished_job_ttl_secs);

        let mut metadata = job_template.metadata.unwrap_or_default();
        metadata.name = Some(job_name.to_string());
        merge_into(
            metadata.labels.get_or_insert_with(BTreeMap::new),
            &engine_labels(cron_name),
        );
        merge_into(
            metadata.annotations.get_or_insert_with(BTreeMap::new),
            extra_annotations,
        );

        let pod_spec = job_spec.template.spec.as_mut().ok_or_else(not_defined)?;
        let main_container = pod_spec.containers.first_mut().ok_or_else(not_defined)?;

        if !extra_env.is_empty() {
            main_container
                .env
                .get_or_insert_with(Vec::new)
                .extend(extra_env.iter().cloned());
        }

        if let Some(arguments) = extra_arguments.filter(|map| !map.is_empty()) {
            self.attach_arguments(main_container, arguments)?;
        }

        tracing::debug!(
            job = cron_name,
            execution = %execution_id,
            "starting execution"
        );

        let job = Job {
            metadata,
            spec: Some(job_spec),
            ..Job::default()
        };
        self.api.create_job(&job).await
    }

    /// Appends a JSON-encoded arguments map to the runtime invocation.
    fn attach_arguments(
        &self,
        container: &mut Container,
        arguments: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<()> {
        let marker_missing = || {
            Error::definition_shape(format!(
                "main container command has no '{}' invocation to attach arguments to",
                self.run_command_marker
            ))
        };

        let command = container.command.as_mut().ok_or_else(marker_missing)?;
        let last = command.last_mut().ok_or_else(marker_missing)?;
        if !last.contains(&self.run_command_marker) {
            return Err(marker_missing());
        }

        let encoded = serde_json::to_string(&serde_json::Value::Object(arguments.clone()))
            .map_err(|err| Error::serialization(format!("execution arguments: {err}")))?;
        last.push_str(" --arguments '");
        last.push_str(&encoded);
        last.push('\'');
        Ok(())
    }

    /// Cancels a running one-shot job by deleting it and its pods.
    ///
    /// # Errors
    ///
    /// [`Error::NotCancellable`] when the cluster returned no deletion
    /// status at all; [`Error::ClusterApi`] carrying the server's
    /// reason/message/code for any non-success status. Already-absent
    /// resources are tolerated.
    pub async fn cancel_execution(&self, job_name: &str) -> Result<()> {
        let outcome = self.api.delete_job_cascade(job_name).await?;

        if outcome.status.is_none() && outcome.code.is_none() {
            return Err(Error::not_cancellable(
                format!("cluster returned no deletion status for job {job_name}"),
                None,
            ));
        }

        if outcome.is_success() {
            return Ok(());
        }

        Err(Error::ClusterApi {
            message: outcome
                .message
                .unwrap_or_else(|| format!("deletion of job {job_name} rejected")),
            reason: outcome.reason,
            code: outcome.code,
            source: None,
        })
    }

    /// True if the cluster still runs at least one job object for this data
    /// job.
    ///
    /// A job is "still running" until it acquires a completion condition;
    /// the brief window where no pod is active during startup counts as
    /// running.
    ///
    /// # Errors
    ///
    /// [`Error::ClusterApi`] on cluster failures.
    pub async fn is_running_job(&self, name: &str) -> Result<bool> {
        let selector = format!("{}={name}", labels::JOB_NAME);
        let list = self.api.list_jobs(&selector).await?;
        Ok(list.items.iter().any(super::JobSummary::is_running))
    }

    /// Finds the pod behind a one-shot job. Best-effort: absence is not an
    /// error.
    ///
    /// # Errors
    ///
    /// [`Error::ClusterApi`] on cluster failures other than absence.
    pub async fn get_pod(
        &self,
        job_name: &str,
    ) -> Result<Option<k8s_openapi::api::core::v1::Pod>> {
        self.api.get_pod_for_job(job_name).await
    }

    /// Reads the logs of the pod behind a one-shot job. Best-effort: a
    /// missing pod yields an empty string.
    ///
    /// # Errors
    ///
    /// [`Error::ClusterApi`] on cluster failures other than absence.
    pub async fn get_job_logs(&self, job_name: &str) -> Result<String> {
        let Some(pod) = self.api.get_pod_for_job(job_name).await? else {
            return Ok(String::new());
        };
        let Some(pod_name) = pod.metadata.name else {
            return Ok(String::new());
        };
        self.api.pod_logs(&pod_name).await
    }

    /// Lists completed and running job objects under a label selector.
    ///
    /// # Errors
    ///
    /// [`Error::ClusterApi`] on cluster failures.
    pub async fn list_completed_and_running(&self, label_selector: &str) -> Result<JobList> {
        self.api.list_jobs(label_selector).await
    }

    /// Opens an incremental watch on job objects.
    ///
    /// # Errors
    ///
    /// [`Error::ClusterApi`] on cluster failures.
    pub async fn watch(
        &self,
        label_selector: &str,
        from_version: &str,
        timeout: Duration,
    ) -> Result<JobEventStream> {
        self.api.watch_jobs(label_selector, from_version, timeout).await
    }
}

/// Engine-owned labels stamped on every object of a data job.
fn engine_labels(job_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            labels::JOB_TYPE.to_string(),
            labels::TYPE_DATA_JOB.to_string(),
        ),
        (labels::JOB_NAME.to_string(), job_name.to_string()),
    ])
}

fn merge_into(target: &mut BTreeMap<String, String>, source: &BTreeMap<String, String>) {
    for (key, value) in source {
        target.insert(key.clone(), value.clone());
    }
}

/// Validates a schedule expression.
///
/// Cluster schedules are five-field cron expressions; macros (`@hourly`)
/// pass through unchanged.
///
/// # Errors
///
/// [`Error::DefinitionShape`] for unparsable expressions.
pub fn validate_schedule(expression: &str) -> Result<()> {
    let trimmed = expression.trim();
    let normalized = if trimmed.starts_with('@') {
        trimmed.to_string()
    } else {
        // The cron crate wants a seconds field; cluster schedules omit it.
        format!("0 {trimmed}")
    };

    cron::Schedule::from_str(&normalized).map_err(|err| {
        Error::definition_shape(format!("invalid schedule expression {expression:?}: {err}"))
    })?;
    Ok(())
}
