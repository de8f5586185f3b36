//! Recurring-job object templates.
//!
//! The engine builds every recurring-job object from a template: a built-in
//! default is always available, and an operator may point the service at an
//! override file to adjust cluster-specific details (runtime class, image
//! pull policy, history limits).
//!
//! Override handling is deliberately forgiving: an unreadable or unparsable
//! file falls back to the built-in default wholesale, while a parsable but
//! partial file falls back **field by field**: any missing metadata, spec,
//! job template, or pod template sub-object is taken from the default, down
//! to the pod template level. Structural validation runs eagerly so a
//! hollow template is rejected at startup rather than at first deployment.

use std::path::Path;

use k8s_openapi::api::batch::v1::{CronJob, CronJobSpec};
use tracing::warn;

use crate::error::{Error, Result};

/// The built-in recurring-job template, compiled into the binary.
const BUILTIN_TEMPLATE: &str = include_str!("../../templates/data_job_template.yaml");

/// A validated recurring-job template.
#[derive(Debug, Clone)]
pub struct TemplateSet {
    cron_template: CronJob,
}

impl TemplateSet {
    /// Loads the built-in template.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Serialization`] or [`Error::DefinitionShape`] if the
    /// compiled-in template is unparsable or structurally incomplete; both
    /// indicate a broken build.
    pub fn builtin() -> Result<Self> {
        let cron_template = parse_template(BUILTIN_TEMPLATE)?;
        validate(&cron_template)?;
        Ok(Self { cron_template })
    }

    /// Loads the template, overlaying an operator override when configured.
    ///
    /// # Errors
    ///
    /// Returns an error only if the *built-in* template is broken; override
    /// problems are logged and fall back to the default.
    pub fn load(override_path: Option<&Path>) -> Result<Self> {
        let builtin = Self::builtin()?;
        let Some(path) = override_path else {
            return Ok(builtin);
        };

        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "cannot read template override, using built-in template");
                return Ok(builtin);
            }
        };

        let overlay = match parse_template(&raw) {
            Ok(overlay) => overlay,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "cannot parse template override, using built-in template");
                return Ok(builtin);
            }
        };

        let merged = merge(builtin.cron_template, overlay);
        validate(&merged)?;
        Ok(Self {
            cron_template: merged,
        })
    }

    /// Returns a fresh copy of the template to build an object from.
    #[must_use]
    pub fn cron_job(&self) -> CronJob {
        self.cron_template.clone()
    }
}

fn parse_template(raw: &str) -> Result<CronJob> {
    serde_yaml::from_str(raw)
        .map_err(|err| Error::serialization(format!("recurring-job template: {err}")))
}

/// Overlays `overlay` on `default`, falling back field by field.
///
/// Fallback granularity follows the object tree down to the pod template:
/// metadata maps, the cron spec, the job template and its metadata/spec, and
/// the pod template itself each fall back independently. Anything below the
/// pod template travels with it.
fn merge(default: CronJob, mut overlay: CronJob) -> CronJob {
    if overlay.metadata.name.is_none() {
        overlay.metadata.name = default.metadata.name;
    }
    if overlay.metadata.labels.is_none() {
        overlay.metadata.labels = default.metadata.labels;
    }
    if overlay.metadata.annotations.is_none() {
        overlay.metadata.annotations = default.metadata.annotations;
    }

    let Some(default_spec) = default.spec else {
        return overlay;
    };
    let Some(mut spec) = overlay.spec else {
        overlay.spec = Some(default_spec);
        return overlay;
    };

    if spec.schedule.trim().is_empty() {
        spec.schedule = default_spec.schedule;
    }
    if spec.suspend.is_none() {
        spec.suspend = default_spec.suspend;
    }
    if spec.concurrency_policy.is_none() {
        spec.concurrency_policy = default_spec.concurrency_policy;
    }
    if spec.starting_deadline_seconds.is_none() {
        spec.starting_deadline_seconds = default_spec.starting_deadline_seconds;
    }
    if spec.successful_jobs_history_limit.is_none() {
        spec.successful_jobs_history_limit = default_spec.successful_jobs_history_limit;
    }
    if spec.failed_jobs_history_limit.is_none() {
        spec.failed_jobs_history_limit = default_spec.failed_jobs_history_limit;
    }

    let default_job_template = default_spec.job_template;
    if spec.job_template.metadata.is_none() {
        spec.job_template.metadata = default_job_template.metadata;
    }
    match (&mut spec.job_template.spec, default_job_template.spec) {
        (None, default_job_spec) => spec.job_template.spec = default_job_spec,
        (Some(job_spec), Some(default_job_spec)) => {
            if job_spec.active_deadline_seconds.is_none() {
                job_spec.active_deadline_seconds = default_job_spec.active_deadline_seconds;
            }
            if job_spec.backoff_limit.is_none() {
                job_spec.backoff_limit = default_job_spec.backoff_limit;
            }
            if job_spec.ttl_seconds_after_finished.is_none() {
                job_spec.ttl_seconds_after_finished = default_job_spec.ttl_seconds_after_finished;
            }
            if job_spec.template.metadata.is_none() {
                job_spec.template.metadata = default_job_spec.template.metadata;
            }
            if job_spec.template.spec.is_none() {
                job_spec.template.spec = default_job_spec.template.spec;
            }
        }
        (Some(_), None) => {}
    }

    overlay.spec = Some(spec);
    overlay
}

/// Validates that a template is structurally complete.
///
/// # Errors
///
/// Returns [`Error::DefinitionShape`] naming the first missing sub-object.
pub fn validate(cron_job: &CronJob) -> Result<()> {
    let spec: &CronJobSpec = cron_job
        .spec
        .as_ref()
        .ok_or_else(|| Error::definition_shape("recurring-job template has no spec"))?;

    let job_spec = spec
        .job_template
        .spec
        .as_ref()
        .ok_or_else(|| Error::definition_shape("recurring-job template has no job spec"))?;

    let pod_spec = job_spec
        .template
        .spec
        .as_ref()
        .ok_or_else(|| Error::definition_shape("recurring-job template has no pod spec"))?;

    if pod_spec.containers.is_empty() {
        return Err(Error::definition_shape(
            "recurring-job template pod spec has no containers",
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn builtin_template_is_valid() {
        let templates = TemplateSet::builtin().expect("built-in template");
        let cron_job = templates.cron_job();
        let spec = cron_job.spec.expect("spec");
        assert_eq!(spec.suspend, Some(true));
        assert_eq!(spec.concurrency_policy.as_deref(), Some("Forbid"));
    }

    #[test]
    fn missing_override_file_falls_back() {
        let templates =
            TemplateSet::load(Some(Path::new("/nonexistent/template.yaml"))).expect("fallback");
        assert!(templates.cron_job().spec.is_some());
    }

    #[test]
    fn garbage_override_falls_back() {
        let mut file = tempfile();
        writeln!(file.0, ":: not yaml ::").expect("write");
        let templates = TemplateSet::load(Some(&file.1)).expect("fallback");
        assert_eq!(
            templates.cron_job().spec.expect("spec").suspend,
            Some(true)
        );
    }

    #[test]
    fn partial_override_falls_back_field_by_field() {
        let mut file = tempfile();
        // An override that only adjusts the history limits; everything else
        // must come from the built-in default.
        writeln!(
            file.0,
            "apiVersion: batch/v1\nkind: CronJob\nmetadata:\n  name: site-template\nspec:\n  schedule: \"\"\n  successfulJobsHistoryLimit: 7\n  jobTemplate: {{}}"
        )
        .expect("write");

        let templates = TemplateSet::load(Some(&file.1)).expect("merged");
        let cron_job = templates.cron_job();
        assert_eq!(cron_job.metadata.name.as_deref(), Some("site-template"));

        let spec = cron_job.spec.expect("spec");
        assert_eq!(spec.successful_jobs_history_limit, Some(7));
        assert_eq!(spec.schedule, "0 * * * *");
        assert_eq!(spec.suspend, Some(true));

        let pod_spec = spec
            .job_template
            .spec
            .expect("job spec from default")
            .template
            .spec
            .expect("pod spec from default");
        assert_eq!(pod_spec.containers.len(), 1);
    }

    #[test]
    fn hollow_template_is_rejected() {
        let cron_job = CronJob::default();
        let err = validate(&cron_job).expect_err("no spec");
        assert!(matches!(err, Error::DefinitionShape { .. }));
    }

    fn tempfile() -> (std::fs::File, std::path::PathBuf) {
        let unique = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        let path = std::env::temp_dir().join(format!("drover-template-test-{unique}.yaml"));
        (std::fs::File::create(&path).expect("create"), path)
    }
}
