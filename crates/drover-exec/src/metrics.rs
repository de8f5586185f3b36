//! Observability metrics for the reconciliation engine.
//!
//! Metrics are emitted through the `metrics` facade. To export to
//! Prometheus, install a recorder in the binary:
//!
//! ```rust,ignore
//! use metrics_exporter_prometheus::PrometheusBuilder;
//!
//! PrometheusBuilder::new()
//!     .with_http_listener(([0, 0, 0, 0], 9090))
//!     .install()
//!     .expect("failed to install Prometheus recorder");
//! ```
//!
//! ## Metrics Exported
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `drover_exec_monitor_invocations_total` | Counter | - | Reconciliation ticks started |
//! | `drover_exec_monitor_successes_total` | Counter | - | Ticks that completed |
//! | `drover_exec_monitor_failures_total` | Counter | - | Ticks that failed |
//! | `drover_exec_monitor_skipped_total` | Counter | - | Ticks skipped (lease held elsewhere) |
//! | `drover_exec_monitor_tick_duration_seconds` | Histogram | - | Tick processing time |
//! | `drover_exec_data_job_info` | Gauge | `data_job`, `team` | Presence marker per job |
//! | `drover_exec_data_job_notification_delay_minutes` | Gauge | `data_job` | Configured notification delay |
//! | `drover_exec_data_job_termination_status` | Gauge | `data_job` | Latest termination status (encoded) |
//! | `drover_exec_data_job_deployment_status` | Gauge | `data_job` | Deployment status (encoded) |
//! | `drover_exec_deployment_transitions` | Histogram | `data_job`, `status` | Deployment status transitions |

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use metrics::{counter, gauge, histogram};

use crate::model::{DataJob, DeploymentStatus};

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: reconciliation ticks started.
    pub const MONITOR_INVOCATIONS_TOTAL: &str = "drover_exec_monitor_invocations_total";
    /// Counter: reconciliation ticks that completed.
    pub const MONITOR_SUCCESSES_TOTAL: &str = "drover_exec_monitor_successes_total";
    /// Counter: reconciliation ticks that failed.
    pub const MONITOR_FAILURES_TOTAL: &str = "drover_exec_monitor_failures_total";
    /// Counter: reconciliation ticks skipped because the lease was held
    /// by another instance.
    pub const MONITOR_SKIPPED_TOTAL: &str = "drover_exec_monitor_skipped_total";
    /// Histogram: tick processing time in seconds.
    pub const MONITOR_TICK_DURATION_SECONDS: &str = "drover_exec_monitor_tick_duration_seconds";
    /// Gauge: presence marker per data job.
    pub const JOB_INFO: &str = "drover_exec_data_job_info";
    /// Gauge: configured notification delay per data job.
    pub const JOB_NOTIFICATION_DELAY_MINUTES: &str =
        "drover_exec_data_job_notification_delay_minutes";
    /// Gauge: latest termination status per data job (encoded).
    pub const JOB_TERMINATION_STATUS: &str = "drover_exec_data_job_termination_status";
    /// Gauge: deployment status per data job (encoded).
    pub const JOB_DEPLOYMENT_STATUS: &str = "drover_exec_data_job_deployment_status";
    /// Histogram: deployment status transitions per data job.
    pub const DEPLOYMENT_TRANSITIONS: &str = "drover_exec_deployment_transitions";
}

/// Label keys used across metrics.
pub mod labels {
    /// Data job name.
    pub const DATA_JOB: &str = "data_job";
    /// Owning team.
    pub const TEAM: &str = "team";
    /// Status value (for transition events).
    pub const STATUS: &str = "status";
}

/// High-level interface for recording engine metrics.
///
/// Cheap to clone and share across tasks.
#[derive(Debug, Clone, Default)]
pub struct ExecMetrics;

impl ExecMetrics {
    /// Creates a new metrics recorder.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Records the start of a reconciliation tick.
    pub fn record_invocation(&self) {
        counter!(names::MONITOR_INVOCATIONS_TOTAL).increment(1);
    }

    /// Records a completed reconciliation tick.
    pub fn record_success(&self) {
        counter!(names::MONITOR_SUCCESSES_TOTAL).increment(1);
    }

    /// Records a failed reconciliation tick.
    pub fn record_failure(&self) {
        counter!(names::MONITOR_FAILURES_TOTAL).increment(1);
    }

    /// Records a tick skipped because the lease was held elsewhere.
    pub fn record_skipped(&self) {
        counter!(names::MONITOR_SKIPPED_TOTAL).increment(1);
    }

    /// Records tick processing time.
    pub fn observe_tick_duration(&self, duration: Duration) {
        histogram!(names::MONITOR_TICK_DURATION_SECONDS).record(duration.as_secs_f64());
    }

    /// Records a deployment status transition for a job.
    pub fn record_deployment_transition(&self, job_name: &str, status: DeploymentStatus) {
        histogram!(
            names::DEPLOYMENT_TRANSITIONS,
            labels::DATA_JOB => job_name.to_string(),
            labels::STATUS => status.as_str(),
        )
        .record(status.as_metric_value());
    }
}

/// Tag set currently emitted for one job's gauges.
#[derive(Debug, Clone, PartialEq, Eq)]
struct GaugeTags {
    team: String,
}

/// Per-job status gauge registry with replace-on-tag-change semantics.
///
/// The registry is shared between the scheduler task and metric scrapes, so
/// entries are replaced wholesale rather than mutated in place: when a job's
/// tag set changes, the old series is zeroed before the new one is emitted,
/// avoiding duplicate live series under both tag sets. Series belonging to
/// deleted jobs are zeroed and dropped from the registry; the exporter's
/// idle-series pruning removes them from scrape output.
#[derive(Debug, Default)]
pub struct StatusGauges {
    entries: Mutex<HashMap<String, GaugeTags>>,
}

impl StatusGauges {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Re-emits every per-job gauge from the given job set.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    pub fn sync(&self, jobs: &[DataJob]) {
        let mut entries = self.entries.lock().expect("lock");

        for job in jobs {
            let tags = GaugeTags {
                team: job.config.team.clone(),
            };

            if let Some(previous) = entries.get(&job.name) {
                if *previous != tags {
                    Self::zero_info(&job.name, &previous.team);
                }
            }

            gauge!(
                names::JOB_INFO,
                labels::DATA_JOB => job.name.clone(),
                labels::TEAM => tags.team.clone(),
            )
            .set(1.0);
            gauge!(
                names::JOB_NOTIFICATION_DELAY_MINUTES,
                labels::DATA_JOB => job.name.clone(),
            )
            .set(f64::from(job.config.notification_delay_period_minutes));
            if let Some(status) = job.latest_job_termination_status {
                gauge!(
                    names::JOB_TERMINATION_STATUS,
                    labels::DATA_JOB => job.name.clone(),
                )
                .set(status.as_metric_value());
            }
            gauge!(
                names::JOB_DEPLOYMENT_STATUS,
                labels::DATA_JOB => job.name.clone(),
            )
            .set(job.latest_job_deployment_status.as_metric_value());

            entries.insert(job.name.clone(), tags);
        }

        // Zero out series of jobs that no longer exist.
        let live: std::collections::HashSet<&str> =
            jobs.iter().map(|job| job.name.as_str()).collect();
        let dead: Vec<String> = entries
            .keys()
            .filter(|name| !live.contains(name.as_str()))
            .cloned()
            .collect();
        for name in dead {
            if let Some(tags) = entries.remove(&name) {
                Self::zero_info(&name, &tags.team);
            }
            gauge!(names::JOB_NOTIFICATION_DELAY_MINUTES, labels::DATA_JOB => name.clone()).set(0.0);
            gauge!(names::JOB_TERMINATION_STATUS, labels::DATA_JOB => name.clone()).set(0.0);
            gauge!(names::JOB_DEPLOYMENT_STATUS, labels::DATA_JOB => name.clone()).set(0.0);
        }
    }

    /// Sets one job's deployment-status gauge immediately.
    pub fn set_deployment_status(&self, job_name: &str, status: DeploymentStatus) {
        gauge!(
            names::JOB_DEPLOYMENT_STATUS,
            labels::DATA_JOB => job_name.to_string(),
        )
        .set(status.as_metric_value());
    }

    /// Names of jobs the registry currently tracks.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    #[must_use]
    pub fn tracked(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.lock().expect("lock").keys().cloned().collect();
        names.sort();
        names
    }

    fn zero_info(job_name: &str, team: &str) {
        gauge!(
            names::JOB_INFO,
            labels::DATA_JOB => job_name.to_string(),
            labels::TEAM => team.to_string(),
        )
        .set(0.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::JobConfig;

    fn job(name: &str, team: &str) -> DataJob {
        DataJob::new(
            name,
            JobConfig {
                team: team.to_string(),
                ..JobConfig::default()
            },
        )
    }

    #[test]
    fn metrics_can_record_without_a_recorder() {
        let metrics = ExecMetrics::new();
        metrics.record_invocation();
        metrics.record_success();
        metrics.record_failure();
        metrics.record_skipped();
        metrics.observe_tick_duration(Duration::from_millis(25));
        metrics.record_deployment_transition("ingest", DeploymentStatus::Success);
    }

    #[test]
    fn gauge_registry_tracks_live_jobs() {
        let gauges = StatusGauges::new();
        gauges.sync(&[job("a", "sre"), job("b", "data")]);
        assert_eq!(gauges.tracked(), vec!["a".to_string(), "b".to_string()]);

        // Job b disappears; its entry is dropped.
        gauges.sync(&[job("a", "sre")]);
        assert_eq!(gauges.tracked(), vec!["a".to_string()]);
    }

    #[test]
    fn tag_change_replaces_entry() {
        let gauges = StatusGauges::new();
        gauges.sync(&[job("a", "sre")]);
        gauges.sync(&[job("a", "platform")]);
        assert_eq!(gauges.tracked(), vec!["a".to_string()]);
    }
}
