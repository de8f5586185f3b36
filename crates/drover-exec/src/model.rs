//! Domain model for data jobs and their executions.
//!
//! The two persistent entities are [`DataJob`] (a named, user-owned recurring
//! job definition with cached summary columns) and [`DataJobExecution`] (one
//! run of a data job). Everything else here is embedded value state.
//!
//! ## Status terminality
//!
//! `SUCCEEDED`, `USER_ERROR`, `CANCELLED`, and `SKIPPED` are *hard-terminal*:
//! once stored for an execution they are never overwritten. `PLATFORM_ERROR`
//! is *soft-terminal*: the cluster may retry the same job under the same
//! execution ID, so a later `RUNNING` observation is accepted before a final
//! verdict lands.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use drover_core::{ExecutionId, OpId};

/// Normalized status of a data-job execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    /// Submitted to the cluster; no pod has started yet.
    Submitted,
    /// A pod is (or was last observed) running.
    Running,
    /// Finished successfully at both the cluster and application level.
    Succeeded,
    /// Failed for a reason attributed to the job's owner.
    UserError,
    /// Failed for a reason attributed to the platform.
    PlatformError,
    /// The scheduled run was skipped (e.g. a previous run still held the slot).
    Skipped,
    /// Cancelled by a user before completion.
    Cancelled,
}

impl ExecutionStatus {
    /// Returns true if this status ends an execution (hard or soft).
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Submitted | Self::Running)
    }

    /// Returns true if this status is hard-terminal (never overwritten).
    #[must_use]
    pub const fn is_sticky(self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::UserError | Self::Cancelled | Self::Skipped
        )
    }

    /// Returns true if a stored `self` may be replaced by `next` for the
    /// same execution ID.
    ///
    /// Hard-terminal statuses accept nothing but themselves. A stored
    /// `PLATFORM_ERROR` accepts any later observation: the cluster retries
    /// failed jobs under the same execution ID, so the earlier verdict was
    /// provisional.
    #[must_use]
    pub fn accepts(self, next: Self) -> bool {
        if self == next {
            return true;
        }
        !self.is_sticky()
    }

    /// Returns true if an execution in this status may be cancelled.
    #[must_use]
    pub const fn is_cancellable(self) -> bool {
        matches!(self, Self::Submitted | Self::Running)
    }

    /// The canonical wire form of the status.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Submitted => "SUBMITTED",
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::UserError => "USER_ERROR",
            Self::PlatformError => "PLATFORM_ERROR",
            Self::Skipped => "SKIPPED",
            Self::Cancelled => "CANCELLED",
        }
    }

    /// Stable numeric encoding used for status gauges.
    #[must_use]
    pub const fn as_metric_value(self) -> f64 {
        match self {
            Self::Succeeded => 0.0,
            Self::UserError => 1.0,
            Self::PlatformError => 2.0,
            Self::Skipped => 3.0,
            Self::Cancelled => 4.0,
            Self::Submitted => 5.0,
            Self::Running => 6.0,
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Deployment state of a data job's recurring-job object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeploymentStatus {
    /// Never deployed.
    #[default]
    None,
    /// A deployment is in flight.
    Pending,
    /// The last deployment succeeded.
    Success,
    /// The last deployment failed.
    Failed,
}

impl DeploymentStatus {
    /// The canonical wire form of the status.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::Pending => "PENDING",
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
        }
    }

    /// Stable numeric encoding used for status gauges.
    #[must_use]
    pub const fn as_metric_value(self) -> f64 {
        match self {
            Self::None => 0.0,
            Self::Pending => 1.0,
            Self::Success => 2.0,
            Self::Failed => 3.0,
        }
    }
}

impl std::fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How an execution was triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionType {
    /// Started by a user through the API.
    Manual,
    /// Spawned by the recurring-job schedule.
    #[default]
    Scheduled,
}

impl ExecutionType {
    /// The canonical wire form of the type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Manual => "MANUAL",
            Self::Scheduled => "SCHEDULED",
        }
    }
}

/// Requested and limited compute resources for an execution's container.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceProfile {
    /// Requested CPU cores.
    pub cpu_request: f64,
    /// CPU core limit.
    pub cpu_limit: f64,
    /// Requested memory in MiB.
    pub memory_request_mi: i64,
    /// Memory limit in MiB.
    pub memory_limit_mi: i64,
}

/// Snapshot of what was actually deployed for a data job.
///
/// Persisted when a deployment reaches `SUCCESS` so later passes can compare
/// the recorded spec against cluster state.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentSnapshot {
    /// Container image reference.
    pub image: String,
    /// Schedule expression the recurring job was deployed with.
    pub schedule: String,
    /// Resources the main container was deployed with.
    pub resources: ResourceProfile,
    /// Version of the job runtime baked into the image.
    pub runtime_version: Option<String>,
    /// Source version (e.g. VCS revision) of the job code.
    pub job_version: Option<String>,
    /// Principal that performed the deployment.
    pub deployed_by: Option<String>,
    /// When the deployment completed.
    pub deployed_date: Option<DateTime<Utc>>,
}

/// Embedded configuration of a data job.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobConfig {
    /// Cron schedule expression (five-field cluster form).
    pub schedule: String,
    /// Owning team.
    pub team: String,
    /// Whether scheduled executions are enabled.
    pub enabled: bool,
    /// Recipients notified on successful executions.
    pub notified_on_success: Vec<String>,
    /// Recipients notified on user-error executions.
    pub notified_on_user_error: Vec<String>,
    /// Recipients notified on platform-error executions.
    pub notified_on_platform_error: Vec<String>,
    /// Whether success notifications are sent at all.
    pub notify_on_success: bool,
    /// Whether execution notifications are enabled for this job.
    pub enable_execution_notifications: bool,
    /// Minutes to wait before notifying about a delayed execution.
    pub notification_delay_period_minutes: u32,
}

/// A named, user-owned recurring data job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataJob {
    /// Unique job name; doubles as the recurring-job object name.
    pub name: String,
    /// Embedded configuration.
    pub config: JobConfig,
    /// Deployment state of the recurring-job object.
    pub latest_job_deployment_status: DeploymentStatus,
    /// Status of the most recent finished execution.
    pub last_execution_status: Option<ExecutionStatus>,
    /// End time of the most recent finished execution (monotonic watermark).
    pub last_execution_end_time: Option<DateTime<Utc>>,
    /// Duration of the most recent finished execution, in seconds.
    pub last_execution_duration_secs: Option<i64>,
    /// Termination status of the latest observed execution.
    pub latest_job_termination_status: Option<ExecutionStatus>,
    /// Execution ID the termination status refers to.
    pub latest_job_execution_id: Option<ExecutionId>,
    /// Snapshot of the last successfully deployed spec.
    pub deployment: Option<DeploymentSnapshot>,
}

impl DataJob {
    /// Creates a new job with empty summary columns.
    #[must_use]
    pub fn new(name: impl Into<String>, config: JobConfig) -> Self {
        Self {
            name: name.into(),
            config,
            latest_job_deployment_status: DeploymentStatus::None,
            last_execution_status: None,
            last_execution_end_time: None,
            last_execution_duration_secs: None,
            latest_job_termination_status: None,
            latest_job_execution_id: None,
            deployment: None,
        }
    }
}

/// One run of a data job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataJobExecution {
    /// Unique execution ID; doubles as the one-shot job object name.
    pub id: ExecutionId,
    /// Owning job name.
    pub job_name: String,
    /// How the execution was triggered.
    pub exec_type: ExecutionType,
    /// Current normalized status.
    pub status: ExecutionStatus,
    /// When the execution started, once observed.
    pub start_time: Option<DateTime<Utc>>,
    /// When the execution ended; set only once the status is terminal.
    pub end_time: Option<DateTime<Utc>>,
    /// Correlation ID for the operation that started the execution.
    pub op_id: Option<OpId>,
    /// Principal that started the execution, for manual runs.
    pub started_by: Option<String>,
    /// Human-readable outcome message.
    pub message: String,
    /// Runtime version reported by the job, when known.
    pub runtime_version: Option<String>,
    /// Resources the execution ran with.
    pub resources: Option<ResourceProfile>,
    /// Deployment snapshot fields captured at submit time.
    pub deployment: Option<DeploymentSnapshot>,
}

impl DataJobExecution {
    /// Creates a freshly submitted execution record.
    #[must_use]
    pub fn submitted(
        id: ExecutionId,
        job_name: impl Into<String>,
        exec_type: ExecutionType,
        op_id: OpId,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            job_name: job_name.into(),
            exec_type,
            status: ExecutionStatus::Submitted,
            start_time: Some(now),
            end_time: None,
            op_id: Some(op_id),
            started_by: None,
            message: String::new(),
            runtime_version: None,
            resources: None,
            deployment: None,
        }
    }

    /// Duration between start and end, in seconds, when both are known.
    #[must_use]
    pub fn duration_secs(&self) -> Option<i64> {
        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => Some((end - start).num_seconds()),
            _ => None,
        }
    }
}
