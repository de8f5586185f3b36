//! Execution lifecycle persistence.
//!
//! [`ExecutionLifecycle`] is the only writer of execution records and of the
//! per-job summary columns. It enforces the rules that make last-writer-wins
//! safe under duplicate and out-of-order event delivery:
//!
//! - **Stickiness**: a hard-terminal stored status is never overwritten; a
//!   stored `PLATFORM_ERROR` accepts later observations (the cluster retries
//!   failed jobs under the same execution ID)
//! - **Watermark**: the per-job last-execution summary only advances in end
//!   time
//! - **Idempotency**: re-delivering the termination of the latest execution
//!   changes nothing
//!
//! Every store write goes through the bounded retry in [`crate::retry`];
//! exhaustion is fatal to that single update, never to the caller's loop.
//!
//! The execution-row write and the job-summary-column writes are separate,
//! non-transactional operations. A crash between them leaves the execution
//! record ahead of the job summary; the summary is a cache rediscoverable
//! from execution history, so the gap is tolerated rather than closed.

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use k8s_openapi::api::core::v1::EnvVar;
use tracing::{debug, warn};

use drover_core::{ExecutionId, OpId};

use crate::classify::Classified;
use crate::cluster::facade::WorkloadFacade;
use crate::cluster::{annotations, JobSummary};
use crate::error::{Error, Result};
use crate::model::{DataJob, DataJobExecution, ExecutionStatus, ExecutionType};
use crate::retry::{with_retries, DEFAULT_ATTEMPTS};
use crate::store::Store;

/// Environment variable carrying the op ID into the job's container.
pub const OP_ID_ENV_VAR: &str = "DROVER_OP_ID";

/// Default grace period before a stored-but-unobserved execution is closed.
///
/// Covers the window between submitting a job object and it first appearing
/// in a list pass.
pub const DEFAULT_RUNNING_SYNC_GRACE_SECS: i64 = 300;

/// Message recorded when an execution's job object vanished from the cluster.
const LOST_EXECUTION_MESSAGE: &str =
    "Job object disappeared from the cluster before reporting a terminal status.";

/// Persists execution records and per-job summaries.
pub struct ExecutionLifecycle {
    store: Arc<dyn Store>,
    facade: Arc<WorkloadFacade>,
    retry_attempts: u32,
    running_sync_grace: Duration,
}

impl ExecutionLifecycle {
    /// Creates a lifecycle store with default retry and grace settings.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, facade: Arc<WorkloadFacade>) -> Self {
        Self {
            store,
            facade,
            retry_attempts: DEFAULT_ATTEMPTS,
            running_sync_grace: Duration::seconds(DEFAULT_RUNNING_SYNC_GRACE_SECS),
        }
    }

    /// Overrides the per-write retry attempt count.
    #[must_use]
    pub const fn with_retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = attempts;
        self
    }

    /// Overrides the grace period for [`Self::sync_running_set`].
    #[must_use]
    pub const fn with_running_sync_grace(mut self, grace: Duration) -> Self {
        self.running_sync_grace = grace;
        self
    }

    /// Starts one execution of a data job.
    ///
    /// Creates the one-shot job object on the cluster and inserts the
    /// `SUBMITTED` execution record.
    ///
    /// # Errors
    ///
    /// Propagates facade errors (missing or malformed recurring job) and
    /// [`Error::Repository`] if the record cannot be persisted.
    pub async fn start_execution(
        &self,
        job: &DataJob,
        exec_type: ExecutionType,
        started_by: Option<&str>,
        arguments: Option<&serde_json::Map<String, serde_json::Value>>,
    ) -> Result<DataJobExecution> {
        let execution_id = ExecutionId::generate(&job.name);
        let op_id = OpId::generate();

        let mut extra_annotations = BTreeMap::from([
            (
                annotations::EXECUTION_TYPE.to_string(),
                exec_type.as_str().to_string(),
            ),
            (annotations::OP_ID.to_string(), op_id.to_string()),
        ]);
        if let Some(principal) = started_by {
            extra_annotations.insert(annotations::STARTED_BY.to_string(), principal.to_string());
        }

        let extra_env = vec![EnvVar {
            name: OP_ID_ENV_VAR.to_string(),
            value: Some(op_id.to_string()),
            ..EnvVar::default()
        }];

        self.facade
            .start_execution(
                &job.name,
                &execution_id,
                &extra_annotations,
                &extra_env,
                arguments,
                execution_id.as_str(),
            )
            .await?;

        let mut execution = DataJobExecution::submitted(
            execution_id,
            &job.name,
            exec_type,
            op_id,
            Utc::now(),
        );
        execution.started_by = started_by.map(str::to_string);
        execution.deployment.clone_from(&job.deployment);
        execution.resources = job.deployment.as_ref().map(|snapshot| snapshot.resources);

        self.save(&execution, "insert submitted execution").await?;
        Ok(execution)
    }

    /// Cancels an execution.
    ///
    /// Rejected unless the stored status is `SUBMITTED` or `RUNNING`; on
    /// success the cluster job is deleted and the record transitions to
    /// `CANCELLED` with an end time.
    ///
    /// # Errors
    ///
    /// [`Error::NotCancellable`] for unknown or finished executions;
    /// facade and repository errors otherwise.
    pub async fn cancel_execution(&self, id: &ExecutionId) -> Result<DataJobExecution> {
        let Some(mut execution) = self.store.get_execution(id).await? else {
            return Err(Error::not_cancellable(
                format!("execution {id} not found"),
                None,
            ));
        };

        if !execution.status.is_cancellable() {
            return Err(Error::not_cancellable(
                format!(
                    "execution {id} is {} and can no longer be cancelled",
                    execution.status
                ),
                Some(execution.status),
            ));
        }

        self.facade.cancel_execution(id.as_str()).await?;

        execution.status = ExecutionStatus::Cancelled;
        execution.end_time = Some(Utc::now());
        execution.message = "Execution cancelled by user.".to_string();
        self.save(&execution, "persist cancellation").await?;

        self.update_last_execution(&execution).await?;
        self.update_termination_status(&execution).await?;
        Ok(execution)
    }

    /// Upserts the execution record for one classified observation.
    ///
    /// No-op when the summary carries a blank execution ID or when the
    /// stored status does not accept the new one. Returns the written row,
    /// or `None` when the observation was discarded.
    ///
    /// # Errors
    ///
    /// [`Error::Repository`] if persistence fails after retries.
    pub async fn record_execution(
        &self,
        job: &DataJob,
        summary: &JobSummary,
        outcome: &Classified,
    ) -> Result<Option<DataJobExecution>> {
        let id = ExecutionId::new(summary.name.clone());
        if id.is_blank() {
            return Ok(None);
        }

        let existing = self.store.get_execution(&id).await?;
        if let Some(existing) = &existing {
            if !existing.status.accepts(outcome.status) {
                debug!(
                    execution = %id,
                    stored = %existing.status,
                    observed = %outcome.status,
                    "discarding stale status observation"
                );
                return Ok(None);
            }
        }

        let mut execution = existing.unwrap_or_else(|| DataJobExecution {
            id: id.clone(),
            job_name: job.name.clone(),
            exec_type: summary.execution_type.unwrap_or_default(),
            status: outcome.status,
            start_time: None,
            end_time: None,
            op_id: summary
                .op_id
                .as_deref()
                .and_then(|raw| OpId::from_str(raw).ok()),
            started_by: None,
            message: String::new(),
            runtime_version: None,
            resources: None,
            deployment: None,
        });

        execution.status = outcome.status;
        execution.message.clone_from(&outcome.message);
        if !outcome.runtime_version.is_empty() {
            execution.runtime_version = Some(outcome.runtime_version.clone());
        }
        if summary.start_time.is_some() {
            execution.start_time = summary.start_time;
        }
        // The end time exists exactly while the status is terminal; a
        // PLATFORM_ERROR superseded by RUNNING reopens the record.
        execution.end_time = if outcome.status.is_terminal() {
            summary
                .completion_time
                .or(execution.end_time)
                .or_else(|| Some(Utc::now()))
        } else {
            None
        };
        if summary.resources.is_some() {
            execution.resources = summary.resources;
        }
        if execution.deployment.is_none() {
            execution.deployment.clone_from(&summary.deployment);
        }

        self.save(&execution, "upsert execution").await?;
        Ok(Some(execution))
    }

    /// Advances the job's last-execution summary columns.
    ///
    /// Applies only to finished executions with a hard-terminal (or skipped)
    /// status and an end time, and only when the end time is at or past the
    /// stored watermark. Returns whether the columns were written.
    ///
    /// # Errors
    ///
    /// [`Error::Repository`] if the column update fails after retries.
    pub async fn update_last_execution(&self, execution: &DataJobExecution) -> Result<bool> {
        if !execution.status.is_sticky() {
            return Ok(false);
        }
        let Some(end_time) = execution.end_time else {
            return Ok(false);
        };
        let Some(job) = self.store.get_job(&execution.job_name).await? else {
            return Ok(false);
        };
        if let Some(watermark) = job.last_execution_end_time {
            if end_time < watermark {
                debug!(
                    execution = %execution.id,
                    %watermark,
                    %end_time,
                    "discarding out-of-order last-execution update"
                );
                return Ok(false);
            }
        }

        let duration_secs = execution.duration_secs().unwrap_or_default();
        let store = &self.store;
        let job_name = execution.job_name.clone();
        let status = execution.status;
        with_retries("update last execution", self.retry_attempts, || {
            let job_name = job_name.clone();
            async move {
                store
                    .update_last_execution(&job_name, status, end_time, duration_secs)
                    .await
            }
        })
        .await
    }

    /// Advances the job's latest termination status columns.
    ///
    /// Skipped runs never touch the columns; an unchanged (status,
    /// execution ID) tuple is idempotent; for the same execution ID a
    /// hard-terminal stored status is never overwritten, while a stored
    /// `PLATFORM_ERROR` accepts `RUNNING`. A different execution ID always
    /// updates: the columns track the latest execution. Returns whether the
    /// columns were written.
    ///
    /// # Errors
    ///
    /// [`Error::Repository`] if the column update fails after retries.
    pub async fn update_termination_status(&self, execution: &DataJobExecution) -> Result<bool> {
        if execution.status == ExecutionStatus::Skipped {
            return Ok(false);
        }
        let Some(job) = self.store.get_job(&execution.job_name).await? else {
            return Ok(false);
        };

        if let (Some(stored_status), Some(stored_id)) = (
            job.latest_job_termination_status,
            job.latest_job_execution_id.as_ref(),
        ) {
            if stored_status == execution.status && *stored_id == execution.id {
                return Ok(false);
            }
            if *stored_id == execution.id && !stored_status.accepts(execution.status) {
                return Ok(false);
            }
        }

        let store = &self.store;
        let job_name = execution.job_name.clone();
        let status = execution.status;
        let id = execution.id.clone();
        with_retries("update termination status", self.retry_attempts, || {
            let job_name = job_name.clone();
            let id = id.clone();
            async move {
                store
                    .update_termination_status(&job_name, status, &id)
                    .await
            }
        })
        .await
    }

    /// Reconciles stored-open executions against the observed running set.
    ///
    /// Executions recorded `SUBMITTED` or `RUNNING` whose job object no
    /// longer exists on the cluster are closed as `PLATFORM_ERROR` once they
    /// are older than the grace period. Returns how many were closed.
    ///
    /// # Errors
    ///
    /// Returns an error only if the open-execution query fails; individual
    /// close failures are logged and skipped.
    pub async fn sync_running_set(
        &self,
        observed: &HashSet<String>,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let open = self
            .store
            .find_executions_by_status(&[ExecutionStatus::Submitted, ExecutionStatus::Running])
            .await?;

        let mut closed = 0;
        for mut execution in open {
            if observed.contains(execution.id.as_str()) {
                continue;
            }
            let Some(start_time) = execution.start_time else {
                continue;
            };
            if now - start_time < self.running_sync_grace {
                continue;
            }

            execution.status = ExecutionStatus::PlatformError;
            execution.end_time = Some(now);
            execution.message = LOST_EXECUTION_MESSAGE.to_string();

            if let Err(err) = self.save(&execution, "close lost execution").await {
                warn!(execution = %execution.id, error = %err, "failed to close lost execution");
                continue;
            }
            if let Err(err) = self.update_termination_status(&execution).await {
                warn!(execution = %execution.id, error = %err, "failed to update termination status for lost execution");
            }
            closed += 1;
        }

        Ok(closed)
    }

    async fn save(&self, execution: &DataJobExecution, operation: &str) -> Result<()> {
        let store = &self.store;
        with_retries(operation, self.retry_attempts, || async move {
            store.save_execution(execution).await
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::memory::InMemoryCluster;
    use crate::cluster::template::TemplateSet;
    use crate::model::JobConfig;
    use crate::store::memory::InMemoryStore;

    fn lifecycle() -> (Arc<InMemoryStore>, Arc<InMemoryCluster>, ExecutionLifecycle) {
        let store = Arc::new(InMemoryStore::new());
        let cluster = Arc::new(InMemoryCluster::new());
        let facade = Arc::new(WorkloadFacade::new(
            cluster.clone(),
            TemplateSet::builtin().expect("template"),
        ));
        let lifecycle = ExecutionLifecycle::new(store.clone(), facade);
        (store, cluster, lifecycle)
    }

    fn job(name: &str) -> DataJob {
        DataJob::new(name, JobConfig::default())
    }

    fn summary(name: &str, job_name: &str) -> JobSummary {
        JobSummary {
            name: name.to_string(),
            job_name: job_name.to_string(),
            ..JobSummary::default()
        }
    }

    fn verdict(status: ExecutionStatus) -> Classified {
        Classified {
            status,
            message: String::new(),
            runtime_version: String::new(),
        }
    }

    #[tokio::test]
    async fn blank_execution_id_is_ignored() -> Result<()> {
        let (_, _, lifecycle) = lifecycle();
        let written = lifecycle
            .record_execution(
                &job("ingest"),
                &summary("", "ingest"),
                &verdict(ExecutionStatus::Succeeded),
            )
            .await?;
        assert!(written.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn sticky_status_is_never_overwritten() -> Result<()> {
        let (store, _, lifecycle) = lifecycle();
        let ingest = job("ingest");

        let mut observed = summary("ingest-1", "ingest");
        observed.completion_time = Some(Utc::now());
        lifecycle
            .record_execution(&ingest, &observed, &verdict(ExecutionStatus::Succeeded))
            .await?;

        // A duplicate delivery with a different verdict must be discarded.
        let discarded = lifecycle
            .record_execution(&ingest, &observed, &verdict(ExecutionStatus::PlatformError))
            .await?;
        assert!(discarded.is_none());

        let stored = store
            .get_execution(&ExecutionId::new("ingest-1"))
            .await?
            .expect("row");
        assert_eq!(stored.status, ExecutionStatus::Succeeded);
        Ok(())
    }

    #[tokio::test]
    async fn platform_error_reopens_on_running() -> Result<()> {
        let (store, _, lifecycle) = lifecycle();
        let ingest = job("ingest");

        let mut observed = summary("ingest-1", "ingest");
        observed.completion_time = Some(Utc::now());
        lifecycle
            .record_execution(&ingest, &observed, &verdict(ExecutionStatus::PlatformError))
            .await?;

        // Cluster-level retry under the same execution ID.
        let reopened = lifecycle
            .record_execution(&ingest, &summary("ingest-1", "ingest"), &verdict(ExecutionStatus::Running))
            .await?
            .expect("accepted");
        assert_eq!(reopened.status, ExecutionStatus::Running);
        // Reopening clears the end time: the record is no longer terminal.
        assert_eq!(reopened.end_time, None);

        let stored = store
            .get_execution(&ExecutionId::new("ingest-1"))
            .await?
            .expect("row");
        assert_eq!(stored.status, ExecutionStatus::Running);
        Ok(())
    }

    #[tokio::test]
    async fn last_execution_watermark_discards_stale_events() -> Result<()> {
        let (store, _, lifecycle) = lifecycle();
        store.save_job(&job("ingest")).await?;

        let t1 = Utc::now();
        let t2 = t1 + Duration::minutes(10);

        let newer = DataJobExecution {
            end_time: Some(t2),
            status: ExecutionStatus::Succeeded,
            ..DataJobExecution::submitted(
                ExecutionId::new("ingest-2"),
                "ingest",
                ExecutionType::Scheduled,
                OpId::generate(),
                t1,
            )
        };
        assert!(lifecycle.update_last_execution(&newer).await?);

        // The older event arrives late and must not win.
        let older = DataJobExecution {
            end_time: Some(t1),
            status: ExecutionStatus::UserError,
            ..newer.clone()
        };
        assert!(!lifecycle.update_last_execution(&older).await?);

        let stored = store.get_job("ingest").await?.expect("job");
        assert_eq!(stored.last_execution_end_time, Some(t2));
        assert_eq!(stored.last_execution_status, Some(ExecutionStatus::Succeeded));
        Ok(())
    }

    #[tokio::test]
    async fn last_execution_ignores_soft_terminal_and_open_rows() -> Result<()> {
        let (store, _, lifecycle) = lifecycle();
        store.save_job(&job("ingest")).await?;

        let mut execution = DataJobExecution::submitted(
            ExecutionId::new("ingest-1"),
            "ingest",
            ExecutionType::Scheduled,
            OpId::generate(),
            Utc::now(),
        );
        execution.status = ExecutionStatus::PlatformError;
        execution.end_time = Some(Utc::now());
        assert!(!lifecycle.update_last_execution(&execution).await?);

        execution.status = ExecutionStatus::Succeeded;
        execution.end_time = None;
        assert!(!lifecycle.update_last_execution(&execution).await?);
        Ok(())
    }

    #[tokio::test]
    async fn termination_status_rules() -> Result<()> {
        let (store, _, lifecycle) = lifecycle();
        store.save_job(&job("ingest")).await?;

        let mut execution = DataJobExecution::submitted(
            ExecutionId::new("ingest-1"),
            "ingest",
            ExecutionType::Scheduled,
            OpId::generate(),
            Utc::now(),
        );

        // Skipped never touches the columns.
        execution.status = ExecutionStatus::Skipped;
        assert!(!lifecycle.update_termination_status(&execution).await?);

        execution.status = ExecutionStatus::PlatformError;
        assert!(lifecycle.update_termination_status(&execution).await?);

        // Unchanged tuple is idempotent.
        assert!(!lifecycle.update_termination_status(&execution).await?);

        // PLATFORM_ERROR -> RUNNING for the same ID is accepted.
        execution.status = ExecutionStatus::Running;
        assert!(lifecycle.update_termination_status(&execution).await?);

        execution.status = ExecutionStatus::Succeeded;
        assert!(lifecycle.update_termination_status(&execution).await?);

        // A hard-terminal stored status is sticky for the same ID.
        execution.status = ExecutionStatus::PlatformError;
        assert!(!lifecycle.update_termination_status(&execution).await?);

        // A different execution always updates.
        let newer = DataJobExecution {
            id: ExecutionId::new("ingest-2"),
            status: ExecutionStatus::UserError,
            ..execution.clone()
        };
        assert!(lifecycle.update_termination_status(&newer).await?);

        let stored = store.get_job("ingest").await?.expect("job");
        assert_eq!(
            stored.latest_job_termination_status,
            Some(ExecutionStatus::UserError)
        );
        assert_eq!(
            stored.latest_job_execution_id,
            Some(ExecutionId::new("ingest-2"))
        );
        Ok(())
    }

    #[tokio::test]
    async fn cancel_rejects_finished_execution() -> Result<()> {
        let (store, _, lifecycle) = lifecycle();
        let mut execution = DataJobExecution::submitted(
            ExecutionId::new("ingest-1"),
            "ingest",
            ExecutionType::Manual,
            OpId::generate(),
            Utc::now(),
        );
        execution.status = ExecutionStatus::Succeeded;
        store.save_execution(&execution).await?;

        let err = lifecycle
            .cancel_execution(&ExecutionId::new("ingest-1"))
            .await
            .expect_err("finished executions are not cancellable");
        match err {
            Error::NotCancellable { current_status, .. } => {
                assert_eq!(current_status, Some(ExecutionStatus::Succeeded));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn cancel_unknown_execution_is_rejected() {
        let (_, _, lifecycle) = lifecycle();
        let err = lifecycle
            .cancel_execution(&ExecutionId::new("ghost"))
            .await
            .expect_err("unknown executions are not cancellable");
        assert!(matches!(err, Error::NotCancellable { .. }));
    }

    #[tokio::test]
    async fn cancel_running_execution_transitions_to_cancelled() -> Result<()> {
        let (store, _, lifecycle) = lifecycle();
        store.save_job(&job("ingest")).await?;
        let mut execution = DataJobExecution::submitted(
            ExecutionId::new("ingest-1"),
            "ingest",
            ExecutionType::Manual,
            OpId::generate(),
            Utc::now(),
        );
        execution.status = ExecutionStatus::Running;
        store.save_execution(&execution).await?;

        let cancelled = lifecycle
            .cancel_execution(&ExecutionId::new("ingest-1"))
            .await?;
        assert_eq!(cancelled.status, ExecutionStatus::Cancelled);
        assert!(cancelled.end_time.is_some());

        let stored = store.get_job("ingest").await?.expect("job");
        assert_eq!(
            stored.latest_job_termination_status,
            Some(ExecutionStatus::Cancelled)
        );
        Ok(())
    }

    #[tokio::test]
    async fn lost_executions_are_closed_after_grace() -> Result<()> {
        let (store, _, lifecycle) = lifecycle();
        store.save_job(&job("ingest")).await?;

        let now = Utc::now();
        let stale = DataJobExecution::submitted(
            ExecutionId::new("ingest-old"),
            "ingest",
            ExecutionType::Scheduled,
            OpId::generate(),
            now - Duration::minutes(30),
        );
        let fresh = DataJobExecution::submitted(
            ExecutionId::new("ingest-new"),
            "ingest",
            ExecutionType::Scheduled,
            OpId::generate(),
            now - Duration::seconds(10),
        );
        store.save_execution(&stale).await?;
        store.save_execution(&fresh).await?;

        let closed = lifecycle.sync_running_set(&HashSet::new(), now).await?;
        assert_eq!(closed, 1);

        let stale = store
            .get_execution(&ExecutionId::new("ingest-old"))
            .await?
            .expect("row");
        assert_eq!(stale.status, ExecutionStatus::PlatformError);
        assert!(stale.end_time.is_some());

        // Still within the grace window: left open.
        let fresh = store
            .get_execution(&ExecutionId::new("ingest-new"))
            .await?
            .expect("row");
        assert_eq!(fresh.status, ExecutionStatus::Submitted);
        Ok(())
    }

    #[tokio::test]
    async fn observed_executions_are_left_open() -> Result<()> {
        let (store, _, lifecycle) = lifecycle();
        store.save_job(&job("ingest")).await?;
        let execution = DataJobExecution::submitted(
            ExecutionId::new("ingest-1"),
            "ingest",
            ExecutionType::Scheduled,
            OpId::generate(),
            Utc::now() - Duration::hours(1),
        );
        store.save_execution(&execution).await?;

        let observed = HashSet::from(["ingest-1".to_string()]);
        let closed = lifecycle.sync_running_set(&observed, Utc::now()).await?;
        assert_eq!(closed, 0);
        Ok(())
    }
}
