//! Execution history retention.
//!
//! Bounds the per-job execution record count and age. Selection is a pure
//! function over a job's execution rows; the [`ExecutionCleaner`] applies it
//! across all jobs on a fixed schedule, best-effort.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use drover_core::ExecutionId;

use crate::error::Result;
use crate::model::DataJobExecution;
use crate::store::Store;

/// Default number of finished executions retained per job.
pub const DEFAULT_KEEP_COUNT: usize = 100;

/// Default age cutoff for finished executions, in days.
pub const DEFAULT_MAX_AGE_DAYS: i64 = 14;

/// Retention rules for one job's execution history.
#[derive(Debug, Clone, Copy)]
pub struct RetentionPolicy {
    /// How many finished executions to keep, most recent by end time.
    pub keep_count: usize,
    /// Finished executions older than this are removed regardless of count.
    pub max_age: Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            keep_count: DEFAULT_KEEP_COUNT,
            max_age: Duration::days(DEFAULT_MAX_AGE_DAYS),
        }
    }
}

impl RetentionPolicy {
    /// Creates a policy with explicit bounds.
    #[must_use]
    pub const fn new(keep_count: usize, max_age: Duration) -> Self {
        Self {
            keep_count,
            max_age,
        }
    }

    /// Selects the executions that fall outside the retention bounds.
    ///
    /// Only executions with a non-null end time are ever selected: an
    /// execution that is still active is never removed, regardless of the
    /// job's total record count. Finished executions are ordered by end time
    /// descending; everything past `keep_count`, plus everything at or past
    /// the age cutoff, is selected.
    #[must_use]
    pub fn select_expired(
        &self,
        executions: &[DataJobExecution],
        now: DateTime<Utc>,
    ) -> Vec<ExecutionId> {
        let mut finished: Vec<(&ExecutionId, DateTime<Utc>)> = executions
            .iter()
            .filter_map(|execution| execution.end_time.map(|end| (&execution.id, end)))
            .collect();
        finished.sort_by(|a, b| b.1.cmp(&a.1));

        let cutoff = now - self.max_age;
        finished
            .iter()
            .enumerate()
            .filter(|(index, (_, end_time))| *index >= self.keep_count || *end_time <= cutoff)
            .map(|(_, (id, _))| (*id).clone())
            .collect()
    }
}

/// Applies the retention policy across all jobs on demand.
pub struct ExecutionCleaner {
    store: Arc<dyn Store>,
    policy: RetentionPolicy,
}

impl ExecutionCleaner {
    /// Creates a cleaner over a store.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, policy: RetentionPolicy) -> Self {
        Self { store, policy }
    }

    /// Deletes expired executions for every job. Best-effort: per-job
    /// failures are logged and skipped. Returns the number deleted.
    ///
    /// # Errors
    ///
    /// Returns an error only if the job listing itself fails.
    pub async fn sweep(&self) -> Result<usize> {
        let jobs = self.store.list_jobs().await?;
        let now = Utc::now();
        let mut deleted = 0;

        for job in jobs {
            let executions = match self.store.list_executions(&job.name).await {
                Ok(executions) => executions,
                Err(err) => {
                    warn!(job = %job.name, error = %err, "cannot list executions for cleanup");
                    continue;
                }
            };

            let expired = self.policy.select_expired(&executions, now);
            if expired.is_empty() {
                continue;
            }

            match self.store.delete_executions(&expired).await {
                Ok(count) => deleted += count,
                Err(err) => {
                    warn!(job = %job.name, error = %err, "cannot delete expired executions");
                }
            }
        }

        if deleted > 0 {
            info!(deleted, "execution history cleanup finished");
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ExecutionStatus, ExecutionType};
    use drover_core::OpId;

    fn finished(id: &str, job: &str, end_time: DateTime<Utc>) -> DataJobExecution {
        let mut execution = DataJobExecution::submitted(
            ExecutionId::new(id),
            job,
            ExecutionType::Scheduled,
            OpId::generate(),
            end_time - Duration::minutes(5),
        );
        execution.status = ExecutionStatus::Succeeded;
        execution.end_time = Some(end_time);
        execution
    }

    fn active(id: &str, job: &str) -> DataJobExecution {
        DataJobExecution::submitted(
            ExecutionId::new(id),
            job,
            ExecutionType::Scheduled,
            OpId::generate(),
            Utc::now(),
        )
    }

    #[test]
    fn keeps_most_recent_hundred() {
        let policy = RetentionPolicy::default();
        let now = Utc::now();

        let executions: Vec<DataJobExecution> = (0..101)
            .map(|i| finished(&format!("job-{i}"), "job", now - Duration::minutes(i)))
            .collect();

        let expired = policy.select_expired(&executions, now);
        assert_eq!(expired.len(), 1);
        // The oldest by end time loses.
        assert_eq!(expired[0], ExecutionId::new("job-100"));
    }

    #[test]
    fn active_executions_are_never_selected() {
        let policy = RetentionPolicy::new(1, Duration::days(14));
        let now = Utc::now();

        let mut executions: Vec<DataJobExecution> = (0..5)
            .map(|i| finished(&format!("job-{i}"), "job", now - Duration::minutes(i)))
            .collect();
        executions.push(active("job-active", "job"));

        let expired = policy.select_expired(&executions, now);
        assert_eq!(expired.len(), 4);
        assert!(!expired.contains(&ExecutionId::new("job-active")));
    }

    #[test]
    fn age_cutoff_is_fourteen_days() {
        let policy = RetentionPolicy::default();
        let now = Utc::now();

        let executions = vec![
            finished(
                "job-fresh",
                "job",
                now - Duration::days(13) - Duration::hours(23) - Duration::minutes(59),
            ),
            finished("job-stale", "job", now - Duration::days(14)),
        ];

        let expired = policy.select_expired(&executions, now);
        assert_eq!(expired, vec![ExecutionId::new("job-stale")]);
    }

    #[tokio::test]
    async fn sweep_deletes_across_jobs() -> Result<()> {
        use crate::model::{DataJob, JobConfig};
        use crate::store::memory::InMemoryStore;

        let store = Arc::new(InMemoryStore::new());
        store.save_job(&DataJob::new("a", JobConfig::default())).await?;
        store.save_job(&DataJob::new("b", JobConfig::default())).await?;

        let now = Utc::now();
        for i in 0..3 {
            store
                .save_execution(&finished(&format!("a-{i}"), "a", now - Duration::minutes(i)))
                .await?;
            store
                .save_execution(&finished(&format!("b-{i}"), "b", now - Duration::minutes(i)))
                .await?;
        }

        let cleaner = ExecutionCleaner::new(
            store.clone(),
            RetentionPolicy::new(1, Duration::days(14)),
        );
        let deleted = cleaner.sweep().await?;
        assert_eq!(deleted, 4);
        assert_eq!(store.execution_count()?, 2);
        Ok(())
    }
}
