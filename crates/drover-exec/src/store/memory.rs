//! In-memory store implementation for testing and development.
//!
//! ## Limitations
//!
//! - **NOT durable**: All state is lost when the process exits
//! - **Single-process only**: No cross-instance visibility

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use drover_core::ExecutionId;

use super::Store;
use crate::error::{Error, Result};
use crate::model::{
    DataJob, DataJobExecution, DeploymentSnapshot, DeploymentStatus, ExecutionStatus,
};

/// In-memory [`Store`] backed by `RwLock`-guarded maps.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    jobs: RwLock<HashMap<String, DataJob>>,
    executions: RwLock<HashMap<ExecutionId, DataJobExecution>>,
}

/// Converts a lock poison error to a storage error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("lock poisoned")
}

impl InMemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of executions currently stored, across all jobs.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the internal lock is poisoned.
    pub fn execution_count(&self) -> Result<usize> {
        Ok(self.executions.read().map_err(poison_err)?.len())
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn get_job(&self, name: &str) -> Result<Option<DataJob>> {
        Ok(self.jobs.read().map_err(poison_err)?.get(name).cloned())
    }

    async fn list_jobs(&self) -> Result<Vec<DataJob>> {
        Ok(self.jobs.read().map_err(poison_err)?.values().cloned().collect())
    }

    async fn save_job(&self, job: &DataJob) -> Result<()> {
        self.jobs
            .write()
            .map_err(poison_err)?
            .insert(job.name.clone(), job.clone());
        Ok(())
    }

    async fn delete_job(&self, name: &str) -> Result<bool> {
        let existed = self.jobs.write().map_err(poison_err)?.remove(name).is_some();
        if existed {
            self.executions
                .write()
                .map_err(poison_err)?
                .retain(|_, execution| execution.job_name != name);
        }
        Ok(existed)
    }

    async fn update_deployment_status(
        &self,
        name: &str,
        status: DeploymentStatus,
    ) -> Result<bool> {
        let mut jobs = self.jobs.write().map_err(poison_err)?;
        let Some(job) = jobs.get_mut(name) else {
            return Ok(false);
        };
        job.latest_job_deployment_status = status;
        Ok(true)
    }

    async fn update_deployment_snapshot(
        &self,
        name: &str,
        snapshot: &DeploymentSnapshot,
    ) -> Result<bool> {
        let mut jobs = self.jobs.write().map_err(poison_err)?;
        let Some(job) = jobs.get_mut(name) else {
            return Ok(false);
        };
        job.deployment = Some(snapshot.clone());
        Ok(true)
    }

    async fn update_last_execution(
        &self,
        name: &str,
        status: ExecutionStatus,
        end_time: DateTime<Utc>,
        duration_secs: i64,
    ) -> Result<bool> {
        let mut jobs = self.jobs.write().map_err(poison_err)?;
        let Some(job) = jobs.get_mut(name) else {
            return Ok(false);
        };
        job.last_execution_status = Some(status);
        job.last_execution_end_time = Some(end_time);
        job.last_execution_duration_secs = Some(duration_secs);
        Ok(true)
    }

    async fn update_termination_status(
        &self,
        name: &str,
        status: ExecutionStatus,
        execution_id: &ExecutionId,
    ) -> Result<bool> {
        let mut jobs = self.jobs.write().map_err(poison_err)?;
        let Some(job) = jobs.get_mut(name) else {
            return Ok(false);
        };
        job.latest_job_termination_status = Some(status);
        job.latest_job_execution_id = Some(execution_id.clone());
        Ok(true)
    }

    async fn get_execution(&self, id: &ExecutionId) -> Result<Option<DataJobExecution>> {
        Ok(self.executions.read().map_err(poison_err)?.get(id).cloned())
    }

    async fn save_execution(&self, execution: &DataJobExecution) -> Result<()> {
        self.executions
            .write()
            .map_err(poison_err)?
            .insert(execution.id.clone(), execution.clone());
        Ok(())
    }

    async fn list_executions(&self, job_name: &str) -> Result<Vec<DataJobExecution>> {
        Ok(self
            .executions
            .read()
            .map_err(poison_err)?
            .values()
            .filter(|execution| execution.job_name == job_name)
            .cloned()
            .collect())
    }

    async fn find_executions_by_status(
        &self,
        statuses: &[ExecutionStatus],
    ) -> Result<Vec<DataJobExecution>> {
        Ok(self
            .executions
            .read()
            .map_err(poison_err)?
            .values()
            .filter(|execution| statuses.contains(&execution.status))
            .cloned()
            .collect())
    }

    async fn delete_executions(&self, ids: &[ExecutionId]) -> Result<usize> {
        let mut executions = self.executions.write().map_err(poison_err)?;
        let mut deleted = 0;
        for id in ids {
            if executions.remove(id).is_some() {
                deleted += 1;
            }
        }
        Ok(deleted)
    }
}
