//! Pluggable persistence for jobs and executions.
//!
//! The [`Store`] trait is the engine's record-store boundary. It exposes row
//! CRUD plus the atomic single-column updates the reconciliation rules rely
//! on: callers never read-modify-write a summary column through this trait,
//! they ask the store to set it.
//!
//! ## Design Principles
//!
//! - **Atomic column updates**: Summary fields change in one operation keyed
//!   by job name, so concurrent sync passes degrade to last-writer-wins
//! - **Separation of concerns**: Monotonicity and stickiness rules live in
//!   [`crate::lifecycle`], not in storage implementations
//! - **Testability**: In-memory implementation for tests; durable backends
//!   plug in behind the same trait

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use drover_core::ExecutionId;

use crate::error::Result;
use crate::model::{
    DataJob, DataJobExecution, DeploymentSnapshot, DeploymentStatus, ExecutionStatus,
};

/// Storage abstraction for data jobs and their executions.
///
/// All methods are `Send + Sync` to support concurrent access from the
/// reconciliation loop and the periodic sync passes.
#[async_trait]
pub trait Store: Send + Sync {
    // --- Job operations ---

    /// Gets a job by name. Returns `None` if it does not exist.
    async fn get_job(&self, name: &str) -> Result<Option<DataJob>>;

    /// Lists all jobs.
    async fn list_jobs(&self) -> Result<Vec<DataJob>>;

    /// Saves a job (insert or full replacement).
    async fn save_job(&self, job: &DataJob) -> Result<()>;

    /// Deletes a job and cascades to its executions.
    ///
    /// Returns `true` if the job existed.
    async fn delete_job(&self, name: &str) -> Result<bool>;

    // --- Atomic per-job column updates ---

    /// Sets the job's deployment status column.
    ///
    /// Returns `false` if the job does not exist.
    async fn update_deployment_status(
        &self,
        name: &str,
        status: DeploymentStatus,
    ) -> Result<bool>;

    /// Replaces the job's deployed-spec snapshot.
    ///
    /// Returns `false` if the job does not exist.
    async fn update_deployment_snapshot(
        &self,
        name: &str,
        snapshot: &DeploymentSnapshot,
    ) -> Result<bool>;

    /// Sets the job's last-execution summary columns.
    ///
    /// Returns `false` if the job does not exist.
    async fn update_last_execution(
        &self,
        name: &str,
        status: ExecutionStatus,
        end_time: DateTime<Utc>,
        duration_secs: i64,
    ) -> Result<bool>;

    /// Sets the job's latest termination status and execution ID columns.
    ///
    /// Returns `false` if the job does not exist.
    async fn update_termination_status(
        &self,
        name: &str,
        status: ExecutionStatus,
        execution_id: &ExecutionId,
    ) -> Result<bool>;

    // --- Execution operations ---

    /// Gets an execution by ID. Returns `None` if it does not exist.
    async fn get_execution(&self, id: &ExecutionId) -> Result<Option<DataJobExecution>>;

    /// Saves an execution (insert or full replacement).
    async fn save_execution(&self, execution: &DataJobExecution) -> Result<()>;

    /// Lists all executions of a job, in no particular order.
    async fn list_executions(&self, job_name: &str) -> Result<Vec<DataJobExecution>>;

    /// Finds executions whose status is in `statuses`, across all jobs.
    async fn find_executions_by_status(
        &self,
        statuses: &[ExecutionStatus],
    ) -> Result<Vec<DataJobExecution>>;

    /// Deletes the given executions. Returns how many existed.
    async fn delete_executions(&self, ids: &[ExecutionId]) -> Result<usize>;
}
