//! Deployment status tracking.
//!
//! Records recurring-job deployment outcomes into the job's
//! `latest_job_deployment_status` column and, on success, snapshots the
//! actually-deployed spec for later drift comparison. Every transition is
//! mirrored to metrics: a per-job gauge for the current status and a
//! distribution-summary event per transition.

use std::sync::Arc;

use tracing::info;

use crate::error::Result;
use crate::metrics::{ExecMetrics, StatusGauges};
use crate::model::{DeploymentSnapshot, DeploymentStatus};
use crate::retry::{with_retries, DEFAULT_ATTEMPTS};
use crate::store::Store;

/// Tracks deployment outcomes for data jobs.
pub struct DeploymentTracker {
    store: Arc<dyn Store>,
    metrics: ExecMetrics,
    gauges: Arc<StatusGauges>,
    retry_attempts: u32,
}

impl DeploymentTracker {
    /// Creates a tracker over a store and a gauge registry.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, gauges: Arc<StatusGauges>) -> Self {
        Self {
            store,
            metrics: ExecMetrics::new(),
            gauges,
            retry_attempts: DEFAULT_ATTEMPTS,
        }
    }

    /// Overrides the per-write retry attempt count.
    #[must_use]
    pub const fn with_retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = attempts;
        self
    }

    /// Records a deployment status transition for a job.
    ///
    /// Returns `false` when the job no longer exists (nothing to track).
    ///
    /// # Errors
    ///
    /// [`Error::Repository`](crate::error::Error::Repository) if the column
    /// update fails after retries.
    pub async fn update_status(&self, job_name: &str, status: DeploymentStatus) -> Result<bool> {
        let store = &self.store;
        let updated = with_retries("update deployment status", self.retry_attempts, || {
            async move { store.update_deployment_status(job_name, status).await }
        })
        .await?;

        if updated {
            info!(job = job_name, status = %status, "deployment status updated");
            self.metrics.record_deployment_transition(job_name, status);
            self.gauges.set_deployment_status(job_name, status);
        }
        Ok(updated)
    }

    /// Records a successful deployment together with its deployed-spec
    /// snapshot.
    ///
    /// # Errors
    ///
    /// Same contract as [`Self::update_status`].
    pub async fn record_success(
        &self,
        job_name: &str,
        snapshot: &DeploymentSnapshot,
    ) -> Result<bool> {
        let store = &self.store;
        let stored = with_retries("update deployment snapshot", self.retry_attempts, || {
            async move { store.update_deployment_snapshot(job_name, snapshot).await }
        })
        .await?;
        if !stored {
            return Ok(false);
        }
        self.update_status(job_name, DeploymentStatus::Success).await
    }

    /// Refreshes all per-job gauges from the store.
    ///
    /// Runs on its own fixed-delay schedule and only reads the database, so
    /// it can safely overlap the reconciliation loop.
    ///
    /// # Errors
    ///
    /// Propagates the job listing failure.
    pub async fn refresh_gauges(&self) -> Result<()> {
        let jobs = self.store.list_jobs().await?;
        self.gauges.sync(&jobs);
        Ok(())
    }
}
