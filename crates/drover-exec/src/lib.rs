//! # drover-exec
//!
//! Execution reconciliation engine for the drover data-job control plane.
//!
//! This crate keeps the control plane's record of data-job executions in
//! agreement with what the cluster actually ran. It provides:
//!
//! - **Workload Templates**: Build and mutate recurring-job and one-shot-job
//!   objects from a default template with operator overrides
//! - **Status Classification**: Map raw completion signals to a normalized
//!   execution-status taxonomy
//! - **Lifecycle Persistence**: Monotonic, idempotent execution-record and
//!   job-summary updates that survive duplicate and out-of-order delivery
//! - **Reconciliation Loop**: A lease-guarded list + watch pass safe to run
//!   on every redundant control-plane instance
//!
//! ## Guarantees
//!
//! - **Sticky verdicts**: A hard-terminal execution status is never
//!   overwritten; the single sanctioned exception is a cluster-level retry
//!   observed as `PLATFORM_ERROR` → `RUNNING` under the same execution ID
//! - **Monotonic summaries**: Per-job last-execution summaries only move
//!   forward in end time, regardless of event delivery order
//! - **At-most-one writer**: The reconciliation tick runs under a
//!   cluster-wide lease; instances that fail to acquire it skip the tick
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use drover_exec::cluster::memory::InMemoryCluster;
//! use drover_exec::cluster::{facade::WorkloadFacade, template::TemplateSet};
//! use drover_exec::error::Result;
//! use drover_exec::lease::memory::InMemoryLease;
//! use drover_exec::lifecycle::ExecutionLifecycle;
//! use drover_exec::monitor::{JobMonitor, MonitorConfig};
//! use drover_exec::store::memory::InMemoryStore;
//!
//! # async fn run() -> Result<()> {
//! let api = Arc::new(InMemoryCluster::new());
//! let store = Arc::new(InMemoryStore::new());
//! let facade = Arc::new(WorkloadFacade::new(api, TemplateSet::builtin()?));
//! let lifecycle = Arc::new(ExecutionLifecycle::new(store.clone(), facade.clone()));
//! let monitor = JobMonitor::new(
//!     facade,
//!     lifecycle,
//!     store,
//!     Arc::new(InMemoryLease::new()),
//!     MonitorConfig::default(),
//! );
//! monitor.tick().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod classify;
pub mod cluster;
pub mod deploy;
pub mod error;
pub mod lease;
pub mod lifecycle;
pub mod metrics;
pub mod model;
pub mod monitor;
pub mod retention;
pub mod retry;
pub mod store;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::classify::{classify, Classified, TerminationSignal};
    pub use crate::cluster::facade::WorkloadFacade;
    pub use crate::cluster::template::TemplateSet;
    pub use crate::cluster::{ClusterApi, JobEvent, JobSummary};
    pub use crate::deploy::DeploymentTracker;
    pub use crate::error::{Error, Result};
    pub use crate::lease::ClusterLease;
    pub use crate::lifecycle::ExecutionLifecycle;
    pub use crate::metrics::ExecMetrics;
    pub use crate::model::{
        DataJob, DataJobExecution, DeploymentStatus, ExecutionStatus, ExecutionType,
    };
    pub use crate::monitor::{JobMonitor, MonitorConfig};
    pub use crate::retention::RetentionPolicy;
    pub use crate::store::Store;
}
