//! Cluster-wide mutual exclusion for the reconciliation loop.
//!
//! The [`ClusterLease`] trait grants a time-bounded, cluster-wide lease so
//! at most one control-plane instance runs a given loop concurrently.
//!
//! ## Design Principles
//!
//! - **Leases, not locks**: A crashed holder is displaced once its TTL
//!   elapses; nothing is held indefinitely
//! - **Not-acquired is not an error**: Callers treat a failed acquisition as
//!   "skip this tick": another instance is running it
//! - **Held no longer than one tick**: The loop releases on every tick
//!   completion, normal or not

pub mod kube;
pub mod memory;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

/// Time-bounded, cluster-wide mutual exclusion grant.
#[async_trait]
pub trait ClusterLease: Send + Sync {
    /// Attempts to acquire the lease for `lock_key` with the given maximum
    /// hold duration.
    ///
    /// Returns `true` if this instance now holds the lease (including
    /// re-acquisition of its own unexpired lease), `false` if another
    /// instance holds it.
    async fn try_acquire(&self, lock_key: &str, ttl: Duration) -> Result<bool>;

    /// Releases the lease if this instance holds it.
    ///
    /// Best-effort: an unreleased lease is displaced by TTL expiry.
    async fn release(&self, lock_key: &str) -> Result<()>;
}
