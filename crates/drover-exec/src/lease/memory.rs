//! In-memory lease implementation for testing.
//!
//! ## Limitations
//!
//! - **NOT suitable for production**: No cross-process coordination
//! - **Single-process only**: Leases are not shared across process boundaries

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use drover_core::OpId;

use super::ClusterLease;
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
struct Held {
    holder: String,
    expires_at: DateTime<Utc>,
}

/// In-memory lease for tests.
///
/// [`InMemoryLease::peer`] creates a second handle with its own identity
/// over the same lease table, for contention scenarios.
#[derive(Debug)]
pub struct InMemoryLease {
    holder: String,
    leases: Arc<RwLock<HashMap<String, Held>>>,
}

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("lock poisoned")
}

impl Default for InMemoryLease {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryLease {
    /// Creates a lease table with a fresh holder identity.
    #[must_use]
    pub fn new() -> Self {
        Self {
            holder: OpId::generate().to_string(),
            leases: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// A second handle with its own identity over the same lease table.
    #[must_use]
    pub fn peer(&self) -> Self {
        Self {
            holder: OpId::generate().to_string(),
            leases: Arc::clone(&self.leases),
        }
    }
}

#[async_trait]
impl ClusterLease for InMemoryLease {
    async fn try_acquire(&self, lock_key: &str, ttl: Duration) -> Result<bool> {
        let mut leases = self.leases.write().map_err(poison_err)?;
        let now = Utc::now();

        if let Some(held) = leases.get(lock_key) {
            if held.expires_at > now && held.holder != self.holder {
                return Ok(false);
            }
        }

        leases.insert(
            lock_key.to_string(),
            Held {
                holder: self.holder.clone(),
                expires_at: now
                    + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::seconds(30)),
            },
        );
        Ok(true)
    }

    async fn release(&self, lock_key: &str) -> Result<()> {
        let mut leases = self.leases.write().map_err(poison_err)?;
        if leases
            .get(lock_key)
            .is_some_and(|held| held.holder == self.holder)
        {
            leases.remove(lock_key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_when_free() -> Result<()> {
        let lease = InMemoryLease::new();
        assert!(lease.try_acquire("monitor", Duration::from_secs(30)).await?);
        Ok(())
    }

    #[tokio::test]
    async fn contention_is_not_an_error() -> Result<()> {
        let lease = InMemoryLease::new();
        let peer = lease.peer();

        assert!(lease.try_acquire("monitor", Duration::from_secs(30)).await?);
        assert!(!peer.try_acquire("monitor", Duration::from_secs(30)).await?);
        Ok(())
    }

    #[tokio::test]
    async fn release_frees_the_lease() -> Result<()> {
        let lease = InMemoryLease::new();
        let peer = lease.peer();

        assert!(lease.try_acquire("monitor", Duration::from_secs(30)).await?);
        lease.release("monitor").await?;
        assert!(peer.try_acquire("monitor", Duration::from_secs(30)).await?);
        Ok(())
    }

    #[tokio::test]
    async fn release_by_non_holder_is_a_no_op() -> Result<()> {
        let lease = InMemoryLease::new();
        let peer = lease.peer();

        assert!(lease.try_acquire("monitor", Duration::from_secs(30)).await?);
        peer.release("monitor").await?;
        assert!(!peer.try_acquire("monitor", Duration::from_secs(30)).await?);
        Ok(())
    }

    #[tokio::test]
    async fn expired_lease_is_displaced() -> Result<()> {
        let lease = InMemoryLease::new();
        let peer = lease.peer();

        assert!(lease.try_acquire("monitor", Duration::from_millis(1)).await?);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(peer.try_acquire("monitor", Duration::from_secs(30)).await?);
        Ok(())
    }

    #[tokio::test]
    async fn holder_can_reacquire() -> Result<()> {
        let lease = InMemoryLease::new();
        assert!(lease.try_acquire("monitor", Duration::from_secs(30)).await?);
        assert!(lease.try_acquire("monitor", Duration::from_secs(30)).await?);
        Ok(())
    }

    #[tokio::test]
    async fn lock_keys_are_independent() -> Result<()> {
        let lease = InMemoryLease::new();
        let peer = lease.peer();

        assert!(lease.try_acquire("monitor", Duration::from_secs(30)).await?);
        assert!(peer.try_acquire("cleanup", Duration::from_secs(30)).await?);
        Ok(())
    }
}
