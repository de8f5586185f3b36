//! Lease implementation on the cluster's coordination API.
//!
//! Uses `coordination.k8s.io/v1` Lease objects as the coordination point.
//! Acquisition is compare-and-swap shaped: creation races are decided by the
//! server's already-exists response, takeovers replace the fetched object so
//! a concurrent takeover fails on the resource-version conflict.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Api, PostParams};
use kube::Client;
use tracing::warn;

use drover_core::OpId;

use super::ClusterLease;
use crate::error::{Error, Result};

/// [`ClusterLease`] implementation over Kubernetes Lease objects.
pub struct KubeLease {
    api: Api<Lease>,
    holder: String,
}

impl KubeLease {
    /// Creates a lease client scoped to one namespace, with a fresh holder
    /// identity.
    #[must_use]
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            holder: format!("drover-{}", OpId::generate()),
        }
    }

    /// This instance's holder identity.
    #[must_use]
    pub fn holder(&self) -> &str {
        &self.holder
    }

    fn spec(&self, ttl: Duration, transitions: Option<i32>) -> LeaseSpec {
        let now = MicroTime(Utc::now());
        #[allow(clippy::cast_possible_truncation)]
        LeaseSpec {
            holder_identity: Some(self.holder.clone()),
            acquire_time: Some(now.clone()),
            renew_time: Some(now),
            lease_duration_seconds: Some(ttl.as_secs().min(i32::MAX as u64) as i32),
            lease_transitions: transitions,
            ..LeaseSpec::default()
        }
    }
}

fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(response) if response.code == 409)
}

fn is_expired(spec: &LeaseSpec) -> bool {
    let Some(renewed) = spec
        .renew_time
        .as_ref()
        .or(spec.acquire_time.as_ref())
        .map(|t| t.0)
    else {
        return true;
    };
    let Some(duration) = spec.lease_duration_seconds else {
        return true;
    };
    renewed + chrono::Duration::seconds(i64::from(duration)) <= Utc::now()
}

#[async_trait]
impl ClusterLease for KubeLease {
    async fn try_acquire(&self, lock_key: &str, ttl: Duration) -> Result<bool> {
        let existing = self
            .api
            .get_opt(lock_key)
            .await
            .map_err(|err| Error::cluster_api_with_source("get lease failed", err))?;

        let Some(mut lease) = existing else {
            let mut lease = Lease::default();
            lease.metadata.name = Some(lock_key.to_string());
            lease.spec = Some(self.spec(ttl, Some(1)));

            return match self.api.create(&PostParams::default(), &lease).await {
                Ok(_) => Ok(true),
                // Another instance created it first.
                Err(err) if is_conflict(&err) => Ok(false),
                Err(err) => Err(Error::cluster_api_with_source("create lease failed", err)),
            };
        };

        let spec = lease.spec.clone().unwrap_or_default();
        let ours = spec.holder_identity.as_deref() == Some(self.holder.as_str());
        if !ours && spec.holder_identity.is_some() && !is_expired(&spec) {
            return Ok(false);
        }

        let transitions = if ours {
            spec.lease_transitions
        } else {
            Some(spec.lease_transitions.unwrap_or_default().saturating_add(1))
        };
        lease.spec = Some(self.spec(ttl, transitions));

        match self.api.replace(lock_key, &PostParams::default(), &lease).await {
            Ok(_) => Ok(true),
            // Someone else renewed or took over between the get and the
            // replace; the resource-version precondition caught it.
            Err(err) if is_conflict(&err) => Ok(false),
            Err(err) => Err(Error::cluster_api_with_source("replace lease failed", err)),
        }
    }

    async fn release(&self, lock_key: &str) -> Result<()> {
        let existing = match self.api.get_opt(lock_key).await {
            Ok(existing) => existing,
            Err(err) => {
                warn!(lease = lock_key, error = %err, "cannot read lease for release");
                return Ok(());
            }
        };
        let Some(mut lease) = existing else {
            return Ok(());
        };

        let Some(spec) = lease.spec.as_mut() else {
            return Ok(());
        };
        if spec.holder_identity.as_deref() != Some(self.holder.as_str()) {
            return Ok(());
        }
        spec.holder_identity = None;
        spec.renew_time = Some(MicroTime(Utc::now()));

        if let Err(err) = self.api.replace(lock_key, &PostParams::default(), &lease).await {
            // Lost to a concurrent takeover or transient failure; the TTL
            // bounds how long the stale grant lingers.
            warn!(lease = lock_key, error = %err, "cannot release lease");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expiry_computation() {
        let fresh = LeaseSpec {
            holder_identity: Some("other".to_string()),
            renew_time: Some(MicroTime(Utc::now())),
            lease_duration_seconds: Some(30),
            ..LeaseSpec::default()
        };
        assert!(!is_expired(&fresh));

        let stale = LeaseSpec {
            holder_identity: Some("other".to_string()),
            renew_time: Some(MicroTime(Utc::now() - chrono::Duration::seconds(60))),
            lease_duration_seconds: Some(30),
            ..LeaseSpec::default()
        };
        assert!(is_expired(&stale));

        // A lease without timing information cannot block anyone.
        assert!(is_expired(&LeaseSpec::default()));
    }
}
