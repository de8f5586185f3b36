//! The execution reconciliation loop.
//!
//! [`JobMonitor`] brings the record store's view of execution status into
//! agreement with the cluster's observed state. Each tick, under a
//! cluster-wide lease:
//!
//! 1. List all data-job one-shot job objects. Objects without a completion
//!    condition form the "currently running" set, reported to the lifecycle
//!    store so executions that vanished from the cluster can be reconciled
//!    independently. Completed objects newer than the watch watermark are
//!    classified and persisted immediately.
//! 2. Open an incremental watch at the list's resource version. Deletions
//!    are ignored; completions older than the stale-event window are
//!    discarded (duplicate replay protection); everything else is
//!    classified and persisted as it arrives.
//! 3. On normal or error completion of the watch, release the lease and
//!    advance the watermark to now minus a backoff that tolerates clock
//!    skew and in-flight delivery.
//!
//! Cluster errors end the tick early; no state is lost because the next
//! tick re-lists from scratch. Persistence errors are fatal to the single
//! update they accompany, never to the loop.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::classify::classify;
use crate::cluster::facade::WorkloadFacade;
use crate::cluster::{data_job_selector, JobEvent, JobSummary};
use crate::error::{Error, Result};
use crate::lease::ClusterLease;
use crate::lifecycle::ExecutionLifecycle;
use crate::metrics::ExecMetrics;
use crate::store::Store;

/// Default delay between reconciliation ticks, in seconds.
pub const DEFAULT_TICK_INTERVAL_SECS: u64 = 1;

/// Default incremental watch timeout, in seconds.
pub const DEFAULT_WATCH_TIMEOUT_SECS: u64 = 300;

/// Default window after which a completion event is considered stale.
pub const DEFAULT_STALE_EVENT_WINDOW_SECS: u64 = 3600;

/// Default watermark backoff, in seconds.
///
/// Tolerates clock skew and in-flight event delay, and bounds how far
/// another instance must re-scan when it next acquires the lease.
pub const DEFAULT_WATERMARK_BACKOFF_SECS: u64 = 60;

/// Default maximum lease hold, in seconds. Must outlast one full tick,
/// watch timeout included.
pub const DEFAULT_LEASE_TTL_SECS: u64 = 600;

/// Default lease name scoping the loop's mutual exclusion.
pub const DEFAULT_LEASE_NAME: &str = "job-execution-monitor";

/// Environment variable for the tick interval.
pub const ENV_TICK_INTERVAL_SECS: &str = "DROVER_MONITOR_TICK_INTERVAL_SECS";
/// Environment variable for the watch timeout.
pub const ENV_WATCH_TIMEOUT_SECS: &str = "DROVER_MONITOR_WATCH_TIMEOUT_SECS";
/// Environment variable for the stale-event window.
pub const ENV_STALE_EVENT_WINDOW_SECS: &str = "DROVER_MONITOR_STALE_EVENT_WINDOW_SECS";
/// Environment variable for the watermark backoff.
pub const ENV_WATERMARK_BACKOFF_SECS: &str = "DROVER_MONITOR_WATERMARK_BACKOFF_SECS";
/// Environment variable for the lease TTL.
pub const ENV_LEASE_TTL_SECS: &str = "DROVER_MONITOR_LEASE_TTL_SECS";

/// Tunable thresholds of the reconciliation loop.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Delay between ticks.
    pub tick_interval: Duration,
    /// Maximum duration of one incremental watch.
    pub watch_timeout: Duration,
    /// Completions older than this are discarded from the watch.
    pub stale_event_window: chrono::Duration,
    /// How far behind now the watermark is parked after each watch.
    pub watermark_backoff: chrono::Duration,
    /// Maximum lease hold duration.
    pub lease_ttl: Duration,
    /// Lease name scoping this loop's mutual exclusion.
    pub lease_name: String,
    /// Label selector for the loop's job objects.
    pub label_selector: String,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(DEFAULT_TICK_INTERVAL_SECS),
            watch_timeout: Duration::from_secs(DEFAULT_WATCH_TIMEOUT_SECS),
            stale_event_window: chrono::Duration::seconds(
                i64::try_from(DEFAULT_STALE_EVENT_WINDOW_SECS).unwrap_or(3600),
            ),
            watermark_backoff: chrono::Duration::seconds(
                i64::try_from(DEFAULT_WATERMARK_BACKOFF_SECS).unwrap_or(60),
            ),
            lease_ttl: Duration::from_secs(DEFAULT_LEASE_TTL_SECS),
            lease_name: DEFAULT_LEASE_NAME.to_string(),
            label_selector: data_job_selector(),
        }
    }
}

impl MonitorConfig {
    /// Loads the config from process environment with strict validation.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when a value is not a positive integer.
    pub fn from_env() -> Result<Self> {
        Self::from_env_with(|key| std::env::var(key).ok())
    }

    /// Loads the config with a custom environment source. Test-friendly.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when a value is not a positive integer.
    pub fn from_env_with<F>(get_env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let tick_interval_secs =
            parse_positive_u64(&get_env, ENV_TICK_INTERVAL_SECS, DEFAULT_TICK_INTERVAL_SECS)?;
        let watch_timeout_secs =
            parse_positive_u64(&get_env, ENV_WATCH_TIMEOUT_SECS, DEFAULT_WATCH_TIMEOUT_SECS)?;
        let stale_window_secs = parse_positive_u64(
            &get_env,
            ENV_STALE_EVENT_WINDOW_SECS,
            DEFAULT_STALE_EVENT_WINDOW_SECS,
        )?;
        let watermark_backoff_secs = parse_positive_u64(
            &get_env,
            ENV_WATERMARK_BACKOFF_SECS,
            DEFAULT_WATERMARK_BACKOFF_SECS,
        )?;
        let lease_ttl_secs =
            parse_positive_u64(&get_env, ENV_LEASE_TTL_SECS, DEFAULT_LEASE_TTL_SECS)?;

        Ok(Self {
            tick_interval: Duration::from_secs(tick_interval_secs),
            watch_timeout: Duration::from_secs(watch_timeout_secs),
            stale_event_window: chrono_secs(ENV_STALE_EVENT_WINDOW_SECS, stale_window_secs)?,
            watermark_backoff: chrono_secs(ENV_WATERMARK_BACKOFF_SECS, watermark_backoff_secs)?,
            lease_ttl: Duration::from_secs(lease_ttl_secs),
            ..Self::default()
        })
    }
}

fn parse_positive_u64<F>(get_env: &F, key: &str, default: u64) -> Result<u64>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = get_env(key) else {
        return Ok(default);
    };
    match raw.trim().parse::<u64>() {
        Ok(value) if value > 0 => Ok(value),
        _ => Err(Error::configuration(format!(
            "{key} must be a positive integer, got {raw:?}"
        ))),
    }
}

fn chrono_secs(key: &str, secs: u64) -> Result<chrono::Duration> {
    i64::try_from(secs)
        .map(chrono::Duration::seconds)
        .map_err(|_| Error::configuration(format!("{key} value {secs} exceeds supported range")))
}

/// What one tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    /// The tick was skipped because another instance holds the lease.
    pub skipped: bool,
    /// Job objects returned by the list pass.
    pub listed: usize,
    /// Objects currently running (no completion condition).
    pub running: usize,
    /// Observations persisted this tick (list and watch combined).
    pub recorded: usize,
    /// Watch deliveries received.
    pub watch_events: usize,
}

impl TickSummary {
    /// A tick skipped on lease contention.
    #[must_use]
    pub fn lease_skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }
}

/// The lease-guarded reconciliation loop.
pub struct JobMonitor {
    facade: Arc<WorkloadFacade>,
    lifecycle: Arc<ExecutionLifecycle>,
    store: Arc<dyn Store>,
    lease: Arc<dyn ClusterLease>,
    config: MonitorConfig,
    metrics: ExecMetrics,
    last_watch_time: Mutex<DateTime<Utc>>,
}

impl JobMonitor {
    /// Creates a monitor.
    ///
    /// The watch watermark starts one stale-event window in the past so a
    /// restarted control plane re-discovers completions it missed while
    /// down, bounded by the same window the watch itself honors.
    #[must_use]
    pub fn new(
        facade: Arc<WorkloadFacade>,
        lifecycle: Arc<ExecutionLifecycle>,
        store: Arc<dyn Store>,
        lease: Arc<dyn ClusterLease>,
        config: MonitorConfig,
    ) -> Self {
        let initial_watermark = Utc::now() - config.stale_event_window;
        Self {
            facade,
            lifecycle,
            store,
            lease,
            config,
            metrics: ExecMetrics::new(),
            last_watch_time: Mutex::new(initial_watermark),
        }
    }

    /// Runs the loop until the token is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(lease = %self.config.lease_name, "job execution monitor started");
        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    info!("job execution monitor stopping");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(err) = self.tick().await {
                        warn!(error = %err, "reconciliation tick failed");
                    }
                }
            }
        }
    }

    /// Runs one reconciliation tick.
    ///
    /// # Errors
    ///
    /// Returns cluster errors from the list pass and lease errors; both are
    /// transient at tick granularity and retried on the next tick.
    pub async fn tick(&self) -> Result<TickSummary> {
        self.metrics.record_invocation();

        let acquired = match self
            .lease
            .try_acquire(&self.config.lease_name, self.config.lease_ttl)
            .await
        {
            Ok(acquired) => acquired,
            Err(err) => {
                self.metrics.record_failure();
                return Err(err);
            }
        };
        if !acquired {
            self.metrics.record_skipped();
            return Ok(TickSummary::lease_skipped());
        }

        let started = Instant::now();
        let result = self.run_pass().await;

        if let Err(err) = self.lease.release(&self.config.lease_name).await {
            warn!(error = %err, "cannot release monitor lease");
        }
        self.metrics.observe_tick_duration(started.elapsed());
        match &result {
            Ok(_) => self.metrics.record_success(),
            Err(_) => self.metrics.record_failure(),
        }
        result
    }

    async fn run_pass(&self) -> Result<TickSummary> {
        let mut summary = TickSummary::default();
        let last_watch = *self
            .last_watch_time
            .lock()
            .map_err(|_| Error::storage("watermark lock poisoned"))?;

        let list = self
            .facade
            .list_completed_and_running(&self.config.label_selector)
            .await?;
        summary.listed = list.items.len();

        let mut running: HashSet<String> = HashSet::new();
        for item in &list.items {
            if item.is_running() {
                running.insert(item.name.clone());
            } else if item.completion_time.map_or(true, |time| time > last_watch) {
                if self.process(item).await {
                    summary.recorded += 1;
                }
            }
        }
        summary.running = running.len();

        if let Err(err) = self.lifecycle.sync_running_set(&running, Utc::now()).await {
            warn!(error = %err, "running-set reconciliation failed");
        }

        let resource_version = list.resource_version.clone().unwrap_or_default();
        let watch = self
            .facade
            .watch(
                &self.config.label_selector,
                &resource_version,
                self.config.watch_timeout,
            )
            .await;
        let mut stream = match watch {
            Ok(stream) => stream,
            Err(err) => {
                warn!(error = %err, "cannot open watch, will re-list next tick");
                self.advance_watermark();
                return Ok(summary);
            }
        };

        while let Some(event) = stream.next().await {
            match event {
                Err(err) => {
                    warn!(error = %err, "watch stream error");
                    break;
                }
                Ok(JobEvent::Deleted(_)) => {}
                Ok(JobEvent::Applied(item)) => {
                    summary.watch_events += 1;
                    let cutoff = Utc::now() - self.config.stale_event_window;
                    if item.completion_time.is_some_and(|time| time < cutoff) {
                        debug!(job = %item.name, "ignoring stale completion event");
                        continue;
                    }
                    if self.process(&item).await {
                        summary.recorded += 1;
                    }
                }
            }
        }

        self.advance_watermark();
        Ok(summary)
    }

    /// Classifies and persists one observation. Returns whether a record
    /// was written; failures are logged, not propagated; the next tick
    /// re-discovers any unresolved transition.
    async fn process(&self, item: &JobSummary) -> bool {
        if item.name.is_empty() || item.job_name.is_empty() {
            return false;
        }

        let job = match self.store.get_job(&item.job_name).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                debug!(job = %item.job_name, execution = %item.name, "observed execution for unknown job");
                return false;
            }
            Err(err) => {
                warn!(job = %item.job_name, error = %err, "cannot load job for observation");
                return false;
            }
        };

        let outcome = classify(&item.termination_signal());
        match self.lifecycle.record_execution(&job, item, &outcome).await {
            Ok(Some(execution)) => {
                if let Err(err) = self.lifecycle.update_last_execution(&execution).await {
                    warn!(execution = %execution.id, error = %err, "cannot update last-execution summary");
                }
                if let Err(err) = self.lifecycle.update_termination_status(&execution).await {
                    warn!(execution = %execution.id, error = %err, "cannot update termination status");
                }
                true
            }
            Ok(None) => false,
            Err(err) => {
                warn!(execution = %item.name, error = %err, "cannot record execution");
                false
            }
        }
    }

    fn advance_watermark(&self) {
        if let Ok(mut watermark) = self.last_watch_time.lock() {
            *watermark = Utc::now() - self.config.watermark_backoff;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = MonitorConfig::default();
        assert_eq!(config.tick_interval, Duration::from_secs(1));
        assert_eq!(config.watch_timeout, Duration::from_secs(300));
        assert_eq!(config.stale_event_window, chrono::Duration::hours(1));
        assert_eq!(config.watermark_backoff, chrono::Duration::seconds(60));
        assert_eq!(config.lease_name, "job-execution-monitor");
    }

    #[test]
    fn config_from_env_overrides() {
        let env = |key: &str| match key {
            ENV_WATCH_TIMEOUT_SECS => Some("30".to_string()),
            ENV_WATERMARK_BACKOFF_SECS => Some("5".to_string()),
            _ => None,
        };
        let config = MonitorConfig::from_env_with(env).expect("config");
        assert_eq!(config.watch_timeout, Duration::from_secs(30));
        assert_eq!(config.watermark_backoff, chrono::Duration::seconds(5));
        assert_eq!(config.tick_interval, Duration::from_secs(1));
    }

    #[test]
    fn config_rejects_non_positive_values() {
        let env = |key: &str| (key == ENV_TICK_INTERVAL_SECS).then(|| "0".to_string());
        let err = MonitorConfig::from_env_with(env).expect_err("zero is invalid");
        assert!(matches!(err, Error::Configuration { .. }));

        let env = |key: &str| (key == ENV_LEASE_TTL_SECS).then(|| "soon".to_string());
        assert!(MonitorConfig::from_env_with(env).is_err());
    }
}
