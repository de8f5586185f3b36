//! Drover execution reconciler service.
//!
//! Runs the lease-guarded reconciliation loop plus the periodic sync passes
//! (gauge refresh, execution history cleanup) against one cluster
//! namespace, and serves a health endpoint.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use drover_core::observability::{init_logging, LogFormat};
use drover_exec::cluster::facade::WorkloadFacade;
use drover_exec::cluster::kube::KubeCluster;
use drover_exec::cluster::template::TemplateSet;
use drover_exec::cluster::ClusterApi;
use drover_exec::deploy::DeploymentTracker;
use drover_exec::error::{Error, Result};
use drover_exec::lease::kube::KubeLease;
use drover_exec::lease::ClusterLease;
use drover_exec::lifecycle::ExecutionLifecycle;
use drover_exec::metrics::StatusGauges;
use drover_exec::monitor::{JobMonitor, MonitorConfig};
use drover_exec::retention::{ExecutionCleaner, RetentionPolicy, DEFAULT_MAX_AGE_DAYS};
use drover_exec::store::memory::InMemoryStore;
use drover_exec::store::Store;

const DEFAULT_GAUGE_REFRESH_SECS: u64 = 5;
const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 86_400;

fn required_env(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| Error::configuration(format!("missing {key}")))
}

fn optional_env(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

fn resolve_port() -> Result<u16> {
    if let Ok(port) = std::env::var("PORT") {
        return port
            .parse::<u16>()
            .map_err(|_| Error::configuration("invalid PORT"));
    }

    if let Ok(port) = std::env::var("DROVER_PORT") {
        return port
            .parse::<u16>()
            .map_err(|_| Error::configuration("invalid DROVER_PORT"));
    }

    Ok(8080)
}

fn log_format_from_env() -> LogFormat {
    match std::env::var("DROVER_LOG_FORMAT") {
        Ok(value) if value.eq_ignore_ascii_case("json") => LogFormat::Json,
        _ => LogFormat::Pretty,
    }
}

fn parse_positive_env(key: &str, default: u64) -> Result<u64> {
    let Some(raw) = optional_env(key) else {
        return Ok(default);
    };
    match raw.trim().parse::<u64>() {
        Ok(value) if value > 0 => Ok(value),
        _ => Err(Error::configuration(format!(
            "{key} must be a positive integer, got {raw:?}"
        ))),
    }
}

fn retention_from_env() -> Result<RetentionPolicy> {
    let keep_count = parse_positive_env(
        "DROVER_RETENTION_KEEP_COUNT",
        drover_exec::retention::DEFAULT_KEEP_COUNT as u64,
    )?;
    let max_age_days = parse_positive_env(
        "DROVER_RETENTION_MAX_AGE_DAYS",
        u64::try_from(DEFAULT_MAX_AGE_DAYS).unwrap_or(14),
    )?;

    Ok(RetentionPolicy::new(
        usize::try_from(keep_count)
            .map_err(|_| Error::configuration("DROVER_RETENTION_KEEP_COUNT out of range"))?,
        chrono::Duration::days(
            i64::try_from(max_age_days)
                .map_err(|_| Error::configuration("DROVER_RETENTION_MAX_AGE_DAYS out of range"))?,
        ),
    ))
}

async fn health_handler() -> StatusCode {
    StatusCode::OK
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging(log_format_from_env());

    let namespace = required_env("DROVER_NAMESPACE")?;
    let template_path = optional_env("DROVER_TEMPLATE_PATH").map(PathBuf::from);
    let port = resolve_port()?;
    let monitor_config = MonitorConfig::from_env()?;
    let retention = retention_from_env()?;
    let gauge_refresh =
        Duration::from_secs(parse_positive_env("DROVER_GAUGE_REFRESH_SECS", DEFAULT_GAUGE_REFRESH_SECS)?);
    let cleanup_interval = Duration::from_secs(parse_positive_env(
        "DROVER_CLEANUP_INTERVAL_SECS",
        DEFAULT_CLEANUP_INTERVAL_SECS,
    )?);

    let client = kube::Client::try_default()
        .await
        .map_err(|err| Error::cluster_api_with_source("cannot build cluster client", err))?;
    let api: Arc<dyn ClusterApi> = Arc::new(KubeCluster::new(client.clone(), &namespace));
    let lease: Arc<dyn ClusterLease> = Arc::new(KubeLease::new(client, &namespace));

    // The record store is pluggable behind `Store`; the in-memory
    // implementation keeps single-instance deployments and local
    // development self-contained. Durable backends wire in here.
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());

    // Template problems must surface now, not at first deployment.
    let templates = TemplateSet::load(template_path.as_deref())?;

    let facade = Arc::new(WorkloadFacade::new(api, templates));
    let lifecycle = Arc::new(ExecutionLifecycle::new(store.clone(), facade.clone()));
    let gauges = Arc::new(StatusGauges::new());
    let tracker = Arc::new(DeploymentTracker::new(store.clone(), gauges));
    let cleaner = Arc::new(ExecutionCleaner::new(store.clone(), retention));
    let monitor = Arc::new(JobMonitor::new(
        facade,
        lifecycle,
        store,
        lease,
        monitor_config,
    ));

    let shutdown = CancellationToken::new();

    {
        let monitor = Arc::clone(&monitor);
        let token = shutdown.clone();
        tokio::spawn(async move { monitor.run(token).await });
    }

    {
        let tracker = Arc::clone(&tracker);
        let token = shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(gauge_refresh);
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = tracker.refresh_gauges().await {
                            warn!(error = %err, "gauge refresh failed");
                        }
                    }
                }
            }
        });
    }

    {
        let cleaner = Arc::clone(&cleaner);
        let token = shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cleanup_interval);
            // The first tick fires immediately; skip it so a restart loop
            // doesn't hammer the store.
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = cleaner.sweep().await {
                            warn!(error = %err, "execution history cleanup failed");
                        }
                    }
                }
            }
        });
    }

    {
        let token = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received");
                token.cancel();
            }
        });
    }

    let app = Router::new().route("/health", get(health_handler));
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|err| Error::configuration(format!("failed to bind: {err}")))?;

    info!(%addr, namespace = %namespace, "drover reconciler serving");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await
        .map_err(|err| Error::configuration(format!("server error: {err}")))?;

    shutdown.cancel();
    Ok(())
}
