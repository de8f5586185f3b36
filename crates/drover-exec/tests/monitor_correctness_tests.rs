//! End-to-end correctness tests for the reconciliation loop.
//!
//! Every scenario runs the real monitor against the in-memory cluster,
//! store, and lease implementations.

use std::sync::Arc;

use chrono::{Duration, Utc};

use drover_core::{ExecutionId, OpId};
use drover_exec::cluster::facade::WorkloadFacade;
use drover_exec::cluster::memory::InMemoryCluster;
use drover_exec::cluster::template::TemplateSet;
use drover_exec::cluster::{JobEvent, JobSummary};
use drover_exec::error::Result;
use drover_exec::lease::memory::InMemoryLease;
use drover_exec::lease::ClusterLease;
use drover_exec::lifecycle::ExecutionLifecycle;
use drover_exec::model::{
    DataJob, DataJobExecution, ExecutionStatus, ExecutionType, JobConfig,
};
use drover_exec::monitor::{JobMonitor, MonitorConfig};
use drover_exec::store::memory::InMemoryStore;
use drover_exec::store::Store;

struct Harness {
    cluster: Arc<InMemoryCluster>,
    store: Arc<InMemoryStore>,
    monitor: JobMonitor,
}

fn harness() -> Harness {
    harness_with_lease(Arc::new(InMemoryLease::new()))
}

fn harness_with_lease(lease: Arc<dyn ClusterLease>) -> Harness {
    let cluster = Arc::new(InMemoryCluster::new());
    let store = Arc::new(InMemoryStore::new());
    let facade = Arc::new(WorkloadFacade::new(
        cluster.clone(),
        TemplateSet::builtin().expect("template"),
    ));
    let lifecycle = Arc::new(ExecutionLifecycle::new(store.clone(), facade.clone()));
    let monitor = JobMonitor::new(
        facade,
        lifecycle,
        store.clone(),
        lease,
        MonitorConfig::default(),
    );
    Harness {
        cluster,
        store,
        monitor,
    }
}

fn completed(name: &str, job: &str, succeeded: bool, completed_at: chrono::DateTime<Utc>) -> JobSummary {
    JobSummary {
        name: name.to_string(),
        job_name: job.to_string(),
        execution_type: Some(ExecutionType::Scheduled),
        has_conditions: true,
        succeeded: Some(succeeded),
        start_time: Some(completed_at - Duration::minutes(5)),
        completion_time: Some(completed_at),
        ..JobSummary::default()
    }
}

fn running(name: &str, job: &str) -> JobSummary {
    JobSummary {
        name: name.to_string(),
        job_name: job.to_string(),
        has_conditions: false,
        start_time: Some(Utc::now()),
        ..JobSummary::default()
    }
}

#[tokio::test]
async fn listed_completion_is_classified_and_persisted() -> Result<()> {
    let harness = harness();
    harness
        .store
        .save_job(&DataJob::new("ingest", JobConfig::default()))
        .await?;

    let end = Utc::now() - Duration::minutes(2);
    harness.cluster.insert_summary(completed("ingest-1", "ingest", true, end));

    let summary = harness.monitor.tick().await?;
    assert!(!summary.skipped);
    assert_eq!(summary.recorded, 1);

    let execution = harness
        .store
        .get_execution(&ExecutionId::new("ingest-1"))
        .await?
        .expect("execution persisted");
    assert_eq!(execution.status, ExecutionStatus::Succeeded);
    assert_eq!(execution.end_time, Some(end));

    let job = harness.store.get_job("ingest").await?.expect("job");
    assert_eq!(job.last_execution_status, Some(ExecutionStatus::Succeeded));
    assert_eq!(job.last_execution_end_time, Some(end));
    assert_eq!(
        job.latest_job_termination_status,
        Some(ExecutionStatus::Succeeded)
    );
    assert_eq!(
        job.latest_job_execution_id,
        Some(ExecutionId::new("ingest-1"))
    );
    Ok(())
}

#[tokio::test]
async fn tick_is_skipped_while_lease_is_held_elsewhere() -> Result<()> {
    let lease = InMemoryLease::new();
    let rival = lease.peer();
    assert!(
        rival
            .try_acquire("job-execution-monitor", std::time::Duration::from_secs(60))
            .await?
    );

    let harness = harness_with_lease(Arc::new(lease));
    harness
        .store
        .save_job(&DataJob::new("ingest", JobConfig::default()))
        .await?;
    harness
        .cluster
        .insert_summary(completed("ingest-1", "ingest", true, Utc::now()));

    let summary = harness.monitor.tick().await?;
    assert!(summary.skipped);
    assert!(harness
        .store
        .get_execution(&ExecutionId::new("ingest-1"))
        .await?
        .is_none());

    // Once the rival releases, the next tick does the work.
    rival.release("job-execution-monitor").await?;
    let summary = harness.monitor.tick().await?;
    assert!(!summary.skipped);
    assert_eq!(summary.recorded, 1);
    Ok(())
}

#[tokio::test]
async fn stale_watch_events_are_discarded() -> Result<()> {
    let harness = harness();
    harness
        .store
        .save_job(&DataJob::new("ingest", JobConfig::default()))
        .await?;

    harness.cluster.queue_event(JobEvent::Applied(completed(
        "ingest-old",
        "ingest",
        true,
        Utc::now() - Duration::hours(2),
    )));

    let summary = harness.monitor.tick().await?;
    assert_eq!(summary.watch_events, 1);
    assert_eq!(summary.recorded, 0);
    assert!(harness
        .store
        .get_execution(&ExecutionId::new("ingest-old"))
        .await?
        .is_none());
    Ok(())
}

#[tokio::test]
async fn watch_deletions_are_ignored() -> Result<()> {
    let harness = harness();
    harness
        .store
        .save_job(&DataJob::new("ingest", JobConfig::default()))
        .await?;

    harness.cluster.queue_event(JobEvent::Deleted(completed(
        "ingest-1",
        "ingest",
        true,
        Utc::now(),
    )));

    let summary = harness.monitor.tick().await?;
    assert_eq!(summary.recorded, 0);
    assert!(harness
        .store
        .get_execution(&ExecutionId::new("ingest-1"))
        .await?
        .is_none());
    Ok(())
}

#[tokio::test]
async fn out_of_order_terminations_keep_the_newest_end_time() -> Result<()> {
    let harness = harness();
    harness
        .store
        .save_job(&DataJob::new("ingest", JobConfig::default()))
        .await?;

    let t1 = Utc::now() - Duration::minutes(10);
    let t2 = Utc::now() - Duration::minutes(5);

    // The newer termination (T2) is delivered first; the older one (T1)
    // arrives afterwards.
    harness
        .cluster
        .queue_event(JobEvent::Applied(completed("ingest-2", "ingest", true, t2)));
    harness.monitor.tick().await?;

    harness
        .cluster
        .queue_event(JobEvent::Applied(completed("ingest-1", "ingest", true, t1)));
    harness.monitor.tick().await?;

    // The execution row for T1 exists, but the job summary watermark
    // refused to move backwards.
    assert!(harness
        .store
        .get_execution(&ExecutionId::new("ingest-1"))
        .await?
        .is_some());
    let job = harness.store.get_job("ingest").await?.expect("job");
    assert_eq!(job.last_execution_end_time, Some(t2));
    assert_eq!(job.last_execution_status, Some(ExecutionStatus::Succeeded));
    Ok(())
}

#[tokio::test]
async fn platform_error_is_reopened_by_cluster_retry() -> Result<()> {
    let harness = harness();
    harness
        .store
        .save_job(&DataJob::new("ingest", JobConfig::default()))
        .await?;

    harness.cluster.queue_event(JobEvent::Applied(completed(
        "ingest-1",
        "ingest",
        false,
        Utc::now(),
    )));
    harness.monitor.tick().await?;

    let execution = harness
        .store
        .get_execution(&ExecutionId::new("ingest-1"))
        .await?
        .expect("execution");
    assert_eq!(execution.status, ExecutionStatus::PlatformError);

    // The cluster retries the same job object: the execution reappears
    // without a completion condition.
    harness
        .cluster
        .queue_event(JobEvent::Applied(running("ingest-1", "ingest")));
    harness.monitor.tick().await?;

    let execution = harness
        .store
        .get_execution(&ExecutionId::new("ingest-1"))
        .await?
        .expect("execution");
    assert_eq!(execution.status, ExecutionStatus::Running);
    assert_eq!(execution.end_time, None);

    // A hard-terminal verdict then lands and sticks.
    harness.cluster.queue_event(JobEvent::Applied(completed(
        "ingest-1",
        "ingest",
        true,
        Utc::now(),
    )));
    harness.monitor.tick().await?;

    let execution = harness
        .store
        .get_execution(&ExecutionId::new("ingest-1"))
        .await?
        .expect("execution");
    assert_eq!(execution.status, ExecutionStatus::Succeeded);
    Ok(())
}

#[tokio::test]
async fn executions_missing_from_cluster_are_closed() -> Result<()> {
    let harness = harness();
    harness
        .store
        .save_job(&DataJob::new("ingest", JobConfig::default()))
        .await?;

    let lost = DataJobExecution::submitted(
        ExecutionId::new("ingest-lost"),
        "ingest",
        ExecutionType::Scheduled,
        OpId::generate(),
        Utc::now() - Duration::minutes(30),
    );
    harness.store.save_execution(&lost).await?;

    harness.monitor.tick().await?;

    let execution = harness
        .store
        .get_execution(&ExecutionId::new("ingest-lost"))
        .await?
        .expect("execution");
    assert_eq!(execution.status, ExecutionStatus::PlatformError);
    assert!(execution.end_time.is_some());
    Ok(())
}

#[tokio::test]
async fn running_jobs_are_reported_not_recorded_as_lost() -> Result<()> {
    let harness = harness();
    harness
        .store
        .save_job(&DataJob::new("ingest", JobConfig::default()))
        .await?;

    // The execution row is old, but its job object is still visible on
    // the cluster: it must stay open.
    let open = DataJobExecution::submitted(
        ExecutionId::new("ingest-1"),
        "ingest",
        ExecutionType::Scheduled,
        OpId::generate(),
        Utc::now() - Duration::hours(2),
    );
    harness.store.save_execution(&open).await?;
    harness.cluster.insert_summary(running("ingest-1", "ingest"));

    let summary = harness.monitor.tick().await?;
    assert_eq!(summary.running, 1);

    let execution = harness
        .store
        .get_execution(&ExecutionId::new("ingest-1"))
        .await?
        .expect("execution");
    assert_eq!(execution.status, ExecutionStatus::Submitted);
    Ok(())
}

#[tokio::test]
async fn list_failure_ends_the_tick_early() -> Result<()> {
    let harness = harness();
    harness.cluster.fail_next_list("cluster unavailable");

    let err = harness.monitor.tick().await.expect_err("tick must fail");
    let message = err.to_string();
    assert!(message.contains("cluster unavailable"), "got: {message}");

    // The next tick recovers.
    let summary = harness.monitor.tick().await?;
    assert!(!summary.skipped);
    Ok(())
}

#[tokio::test]
async fn observations_for_unknown_jobs_are_skipped() -> Result<()> {
    let harness = harness();
    harness
        .cluster
        .insert_summary(completed("ghost-1", "ghost", true, Utc::now()));

    let summary = harness.monitor.tick().await?;
    assert_eq!(summary.recorded, 0);
    assert!(harness
        .store
        .get_execution(&ExecutionId::new("ghost-1"))
        .await?
        .is_none());
    Ok(())
}

#[tokio::test]
async fn termination_payload_drives_the_verdict() -> Result<()> {
    let harness = harness();
    harness
        .store
        .save_job(&DataJob::new("ingest", JobConfig::default()))
        .await?;

    let mut summary = completed("ingest-1", "ingest", true, Utc::now());
    summary.termination_payload =
        Some(r#"{"status":"User Error","vdk_version":"3.1.0"}"#.to_string());
    harness.cluster.insert_summary(summary);

    harness.monitor.tick().await?;

    let execution = harness
        .store
        .get_execution(&ExecutionId::new("ingest-1"))
        .await?
        .expect("execution");
    // The application-level verdict overrides the cluster-level success.
    assert_eq!(execution.status, ExecutionStatus::UserError);
    assert_eq!(execution.runtime_version.as_deref(), Some("3.1.0"));
    Ok(())
}
