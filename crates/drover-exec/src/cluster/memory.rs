//! In-memory cluster implementation for testing.
//!
//! Holds workload objects in plain maps and lets tests script watch
//! deliveries, deletion outcomes, and failure injection.
//!
//! ## Limitations
//!
//! - **NOT a scheduler**: Recurring jobs never spawn one-shot jobs on their
//!   own; tests insert job objects or summaries directly
//! - **Single-process only**: No cross-process state

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use k8s_openapi::api::batch::v1::{CronJob, Job};
use k8s_openapi::api::core::v1::Pod;

use super::{
    labels, summarize_job, ClusterApi, DeleteOutcome, JobEvent, JobEventStream, JobList,
    JobSummary,
};
use crate::error::{Error, Result};

#[derive(Debug, Default)]
struct State {
    cron_jobs: HashMap<String, CronJob>,
    jobs: HashMap<String, Job>,
    pods: HashMap<String, Pod>,
    logs: HashMap<String, String>,
    scripted_summaries: Vec<JobSummary>,
    pending_events: Vec<Result<JobEvent>>,
    delete_outcome: Option<DeleteOutcome>,
    fail_next_list: Option<String>,
    resource_version: u64,
}

/// In-memory [`ClusterApi`] for tests.
#[derive(Debug, Default)]
pub struct InMemoryCluster {
    state: Mutex<State>,
}

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("lock poisoned")
}

impl InMemoryCluster {
    /// Creates an empty cluster.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a recurring-job object directly.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    pub fn insert_cron_job(&self, cron_job: CronJob) {
        let mut state = self.state.lock().expect("lock");
        let name = cron_job.metadata.name.clone().unwrap_or_default();
        state.cron_jobs.insert(name, cron_job);
    }

    /// Inserts a one-shot job object directly.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    pub fn insert_job(&self, job: Job) {
        let mut state = self.state.lock().expect("lock");
        state.resource_version += 1;
        let name = job.metadata.name.clone().unwrap_or_default();
        state.jobs.insert(name, job);
    }

    /// Inserts a pod object directly.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    pub fn insert_pod(&self, pod: Pod) {
        let mut state = self.state.lock().expect("lock");
        let name = pod.metadata.name.clone().unwrap_or_default();
        state.pods.insert(name, pod);
    }

    /// Registers logs for a pod name.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    pub fn insert_logs(&self, pod_name: &str, logs: &str) {
        let mut state = self.state.lock().expect("lock");
        state.logs.insert(pod_name.to_string(), logs.to_string());
    }

    /// Appends a pre-built summary to every subsequent list result.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    pub fn insert_summary(&self, summary: JobSummary) {
        let mut state = self.state.lock().expect("lock");
        state.resource_version += 1;
        state.scripted_summaries.push(summary);
    }

    /// Queues a delivery for the next watch.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    pub fn queue_event(&self, event: JobEvent) {
        let mut state = self.state.lock().expect("lock");
        state.pending_events.push(Ok(event));
    }

    /// Queues a watch failure.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    pub fn queue_watch_error(&self, message: &str) {
        let mut state = self.state.lock().expect("lock");
        state.pending_events.push(Err(Error::cluster_api(message)));
    }

    /// Forces the next cascading delete to report this outcome (and leave
    /// state untouched).
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    pub fn set_delete_outcome(&self, outcome: DeleteOutcome) {
        let mut state = self.state.lock().expect("lock");
        state.delete_outcome = Some(outcome);
    }

    /// Fails the next list call with a cluster API error.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    pub fn fail_next_list(&self, message: &str) {
        let mut state = self.state.lock().expect("lock");
        state.fail_next_list = Some(message.to_string());
    }

    /// Reads back a one-shot job object, for assertions.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    #[must_use]
    pub fn job(&self, name: &str) -> Option<Job> {
        self.state.lock().expect("lock").jobs.get(name).cloned()
    }

    /// Reads back a recurring-job object, for assertions.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    #[must_use]
    pub fn cron_job(&self, name: &str) -> Option<CronJob> {
        self.state.lock().expect("lock").cron_jobs.get(name).cloned()
    }
}

/// Matches a `k=v[,k=v]` label selector against an object's labels.
fn selector_matches(selector: &str, object_labels: Option<&BTreeMap<String, String>>) -> bool {
    if selector.trim().is_empty() {
        return true;
    }
    let empty = BTreeMap::new();
    let object_labels = object_labels.unwrap_or(&empty);
    selector.split(',').all(|clause| {
        clause
            .split_once('=')
            .is_some_and(|(key, value)| {
                object_labels.get(key.trim()).map(String::as_str) == Some(value.trim())
            })
    })
}

#[async_trait]
impl ClusterApi for InMemoryCluster {
    async fn list_jobs(&self, label_selector: &str) -> Result<JobList> {
        let mut state = self.state.lock().map_err(poison_err)?;
        if let Some(message) = state.fail_next_list.take() {
            return Err(Error::cluster_api(message));
        }

        let mut items: Vec<JobSummary> = state
            .jobs
            .values()
            .filter(|job| selector_matches(label_selector, job.metadata.labels.as_ref()))
            .map(|job| {
                let pod = state.pods.values().find(|pod| {
                    pod.metadata
                        .labels
                        .as_ref()
                        .and_then(|labels| labels.get(labels::POD_JOB_NAME))
                        == job.metadata.name.as_ref()
                });
                summarize_job(job, pod)
            })
            .collect();
        items.extend(state.scripted_summaries.iter().cloned());

        Ok(JobList {
            items,
            resource_version: Some(state.resource_version.to_string()),
        })
    }

    async fn watch_jobs(
        &self,
        _label_selector: &str,
        _resource_version: &str,
        _timeout: Duration,
    ) -> Result<JobEventStream> {
        let mut state = self.state.lock().map_err(poison_err)?;
        let events = std::mem::take(&mut state.pending_events);
        Ok(stream::iter(events).boxed())
    }

    async fn get_cron_job(&self, name: &str) -> Result<Option<CronJob>> {
        Ok(self
            .state
            .lock()
            .map_err(poison_err)?
            .cron_jobs
            .get(name)
            .cloned())
    }

    async fn create_cron_job(&self, cron_job: &CronJob) -> Result<()> {
        let mut state = self.state.lock().map_err(poison_err)?;
        let name = cron_job.metadata.name.clone().unwrap_or_default();
        if state.cron_jobs.contains_key(&name) {
            return Err(Error::cluster_api_status(
                format!("cron job {name} already exists"),
                "AlreadyExists",
                409,
            ));
        }
        state.cron_jobs.insert(name, cron_job.clone());
        Ok(())
    }

    async fn update_cron_job(&self, cron_job: &CronJob) -> Result<()> {
        let mut state = self.state.lock().map_err(poison_err)?;
        let name = cron_job.metadata.name.clone().unwrap_or_default();
        state.cron_jobs.insert(name, cron_job.clone());
        Ok(())
    }

    async fn delete_cron_job(&self, name: &str) -> Result<()> {
        self.state.lock().map_err(poison_err)?.cron_jobs.remove(name);
        Ok(())
    }

    async fn create_job(&self, job: &Job) -> Result<()> {
        let mut state = self.state.lock().map_err(poison_err)?;
        state.resource_version += 1;
        let name = job.metadata.name.clone().unwrap_or_default();
        if state.jobs.contains_key(&name) {
            return Err(Error::cluster_api_status(
                format!("job {name} already exists"),
                "AlreadyExists",
                409,
            ));
        }
        state.jobs.insert(name, job.clone());
        Ok(())
    }

    async fn delete_job_cascade(&self, name: &str) -> Result<DeleteOutcome> {
        let mut state = self.state.lock().map_err(poison_err)?;
        if let Some(outcome) = state.delete_outcome.take() {
            return Ok(outcome);
        }

        state.jobs.remove(name);
        state.pods.retain(|_, pod| {
            pod.metadata
                .labels
                .as_ref()
                .and_then(|labels| labels.get(labels::POD_JOB_NAME))
                .map(String::as_str)
                != Some(name)
        });
        Ok(DeleteOutcome::success())
    }

    async fn get_pod_for_job(&self, job_name: &str) -> Result<Option<Pod>> {
        Ok(self
            .state
            .lock()
            .map_err(poison_err)?
            .pods
            .values()
            .find(|pod| {
                pod.metadata
                    .labels
                    .as_ref()
                    .and_then(|labels| labels.get(labels::POD_JOB_NAME))
                    .map(String::as_str)
                    == Some(job_name)
            })
            .cloned())
    }

    async fn pod_logs(&self, pod_name: &str) -> Result<String> {
        Ok(self
            .state
            .lock()
            .map_err(poison_err)?
            .logs
            .get(pod_name)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labeled_job(name: &str, job_name: &str) -> Job {
        let mut job = Job::default();
        job.metadata.name = Some(name.to_string());
        job.metadata.labels = Some(BTreeMap::from([
            (
                labels::JOB_TYPE.to_string(),
                labels::TYPE_DATA_JOB.to_string(),
            ),
            (labels::JOB_NAME.to_string(), job_name.to_string()),
        ]));
        job
    }

    #[tokio::test]
    async fn list_filters_by_selector() -> Result<()> {
        let cluster = InMemoryCluster::new();
        cluster.insert_job(labeled_job("a-1", "a"));
        cluster.insert_job(labeled_job("b-1", "b"));

        let all = cluster.list_jobs(&super::super::data_job_selector()).await?;
        assert_eq!(all.items.len(), 2);

        let only_a = cluster
            .list_jobs(&format!("{}=a", labels::JOB_NAME))
            .await?;
        assert_eq!(only_a.items.len(), 1);
        assert_eq!(only_a.items[0].name, "a-1");
        Ok(())
    }

    #[tokio::test]
    async fn watch_drains_queued_events() -> Result<()> {
        let cluster = InMemoryCluster::new();
        cluster.queue_event(JobEvent::Deleted(JobSummary::default()));

        let mut stream = cluster
            .watch_jobs("", "0", Duration::from_secs(1))
            .await?;
        assert!(stream.next().await.is_some());
        assert!(stream.next().await.is_none());

        // A second watch starts empty.
        let mut stream = cluster
            .watch_jobs("", "0", Duration::from_secs(1))
            .await?;
        assert!(stream.next().await.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn cascade_delete_tolerates_absent_job() -> Result<()> {
        let cluster = InMemoryCluster::new();
        let outcome = cluster.delete_job_cascade("ghost").await?;
        assert!(outcome.is_success());
        Ok(())
    }
}
