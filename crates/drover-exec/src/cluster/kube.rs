//! Kubernetes-backed cluster API implementation.
//!
//! Thin mapping from [`ClusterApi`] onto namespace-scoped `kube` clients.
//! Not-found responses are absorbed wherever the contract says absence is
//! tolerated; everything else is wrapped into [`Error::ClusterApi`] with the
//! underlying cause attached.

use std::time::Duration;

use async_trait::async_trait;
use either::Either;
use futures::StreamExt;
use k8s_openapi::api::batch::v1::{CronJob, Job};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, ListParams, LogParams, PostParams, WatchEvent, WatchParams};
use kube::core::response::{Status, StatusSummary};
use kube::Client;

use super::{
    labels, summarize_job, ClusterApi, DeleteOutcome, JobEvent, JobEventStream, JobList,
    JobSummary,
};
use crate::error::{Error, Result};

/// [`ClusterApi`] implementation over a Kubernetes namespace.
#[derive(Clone)]
pub struct KubeCluster {
    cron_jobs: Api<CronJob>,
    jobs: Api<Job>,
    pods: Api<Pod>,
}

impl KubeCluster {
    /// Creates a cluster API scoped to one namespace.
    #[must_use]
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            cron_jobs: Api::namespaced(client.clone(), namespace),
            jobs: Api::namespaced(client.clone(), namespace),
            pods: Api::namespaced(client, namespace),
        }
    }

    /// Summarizes a job, fetching its pod for termination details when the
    /// job has reached a completion condition. The pod lookup is
    /// best-effort: list/watch must not fail because a pod aged out.
    async fn enrich(&self, job: Job) -> JobSummary {
        let has_conditions = job
            .status
            .as_ref()
            .and_then(|status| status.conditions.as_deref())
            .is_some_and(|conditions| !conditions.is_empty());

        let pod = if has_conditions {
            self.find_pod(job.metadata.name.as_deref().unwrap_or_default())
                .await
        } else {
            None
        };
        summarize_job(&job, pod.as_ref())
    }

    async fn find_pod(&self, job_name: &str) -> Option<Pod> {
        let params = ListParams::default().labels(&format!("{}={job_name}", labels::POD_JOB_NAME));
        self.pods
            .list(&params)
            .await
            .ok()
            .and_then(|list| list.items.into_iter().next())
    }
}

fn map_err(context: &str, err: kube::Error) -> Error {
    Error::cluster_api_with_source(format!("{context} failed"), err)
}

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(response) if response.code == 404)
}

/// Maps the server's deletion status response to a [`DeleteOutcome`].
fn status_outcome(status: &Status) -> DeleteOutcome {
    DeleteOutcome {
        status: status.status.as_ref().map(|summary| {
            match summary {
                StatusSummary::Success => "Success",
                StatusSummary::Failure => "Failure",
            }
            .to_string()
        }),
        code: Some(status.code),
        reason: (!status.reason.is_empty()).then(|| status.reason.clone()),
        message: (!status.message.is_empty()).then(|| status.message.clone()),
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn list_jobs(&self, label_selector: &str) -> Result<JobList> {
        let params = ListParams::default().labels(label_selector);
        let list = self
            .jobs
            .list(&params)
            .await
            .map_err(|err| map_err("list jobs", err))?;

        let resource_version = list.metadata.resource_version.clone();
        let mut items = Vec::with_capacity(list.items.len());
        for job in list.items {
            items.push(self.enrich(job).await);
        }

        Ok(JobList {
            items,
            resource_version,
        })
    }

    async fn watch_jobs(
        &self,
        label_selector: &str,
        resource_version: &str,
        timeout: Duration,
    ) -> Result<JobEventStream> {
        #[allow(clippy::cast_possible_truncation)]
        let params = WatchParams::default()
            .labels(label_selector)
            .timeout(timeout.as_secs().min(u64::from(u32::MAX)) as u32);

        let stream = self
            .jobs
            .watch(&params, resource_version)
            .await
            .map_err(|err| map_err("watch jobs", err))?;

        let this = self.clone();
        let mapped = stream.filter_map(move |event| {
            let this = this.clone();
            async move {
                match event {
                    Ok(WatchEvent::Added(job) | WatchEvent::Modified(job)) => {
                        Some(Ok(JobEvent::Applied(this.enrich(job).await)))
                    }
                    Ok(WatchEvent::Deleted(job)) => {
                        Some(Ok(JobEvent::Deleted(summarize_job(&job, None))))
                    }
                    Ok(WatchEvent::Bookmark(_)) => None,
                    Ok(WatchEvent::Error(response)) => Some(Err(Error::cluster_api_status(
                        format!("watch stream error: {}", response.message),
                        response.reason,
                        response.code,
                    ))),
                    Err(err) => Some(Err(map_err("watch jobs", err))),
                }
            }
        });

        Ok(mapped.boxed())
    }

    async fn get_cron_job(&self, name: &str) -> Result<Option<CronJob>> {
        self.cron_jobs
            .get_opt(name)
            .await
            .map_err(|err| map_err("get cron job", err))
    }

    async fn create_cron_job(&self, cron_job: &CronJob) -> Result<()> {
        self.cron_jobs
            .create(&PostParams::default(), cron_job)
            .await
            .map(drop)
            .map_err(|err| map_err("create cron job", err))
    }

    async fn update_cron_job(&self, cron_job: &CronJob) -> Result<()> {
        let name = cron_job
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| Error::definition_shape("recurring-job object has no name"))?;
        self.cron_jobs
            .replace(name, &PostParams::default(), cron_job)
            .await
            .map(drop)
            .map_err(|err| map_err("update cron job", err))
    }

    async fn delete_cron_job(&self, name: &str) -> Result<()> {
        match self.cron_jobs.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(err) if is_not_found(&err) => Ok(()),
            Err(err) => Err(map_err("delete cron job", err)),
        }
    }

    async fn create_job(&self, job: &Job) -> Result<()> {
        self.jobs
            .create(&PostParams::default(), job)
            .await
            .map(drop)
            .map_err(|err| map_err("create job", err))
    }

    async fn delete_job_cascade(&self, name: &str) -> Result<DeleteOutcome> {
        let outcome = match self.jobs.delete(name, &DeleteParams::background()).await {
            Ok(Either::Left(_)) => DeleteOutcome::success(),
            Ok(Either::Right(status)) => status_outcome(&status),
            Err(err) if is_not_found(&err) => DeleteOutcome::success(),
            Err(err) => return Err(map_err("delete job", err)),
        };

        let params = ListParams::default().labels(&format!("{}={name}", labels::POD_JOB_NAME));
        if let Err(err) = self
            .pods
            .delete_collection(&DeleteParams::background(), &params)
            .await
        {
            if !is_not_found(&err) {
                return Err(map_err("delete job pods", err));
            }
        }

        Ok(outcome)
    }

    async fn get_pod_for_job(&self, job_name: &str) -> Result<Option<Pod>> {
        Ok(self.find_pod(job_name).await)
    }

    async fn pod_logs(&self, pod_name: &str) -> Result<String> {
        match self.pods.logs(pod_name, &LogParams::default()).await {
            Ok(logs) => Ok(logs),
            Err(err) if is_not_found(&err) => Ok(String::new()),
            Err(err) => Err(map_err("read pod logs", err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_outcome_maps_server_fields() {
        let status: Status = serde_json::from_value(serde_json::json!({
            "status": "Failure",
            "code": 409,
            "reason": "Conflict",
            "message": "job is being deleted",
        }))
        .expect("status");

        let outcome = status_outcome(&status);
        assert_eq!(outcome.status.as_deref(), Some("Failure"));
        assert_eq!(outcome.code, Some(409));
        assert_eq!(outcome.reason.as_deref(), Some("Conflict"));
        assert!(!outcome.is_success());
    }

    #[test]
    fn empty_status_fields_become_none() {
        let status: Status = serde_json::from_value(serde_json::json!({
            "status": "Success",
            "code": 200,
        }))
        .expect("status");

        let outcome = status_outcome(&status);
        assert_eq!(outcome.status.as_deref(), Some("Success"));
        assert_eq!(outcome.reason, None);
        assert_eq!(outcome.message, None);
        assert!(outcome.is_success());
    }
}
