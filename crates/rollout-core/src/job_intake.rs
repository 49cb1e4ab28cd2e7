//! Cloud job intake.
//!
//! The job channel delivers notifications at least once and in no
//! particular order. [`JobIntake`] asks for job descriptions when the job
//! list changes and turns each described job into at most one queued
//! deployment.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rollout_state::{Deployment, DeploymentType, JobStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::Result;
use crate::metrics::METRICS;
use crate::obs;
use crate::queue::DeploymentQueue;
use crate::runtime::JobSource;
use crate::status_ledger::{
    DeploymentStatusLedger, StatusConsumer, StatusDetails, DEPLOYMENT_ID_KEY,
    DEPLOYMENT_STATUS_DETAILS_KEY, DEPLOYMENT_STATUS_KEY,
};

/// Job id asking the source for whatever job is next.
pub const NEXT_JOB_SENTINEL: &str = "$next";

/// Execution status buckets of a job-list notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobExecutionStatus {
    Queued,
    InProgress,
    Succeeded,
    Failed,
    Canceled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSummary {
    pub job_id: String,
    pub queued_at: DateTime<Utc>,
}

/// Snapshot of the job list pushed by the source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobsChanged {
    pub jobs: BTreeMap<JobExecutionStatus, Vec<JobSummary>>,
}

impl JobsChanged {
    pub fn with(mut self, status: JobExecutionStatus, summaries: Vec<JobSummary>) -> Self {
        self.jobs.insert(status, summaries);
        self
    }
}

/// Ids seen at the most recent `queued_at`.
///
/// A later timestamp resets the set; an earlier one, or an id already in
/// the set, is rejected. Jobs resumed after a restart are registered with
/// [`LatestQueuedJobs::mark_processed`] because their timestamp is unknown
/// until the source describes them again.
#[derive(Debug)]
pub struct LatestQueuedJobs {
    latest: DateTime<Utc>,
    ids: HashSet<String>,
    processed: HashSet<String>,
}

impl Default for LatestQueuedJobs {
    fn default() -> Self {
        Self {
            latest: DateTime::<Utc>::default(),
            ids: HashSet::new(),
            processed: HashSet::new(),
        }
    }
}

impl LatestQueuedJobs {
    /// Returns whether the job is new.
    pub fn admit(&mut self, queued_at: DateTime<Utc>, job_id: &str) -> bool {
        if self.processed.remove(job_id) {
            self.track(queued_at, job_id);
            return false;
        }
        self.track(queued_at, job_id)
    }

    fn track(&mut self, queued_at: DateTime<Utc>, job_id: &str) -> bool {
        if queued_at > self.latest {
            self.latest = queued_at;
            self.ids.clear();
            self.ids.insert(job_id.to_string());
            return true;
        }
        if queued_at < self.latest || self.ids.contains(job_id) {
            return false;
        }
        self.ids.insert(job_id.to_string());
        true
    }

    pub fn mark_processed(&mut self, job_id: &str) {
        if !self.ids.contains(job_id) {
            self.processed.insert(job_id.to_string());
        }
    }
}

pub struct JobIntake {
    source: Arc<dyn JobSource>,
    queue: Arc<DeploymentQueue>,
    ledger: Arc<DeploymentStatusLedger>,
    tracker: Mutex<LatestQueuedJobs>,
    /// Queued notifications not yet matched by a description
    unprocessed: AtomicUsize,
}

impl JobIntake {
    pub fn new(
        source: Arc<dyn JobSource>,
        queue: Arc<DeploymentQueue>,
        ledger: Arc<DeploymentStatusLedger>,
    ) -> Self {
        Self {
            source,
            queue,
            ledger,
            tracker: Mutex::new(LatestQueuedJobs::default()),
            unprocessed: AtomicUsize::new(0),
        }
    }

    async fn request(&self, job_id: &str) {
        if let Err(e) = self.source.describe(job_id).await {
            warn!(job_id = %job_id, error = %e, "describe request failed");
        }
    }

    /// React to a job-list notification.
    pub async fn jobs_changed(&self, event: &JobsChanged) {
        if event.jobs.is_empty() {
            self.unprocessed.store(0, Ordering::SeqCst);
            self.evaluate_cancellation();
            return;
        }
        for status in [JobExecutionStatus::Queued, JobExecutionStatus::InProgress] {
            let Some(summaries) = event.jobs.get(&status) else {
                continue;
            };
            if status == JobExecutionStatus::Queued {
                self.unprocessed.fetch_add(1, Ordering::SeqCst);
            }
            if summaries.is_empty() {
                self.request(NEXT_JOB_SENTINEL).await;
            }
            for summary in summaries {
                self.request(&summary.job_id).await;
            }
        }
    }

    /// The source answered a describe request with no job.
    pub async fn no_job_available(&self) {
        if self.unprocessed.load(Ordering::SeqCst) > 0 {
            debug!("queued jobs outstanding, asking for the next one again");
            self.request(NEXT_JOB_SENTINEL).await;
        }
    }

    /// Admit a described job. Returns whether a deployment was queued.
    pub fn job_described(&self, job_id: &str, queued_at: DateTime<Utc>, document: &[u8]) -> bool {
        let _ = self
            .unprocessed
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));

        let admitted = self
            .tracker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .admit(queued_at, job_id);
        if !admitted {
            self.reject(job_id, "duplicate or outdated job notification");
            return false;
        }

        let document = match std::str::from_utf8(document) {
            Ok(doc) => doc,
            Err(_) => {
                self.reject(job_id, "job document is not valid UTF-8");
                return false;
            }
        };

        // A newer job being described means the previous one left IN_PROGRESS.
        self.evaluate_cancellation();

        let queued = self
            .queue
            .offer(Deployment::new(job_id, DeploymentType::CloudJob, document));
        if queued {
            info!(job_id = %job_id, "job added to the deployment queue");
        }
        queued
    }

    fn reject(&self, job_id: &str, reason: &str) {
        METRICS.inc_jobs_rejected();
        obs::emit_job_rejected(job_id, reason);
    }

    /// Queue a cancellation if the active cloud deployment can still be
    /// interrupted and nothing else is waiting.
    pub fn evaluate_cancellation(&self) -> bool {
        if !self.queue.is_empty() {
            return false;
        }
        let Some(active) = self.queue.active() else {
            return false;
        };
        if !active.is_cancellable() || active.deployment_type != DeploymentType::CloudJob {
            return false;
        }
        let offered = self.queue.offer(Deployment::cancellation(
            Uuid::new_v4().to_string(),
            DeploymentType::CloudJob,
        ));
        if offered {
            info!(deployment_id = %active.id, "cancellation queued for active job");
        }
        offered
    }

    /// Register a job resumed from the persisted token.
    pub fn mark_processed(&self, job_id: &str) {
        self.tracker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .mark_processed(job_id);
    }

    /// The job channel is back: ask for the next job and flush stored statuses.
    pub async fn on_reconnect(&self) -> Result<usize> {
        self.request(NEXT_JOB_SENTINEL).await;
        Ok(self
            .ledger
            .republish_pending(DeploymentType::CloudJob)
            .await?)
    }
}

/// Status consumer forwarding cloud-job records to the job source.
pub struct JobStatusForwarder {
    source: Arc<dyn JobSource>,
}

impl JobStatusForwarder {
    pub fn new(source: Arc<dyn JobSource>) -> Self {
        Self { source }
    }
}

#[async_trait]
impl StatusConsumer for JobStatusForwarder {
    async fn accept(&self, details: &StatusDetails) -> bool {
        let Some(job_id) = details.get(DEPLOYMENT_ID_KEY).and_then(Value::as_str) else {
            warn!("status record without a deployment id");
            return false;
        };
        let status: JobStatus = match details
            .get(DEPLOYMENT_STATUS_KEY)
            .cloned()
            .map(serde_json::from_value)
        {
            Some(Ok(status)) => status,
            _ => {
                warn!(job_id = %job_id, "status record without a job status");
                return false;
            }
        };
        let nested = details
            .get(DEPLOYMENT_STATUS_DETAILS_KEY)
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        match self.source.update_status(job_id, status, &nested).await {
            Ok(()) => true,
            Err(e) => {
                debug!(job_id = %job_id, error = %e, "job status update not delivered");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn tracker_rejects_duplicates_and_stale_timestamps() {
        let mut t = LatestQueuedJobs::default();
        assert!(t.admit(at(5), "X"));
        assert!(!t.admit(at(5), "X"));
        assert!(!t.admit(at(1), "Y"));
        assert!(t.admit(at(5), "Z"));
        assert!(t.admit(at(6), "X"));
    }

    #[test]
    fn processed_job_is_rejected_once_then_tracked() {
        let mut t = LatestQueuedJobs::default();
        t.mark_processed("R");
        assert!(!t.admit(at(3), "R"));
        assert!(!t.admit(at(3), "R"));
        assert!(t.admit(at(3), "S"));
    }
}
