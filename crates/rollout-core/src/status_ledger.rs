//! Deployment status ledger.
//!
//! Every status is persisted before it is offered to the consumer registered
//! for its deployment type, and is deleted only once that consumer accepts
//! it. Records nobody accepted stay in the store until
//! [`DeploymentStatusLedger::republish_pending`] runs again (after a restart
//! or reconnect). The ledger never retries on a timer.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use rollout_state::{
    DeploymentType, JobStatus, PersistedStatusRecord, StatusStore, StatusUpdate, StorageResult,
};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

use crate::metrics::METRICS;
use crate::obs;

/// Details map handed to status consumers.
pub type StatusDetails = serde_json::Map<String, Value>;

pub const DEPLOYMENT_ID_KEY: &str = "DeploymentId";
pub const DEPLOYMENT_TYPE_KEY: &str = "DeploymentType";
pub const DEPLOYMENT_STATUS_KEY: &str = "DeploymentStatus";
pub const DEPLOYMENT_STATUS_DETAILS_KEY: &str = "DeploymentStatusDetails";
/// Detailed outcome inside the status details (`SUCCESSFUL`, `FAILED_...`)
pub const DETAILED_STATUS_KEY: &str = "detailed-deployment-status";
pub const FAILURE_CAUSE_KEY: &str = "deployment-failure-cause";

/// Receives status records for one deployment type.
///
/// Returning `false` keeps the record for a later republish.
#[async_trait]
pub trait StatusConsumer: Send + Sync {
    async fn accept(&self, details: &StatusDetails) -> bool;
}

/// Adapts a plain function into a [`StatusConsumer`].
pub struct FnConsumer<F>(pub F);

#[async_trait]
impl<F> StatusConsumer for FnConsumer<F>
where
    F: Fn(&StatusDetails) -> bool + Send + Sync,
{
    async fn accept(&self, details: &StatusDetails) -> bool {
        (self.0)(details)
    }
}

/// Render a persisted record as the consumer-facing details map.
pub fn details_map(record: &PersistedStatusRecord) -> StatusDetails {
    let update = &record.update;
    let nested: StatusDetails = update
        .status_details
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect();

    let mut details = StatusDetails::new();
    details.insert(
        DEPLOYMENT_ID_KEY.to_string(),
        Value::String(update.deployment_id.clone()),
    );
    details.insert(
        DEPLOYMENT_TYPE_KEY.to_string(),
        Value::String(update.deployment_type.as_str().to_string()),
    );
    details.insert(
        DEPLOYMENT_STATUS_KEY.to_string(),
        Value::String(update.job_status.as_str().to_string()),
    );
    details.insert(
        DEPLOYMENT_STATUS_DETAILS_KEY.to_string(),
        Value::Object(nested),
    );
    details
}

pub struct DeploymentStatusLedger {
    store: Arc<dyn StatusStore>,
    consumers: RwLock<HashMap<DeploymentType, Arc<dyn StatusConsumer>>>,
    // publish and republish of one type never interleave
    cloud_gate: Mutex<()>,
    local_gate: Mutex<()>,
}

impl DeploymentStatusLedger {
    pub fn new(store: Arc<dyn StatusStore>) -> Self {
        Self {
            store,
            consumers: RwLock::new(HashMap::new()),
            cloud_gate: Mutex::new(()),
            local_gate: Mutex::new(()),
        }
    }

    fn gate(&self, deployment_type: DeploymentType) -> &Mutex<()> {
        match deployment_type {
            DeploymentType::CloudJob => &self.cloud_gate,
            DeploymentType::LocalRequest => &self.local_gate,
        }
    }

    fn consumer(&self, deployment_type: DeploymentType) -> Option<Arc<dyn StatusConsumer>> {
        self.consumers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&deployment_type)
            .cloned()
    }

    /// Register the single consumer for `deployment_type`.
    ///
    /// Returns `false` and keeps the existing consumer if one is registered.
    pub fn register(
        &self,
        deployment_type: DeploymentType,
        consumer: Arc<dyn StatusConsumer>,
    ) -> bool {
        let mut consumers = self
            .consumers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if consumers.contains_key(&deployment_type) {
            return false;
        }
        consumers.insert(deployment_type, consumer);
        true
    }

    /// Persist a status, then offer every pending record of its type in order.
    pub async fn publish(
        &self,
        deployment_id: &str,
        deployment_type: DeploymentType,
        job_status: JobStatus,
        status_details: BTreeMap<String, String>,
    ) -> StorageResult<()> {
        let _gate = self.gate(deployment_type).lock().await;
        let record = self
            .store
            .append(StatusUpdate {
                deployment_id: deployment_id.to_string(),
                deployment_type,
                job_status,
                status_details,
            })
            .await?;
        debug!(
            deployment_id = %deployment_id,
            status = %job_status,
            seq = record.seq,
            "stored deployment status"
        );
        self.deliver_pending(deployment_type).await?;
        Ok(())
    }

    /// Offer every persisted record of `deployment_type` to its consumer.
    ///
    /// Delivery follows persistence order and stops at the first record the
    /// consumer rejects. Returns the number of records delivered.
    pub async fn republish_pending(&self, deployment_type: DeploymentType) -> StorageResult<usize> {
        let _gate = self.gate(deployment_type).lock().await;
        self.deliver_pending(deployment_type).await
    }

    /// Records of `deployment_type` still waiting for acknowledgement.
    pub async fn pending(
        &self,
        deployment_type: DeploymentType,
    ) -> StorageResult<Vec<PersistedStatusRecord>> {
        self.store.pending(deployment_type).await
    }

    async fn deliver_pending(&self, deployment_type: DeploymentType) -> StorageResult<usize> {
        let pending = self.store.pending(deployment_type).await?;
        let Some(consumer) = self.consumer(deployment_type) else {
            if let Some(first) = pending.first() {
                METRICS.inc_statuses_retained();
                obs::emit_status_delivery_deferred(
                    &first.update.deployment_id,
                    first.seq,
                    "no consumer registered",
                );
            }
            return Ok(0);
        };

        let mut delivered = 0;
        for record in pending {
            if !consumer.accept(&details_map(&record)).await {
                METRICS.inc_statuses_retained();
                obs::emit_status_delivery_deferred(
                    &record.update.deployment_id,
                    record.seq,
                    "consumer rejected the record",
                );
                break;
            }
            self.store.remove(record.seq).await?;
            delivered += 1;
        }
        Ok(delivered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn details_map_nests_status_details() {
        let record = PersistedStatusRecord {
            seq: 4,
            update: StatusUpdate {
                deployment_id: "job-1".into(),
                deployment_type: DeploymentType::CloudJob,
                job_status: JobStatus::Failed,
                status_details: BTreeMap::from([(
                    DETAILED_STATUS_KEY.to_string(),
                    "FAILED_ROLLBACK_COMPLETE".to_string(),
                )]),
            },
            recorded_at: Utc::now(),
        };
        let details = details_map(&record);
        assert_eq!(details[DEPLOYMENT_ID_KEY], "job-1");
        assert_eq!(details[DEPLOYMENT_TYPE_KEY], "CLOUD_JOB");
        assert_eq!(details[DEPLOYMENT_STATUS_KEY], "FAILED");
        assert_eq!(
            details[DEPLOYMENT_STATUS_DETAILS_KEY][DETAILED_STATUS_KEY],
            "FAILED_ROLLBACK_COMPLETE"
        );
    }
}
