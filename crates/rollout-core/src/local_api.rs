//! Local deployment requests: submit, cancel and status lookup.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use rollout_state::{Deployment, DeploymentType};
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::domain::{Result, RolloutError};
use crate::queue::DeploymentQueue;
use crate::status_ledger::{StatusConsumer, StatusDetails, DEPLOYMENT_ID_KEY};

/// Latest status details of every local deployment seen this run.
#[derive(Debug, Default)]
pub struct LocalStatusBoard {
    latest: Mutex<BTreeMap<String, StatusDetails>>,
}

impl LocalStatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, deployment_id: &str) -> Option<StatusDetails> {
        self.latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(deployment_id)
            .cloned()
    }

    pub fn all(&self) -> BTreeMap<String, StatusDetails> {
        self.latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl StatusConsumer for LocalStatusBoard {
    async fn accept(&self, details: &StatusDetails) -> bool {
        let Some(id) = details.get(DEPLOYMENT_ID_KEY).and_then(Value::as_str) else {
            return false;
        };
        self.latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.to_string(), details.clone());
        true
    }
}

pub struct LocalDeploymentApi {
    queue: Arc<DeploymentQueue>,
    board: Arc<LocalStatusBoard>,
}

impl LocalDeploymentApi {
    pub fn new(queue: Arc<DeploymentQueue>, board: Arc<LocalStatusBoard>) -> Self {
        Self { queue, board }
    }

    /// Queue a local deployment document and return its generated id.
    pub fn submit(&self, document: &str) -> Result<String> {
        let parsed: Value = serde_json::from_str(document)?;
        if !parsed.is_object() {
            return Err(RolloutError::InvalidDeployment(
                "deployment document must be a JSON object".to_string(),
            ));
        }
        let id = Uuid::new_v4().to_string();
        if !self
            .queue
            .offer(Deployment::new(&id, DeploymentType::LocalRequest, document))
        {
            return Err(RolloutError::InvalidDeployment(format!(
                "deployment {id} was not accepted"
            )));
        }
        info!(deployment_id = %id, "local deployment submitted");
        Ok(id)
    }

    /// Ask to cancel local deployment `deployment_id`.
    ///
    /// A queued deployment is replaced by the cancellation; a running one is
    /// interrupted if it has not reached a restart-surviving stage.
    pub fn cancel(&self, deployment_id: &str) -> bool {
        self.queue.offer(Deployment::cancellation(
            deployment_id,
            DeploymentType::LocalRequest,
        ))
    }

    pub fn status(&self, deployment_id: &str) -> Option<StatusDetails> {
        self.board.get(deployment_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollout_state::DeploymentStage;

    fn api() -> (LocalDeploymentApi, Arc<DeploymentQueue>) {
        let queue = Arc::new(DeploymentQueue::new());
        (
            LocalDeploymentApi::new(queue.clone(), Arc::new(LocalStatusBoard::new())),
            queue,
        )
    }

    #[test]
    fn submit_queues_with_a_fresh_id() {
        let (api, queue) = api();
        let a = api.submit(r#"{"services":{}}"#).unwrap();
        let b = api.submit(r#"{"services":{}}"#).unwrap();
        assert_ne!(a, b);
        let queued = queue.snapshot();
        assert_eq!(queued.len(), 2);
        assert_eq!(queued[0].deployment_type, DeploymentType::LocalRequest);
        assert_eq!(queued[0].stage, DeploymentStage::Default);
    }

    #[test]
    fn submit_rejects_non_objects() {
        let (api, queue) = api();
        assert!(api.submit("not json").is_err());
        assert!(api.submit("[1, 2]").is_err());
        assert!(queue.is_empty());
    }

    #[test]
    fn cancel_replaces_the_queued_request() {
        let (api, queue) = api();
        let id = api.submit("{}").unwrap();
        assert!(api.cancel(&id));
        assert!(queue.snapshot()[0].is_cancelled);
    }

    #[tokio::test]
    async fn board_keeps_the_latest_status() {
        let board = LocalStatusBoard::new();
        let mut details = StatusDetails::new();
        details.insert(DEPLOYMENT_ID_KEY.into(), "d1".into());
        details.insert("DeploymentStatus".into(), "IN_PROGRESS".into());
        assert!(board.accept(&details).await);
        details.insert("DeploymentStatus".into(), "SUCCEEDED".into());
        assert!(board.accept(&details).await);
        assert_eq!(board.get("d1").unwrap()["DeploymentStatus"], "SUCCEEDED");
        assert!(!board.accept(&StatusDetails::new()).await);
    }
}
