use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rollout_core::status_ledger::{
    FnConsumer, DEPLOYMENT_ID_KEY, DEPLOYMENT_STATUS_DETAILS_KEY, DEPLOYMENT_STATUS_KEY,
    DETAILED_STATUS_KEY,
};
use rollout_core::{DeploymentStatusLedger, StatusConsumer, StatusDetails};
use rollout_state::fakes::MemoryStatusStore;
use rollout_state::{DeploymentType, JobStatus};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Records accepted deployment ids; rejects everything while closed.
#[derive(Default)]
struct Recorder {
    closed: AtomicBool,
    seen: Mutex<Vec<(String, String)>>,
}

impl Recorder {
    fn seen(&self) -> Vec<(String, String)> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl StatusConsumer for Recorder {
    async fn accept(&self, details: &StatusDetails) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        self.seen.lock().unwrap().push((
            details[DEPLOYMENT_ID_KEY].as_str().unwrap().to_string(),
            details[DEPLOYMENT_STATUS_KEY].as_str().unwrap().to_string(),
        ));
        true
    }
}

fn ledger() -> (DeploymentStatusLedger, Arc<MemoryStatusStore>) {
    let store = Arc::new(MemoryStatusStore::new());
    (DeploymentStatusLedger::new(store.clone()), store)
}

async fn publish(ledger: &DeploymentStatusLedger, id: &str, status: JobStatus) {
    ledger
        .publish(id, DeploymentType::CloudJob, status, BTreeMap::new())
        .await
        .expect("publish");
}

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

#[tokio::test]
async fn second_consumer_for_a_type_is_refused() {
    let (ledger, _) = ledger();
    let first = Arc::new(Recorder::default());
    assert!(ledger.register(DeploymentType::CloudJob, first.clone()));
    assert!(!ledger.register(DeploymentType::CloudJob, Arc::new(Recorder::default())));
    assert!(ledger.register(DeploymentType::LocalRequest, Arc::new(Recorder::default())));

    publish(&ledger, "job-1", JobStatus::InProgress).await;
    assert_eq!(first.seen().len(), 1);
}

// ---------------------------------------------------------------------------
// Delivery and retention
// ---------------------------------------------------------------------------

#[tokio::test]
async fn accepted_records_are_removed() {
    let (ledger, store) = ledger();
    let consumer = Arc::new(Recorder::default());
    ledger.register(DeploymentType::CloudJob, consumer.clone());

    publish(&ledger, "job-1", JobStatus::InProgress).await;
    publish(&ledger, "job-1", JobStatus::Succeeded).await;

    assert_eq!(
        consumer.seen(),
        vec![
            ("job-1".to_string(), "IN_PROGRESS".to_string()),
            ("job-1".to_string(), "SUCCEEDED".to_string()),
        ]
    );
    assert!(store.is_empty());
}

#[tokio::test]
async fn rejected_record_stays_until_republished() {
    let (ledger, store) = ledger();
    let consumer = Arc::new(Recorder::default());
    consumer.closed.store(true, Ordering::SeqCst);
    ledger.register(DeploymentType::CloudJob, consumer.clone());

    publish(&ledger, "job-1", JobStatus::Failed).await;
    assert_eq!(store.len(), 1);
    assert!(consumer.seen().is_empty());

    consumer.closed.store(false, Ordering::SeqCst);
    let delivered = ledger
        .republish_pending(DeploymentType::CloudJob)
        .await
        .unwrap();
    assert_eq!(delivered, 1);
    assert!(store.is_empty());
    assert_eq!(consumer.seen()[0].1, "FAILED");
}

#[tokio::test]
async fn delivery_stops_at_the_first_rejection() {
    let (ledger, store) = ledger();
    let calls = Arc::new(Mutex::new(Vec::<String>::new()));
    let consumer = {
        let calls = calls.clone();
        FnConsumer(move |details: &StatusDetails| {
            let id = details[DEPLOYMENT_ID_KEY].as_str().unwrap().to_string();
            calls.lock().unwrap().push(id.clone());
            id != "job-2"
        })
    };

    // persisted while nobody listens
    publish(&ledger, "job-1", JobStatus::Succeeded).await;
    publish(&ledger, "job-2", JobStatus::Succeeded).await;
    publish(&ledger, "job-3", JobStatus::Succeeded).await;
    assert_eq!(store.len(), 3);

    ledger.register(DeploymentType::CloudJob, Arc::new(consumer));
    let delivered = ledger
        .republish_pending(DeploymentType::CloudJob)
        .await
        .unwrap();

    assert_eq!(delivered, 1);
    assert_eq!(*calls.lock().unwrap(), vec!["job-1", "job-2"]);
    let remaining: Vec<String> = ledger
        .pending(DeploymentType::CloudJob)
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.update.deployment_id)
        .collect();
    assert_eq!(remaining, vec!["job-2", "job-3"]);
}

#[tokio::test]
async fn types_are_delivered_independently() {
    let (ledger, store) = ledger();
    let local = Arc::new(Recorder::default());
    ledger.register(DeploymentType::LocalRequest, local.clone());

    publish(&ledger, "job-1", JobStatus::InProgress).await;
    ledger
        .publish(
            "local-1",
            DeploymentType::LocalRequest,
            JobStatus::InProgress,
            BTreeMap::new(),
        )
        .await
        .unwrap();

    assert_eq!(local.seen(), vec![("local-1".to_string(), "IN_PROGRESS".to_string())]);
    assert_eq!(store.len(), 1);
}

#[tokio::test]
async fn consumers_see_nested_status_details() {
    let (ledger, _) = ledger();
    let captured = Arc::new(Mutex::new(None));
    let consumer = {
        let captured = captured.clone();
        FnConsumer(move |details: &StatusDetails| {
            *captured.lock().unwrap() = Some(details.clone());
            true
        })
    };
    ledger.register(DeploymentType::CloudJob, Arc::new(consumer));

    ledger
        .publish(
            "job-9",
            DeploymentType::CloudJob,
            JobStatus::Failed,
            BTreeMap::from([(
                DETAILED_STATUS_KEY.to_string(),
                "FAILED_NO_STATE_CHANGE".to_string(),
            )]),
        )
        .await
        .unwrap();

    let details = captured.lock().unwrap().clone().unwrap();
    assert_eq!(
        details[DEPLOYMENT_STATUS_DETAILS_KEY][DETAILED_STATUS_KEY],
        "FAILED_NO_STATE_CHANGE"
    );
}
