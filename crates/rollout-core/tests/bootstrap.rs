use std::sync::Arc;

use rollout_core::domain::{BootstrapError, Dependency};
use rollout_core::fakes::FakeRuntime;
use rollout_core::{
    BootstrapSequencer, ServiceConfig, ServiceGraph, TargetConfig, BOOTSTRAP_NO_OP,
    REQUEST_REBOOT, REQUEST_RESTART,
};
use rollout_state::fakes::MemoryResumeStore;
use rollout_state::{ExecutionStatus, ResumeStore};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// `agent` bootstraps after `driver`; `web` has no bootstrap step.
fn target() -> TargetConfig {
    TargetConfig::new()
        .with_service(
            "agent",
            ServiceConfig::new("2.0.0")
                .with_dependency(Dependency::hard("driver"))
                .with_bootstrap("./install-agent.sh"),
        )
        .with_service(
            "driver",
            ServiceConfig::new("1.4.0").with_bootstrap("./load-driver.sh"),
        )
        .with_service("web", ServiceConfig::new("1.0.0"))
}

fn sequencer(store: &Arc<MemoryResumeStore>, runtime: &Arc<FakeRuntime>) -> BootstrapSequencer {
    BootstrapSequencer::new(store.clone(), runtime.clone())
}

// ---------------------------------------------------------------------------
// Planning and persistence
// ---------------------------------------------------------------------------

#[tokio::test]
async fn plan_is_persisted_before_any_step_runs() {
    let store = Arc::new(MemoryResumeStore::new());
    let runtime = Arc::new(FakeRuntime::new());
    let mut seq = sequencer(&store, &runtime);

    let plan: Vec<String> = seq
        .prepare(&ServiceGraph::new(), &target())
        .await
        .expect("prepare")
        .iter()
        .map(|t| t.service_name.clone())
        .collect();
    assert_eq!(plan, vec!["driver", "agent"]);

    let history = store.task_history();
    assert_eq!(history.len(), 1);
    assert!(history[0].iter().all(|t| t.execution_status == ExecutionStatus::Pending));
    assert!(runtime.bootstrap_calls().is_empty());
}

#[tokio::test]
async fn every_finished_task_is_persisted() {
    let store = Arc::new(MemoryResumeStore::new());
    let runtime = Arc::new(FakeRuntime::new());
    let mut seq = sequencer(&store, &runtime);
    let target = target();

    seq.prepare(&ServiceGraph::new(), &target).await.unwrap();
    let code = seq.run_pending(&target).await.unwrap();

    assert_eq!(code, BOOTSTRAP_NO_OP);
    assert!(!seq.has_next());
    assert_eq!(runtime.bootstrap_calls(), vec!["driver", "agent"]);
    // initial plan plus one save per task
    assert_eq!(store.task_history().len(), 3);
    assert_eq!(seq.last_exit_code(), Some(0));
}

// ---------------------------------------------------------------------------
// Restart and reboot requests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn reboot_request_resumes_at_next_pending_task() {
    let store = Arc::new(MemoryResumeStore::new());
    let runtime = Arc::new(FakeRuntime::new());
    runtime.script_bootstrap("driver", [REQUEST_REBOOT]);
    let target = target();

    let mut before = sequencer(&store, &runtime);
    before.prepare(&ServiceGraph::new(), &target).await.unwrap();
    assert_eq!(before.run_pending(&target).await.unwrap(), REQUEST_REBOOT);
    assert!(before.has_next());

    // after the reboot a new sequencer picks the plan up from the store
    let mut after = sequencer(&store, &runtime);
    assert!(after.load().await.unwrap());
    assert_eq!(after.run_pending(&target).await.unwrap(), BOOTSTRAP_NO_OP);

    assert_eq!(runtime.bootstrap_calls(), vec!["driver", "agent"]);
    let codes: Vec<Option<i32>> = after.tasks().iter().map(|t| t.exit_code).collect();
    assert_eq!(codes, vec![Some(REQUEST_REBOOT), Some(0)]);
}

#[tokio::test]
async fn last_task_requesting_restart_leaves_nothing_pending() {
    let store = Arc::new(MemoryResumeStore::new());
    let runtime = Arc::new(FakeRuntime::new());
    runtime.script_bootstrap("agent", [REQUEST_RESTART]);
    let target = target();

    let mut seq = sequencer(&store, &runtime);
    seq.prepare(&ServiceGraph::new(), &target).await.unwrap();
    assert_eq!(seq.run_pending(&target).await.unwrap(), REQUEST_RESTART);
    assert!(!seq.has_next());
    assert_eq!(seq.last_exit_code(), Some(REQUEST_RESTART));
}

#[tokio::test]
async fn prepare_keeps_a_partially_run_plan() {
    let store = Arc::new(MemoryResumeStore::new());
    let runtime = Arc::new(FakeRuntime::new());
    runtime.script_bootstrap("driver", [REQUEST_RESTART]);
    let target = target();

    let mut seq = sequencer(&store, &runtime);
    seq.prepare(&ServiceGraph::new(), &target).await.unwrap();
    seq.run_pending(&target).await.unwrap();

    // a different target would plan only `driver`; the persisted plan wins
    let narrower = TargetConfig::new().with_service(
        "driver",
        ServiceConfig::new("1.5.0").with_bootstrap("./load-driver.sh"),
    );
    let mut resumed = sequencer(&store, &runtime);
    let tasks = resumed.prepare(&ServiceGraph::new(), &narrower).await.unwrap();
    assert_eq!(tasks.len(), 2);
    assert_eq!(tasks[0].execution_status, ExecutionStatus::Done);
    assert!(tasks[1].is_pending());
}

// ---------------------------------------------------------------------------
// Failures
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unexpected_exit_code_aborts_the_plan() {
    let store = Arc::new(MemoryResumeStore::new());
    let runtime = Arc::new(FakeRuntime::new());
    runtime.script_bootstrap("driver", [3]);
    let target = target();

    let mut seq = sequencer(&store, &runtime);
    seq.prepare(&ServiceGraph::new(), &target).await.unwrap();
    let err = seq.run_pending(&target).await.unwrap_err();

    assert!(matches!(
        &err,
        BootstrapError::TaskFailed { service, exit_code: 3 } if service == "driver"
    ));
    assert_eq!(
        err.to_string(),
        "Fail to execute bootstrap step for driver, exit code: 3"
    );
    assert_eq!(runtime.bootstrap_calls(), vec!["driver"]);
}

#[tokio::test]
async fn clear_drops_the_persisted_plan() {
    let store = Arc::new(MemoryResumeStore::new());
    let runtime = Arc::new(FakeRuntime::new());
    let mut seq = sequencer(&store, &runtime);
    seq.prepare(&ServiceGraph::new(), &target()).await.unwrap();

    seq.clear().await.unwrap();
    assert!(seq.tasks().is_empty());
    assert!(store.load_bootstrap_tasks().await.unwrap().is_empty());
}
