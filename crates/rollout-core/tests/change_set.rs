use std::sync::Arc;
use std::time::Duration;

use rollout_core::fakes::{FakeRuntime, FakeService};
use rollout_core::{ChangeSet, ServiceConfig, ServiceGraph, ServiceState, TargetConfig};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn graph_of(runtime: &FakeRuntime, names: &[&str]) -> (ServiceGraph, Vec<Arc<FakeService>>) {
    let mut graph = ServiceGraph::new();
    let mut handles = Vec::new();
    for name in names {
        let service = runtime.prepare(FakeService::new(name));
        graph
            .register(service.clone(), &ServiceConfig::new("1.0.0"))
            .expect("register");
        handles.push(service);
    }
    (graph, handles)
}

// ---------------------------------------------------------------------------
// compute against a live graph
// ---------------------------------------------------------------------------

#[test]
fn compute_reads_graph_membership() {
    let runtime = FakeRuntime::new();
    let (graph, _) = graph_of(&runtime, &["kept", "dropped"]);
    let target = TargetConfig::new()
        .with_service("kept", ServiceConfig::new("2.0.0"))
        .with_service("added", ServiceConfig::new("1.0.0"));

    let changes = ChangeSet::compute(&graph, &target);
    assert_eq!(changes.to_add, vec!["added"]);
    assert_eq!(changes.to_remove, vec!["dropped"]);
    assert_eq!(changes.to_update, vec!["kept"]);
}

#[test]
fn broken_updates_are_reinstalled_and_new_services_started() {
    let runtime = FakeRuntime::new();
    let (mut graph, handles) = graph_of(&runtime, &["steady", "broken"]);
    handles[1].set_state(ServiceState::Broken);
    let fresh = runtime.prepare(FakeService::fresh("fresh"));
    let idle = runtime.prepare(FakeService::fresh("idle"));
    idle.set_auto_start(false);
    graph.register(fresh.clone(), &ServiceConfig::new("1.0.0")).unwrap();
    graph.register(idle.clone(), &ServiceConfig::new("1.0.0")).unwrap();

    let changes = ChangeSet::from_names(["steady", "broken"], ["steady", "broken", "fresh", "idle"]);
    changes.start_new_services(&graph);
    changes.reinstall_broken_services(&graph);

    assert_eq!(fresh.start_requests(), 1);
    assert_eq!(idle.start_requests(), 0);
    assert_eq!(handles[0].reinstall_requests(), 0);
    assert_eq!(handles[1].reinstall_requests(), 1);

    let tracked: Vec<String> = changes
        .services_to_track(&graph)
        .iter()
        .map(|s| s.name().to_string())
        .collect();
    assert_eq!(tracked, vec!["fresh", "steady", "broken"]);
}

// ---------------------------------------------------------------------------
// remove_obsolete_services
// ---------------------------------------------------------------------------

#[tokio::test]
async fn removal_waits_for_close_before_deregistering() {
    let runtime = FakeRuntime::new();
    let (mut graph, handles) = graph_of(&runtime, &["old", "stay"]);
    let trigger = handles[0].gate_close();
    let changes = ChangeSet::from_names(["old", "stay"], ["stay"]);

    let removed = {
        let removal = changes.remove_obsolete_services(&mut graph, None);
        tokio::pin!(removal);
        let early = tokio::time::timeout(Duration::from_millis(50), &mut removal).await;
        assert!(early.is_err(), "removal finished before close completed");
        assert_eq!(handles[0].close_requests(), 1);
        trigger.complete();
        removal.await
    };

    assert_eq!(removed, vec!["old"]);
    assert!(!graph.contains("old"));
    assert!(graph.node("old").is_none());
    assert!(graph.contains("stay"));
}

#[tokio::test]
async fn builtins_are_never_closed() {
    let runtime = FakeRuntime::new();
    let (mut graph, handles) = graph_of(&runtime, &["plugin"]);
    let main = FakeService::builtin("main");
    graph.register_builtin(main.clone());

    let changes = ChangeSet::from_names(["main", "plugin"], Vec::<&str>::new());
    let removed = changes.remove_obsolete_services(&mut graph, None).await;

    assert_eq!(removed, vec!["plugin"]);
    assert_eq!(handles[0].close_requests(), 1);
    assert_eq!(main.close_requests(), 0);
    assert!(graph.contains("main"));
}

#[tokio::test]
async fn failed_close_still_deregisters() {
    let runtime = FakeRuntime::new();
    let (mut graph, handles) = graph_of(&runtime, &["flaky"]);
    handles[0].gate_close().fail("shutdown script exited 1");

    let changes = ChangeSet::from_names(["flaky"], Vec::<&str>::new());
    let removed = changes.remove_obsolete_services(&mut graph, None).await;

    assert_eq!(removed, vec!["flaky"]);
    assert!(graph.is_empty());
}

#[tokio::test]
async fn close_timeout_bounds_the_wait() {
    let runtime = FakeRuntime::new();
    let (mut graph, handles) = graph_of(&runtime, &["stuck"]);
    let _trigger = handles[0].gate_close();

    let changes = ChangeSet::from_names(["stuck"], Vec::<&str>::new());
    let removed = tokio::time::timeout(
        Duration::from_secs(2),
        changes.remove_obsolete_services(&mut graph, Some(Duration::from_millis(20))),
    )
    .await
    .expect("close timeout not applied");

    assert_eq!(removed, vec!["stuck"]);
    assert!(!graph.contains("stuck"));
}
