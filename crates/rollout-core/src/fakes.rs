//! In-memory fakes for the collaborator traits (testing only)
//!
//! Provides `FakeService`, `FakeRuntime`, `RecordingRestartController` and
//! `FakeJobSource`. They record every request so tests can assert on the
//! exact lifecycle calls a deployment made.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use rollout_state::JobStatus;
use tokio::sync::{broadcast, oneshot};

use crate::domain::{
    JobSourceError, LifecycleError, ManagedService, ServiceConfig, ServiceState, StateChange,
};
use crate::runtime::{JobSource, LifecycleRuntime, RestartController, RestartReason};
use crate::status_ledger::StatusDetails;

// ---------------------------------------------------------------------------
// FakeService
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct FakeState {
    state: ServiceState,
    mod_time: DateTime<Utc>,
    reached: bool,
    /// State entered whenever start/update/reinstall is requested
    respond_with: Option<ServiceState>,
}

/// Completes a close that was gated with [`FakeService::gate_close`].
#[derive(Debug)]
pub struct CloseTrigger(oneshot::Sender<Result<(), String>>);

impl CloseTrigger {
    pub fn complete(self) {
        let _ = self.0.send(Ok(()));
    }

    pub fn fail(self, reason: impl Into<String>) {
        let _ = self.0.send(Err(reason.into()));
    }
}

/// Scriptable [`ManagedService`].
#[derive(Debug)]
pub struct FakeService {
    name: String,
    builtin: bool,
    auto_start: AtomicBool,
    inner: Mutex<FakeState>,
    starts: AtomicUsize,
    stops: AtomicUsize,
    reinstalls: AtomicUsize,
    updates: AtomicUsize,
    closes: AtomicUsize,
    close_gate: Mutex<Option<oneshot::Receiver<Result<(), String>>>>,
    feed: Mutex<Option<broadcast::Sender<StateChange>>>,
}

impl FakeService {
    fn build(name: &str, builtin: bool, state: ServiceState, reached: bool) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            builtin,
            auto_start: AtomicBool::new(true),
            inner: Mutex::new(FakeState {
                state,
                mod_time: DateTime::<Utc>::default(),
                reached,
                respond_with: Some(ServiceState::Running),
            }),
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
            reinstalls: AtomicUsize::new(0),
            updates: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            close_gate: Mutex::new(None),
            feed: Mutex::new(None),
        })
    }

    /// A running, auto-start service whose last transition is long past.
    pub fn new(name: &str) -> Arc<Self> {
        Self::build(name, false, ServiceState::Running, true)
    }

    pub fn builtin(name: &str) -> Arc<Self> {
        Self::build(name, true, ServiceState::Running, true)
    }

    /// A freshly loaded service that has not been started.
    pub fn fresh(name: &str) -> Arc<Self> {
        Self::build(name, false, ServiceState::New, false)
    }

    pub fn set_auto_start(&self, auto_start: bool) {
        self.auto_start.store(auto_start, Ordering::SeqCst);
    }

    /// Transition now. Running and finished count as having reached the desired state.
    pub fn set_state(&self, state: ServiceState) {
        self.set_state_at(state, Utc::now());
    }

    pub fn set_state_at(&self, state: ServiceState, at: DateTime<Utc>) {
        let old = {
            let mut inner = self.inner.lock().unwrap();
            let old = inner.state;
            inner.state = state;
            inner.mod_time = at;
            inner.reached = matches!(state, ServiceState::Running | ServiceState::Finished);
            old
        };
        if let Some(feed) = self.feed.lock().unwrap().as_ref() {
            let _ = feed.send(StateChange {
                service: self.name.clone(),
                old,
                new: state,
                at,
            });
        }
    }

    pub fn set_reached(&self, reached: bool) {
        self.inner.lock().unwrap().reached = reached;
    }

    /// State entered on every start/update/reinstall request; `None` keeps the state.
    pub fn respond_with(&self, state: Option<ServiceState>) {
        self.inner.lock().unwrap().respond_with = state;
    }

    /// Make the next `close` pend until the returned trigger fires.
    pub fn gate_close(&self) -> CloseTrigger {
        let (tx, rx) = oneshot::channel();
        *self.close_gate.lock().unwrap() = Some(rx);
        CloseTrigger(tx)
    }

    pub fn attach(&self, feed: broadcast::Sender<StateChange>) {
        *self.feed.lock().unwrap() = Some(feed);
    }

    fn respond(&self) {
        let next = self.inner.lock().unwrap().respond_with;
        if let Some(state) = next {
            self.set_state(state);
        }
    }

    pub fn start_requests(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stop_requests(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn reinstall_requests(&self) -> usize {
        self.reinstalls.load(Ordering::SeqCst)
    }

    pub fn update_requests(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }

    pub fn close_requests(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

impl ManagedService for FakeService {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> ServiceState {
        self.inner.lock().unwrap().state
    }

    fn state_mod_time(&self) -> DateTime<Utc> {
        self.inner.lock().unwrap().mod_time
    }

    fn reached_desired_state(&self) -> bool {
        self.inner.lock().unwrap().reached
    }

    fn is_builtin(&self) -> bool {
        self.builtin
    }

    fn should_auto_start(&self) -> bool {
        self.auto_start.load(Ordering::SeqCst)
    }

    fn request_start(&self) {
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.respond();
    }

    fn request_stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.set_state(ServiceState::Finished);
    }

    fn request_reinstall(&self) {
        self.reinstalls.fetch_add(1, Ordering::SeqCst);
        self.respond();
    }

    fn request_update(&self, _config: &ServiceConfig) {
        self.updates.fetch_add(1, Ordering::SeqCst);
        self.respond();
    }

    fn close(&self) -> BoxFuture<'static, Result<(), LifecycleError>> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        let gate = self.close_gate.lock().unwrap().take();
        let service = self.name.clone();
        match gate {
            None => futures::future::ready(Ok(())).boxed(),
            Some(rx) => async move {
                match rx.await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(reason)) => Err(LifecycleError::CloseFailed { service, reason }),
                    Err(_) => Err(LifecycleError::CloseFailed {
                        service,
                        reason: "close abandoned".to_string(),
                    }),
                }
            }
            .boxed(),
        }
    }
}

// ---------------------------------------------------------------------------
// FakeRuntime
// ---------------------------------------------------------------------------

/// Scriptable [`LifecycleRuntime`].
#[derive(Debug)]
pub struct FakeRuntime {
    prepared: Mutex<HashMap<String, Arc<FakeService>>>,
    loaded: Mutex<Vec<String>>,
    bootstrap_codes: Mutex<HashMap<String, VecDeque<i32>>>,
    bootstrap_calls: Mutex<Vec<String>>,
    feed: broadcast::Sender<StateChange>,
}

impl Default for FakeRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeRuntime {
    pub fn new() -> Self {
        let (feed, _) = broadcast::channel(64);
        Self {
            prepared: Mutex::new(HashMap::new()),
            loaded: Mutex::new(Vec::new()),
            bootstrap_codes: Mutex::new(HashMap::new()),
            bootstrap_calls: Mutex::new(Vec::new()),
            feed,
        }
    }

    /// Hand out `service` when its name is loaded, and wire it to the feed.
    pub fn prepare(&self, service: Arc<FakeService>) -> Arc<FakeService> {
        service.attach(self.feed.clone());
        self.prepared
            .lock()
            .unwrap()
            .insert(service.name().to_string(), Arc::clone(&service));
        service
    }

    /// Exit codes returned by successive bootstrap runs of `name`.
    pub fn script_bootstrap(&self, name: &str, codes: impl IntoIterator<Item = i32>) {
        self.bootstrap_codes
            .lock()
            .unwrap()
            .insert(name.to_string(), codes.into_iter().collect());
    }

    pub fn bootstrap_calls(&self) -> Vec<String> {
        self.bootstrap_calls.lock().unwrap().clone()
    }

    /// Names passed to `load_service`, in order.
    pub fn loaded(&self) -> Vec<String> {
        self.loaded.lock().unwrap().clone()
    }

    pub fn service(&self, name: &str) -> Option<Arc<FakeService>> {
        self.prepared.lock().unwrap().get(name).cloned()
    }
}

#[async_trait]
impl LifecycleRuntime for FakeRuntime {
    fn load_service(
        &self,
        name: &str,
        _config: &ServiceConfig,
    ) -> Result<Arc<dyn ManagedService>, LifecycleError> {
        self.loaded.lock().unwrap().push(name.to_string());
        let existing = self.prepared.lock().unwrap().get(name).cloned();
        let service = match existing {
            Some(s) => s,
            None => self.prepare(FakeService::fresh(name)),
        };
        Ok(service)
    }

    async fn run_bootstrap(
        &self,
        name: &str,
        _config: &ServiceConfig,
    ) -> Result<i32, LifecycleError> {
        self.bootstrap_calls.lock().unwrap().push(name.to_string());
        let code = self
            .bootstrap_codes
            .lock()
            .unwrap()
            .get_mut(name)
            .and_then(VecDeque::pop_front)
            .unwrap_or(0);
        Ok(code)
    }

    fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.feed.subscribe()
    }
}

// ---------------------------------------------------------------------------
// RecordingRestartController
// ---------------------------------------------------------------------------

/// [`RestartController`] that records requests instead of exiting.
#[derive(Debug, Default)]
pub struct RecordingRestartController {
    requests: Mutex<Vec<(Duration, RestartReason)>>,
}

impl RecordingRestartController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requests(&self) -> Vec<(Duration, RestartReason)> {
        self.requests.lock().unwrap().clone()
    }

    pub fn reasons(&self) -> Vec<RestartReason> {
        self.requests().into_iter().map(|(_, r)| r).collect()
    }
}

#[async_trait]
impl RestartController for RecordingRestartController {
    async fn shutdown(&self, timeout: Duration, reason: RestartReason) {
        self.requests.lock().unwrap().push((timeout, reason));
    }
}

// ---------------------------------------------------------------------------
// FakeJobSource
// ---------------------------------------------------------------------------

/// [`JobSource`] that records describes and status updates.
#[derive(Debug)]
pub struct FakeJobSource {
    described: Mutex<Vec<String>>,
    updates: Mutex<Vec<(String, JobStatus)>>,
    available: AtomicBool,
}

impl Default for FakeJobSource {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeJobSource {
    pub fn new() -> Self {
        Self {
            described: Mutex::new(Vec::new()),
            updates: Mutex::new(Vec::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate a dropped connection: every call fails while unavailable.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn described(&self) -> Vec<String> {
        self.described.lock().unwrap().clone()
    }

    pub fn updates(&self) -> Vec<(String, JobStatus)> {
        self.updates.lock().unwrap().clone()
    }

    fn check(&self) -> Result<(), JobSourceError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(JobSourceError::Unavailable("connection interrupted".to_string()))
        }
    }
}

#[async_trait]
impl JobSource for FakeJobSource {
    async fn describe(&self, job_id: &str) -> Result<(), JobSourceError> {
        self.check()?;
        self.described.lock().unwrap().push(job_id.to_string());
        Ok(())
    }

    async fn update_status(
        &self,
        job_id: &str,
        status: JobStatus,
        _details: &StatusDetails,
    ) -> Result<(), JobSourceError> {
        self.check()?;
        self.updates
            .lock()
            .unwrap()
            .push((job_id.to_string(), status));
        Ok(())
    }
}
