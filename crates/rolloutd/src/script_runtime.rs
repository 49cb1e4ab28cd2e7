//! Shell-script lifecycle runtime used by the daemon.
//!
//! Each service runs its `install` step to completion, then keeps its `run`
//! step alive as a child process. `bootstrap` steps run on demand and only
//! report their exit code. Every state transition is published on one
//! broadcast feed.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use rollout_core::domain::{LifecycleError, StateChange};
use rollout_core::{LifecycleRuntime, ManagedService, ServiceConfig, ServiceState};
use tokio::process::Command;
use tokio::sync::{broadcast, oneshot, watch};
use tracing::{debug, info, warn};

const INSTALL_STEP: &str = "install";
const RUN_STEP: &str = "run";

#[derive(Debug, Clone, Copy)]
struct Status {
    state: ServiceState,
    mod_time: DateTime<Utc>,
    reached: bool,
}

impl Status {
    fn is_active(&self) -> bool {
        matches!(
            self.state,
            ServiceState::Starting | ServiceState::Running | ServiceState::Stopping
        )
    }
}

struct Shared {
    name: String,
    config: Mutex<ServiceConfig>,
    status: watch::Sender<Status>,
    /// Stops the lifecycle task currently driving the service
    stop: Mutex<Option<oneshot::Sender<()>>>,
    /// Set from a restart request until the new lifecycle starts
    restarting: AtomicBool,
    feed: broadcast::Sender<StateChange>,
    shell: String,
    work_dir: PathBuf,
}

impl Shared {
    fn transition(&self, state: ServiceState, reached: bool) {
        let at = Utc::now();
        let mut old = state;
        self.status.send_modify(|s| {
            old = s.state;
            *s = Status {
                state,
                mod_time: at,
                reached,
            };
        });
        debug!(service = %self.name, from = %old, to = %state, "service state changed");
        // nobody listening is fine
        let _ = self.feed.send(StateChange {
            service: self.name.clone(),
            old,
            new: state,
            at,
        });
    }

    fn config(&self) -> ServiceConfig {
        self.config
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn command(&self, script: &str) -> Command {
        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c")
            .arg(script)
            .current_dir(&self.work_dir)
            .env("SERVICE_NAME", &self.name)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        cmd
    }

    /// Install, then keep the run step alive until it exits or `stop` fires.
    async fn run_lifecycle(self: Arc<Self>, mut stop: oneshot::Receiver<()>) {
        let config = self.config();
        self.transition(ServiceState::Starting, false);
        self.restarting.store(false, Ordering::SeqCst);

        if let Some(script) = config.lifecycle.get(INSTALL_STEP) {
            let mut install = self.command(script);
            tokio::select! {
                status = install.status() => match status {
                    Ok(status) if status.success() => {}
                    Ok(status) => {
                        warn!(service = %self.name, code = ?status.code(), "install step failed");
                        self.transition(ServiceState::Broken, false);
                        return;
                    }
                    Err(e) => {
                        warn!(service = %self.name, error = %e, "install step could not start");
                        self.transition(ServiceState::Broken, false);
                        return;
                    }
                },
                _ = &mut stop => {
                    self.transition(ServiceState::Finished, true);
                    return;
                }
            }
        }
        self.transition(ServiceState::Installed, false);

        let Some(script) = config.lifecycle.get(RUN_STEP) else {
            self.transition(ServiceState::Finished, true);
            return;
        };
        let mut child = match self.command(script).spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(service = %self.name, error = %e, "run step could not start");
                self.transition(ServiceState::Broken, false);
                return;
            }
        };
        self.transition(ServiceState::Running, true);

        tokio::select! {
            status = child.wait() => match status {
                Ok(status) if status.success() => self.transition(ServiceState::Finished, true),
                Ok(status) => {
                    warn!(service = %self.name, code = ?status.code(), "run step exited");
                    self.transition(ServiceState::Broken, false);
                }
                Err(e) => {
                    warn!(service = %self.name, error = %e, "lost track of run step");
                    self.transition(ServiceState::Broken, false);
                }
            },
            _ = &mut stop => {
                self.transition(ServiceState::Stopping, false);
                if let Err(e) = child.kill().await {
                    warn!(service = %self.name, error = %e, "unable to kill run step");
                }
                self.transition(ServiceState::Finished, true);
            }
        }
    }
}

/// A service whose lifecycle steps are shell scripts.
#[derive(Clone)]
pub struct ScriptService(Arc<Shared>);

impl ScriptService {
    fn launch(&self) {
        let mut slot = self.0.stop.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|tx| !tx.is_closed()) {
            debug!(service = %self.0.name, "lifecycle already running");
            self.0.restarting.store(false, Ordering::SeqCst);
            return;
        }
        let (tx, rx) = oneshot::channel();
        *slot = Some(tx);
        tokio::spawn(Arc::clone(&self.0).run_lifecycle(rx));
    }

    /// Signal the lifecycle task; returns whether one was running.
    fn halt(&self) -> bool {
        let tx = self
            .0
            .stop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match tx {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }

    /// Resolves once the service is no longer starting, running or stopping.
    fn settled(&self) -> impl std::future::Future<Output = ()> + Send + 'static {
        let mut rx = self.0.status.subscribe();
        async move {
            let _ = rx.wait_for(|s| !s.is_active()).await;
        }
    }

    /// Relaunch in the background. Until the new lifecycle starts, the
    /// service does not report its desired state as reached.
    fn restart(&self) {
        self.0.restarting.store(true, Ordering::SeqCst);
        let service = self.clone();
        let stopped = self.halt();
        tokio::spawn(async move {
            if stopped {
                service.settled().await;
            }
            service.launch();
        });
    }
}

impl ManagedService for ScriptService {
    fn name(&self) -> &str {
        &self.0.name
    }

    fn state(&self) -> ServiceState {
        self.0.status.borrow().state
    }

    fn state_mod_time(&self) -> DateTime<Utc> {
        self.0.status.borrow().mod_time
    }

    fn reached_desired_state(&self) -> bool {
        self.0.status.borrow().reached && !self.0.restarting.load(Ordering::SeqCst)
    }

    fn is_builtin(&self) -> bool {
        false
    }

    fn should_auto_start(&self) -> bool {
        true
    }

    fn request_start(&self) {
        self.launch();
    }

    fn request_stop(&self) {
        if !self.halt() && self.0.status.borrow().state == ServiceState::New {
            self.0.transition(ServiceState::Finished, true);
        }
    }

    fn request_reinstall(&self) {
        self.restart();
    }

    fn request_update(&self, config: &ServiceConfig) {
        *self.0.config.lock().unwrap_or_else(PoisonError::into_inner) = config.clone();
        self.restart();
    }

    fn close(&self) -> BoxFuture<'static, Result<(), LifecycleError>> {
        self.request_stop();
        let settled = self.settled();
        async move {
            settled.await;
            Ok(())
        }
        .boxed()
    }
}

/// [`LifecycleRuntime`] that runs lifecycle steps with `sh -c`.
pub struct ScriptRuntime {
    work_dir: PathBuf,
    shell: String,
    feed: broadcast::Sender<StateChange>,
    services: Mutex<Vec<ScriptService>>,
}

impl ScriptRuntime {
    pub fn new(work_dir: impl AsRef<Path>) -> std::io::Result<Self> {
        let work_dir = work_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&work_dir)?;
        let (feed, _) = broadcast::channel(256);
        Ok(Self {
            work_dir,
            shell: "sh".to_string(),
            feed,
            services: Mutex::new(Vec::new()),
        })
    }

    /// Stop every loaded service, waiting at most `timeout` overall.
    pub async fn stop_all(&self, timeout: Duration) {
        let services = self
            .services
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let closing = futures::future::join_all(services.iter().map(|s| s.close()));
        if tokio::time::timeout(timeout, closing).await.is_err() {
            warn!(timeout = ?timeout, "services still running at shutdown");
        }
    }
}

#[async_trait]
impl LifecycleRuntime for ScriptRuntime {
    fn load_service(
        &self,
        name: &str,
        config: &ServiceConfig,
    ) -> Result<Arc<dyn ManagedService>, LifecycleError> {
        let (status, _) = watch::channel(Status {
            state: ServiceState::New,
            mod_time: Utc::now(),
            reached: false,
        });
        let service = ScriptService(Arc::new(Shared {
            name: name.to_string(),
            config: Mutex::new(config.clone()),
            status,
            stop: Mutex::new(None),
            restarting: AtomicBool::new(false),
            feed: self.feed.clone(),
            shell: self.shell.clone(),
            work_dir: self.work_dir.clone(),
        }));
        let mut services = self.services.lock().unwrap_or_else(PoisonError::into_inner);
        services.retain(|s| s.name() != name);
        services.push(service.clone());
        Ok(Arc::new(service))
    }

    async fn run_bootstrap(
        &self,
        name: &str,
        config: &ServiceConfig,
    ) -> Result<i32, LifecycleError> {
        let launch_failed = |reason: String| LifecycleError::BootstrapLaunch {
            service: name.to_string(),
            reason,
        };
        let script = config
            .bootstrap_step()
            .ok_or_else(|| launch_failed("no bootstrap step".to_string()))?;

        info!(service = %name, "running bootstrap step");
        let status = Command::new(&self.shell)
            .arg("-c")
            .arg(script)
            .current_dir(&self.work_dir)
            .env("SERVICE_NAME", name)
            .stdin(Stdio::null())
            .status()
            .await
            .map_err(|e| launch_failed(e.to_string()))?;
        // killed by a signal
        Ok(status.code().unwrap_or(-1))
    }

    fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.feed.subscribe()
    }
}
