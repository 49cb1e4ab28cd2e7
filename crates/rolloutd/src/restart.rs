//! Restart handling: stop services, then exit with a code the supervisor
//! understands.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rollout_core::{RestartController, RestartReason};
use tracing::info;

use crate::script_runtime::ScriptRuntime;

/// Exit code asking the supervisor to start the daemon again.
pub const EXIT_RESTART: i32 = 100;
/// Exit code asking the supervisor to reboot the device.
pub const EXIT_REBOOT: i32 = 101;

pub fn exit_code(reason: RestartReason) -> i32 {
    match reason {
        RestartReason::RebootDevice => EXIT_REBOOT,
        RestartReason::Restart | RestartReason::ResumeRollback | RestartReason::ResumeBootstrap => {
            EXIT_RESTART
        }
    }
}

/// Stops every running service before the daemon exits.
pub struct ProcessRestartController {
    runtime: Arc<ScriptRuntime>,
}

impl ProcessRestartController {
    pub fn new(runtime: Arc<ScriptRuntime>) -> Self {
        Self { runtime }
    }
}

#[async_trait]
impl RestartController for ProcessRestartController {
    async fn shutdown(&self, timeout: Duration, reason: RestartReason) {
        info!(reason = %reason, exit_code = exit_code(reason), "stopping services for restart");
        self.runtime.stop_all(timeout).await;
    }
}
