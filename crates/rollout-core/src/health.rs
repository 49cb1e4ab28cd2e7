//! Bounded wait for tracked services to reach their desired state.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::cancel::CancelSignal;
use crate::domain::{HealthError, ManagedService, ServiceState, StateChange};

/// Poll-based health watch with a fail-fast rule for fresh breakage.
///
/// Every round checks the live state of each tracked service. A service
/// that is `BROKEN` with a transition newer than `since` fails the wait
/// immediately; older breakage is ignored. The optional state-change feed
/// only shortens the sleep between rounds.
#[derive(Debug, Clone, Copy)]
pub struct HealthWatch {
    pub poll_interval: Duration,
    pub timeout: Duration,
}

impl HealthWatch {
    pub fn new(poll_interval: Duration, timeout: Duration) -> Self {
        Self {
            poll_interval,
            timeout,
        }
    }

    pub async fn wait_for_desired_state(
        &self,
        services: &[Arc<dyn ManagedService>],
        since: DateTime<Utc>,
        mut changes: Option<broadcast::Receiver<StateChange>>,
        cancel: &CancelSignal,
    ) -> Result<(), HealthError> {
        let started = Instant::now();
        // None when the timeout is too large to represent: wait indefinitely
        let deadline = started.checked_add(self.timeout);

        loop {
            if let Some(broken) = services
                .iter()
                .find(|s| s.state() == ServiceState::Broken && s.state_mod_time() > since)
            {
                return Err(HealthError::Broken {
                    service: broken.name().to_string(),
                });
            }

            let pending: Vec<String> = services
                .iter()
                .filter(|s| !is_settled(s.as_ref()))
                .map(|s| s.name().to_string())
                .collect();
            if pending.is_empty() {
                debug!(tracked = services.len(), "tracked services reached desired state");
                return Ok(());
            }

            let now = Instant::now();
            if deadline.is_some_and(|deadline| now >= deadline) {
                return Err(HealthError::TimedOut {
                    waited: now - started,
                    pending,
                });
            }
            trace!(?pending, "waiting for services");

            let nap = deadline.map_or(self.poll_interval, |deadline| {
                self.poll_interval.min(deadline - now)
            });
            let mut feed_closed = false;
            match changes.as_mut() {
                Some(feed) => {
                    tokio::select! {
                        _ = tokio::time::sleep(nap) => {}
                        received = feed.recv() => {
                            feed_closed = matches!(received, Err(RecvError::Closed));
                        }
                        _ = cancel.cancelled() => return Err(HealthError::Cancelled),
                    }
                }
                None => {
                    tokio::select! {
                        _ = tokio::time::sleep(nap) => {}
                        _ = cancel.cancelled() => return Err(HealthError::Cancelled),
                    }
                }
            }
            if feed_closed {
                changes = None;
            }
        }
    }
}

/// Desired state reached, and either running/finished or not meant to run.
fn is_settled(service: &dyn ManagedService) -> bool {
    service.reached_desired_state()
        && (matches!(
            service.state(),
            ServiceState::Running | ServiceState::Finished
        ) || !service.should_auto_start())
}
