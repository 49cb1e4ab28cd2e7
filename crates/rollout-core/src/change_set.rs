//! Change-set computer: diff of the live graph against a target.
//!
//! A [`ChangeSet`] is ephemeral. It is computed per deployment attempt and
//! its inverse drives rollback, so the rollback plan never depends on a
//! second diff against state that may already have moved.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::domain::{LifecycleError, ManagedService, ServiceState, TargetConfig};
use crate::obs;
use crate::service_graph::ServiceGraph;

/// Services to add, remove and update, each in first-seen order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChangeSet {
    pub to_add: Vec<String>,
    pub to_remove: Vec<String>,
    pub to_update: Vec<String>,
}

impl ChangeSet {
    /// Diff the live graph against `target`.
    pub fn compute(graph: &ServiceGraph, target: &TargetConfig) -> Self {
        Self::from_names(graph.names(), target.service_names())
    }

    /// Diff two name lists.
    ///
    /// `to_add` follows `target` order; `to_remove` and `to_update` follow
    /// `current` order. Repeated names count once.
    pub fn from_names<C, T>(current: C, target: T) -> Self
    where
        C: IntoIterator,
        C::Item: AsRef<str>,
        T: IntoIterator,
        T::Item: AsRef<str>,
    {
        let current = dedup(current);
        let target = dedup(target);
        let current_set: HashSet<&str> = current.iter().map(String::as_str).collect();
        let target_set: HashSet<&str> = target.iter().map(String::as_str).collect();

        let to_add = target
            .iter()
            .filter(|n| !current_set.contains(n.as_str()))
            .cloned()
            .collect();
        let (to_update, to_remove) = current
            .iter()
            .cloned()
            .partition(|n| target_set.contains(n.as_str()));

        Self {
            to_add,
            to_remove,
            to_update,
        }
    }

    /// Swap additions and removals. Updates stay as they are.
    pub fn invert(&self) -> Self {
        Self {
            to_add: self.to_remove.clone(),
            to_remove: self.to_add.clone(),
            to_update: self.to_update.clone(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty() && self.to_update.is_empty()
    }

    /// Health-watch set: auto-start additions followed by every update.
    pub fn services_to_track(&self, graph: &ServiceGraph) -> Vec<Arc<dyn ManagedService>> {
        let added = self
            .to_add
            .iter()
            .filter_map(|n| graph.get(n))
            .filter(|s| s.should_auto_start());
        let updated = self.to_update.iter().filter_map(|n| graph.get(n));
        added.chain(updated).collect()
    }

    /// Request a start for every auto-start addition.
    pub fn start_new_services(&self, graph: &ServiceGraph) {
        for name in &self.to_add {
            match graph.get(name) {
                Some(service) if service.should_auto_start() => {
                    debug!(service = %name, "starting new service");
                    service.request_start();
                }
                Some(_) => debug!(service = %name, "new service is not auto-start"),
                None => debug!(service = %name, "new service missing from graph"),
            }
        }
    }

    /// Re-run install for updated services left broken by an earlier deployment.
    pub fn reinstall_broken_services(&self, graph: &ServiceGraph) {
        for service in self.to_update.iter().filter_map(|n| graph.get(n)) {
            if service.state() == ServiceState::Broken {
                debug!(service = %service.name(), "reinstalling broken service");
                service.request_reinstall();
            }
        }
    }

    /// Close and deregister every non-builtin removal, one at a time.
    ///
    /// Each close is awaited before the service's subtree and handle are
    /// dropped. A failed or timed-out close is logged and the service is
    /// deregistered anyway. Returns the names that were deregistered.
    pub async fn remove_obsolete_services(
        &self,
        graph: &mut ServiceGraph,
        close_timeout: Option<Duration>,
    ) -> Vec<String> {
        let mut removed = Vec::with_capacity(self.to_remove.len());
        for name in &self.to_remove {
            if let Some(service) = graph.get(name) {
                if service.is_builtin() {
                    debug!(service = %name, "leaving builtin service running");
                    continue;
                }
                let close = service.close();
                let outcome = match close_timeout {
                    Some(limit) => match tokio::time::timeout(limit, close).await {
                        Ok(outcome) => outcome,
                        Err(_) => Err(LifecycleError::CloseFailed {
                            service: name.clone(),
                            reason: format!("close did not complete within {limit:?}"),
                        }),
                    },
                    None => close.await,
                };
                if let Err(e) = outcome {
                    obs::emit_service_close_failed(name, &e);
                }
            }
            graph.deregister(name);
            removed.push(name.clone());
        }
        removed
    }
}

fn dedup<I>(names: I) -> Vec<String>
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    let mut seen = HashSet::new();
    names
        .into_iter()
        .filter_map(|n| {
            let n = n.as_ref();
            seen.insert(n.to_string()).then(|| n.to_string())
        })
        .collect()
}
