//! The live service graph owned by the orchestrator.
//!
//! Holds the ordered registry of service handles together with the typed
//! configuration tree. The orchestrator owns exactly one instance and
//! threads it through every component call.

use std::sync::Arc;

use tracing::debug;

use crate::domain::target::SERVICES_NAMESPACE;
use crate::domain::{
    ConfigError, ConfigNode, ManagedService, Result, ServiceConfig, ServiceState, TargetConfig,
};
use crate::runtime::LifecycleRuntime;

/// Registry of running services plus their configuration subtrees.
#[derive(Default)]
pub struct ServiceGraph {
    /// Registration order
    services: Vec<Arc<dyn ManagedService>>,
    config: ConfigNode,
}

impl std::fmt::Debug for ServiceGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceGraph")
            .field("services", &self.names())
            .finish()
    }
}

impl ServiceGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the graph the orchestrator launches with.
    pub fn launch(target: &TargetConfig, runtime: &dyn LifecycleRuntime) -> Result<Self> {
        let mut graph = Self::new();
        for (name, config) in &target.services {
            let handle = runtime.load_service(name, config)?;
            graph.register(handle, config)?;
        }
        Ok(graph)
    }

    /// Request a start for every auto-start service that has not run yet.
    pub fn start_services(&self) {
        for service in self
            .services
            .iter()
            .filter(|s| s.should_auto_start() && s.state() == ServiceState::New)
        {
            debug!(service = %service.name(), "starting service");
            service.request_start();
        }
    }

    /// Add or replace a service handle and write its configuration subtree.
    pub fn register(
        &mut self,
        service: Arc<dyn ManagedService>,
        config: &ServiceConfig,
    ) -> std::result::Result<(), ConfigError> {
        let name = service.name().to_string();
        self.config
            .insert(&[SERVICES_NAMESPACE, &name], config.to_node()?)?;
        match self.services.iter().position(|s| s.name() == name) {
            Some(idx) => self.services[idx] = service,
            None => self.services.push(service),
        }
        Ok(())
    }

    /// Register a handle that has no configuration subtree (builtins).
    pub fn register_builtin(&mut self, service: Arc<dyn ManagedService>) {
        match self.services.iter().position(|s| s.name() == service.name()) {
            Some(idx) => self.services[idx] = service,
            None => self.services.push(service),
        }
    }

    /// Remove both the handle and the configuration subtree.
    pub fn deregister(&mut self, name: &str) -> Option<Arc<dyn ManagedService>> {
        self.config.remove(&[SERVICES_NAMESPACE, name]);
        let idx = self.services.iter().position(|s| s.name() == name)?;
        Some(self.services.remove(idx))
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ManagedService>> {
        self.services.iter().find(|s| s.name() == name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.services.iter().any(|s| s.name() == name)
    }

    pub fn services(&self) -> impl Iterator<Item = &Arc<dyn ManagedService>> {
        self.services.iter()
    }

    /// Service names in registration order.
    pub fn names(&self) -> Vec<String> {
        self.services.iter().map(|s| s.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn config(&self) -> &ConfigNode {
        &self.config
    }

    /// Configuration subtree of `name`.
    pub fn node(&self, name: &str) -> Option<&ConfigNode> {
        self.config.lookup(&[SERVICES_NAMESPACE, name])
    }

    /// Installed configuration of `name`, if the service has a subtree.
    pub fn installed_config(
        &self,
        name: &str,
    ) -> std::result::Result<Option<ServiceConfig>, ConfigError> {
        self.node(name)
            .map(|node| ServiceConfig::from_node(name, node))
            .transpose()
    }

    /// Current configuration of every non-builtin service with a subtree.
    pub fn snapshot(&self) -> std::result::Result<TargetConfig, ConfigError> {
        let mut target = TargetConfig::new();
        for service in self.services.iter().filter(|s| !s.is_builtin()) {
            if let Some(config) = self.installed_config(service.name())? {
                target.services.insert(service.name().to_string(), config);
            }
        }
        Ok(target)
    }

    /// Write every target subtree into the graph.
    ///
    /// Existing services receive their new configuration through
    /// `request_update` when it changed; missing services are loaded from the
    /// runtime and registered. Nothing is removed here.
    pub fn merge(&mut self, target: &TargetConfig, runtime: &dyn LifecycleRuntime) -> Result<()> {
        for (name, config) in &target.services {
            match self.get(name) {
                Some(existing) => {
                    let changed = self.installed_config(name)?.as_ref() != Some(config);
                    self.register(Arc::clone(&existing), config)?;
                    if changed {
                        debug!(service = %name, "configuration changed");
                        existing.request_update(config);
                    }
                }
                None => {
                    let handle = runtime.load_service(name, config)?;
                    debug!(service = %name, "service loaded");
                    self.register(handle, config)?;
                }
            }
        }
        Ok(())
    }
}
