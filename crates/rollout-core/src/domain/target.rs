//! Resolved service configuration and the target configuration map.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::config_tree::ConfigNode;
use super::error::ConfigError;
use super::service::Dependency;

/// Root namespace holding one subtree per service.
pub const SERVICES_NAMESPACE: &str = "services";
pub const VERSION_KEY: &str = "version";
pub const LIFECYCLE_KEY: &str = "lifecycle";
pub const BOOTSTRAP_KEY: &str = "bootstrap";

/// What to do when activation leaves a tracked service broken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureHandlingPolicy {
    #[default]
    Rollback,
    DoNothing,
}

/// Fully resolved configuration of one service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub version: String,
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
    /// Lifecycle steps by name (`install`, `run`, `shutdown`, `bootstrap`, ...)
    #[serde(default)]
    pub lifecycle: BTreeMap<String, String>,
    #[serde(default)]
    pub parameters: ConfigNode,
}

impl ServiceConfig {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            dependencies: Vec::new(),
            lifecycle: BTreeMap::new(),
            parameters: ConfigNode::map(),
        }
    }

    pub fn with_dependency(mut self, dependency: Dependency) -> Self {
        self.dependencies.push(dependency);
        self
    }

    pub fn with_step(mut self, step: impl Into<String>, script: impl Into<String>) -> Self {
        self.lifecycle.insert(step.into(), script.into());
        self
    }

    pub fn with_bootstrap(self, script: impl Into<String>) -> Self {
        self.with_step(BOOTSTRAP_KEY, script)
    }

    pub fn bootstrap_step(&self) -> Option<&str> {
        self.lifecycle.get(BOOTSTRAP_KEY).map(String::as_str)
    }

    /// Render as a config subtree.
    pub fn to_node(&self) -> Result<ConfigNode, ConfigError> {
        let value = serde_json::to_value(self).map_err(|e| ConfigError::InvalidNode {
            path: String::new(),
            reason: e.to_string(),
        })?;
        ConfigNode::from_json(value)
    }

    /// Read back from a config subtree written by [`ServiceConfig::to_node`].
    pub fn from_node(name: &str, node: &ConfigNode) -> Result<Self, ConfigError> {
        let value = node.to_json()?;
        serde_json::from_value(value).map_err(|e| ConfigError::InvalidNode {
            path: format!("{SERVICES_NAMESPACE}/{name}"),
            reason: e.to_string(),
        })
    }
}

/// The resolver's output: every service the device should run.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TargetConfig {
    pub services: BTreeMap<String, ServiceConfig>,
    #[serde(default)]
    pub failure_handling_policy: FailureHandlingPolicy,
}

impl TargetConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_service(mut self, name: impl Into<String>, config: ServiceConfig) -> Self {
        self.services.insert(name.into(), config);
        self
    }

    pub fn get(&self, name: &str) -> Option<&ServiceConfig> {
        self.services.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.services.contains_key(name)
    }

    /// Service names in iteration order.
    pub fn service_names(&self) -> impl Iterator<Item = &str> {
        self.services.keys().map(String::as_str)
    }

    pub fn to_payload(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    pub fn from_payload(payload: serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(payload)
    }
}
