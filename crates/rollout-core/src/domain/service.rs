//! Managed service handle and its lifecycle vocabulary.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use super::error::{ConfigError, LifecycleError};
use super::target::ServiceConfig;

/// Lifecycle state reported by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceState {
    New,
    Installed,
    Starting,
    Running,
    Stopping,
    Finished,
    Errored,
    Broken,
}

impl ServiceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceState::New => "NEW",
            ServiceState::Installed => "INSTALLED",
            ServiceState::Starting => "STARTING",
            ServiceState::Running => "RUNNING",
            ServiceState::Stopping => "STOPPING",
            ServiceState::Finished => "FINISHED",
            ServiceState::Errored => "ERRORED",
            ServiceState::Broken => "BROKEN",
        }
    }
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Strength of a dependency edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DependencyKind {
    #[default]
    Hard,
    Soft,
}

/// A dependency declaration, written as `name` or `name:HARD` / `name:SOFT`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Dependency {
    pub name: String,
    pub kind: DependencyKind,
}

impl Dependency {
    pub fn hard(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: DependencyKind::Hard,
        }
    }

    pub fn soft(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: DependencyKind::Soft,
        }
    }

    pub fn parse(declaration: &str) -> Result<Self, ConfigError> {
        let invalid = || ConfigError::InvalidDependency {
            declaration: declaration.to_string(),
        };
        let (name, kind) = match declaration.split_once(':') {
            None => (declaration, DependencyKind::Hard),
            Some((name, kind)) => {
                let kind = match kind.trim().to_ascii_uppercase().as_str() {
                    "HARD" => DependencyKind::Hard,
                    "SOFT" => DependencyKind::Soft,
                    _ => return Err(invalid()),
                };
                (name, kind)
            }
        };
        let name = name.trim();
        if name.is_empty() {
            return Err(invalid());
        }
        Ok(Self {
            name: name.to_string(),
            kind,
        })
    }
}

impl TryFrom<String> for Dependency {
    type Error = ConfigError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Dependency::parse(&s)
    }
}

impl From<Dependency> for String {
    fn from(d: Dependency) -> Self {
        d.to_string()
    }
}

impl std::fmt::Display for Dependency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.kind {
            DependencyKind::Hard => "HARD",
            DependencyKind::Soft => "SOFT",
        };
        write!(f, "{}:{}", self.name, kind)
    }
}

/// One transition on the runtime's global state-change feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    pub service: String,
    pub old: ServiceState,
    pub new: ServiceState,
    pub at: DateTime<Utc>,
}

/// Handle to a named long-lived process owned by the lifecycle runtime.
///
/// Lifecycle requests are asynchronous: they return once the runtime has
/// accepted them, and the outcome shows up later as a state transition.
pub trait ManagedService: Send + Sync {
    fn name(&self) -> &str;

    fn state(&self) -> ServiceState;

    /// Time of the last state transition.
    fn state_mod_time(&self) -> DateTime<Utc>;

    fn reached_desired_state(&self) -> bool;

    /// Orchestrator-internal service exempt from removal.
    fn is_builtin(&self) -> bool;

    /// Runtime policy: start as soon as the service is added.
    fn should_auto_start(&self) -> bool;

    fn request_start(&self);

    fn request_stop(&self);

    /// Re-run the install lifecycle.
    fn request_reinstall(&self);

    /// Hand a changed configuration to the runtime.
    fn request_update(&self, config: &ServiceConfig);

    /// Shut the service down for good. Resolves once it has fully stopped.
    fn close(&self) -> BoxFuture<'static, Result<(), LifecycleError>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dependency_defaults_to_hard() {
        assert_eq!(Dependency::parse("store").unwrap(), Dependency::hard("store"));
    }

    #[test]
    fn dependency_kind_is_case_insensitive() {
        assert_eq!(Dependency::parse("log:soft").unwrap(), Dependency::soft("log"));
        assert_eq!(Dependency::parse("log:HARD").unwrap(), Dependency::hard("log"));
    }

    #[test]
    fn dependency_rejects_unknown_kind_and_empty_name() {
        assert!(Dependency::parse("log:MAYBE").is_err());
        assert!(Dependency::parse(":SOFT").is_err());
    }

    #[test]
    fn dependency_serializes_as_string() {
        let json = serde_json::to_string(&Dependency::soft("D")).unwrap();
        assert_eq!(json, "\"D:SOFT\"");
        let back: Dependency = serde_json::from_str("\"C\"").unwrap();
        assert_eq!(back, Dependency::hard("C"));
    }
}
