//! Domain types for the rollout engine.

pub mod config_tree;
pub mod error;
pub mod result;
pub mod service;
pub mod target;

pub use config_tree::{ConfigNode, Scalar};
pub use error::{
    BootstrapError, ConfigError, HealthError, JobSourceError, LifecycleError, ResolveError,
    Result, RolloutError,
};
pub use result::{DeploymentResult, DeploymentStatus};
pub use service::{Dependency, DependencyKind, ManagedService, ServiceState, StateChange};
pub use target::{FailureHandlingPolicy, ServiceConfig, TargetConfig};
