//! Error types for the rollout engine.

use std::time::Duration;

use rollout_state::StorageError;
use thiserror::Error;

/// Malformed configuration: typed tree shape, dependency strings, config files.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid dependency declaration '{declaration}'")]
    InvalidDependency { declaration: String },

    #[error("config node '{path}' has unexpected shape: {reason}")]
    InvalidNode { path: String, reason: String },

    #[error("config file {path}: {reason}")]
    File { path: String, reason: String },

    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}

/// Errors from turning a deployment document into a target configuration.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("dependency conflict for service {service}: {detail}")]
    DependencyConflict { service: String, detail: String },

    #[error("packaging failure for service {service}: {detail}")]
    Packaging { service: String, detail: String },

    #[error("invalid deployment document: {0}")]
    InvalidDocument(String),
}

/// Errors reported by the lifecycle runtime.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("service {service} failed to close: {reason}")]
    CloseFailed { service: String, reason: String },

    #[error("service {service} could not be loaded: {reason}")]
    LoadFailed { service: String, reason: String },

    #[error("bootstrap step for {service} could not run: {reason}")]
    BootstrapLaunch { service: String, reason: String },
}

/// Errors from planning or running bootstrap tasks.
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("Fail to execute bootstrap step for {service}, exit code: {exit_code}")]
    TaskFailed { service: String, exit_code: i32 },

    #[error("bootstrap plan has a dependency cycle among {services:?}")]
    DependencyCycle { services: Vec<String> },

    #[error("bootstrap task {service} has no configuration in the target")]
    UnknownService { service: String },

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("bootstrap plan storage: {0}")]
    Storage(#[from] StorageError),
}

/// Outcomes of waiting for tracked services that are not "healthy".
#[derive(Debug, Error)]
pub enum HealthError {
    #[error("Service {service} in broken state after deployment")]
    Broken { service: String },

    #[error("timed out after {waited:?} waiting for services {pending:?} to reach desired state")]
    TimedOut {
        waited: Duration,
        pending: Vec<String>,
    },

    #[error("wait for desired state was cancelled")]
    Cancelled,
}

/// Errors from the cloud job channel.
#[derive(Debug, Error)]
pub enum JobSourceError {
    #[error("job source unavailable: {0}")]
    Unavailable(String),

    #[error("job {job_id} rejected the request: {reason}")]
    Rejected { job_id: String, reason: String },
}

/// Top-level error for rollout operations.
#[derive(Debug, Error)]
pub enum RolloutError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error(transparent)]
    Bootstrap(#[from] BootstrapError),

    #[error(transparent)]
    Health(#[from] HealthError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    JobSource(#[from] JobSourceError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Rollback could not be prepared after activation failed.
    #[error("unable to prepare rollback ({source}) after: {reason}")]
    RollbackPreparation {
        reason: String,
        #[source]
        source: StorageError,
    },

    /// Failure recorded in the deployment's stage details.
    #[error("{0}")]
    StageFailure(String),

    #[error("invalid deployment: {0}")]
    InvalidDeployment(String),
}

/// Convenience result alias.
pub type Result<T> = std::result::Result<T, RolloutError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_failure_names_service_and_code() {
        let err = BootstrapError::TaskFailed {
            service: "ingest".to_string(),
            exit_code: 7,
        };
        assert_eq!(
            err.to_string(),
            "Fail to execute bootstrap step for ingest, exit code: 7"
        );
    }

    #[test]
    fn rollback_preparation_chains_both_causes() {
        let err = RolloutError::RollbackPreparation {
            reason: "Service A in broken state after deployment".to_string(),
            source: StorageError::injected("save_token"),
        };
        let msg = err.to_string();
        assert!(msg.contains("Service A in broken state"));
        assert!(msg.contains("save_token"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn stage_failure_displays_recorded_details_verbatim() {
        let err = RolloutError::StageFailure("Service A in broken state after deployment".into());
        assert_eq!(err.to_string(), "Service A in broken state after deployment");
    }
}
