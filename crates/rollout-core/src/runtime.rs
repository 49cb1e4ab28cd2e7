//! Collaborator interfaces consumed by the rollout engine.
//!
//! - [`LifecycleRuntime`]: creates service handles, runs bootstrap steps and
//!   publishes the global state-change feed
//! - [`RestartController`]: shuts the orchestrator down for a restart
//! - [`Resolver`]: turns a deployment document into a [`TargetConfig`]
//! - [`JobSource`]: the cloud job channel

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rollout_state::{Deployment, JobStatus};
use serde::Deserialize;
use tokio::sync::broadcast;

use crate::domain::{
    DependencyKind, FailureHandlingPolicy, JobSourceError, LifecycleError, ManagedService,
    ResolveError, ServiceConfig, StateChange, TargetConfig,
};
use crate::status_ledger::StatusDetails;

/// The process that actually runs install/run/shutdown scripts.
#[async_trait]
pub trait LifecycleRuntime: Send + Sync {
    /// Create the handle for a service that is not yet in the graph.
    fn load_service(
        &self,
        name: &str,
        config: &ServiceConfig,
    ) -> Result<Arc<dyn ManagedService>, LifecycleError>;

    /// Run the service's bootstrap step and return its exit code.
    async fn run_bootstrap(&self, name: &str, config: &ServiceConfig)
        -> Result<i32, LifecycleError>;

    /// Subscribe to state transitions of every service.
    fn subscribe(&self) -> broadcast::Receiver<StateChange>;
}

/// Why the orchestrator is being restarted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartReason {
    /// Restart into the persisted stage (activation retry, bootstrap finished)
    Restart,
    /// Restart into the rollback configuration
    ResumeRollback,
    /// Restart and continue the bootstrap plan
    ResumeBootstrap,
    /// Reboot the device and continue the bootstrap plan
    RebootDevice,
}

impl RestartReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestartReason::Restart => "restart",
            RestartReason::ResumeRollback => "resume-rollback",
            RestartReason::ResumeBootstrap => "resume-bootstrap",
            RestartReason::RebootDevice => "reboot",
        }
    }
}

impl std::fmt::Display for RestartReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shuts the orchestrator process down so it can be relaunched.
#[async_trait]
pub trait RestartController: Send + Sync {
    async fn shutdown(&self, timeout: Duration, reason: RestartReason);
}

/// Turns a deployment document into a fully resolved target configuration.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, deployment: &Deployment) -> Result<TargetConfig, ResolveError>;
}

/// Outgoing half of the cloud job channel.
///
/// Descriptions arrive asynchronously through
/// [`crate::job_intake::JobIntake::job_described`].
#[async_trait]
pub trait JobSource: Send + Sync {
    /// Ask for the description of `job_id` (or `$next`).
    async fn describe(&self, job_id: &str) -> Result<(), JobSourceError>;

    async fn update_status(
        &self,
        job_id: &str,
        status: JobStatus,
        details: &StatusDetails,
    ) -> Result<(), JobSourceError>;
}

// ---------------------------------------------------------------------------
// JsonDocumentResolver
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct DeploymentDocument {
    services: BTreeMap<String, ServiceConfig>,
    #[serde(default)]
    failure_handling_policy: FailureHandlingPolicy,
}

/// Resolver for documents that already carry resolved service configs.
///
/// Checks that versions are present and that every hard dependency is part
/// of the same document.
#[derive(Debug, Default, Clone)]
pub struct JsonDocumentResolver;

impl JsonDocumentResolver {
    pub fn new() -> Self {
        Self
    }

    pub fn parse(document: &str) -> Result<TargetConfig, ResolveError> {
        let doc: DeploymentDocument = serde_json::from_str(document)
            .map_err(|e| ResolveError::InvalidDocument(e.to_string()))?;

        for (name, config) in &doc.services {
            if config.version.trim().is_empty() {
                return Err(ResolveError::Packaging {
                    service: name.clone(),
                    detail: "no version specified".to_string(),
                });
            }
            for dep in &config.dependencies {
                if dep.kind == DependencyKind::Hard && !doc.services.contains_key(&dep.name) {
                    return Err(ResolveError::DependencyConflict {
                        service: name.clone(),
                        detail: format!("hard dependency {} is not part of the deployment", dep.name),
                    });
                }
            }
        }

        Ok(TargetConfig {
            services: doc.services,
            failure_handling_policy: doc.failure_handling_policy,
        })
    }
}

#[async_trait]
impl Resolver for JsonDocumentResolver {
    async fn resolve(&self, deployment: &Deployment) -> Result<TargetConfig, ResolveError> {
        Self::parse(&deployment.document)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_services_and_policy() {
        let target = JsonDocumentResolver::parse(
            r#"{
                "services": {
                    "store": {"version": "1.0.0"},
                    "ingest": {"version": "2.0.0", "dependencies": ["store", "metrics:SOFT"]}
                },
                "failure_handling_policy": "DO_NOTHING"
            }"#,
        )
        .unwrap();
        assert_eq!(target.services.len(), 2);
        assert_eq!(target.failure_handling_policy, FailureHandlingPolicy::DoNothing);
    }

    #[test]
    fn missing_hard_dependency_is_a_conflict() {
        let err = JsonDocumentResolver::parse(
            r#"{"services": {"ingest": {"version": "2.0.0", "dependencies": ["store"]}}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ResolveError::DependencyConflict { ref service, .. } if service == "ingest"));
    }

    #[test]
    fn empty_version_is_a_packaging_error() {
        let err = JsonDocumentResolver::parse(r#"{"services": {"a": {"version": " "}}}"#)
            .unwrap_err();
        assert!(matches!(err, ResolveError::Packaging { .. }));
    }

    #[test]
    fn garbage_is_an_invalid_document() {
        assert!(matches!(
            JsonDocumentResolver::parse("not json"),
            Err(ResolveError::InvalidDocument(_))
        ));
    }
}
