//! Terminal outcome of one deployment attempt.

use std::sync::Arc;

use rollout_state::JobStatus;
use serde::{Deserialize, Serialize};

use super::error::RolloutError;

/// Detailed deployment outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeploymentStatus {
    Successful,
    /// Failed before any lifecycle change was made
    FailedNoStateChange,
    /// Activation failed and the deployment asked not to roll back
    FailedRollbackNotRequested,
    /// Activation failed and the previous configuration is running again
    FailedRollbackComplete,
    FailedUnableToRollback,
}

impl DeploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStatus::Successful => "SUCCESSFUL",
            DeploymentStatus::FailedNoStateChange => "FAILED_NO_STATE_CHANGE",
            DeploymentStatus::FailedRollbackNotRequested => "FAILED_ROLLBACK_NOT_REQUESTED",
            DeploymentStatus::FailedRollbackComplete => "FAILED_ROLLBACK_COMPLETE",
            DeploymentStatus::FailedUnableToRollback => "FAILED_UNABLE_TO_ROLLBACK",
        }
    }

    /// Job-level status reported to the requester.
    pub fn job_status(&self) -> JobStatus {
        match self {
            DeploymentStatus::Successful => JobStatus::Succeeded,
            _ => JobStatus::Failed,
        }
    }
}

impl std::fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of driving a deployment to a terminal state.
#[derive(Debug, Clone)]
pub struct DeploymentResult {
    pub status: DeploymentStatus,
    pub failure_cause: Option<Arc<RolloutError>>,
}

impl DeploymentResult {
    pub fn successful() -> Self {
        Self {
            status: DeploymentStatus::Successful,
            failure_cause: None,
        }
    }

    pub fn failed(status: DeploymentStatus, cause: RolloutError) -> Self {
        Self {
            status,
            failure_cause: Some(Arc::new(cause)),
        }
    }

    pub fn is_successful(&self) -> bool {
        self.status == DeploymentStatus::Successful
    }

    /// Rendered failure cause, if any.
    pub fn cause_message(&self) -> Option<String> {
        self.failure_cause.as_ref().map(|c| c.to_string())
    }
}
