//! Activation/rollback state machine.
//!
//! Drives one deployment through `KERNEL_ACTIVATION` and, if the new
//! configuration leaves a tracked service broken, `KERNEL_ROLLBACK`. Every
//! decision that outlives the process (stage, stage details, rollback
//! markers, commit attempts) is written to the resume token before a
//! restart is requested, so `call` can be re-entered from the persisted
//! stage on the next start.

use std::sync::Arc;
use std::time::Duration;

use rollout_state::{
    DeploymentStage, ResumeStore, ResumeToken, SnapshotKind, SnapshotStore, StorageError,
    StorageResult,
};
use tracing::{info, warn};

use crate::cancel::CancelSignal;
use crate::change_set::ChangeSet;
use crate::domain::{
    DeploymentResult, DeploymentStatus, FailureHandlingPolicy, HealthError, Result, RolloutError,
};
use crate::health::HealthWatch;
use crate::metrics::METRICS;
use crate::obs;
use crate::runtime::{LifecycleRuntime, RestartController, RestartReason};
use crate::service_graph::ServiceGraph;

/// Commit failures retried through a restart before rolling back.
pub const MAX_COMMIT_RETRIES: u32 = 1;

/// What a single invocation of the state machine ended with.
#[derive(Debug, Clone)]
pub enum StageOutcome {
    /// Terminal result to publish
    Completed(DeploymentResult),
    /// The token is persisted and a restart was requested
    RestartRequested(RestartReason),
    /// Interrupted while waiting for health
    Cancelled,
}

pub struct ActivationStateMachine {
    resume: Arc<dyn ResumeStore>,
    snapshots: Arc<dyn SnapshotStore>,
    restart: Arc<dyn RestartController>,
    runtime: Arc<dyn LifecycleRuntime>,
    health: HealthWatch,
    shutdown_timeout: Duration,
    close_timeout: Option<Duration>,
}

impl ActivationStateMachine {
    pub fn new(
        resume: Arc<dyn ResumeStore>,
        snapshots: Arc<dyn SnapshotStore>,
        restart: Arc<dyn RestartController>,
        runtime: Arc<dyn LifecycleRuntime>,
        health: HealthWatch,
    ) -> Self {
        Self {
            resume,
            snapshots,
            restart,
            runtime,
            health,
            shutdown_timeout: Duration::from_secs(30),
            close_timeout: None,
        }
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_close_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.close_timeout = timeout;
        self
    }

    /// Run the persisted stage of `token`.
    ///
    /// `changes` is the forward change set for `KERNEL_ACTIVATION` and its
    /// inverse for `KERNEL_ROLLBACK`.
    pub async fn call(
        &self,
        token: &mut ResumeToken,
        graph: &mut ServiceGraph,
        changes: &ChangeSet,
        policy: FailureHandlingPolicy,
        cancel: &CancelSignal,
    ) -> Result<StageOutcome> {
        match token.stage() {
            DeploymentStage::KernelActivation => {
                self.activate(token, graph, changes, policy, cancel).await
            }
            DeploymentStage::KernelRollback => self.roll_back(token, graph, changes).await,
            other => Err(RolloutError::InvalidDeployment(format!(
                "deployment {} is at stage {other}, not activation or rollback",
                token.deployment.id
            ))),
        }
    }

    async fn activate(
        &self,
        token: &mut ResumeToken,
        graph: &mut ServiceGraph,
        changes: &ChangeSet,
        policy: FailureHandlingPolicy,
        cancel: &CancelSignal,
    ) -> Result<StageOutcome> {
        let tracked = changes.services_to_track(graph);
        let waited = self
            .health
            .wait_for_desired_state(
                &tracked,
                token.stage_entered_at,
                Some(self.runtime.subscribe()),
                cancel,
            )
            .await;

        match waited {
            Ok(()) => {}
            Err(HealthError::Cancelled) => return Ok(StageOutcome::Cancelled),
            Err(e) => {
                let reason = e.to_string();
                warn!(deployment_id = %token.deployment.id, reason = %reason, "activation failed");
                token.deployment.stage_details = Some(reason.clone());
                return self.begin_rollback(token, policy, reason).await;
            }
        }

        changes
            .remove_obsolete_services(graph, self.close_timeout)
            .await;

        match self.commit().await {
            Ok(()) => {
                info!(deployment_id = %token.deployment.id, "configuration committed as baseline");
                Ok(StageOutcome::Completed(DeploymentResult::successful()))
            }
            Err(e) => {
                token.commit_attempts += 1;
                let reason = format!("unable to commit configuration: {e}");
                token.deployment.stage_details = Some(reason.clone());
                if token.commit_attempts > MAX_COMMIT_RETRIES {
                    return self.begin_rollback(token, policy, reason).await;
                }
                warn!(
                    deployment_id = %token.deployment.id,
                    attempt = token.commit_attempts,
                    error = %e,
                    "commit failed, restarting to retry activation"
                );
                self.resume.save_token(token).await?;
                self.request_restart(RestartReason::Restart).await;
                Ok(StageOutcome::RestartRequested(RestartReason::Restart))
            }
        }
    }

    async fn commit(&self) -> StorageResult<()> {
        self.snapshots
            .promote(SnapshotKind::Target, SnapshotKind::Baseline)
            .await
    }

    /// Roll back after a failed activation, or stop there if `policy` says so.
    pub async fn begin_rollback(
        &self,
        token: &mut ResumeToken,
        policy: FailureHandlingPolicy,
        reason: String,
    ) -> Result<StageOutcome> {
        if policy == FailureHandlingPolicy::DoNothing {
            return Ok(StageOutcome::Completed(DeploymentResult::failed(
                DeploymentStatus::FailedRollbackNotRequested,
                RolloutError::StageFailure(reason),
            )));
        }

        if let Err(source) = self.prepare_rollback(token).await {
            warn!(deployment_id = %token.deployment.id, error = %source, "rollback preparation failed");
            return Ok(StageOutcome::Completed(DeploymentResult::failed(
                DeploymentStatus::FailedUnableToRollback,
                RolloutError::RollbackPreparation { reason, source },
            )));
        }

        METRICS.inc_rollbacks_requested();
        self.request_restart(RestartReason::ResumeRollback).await;
        Ok(StageOutcome::RestartRequested(RestartReason::ResumeRollback))
    }

    /// Confirm the rollback snapshot and persist the rollback stage.
    async fn prepare_rollback(&self, token: &mut ResumeToken) -> StorageResult<()> {
        self.snapshots
            .read_snapshot(SnapshotKind::Rollback)
            .await?
            .ok_or_else(|| StorageError::NotFound {
                what: "rollback snapshot".to_string(),
            })?;

        let from = token.stage();
        token.advance(DeploymentStage::KernelRollback);
        token.rollback.prepared = true;
        self.resume.save_token(token).await?;
        obs::emit_stage_changed(&token.deployment.id, from, DeploymentStage::KernelRollback);
        Ok(())
    }

    async fn roll_back(
        &self,
        token: &mut ResumeToken,
        graph: &mut ServiceGraph,
        changes: &ChangeSet,
    ) -> Result<StageOutcome> {
        let reason = token
            .deployment
            .stage_details
            .clone()
            .unwrap_or_else(|| "deployment failed".to_string());

        if !token.rollback.prepared {
            warn!(deployment_id = %token.deployment.id, "rollback stage reached without a confirmed snapshot");
            return Ok(StageOutcome::Completed(DeploymentResult::failed(
                DeploymentStatus::FailedUnableToRollback,
                RolloutError::StageFailure(format!("{reason}; rollback was never prepared")),
            )));
        }
        if token.rollback.completed {
            info!(
                deployment_id = %token.deployment.id,
                recovered = token.rollback.recovered,
                "rollback already finished before the restart"
            );
            let failure = (!token.rollback.recovered).then(|| "rollback did not recover".to_string());
            return Ok(StageOutcome::Completed(rollback_result(reason, failure)));
        }

        let tracked = changes.services_to_track(graph);
        let waited = self
            .health
            .wait_for_desired_state(
                &tracked,
                token.stage_entered_at,
                Some(self.runtime.subscribe()),
                &CancelSignal::never(),
            )
            .await;
        if waited.is_ok() {
            changes
                .remove_obsolete_services(graph, self.close_timeout)
                .await;
        }

        token.rollback.completed = true;
        token.rollback.recovered = waited.is_ok();
        if let Err(e) = self.resume.save_token(token).await {
            warn!(deployment_id = %token.deployment.id, error = %e, "unable to record finished rollback");
        }

        let failure = waited
            .err()
            .map(|e| format!("rollback did not recover: {e}"));
        Ok(StageOutcome::Completed(rollback_result(reason, failure)))
    }

    async fn request_restart(&self, reason: RestartReason) {
        info!(reason = %reason, "requesting orchestrator restart");
        self.restart.shutdown(self.shutdown_timeout, reason).await;
    }
}

fn rollback_result(reason: String, failure: Option<String>) -> DeploymentResult {
    match failure {
        None => DeploymentResult::failed(
            DeploymentStatus::FailedRollbackComplete,
            RolloutError::StageFailure(reason),
        ),
        Some(failure) => DeploymentResult::failed(
            DeploymentStatus::FailedUnableToRollback,
            RolloutError::StageFailure(format!("{reason}; {failure}")),
        ),
    }
}
