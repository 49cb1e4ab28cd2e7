//! Sequential deployment worker.
//!
//! Takes deployments from the queue one at a time and drives each one from
//! `DEFAULT` to a terminal status: resolve, snapshot, bootstrap or merge,
//! then hand over to the activation state machine. Stages that continue
//! after a restart enter through [`DeploymentWorker::resume`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use rollout_state::{
    ConfigSnapshot, Deployment, DeploymentStage, JobStatus, ResumeStore, ResumeToken,
    SnapshotKind, SnapshotStore,
};
use tracing::{debug, error, info, warn, Instrument};

use crate::activation::{ActivationStateMachine, StageOutcome};
use crate::bootstrap::{BootstrapSequencer, ExitAction};
use crate::cancel::{cancel_pair, CancelSignal};
use crate::change_set::ChangeSet;
use crate::config::RolloutConfig;
use crate::domain::{DeploymentResult, DeploymentStatus, Result, RolloutError, TargetConfig};
use crate::metrics::METRICS;
use crate::obs;
use crate::queue::{ActiveDeployment, DeploymentQueue};
use crate::runtime::{LifecycleRuntime, Resolver, RestartController, RestartReason};
use crate::service_graph::ServiceGraph;
use crate::status_ledger::{DeploymentStatusLedger, DETAILED_STATUS_KEY, FAILURE_CAUSE_KEY};

/// Collaborators the worker is wired with.
#[derive(Clone)]
pub struct WorkerDeps {
    pub runtime: Arc<dyn LifecycleRuntime>,
    pub resolver: Arc<dyn Resolver>,
    pub queue: Arc<DeploymentQueue>,
    pub ledger: Arc<DeploymentStatusLedger>,
    pub resume: Arc<dyn ResumeStore>,
    pub snapshots: Arc<dyn SnapshotStore>,
    pub restart: Arc<dyn RestartController>,
}

pub struct DeploymentWorker {
    graph: ServiceGraph,
    runtime: Arc<dyn LifecycleRuntime>,
    resolver: Arc<dyn Resolver>,
    queue: Arc<DeploymentQueue>,
    ledger: Arc<DeploymentStatusLedger>,
    resume: Arc<dyn ResumeStore>,
    snapshots: Arc<dyn SnapshotStore>,
    restart: Arc<dyn RestartController>,
    sequencer: BootstrapSequencer,
    activation: ActivationStateMachine,
    shutdown_timeout: Duration,
}

impl DeploymentWorker {
    pub fn new(graph: ServiceGraph, deps: WorkerDeps, config: &RolloutConfig) -> Self {
        let sequencer = BootstrapSequencer::new(deps.resume.clone(), deps.runtime.clone());
        let activation = ActivationStateMachine::new(
            deps.resume.clone(),
            deps.snapshots.clone(),
            deps.restart.clone(),
            deps.runtime.clone(),
            config.health_watch(),
        )
        .with_shutdown_timeout(config.shutdown_timeout())
        .with_close_timeout(config.close_timeout());

        Self {
            graph,
            runtime: deps.runtime,
            resolver: deps.resolver,
            queue: deps.queue,
            ledger: deps.ledger,
            resume: deps.resume,
            snapshots: deps.snapshots,
            restart: deps.restart,
            sequencer,
            activation,
            shutdown_timeout: config.shutdown_timeout(),
        }
    }

    pub fn graph(&self) -> &ServiceGraph {
        &self.graph
    }

    /// Process queued deployments until a restart is requested or `shutdown`
    /// fires.
    ///
    /// While a fresh deployment runs, a cancellation aimed at it is consumed
    /// and interrupts it. Local cancellations must carry the running id.
    pub async fn run(&mut self, shutdown: CancelSignal) -> Result<Option<RestartReason>> {
        loop {
            let deployment = tokio::select! {
                deployment = self.queue.next() => deployment,
                _ = shutdown.cancelled() => {
                    info!("deployment worker stopping");
                    return Ok(None);
                }
            };
            if deployment.is_cancelled {
                self.withdraw(&deployment).await;
                continue;
            }

            let active = ActiveDeployment::of(&deployment);
            self.queue.set_active(active.clone());
            let (handle, signal) = cancel_pair();
            let queue = Arc::clone(&self.queue);

            let outcome = {
                let work = self.process(deployment, &signal);
                tokio::pin!(work);
                loop {
                    tokio::select! {
                        outcome = &mut work => break outcome,
                        _ = queue.offered(), if active.is_cancellable() => {
                            if queue.take_cancellation(&active).is_some() {
                                info!(deployment_id = %active.id, "cancelling active deployment");
                                handle.cancel();
                            }
                        }
                    }
                }
            };
            self.queue.clear_active();

            match outcome {
                Ok(Some(reason)) => return Ok(Some(reason)),
                Ok(None) => {}
                Err(e) => error!(deployment_id = %active.id, error = %e, "deployment processing failed"),
            }
        }
    }

    /// Settle a cancellation that reached the worker with nothing running.
    ///
    /// If it replaced a queued deployment, that deployment ends `CANCELED`.
    async fn withdraw(&self, cancellation: &Deployment) {
        if !self.queue.take_withdrawn(cancellation) {
            debug!(deployment_id = %cancellation.id, "nothing to cancel");
            return;
        }
        info!(deployment_id = %cancellation.id, "queued deployment cancelled before start");
        obs::emit_deployment_cancelled(&cancellation.id, false);
        METRICS.inc_deployments_failed();
        if let Err(e) = self
            .publish(cancellation, JobStatus::Canceled, BTreeMap::new())
            .await
        {
            warn!(deployment_id = %cancellation.id, error = %e, "unable to record cancelled status");
        }
    }

    /// Drive a fresh deployment until it finishes or needs a restart.
    ///
    /// Returns the restart reason when the orchestrator must restart before
    /// the deployment can continue.
    pub async fn process(
        &mut self,
        deployment: Deployment,
        cancel: &CancelSignal,
    ) -> Result<Option<RestartReason>> {
        let span = obs::deployment_span(&deployment.id);
        async {
            METRICS.inc_deployments_started();
            obs::emit_deployment_started(&deployment.id, deployment.deployment_type);
            if let Err(e) = self
                .publish(&deployment, JobStatus::InProgress, BTreeMap::new())
                .await
            {
                warn!(error = %e, "unable to record in-progress status");
            }

            let outcome = self.start(&deployment, cancel).await;
            self.conclude(&deployment, outcome).await
        }
        .instrument(span)
        .await
    }

    /// Continue a deployment persisted at `token`'s stage.
    pub async fn resume(&mut self, token: ResumeToken) -> Result<Option<RestartReason>> {
        let deployment = token.deployment.clone();
        let span = obs::deployment_span(&deployment.id);
        async {
            let outcome = match token.stage() {
                DeploymentStage::Default => {
                    debug!("persisted deployment never started, queueing it again");
                    self.queue.offer(deployment.clone());
                    return Ok(None);
                }
                DeploymentStage::Bootstrap => self.resume_bootstrap(token).await,
                DeploymentStage::KernelActivation | DeploymentStage::KernelRollback => {
                    self.resume_activation(token).await
                }
            };
            self.conclude(&deployment, outcome).await
        }
        .instrument(span)
        .await
    }

    async fn start(&mut self, deployment: &Deployment, cancel: &CancelSignal) -> StageOutcome {
        if cancel.is_cancelled() {
            obs::emit_deployment_cancelled(&deployment.id, false);
            return StageOutcome::Cancelled;
        }
        let target = match self.resolver.resolve(deployment).await {
            Ok(target) => target,
            Err(e) => return no_state_change(e.into()),
        };
        if cancel.is_cancelled() {
            obs::emit_deployment_cancelled(&deployment.id, false);
            return StageOutcome::Cancelled;
        }
        if let Err(e) = self.take_snapshots(&target).await {
            return no_state_change(e);
        }

        let token = ResumeToken::new(deployment.clone());
        match BootstrapSequencer::is_bootstrap_required(&self.graph, &target) {
            Ok(true) => self.bootstrap(token, &target).await,
            Ok(false) => self.activate(token, &target, cancel).await,
            Err(e) => no_state_change(e.into()),
        }
    }

    /// Record the running configuration for rollback and the target for
    /// commit.
    async fn take_snapshots(&self, target: &TargetConfig) -> Result<()> {
        let current = self.graph.snapshot()?;
        let rollback = ConfigSnapshot::new(SnapshotKind::Rollback, current.to_payload()?)?;
        self.snapshots.write_snapshot(&rollback).await?;
        let next = ConfigSnapshot::new(SnapshotKind::Target, target.to_payload()?)?;
        self.snapshots.write_snapshot(&next).await?;
        Ok(())
    }

    async fn bootstrap(&mut self, mut token: ResumeToken, target: &TargetConfig) -> StageOutcome {
        enter_stage(&mut token, DeploymentStage::Bootstrap);
        if let Err(e) = self.sequencer.prepare(&self.graph, target).await {
            return no_state_change(e.into());
        }
        if let Err(e) = self.resume.save_token(&token).await {
            return no_state_change(e.into());
        }
        self.continue_bootstrap(token, target).await
    }

    async fn continue_bootstrap(
        &mut self,
        mut token: ResumeToken,
        target: &TargetConfig,
    ) -> StageOutcome {
        let exit_code = match self.sequencer.run_pending(target).await {
            Ok(code) => code,
            Err(e) => return no_state_change(e.into()),
        };
        let action = ExitAction::classify(exit_code);

        if self.sequencer.has_next() {
            let reason = match action {
                ExitAction::Reboot => RestartReason::RebootDevice,
                _ => RestartReason::ResumeBootstrap,
            };
            return self.request_restart(reason).await;
        }

        if action.requires_restart() {
            enter_stage(&mut token, DeploymentStage::KernelActivation);
            if let Err(e) = self.resume.save_token(&token).await {
                return no_state_change(e.into());
            }
            let reason = match action {
                ExitAction::Reboot => RestartReason::RebootDevice,
                _ => RestartReason::Restart,
            };
            return self.request_restart(reason).await;
        }

        // Bootstrap steps have run; the merge is no longer interruptible.
        self.activate(token, target, &CancelSignal::never()).await
    }

    /// Merge `target` into the running graph and let the state machine
    /// watch the result.
    async fn activate(
        &mut self,
        mut token: ResumeToken,
        target: &TargetConfig,
        cancel: &CancelSignal,
    ) -> StageOutcome {
        enter_stage(&mut token, DeploymentStage::KernelActivation);
        if let Err(e) = self.resume.save_token(&token).await {
            return no_state_change(e.into());
        }

        let changes = ChangeSet::compute(&self.graph, target);
        debug!(
            add = ?changes.to_add,
            remove = ?changes.to_remove,
            update = ?changes.to_update,
            "change set computed"
        );
        if let Err(e) = self.graph.merge(target, self.runtime.as_ref()) {
            let reason = e.to_string();
            token.deployment.stage_details = Some(reason.clone());
            return self
                .activation
                .begin_rollback(&mut token, target.failure_handling_policy, reason)
                .await
                .unwrap_or_else(unable_to_roll_back);
        }
        changes.start_new_services(&self.graph);
        changes.reinstall_broken_services(&self.graph);

        if cancel.is_cancelled() {
            obs::emit_deployment_cancelled(&token.deployment.id, true);
            return StageOutcome::Cancelled;
        }

        let outcome = self
            .activation
            .call(
                &mut token,
                &mut self.graph,
                &changes,
                target.failure_handling_policy,
                cancel,
            )
            .await
            .unwrap_or_else(unable_to_roll_back);
        if matches!(outcome, StageOutcome::Cancelled) {
            obs::emit_deployment_cancelled(&token.deployment.id, true);
        }
        outcome
    }

    async fn resume_bootstrap(&mut self, token: ResumeToken) -> StageOutcome {
        let target = match self.read_config(SnapshotKind::Target).await {
            Ok(target) => target,
            Err(e) => return no_state_change(e),
        };
        if let Err(e) = self.sequencer.load().await {
            return no_state_change(e.into());
        }
        self.continue_bootstrap(token, &target).await
    }

    async fn resume_activation(&mut self, mut token: ResumeToken) -> StageOutcome {
        let configs = async {
            let target = self.read_config(SnapshotKind::Target).await?;
            let previous = self.read_config(SnapshotKind::Rollback).await?;
            Ok::<_, RolloutError>((target, previous))
        }
        .await;
        let (target, previous) = match configs {
            Ok(configs) => configs,
            Err(e) => return unable_to_roll_back(e),
        };

        let forward = ChangeSet::from_names(previous.service_names(), target.service_names());
        let changes = match token.stage() {
            DeploymentStage::KernelRollback => forward.invert(),
            _ => forward,
        };
        self.activation
            .call(
                &mut token,
                &mut self.graph,
                &changes,
                target.failure_handling_policy,
                &CancelSignal::never(),
            )
            .await
            .unwrap_or_else(unable_to_roll_back)
    }

    async fn read_config(&self, kind: SnapshotKind) -> Result<TargetConfig> {
        let snapshot = self
            .snapshots
            .read_snapshot(kind)
            .await?
            .ok_or_else(|| RolloutError::InvalidDeployment(format!("{kind} snapshot is missing")))?;
        Ok(TargetConfig::from_payload(snapshot.payload)?)
    }

    async fn request_restart(&self, reason: RestartReason) -> StageOutcome {
        info!(reason = %reason, "requesting orchestrator restart");
        self.restart.shutdown(self.shutdown_timeout, reason).await;
        StageOutcome::RestartRequested(reason)
    }

    async fn conclude(
        &mut self,
        deployment: &Deployment,
        outcome: StageOutcome,
    ) -> Result<Option<RestartReason>> {
        match outcome {
            StageOutcome::RestartRequested(reason) => Ok(Some(reason)),
            StageOutcome::Completed(result) => {
                self.finish(deployment, &result).await?;
                Ok(None)
            }
            StageOutcome::Cancelled => {
                self.publish(deployment, JobStatus::Canceled, BTreeMap::new())
                    .await?;
                METRICS.inc_deployments_failed();
                self.cleanup().await;
                Ok(None)
            }
        }
    }

    async fn finish(&mut self, deployment: &Deployment, result: &DeploymentResult) -> Result<()> {
        let cause = result.cause_message();
        let mut details = BTreeMap::new();
        details.insert(
            DETAILED_STATUS_KEY.to_string(),
            result.status.as_str().to_string(),
        );
        if let Some(cause) = &cause {
            details.insert(FAILURE_CAUSE_KEY.to_string(), cause.clone());
        }
        self.publish(deployment, result.status.job_status(), details)
            .await?;

        if result.is_successful() {
            METRICS.inc_deployments_succeeded();
        } else {
            METRICS.inc_deployments_failed();
        }
        obs::emit_deployment_finished(&deployment.id, result.status.as_str(), cause.as_deref());
        self.cleanup().await;
        METRICS.flush();
        Ok(())
    }

    async fn publish(
        &self,
        deployment: &Deployment,
        status: JobStatus,
        details: BTreeMap<String, String>,
    ) -> Result<()> {
        self.ledger
            .publish(&deployment.id, deployment.deployment_type, status, details)
            .await?;
        Ok(())
    }

    /// Forget everything persisted for the finished deployment.
    async fn cleanup(&mut self) {
        if let Err(e) = self.resume.clear_token().await {
            warn!(error = %e, "unable to clear resume token");
        }
        if let Err(e) = self.sequencer.clear().await {
            warn!(error = %e, "unable to clear bootstrap plan");
        }
        for kind in [SnapshotKind::Target, SnapshotKind::Rollback] {
            if let Err(e) = self.snapshots.delete_snapshot(kind).await {
                warn!(kind = %kind, error = %e, "unable to delete snapshot");
            }
        }
    }
}

fn enter_stage(token: &mut ResumeToken, stage: DeploymentStage) {
    let from = token.stage();
    token.advance(stage);
    obs::emit_stage_changed(&token.deployment.id, from, stage);
}

fn no_state_change(cause: RolloutError) -> StageOutcome {
    warn!(error = %cause, "deployment failed before any lifecycle change");
    StageOutcome::Completed(DeploymentResult::failed(
        DeploymentStatus::FailedNoStateChange,
        cause,
    ))
}

fn unable_to_roll_back(cause: RolloutError) -> StageOutcome {
    error!(error = %cause, "deployment left in an unknown state");
    StageOutcome::Completed(DeploymentResult::failed(
        DeploymentStatus::FailedUnableToRollback,
        cause,
    ))
}
