//! Structured observability hooks for deployment lifecycle events.
//!
//! This module provides:
//! - Deployment-scoped tracing spans via the `DeploymentSpan` RAII guard
//! - Emission functions for key lifecycle events, each carrying a stable
//!   `event` field so log pipelines can filter on it

use rollout_state::{DeploymentStage, DeploymentType};
use tracing::{info, warn};

/// RAII guard that enters a deployment-scoped span.
///
/// Only for synchronous sections; async code should use
/// [`deployment_span`] with `Instrument`.
pub struct DeploymentSpan {
    _span: tracing::span::EnteredSpan,
}

impl DeploymentSpan {
    pub fn enter(deployment_id: &str) -> Self {
        Self {
            _span: deployment_span(deployment_id).entered(),
        }
    }
}

/// Span tagged with the deployment id.
pub fn deployment_span(deployment_id: &str) -> tracing::Span {
    tracing::info_span!("rollout.deployment", deployment_id = %deployment_id)
}

pub fn emit_deployment_started(deployment_id: &str, deployment_type: DeploymentType) {
    info!(
        event = "deployment.started",
        deployment_id = %deployment_id,
        deployment_type = %deployment_type,
    );
}

pub fn emit_stage_changed(deployment_id: &str, from: DeploymentStage, to: DeploymentStage) {
    info!(
        event = "deployment.stage_changed",
        deployment_id = %deployment_id,
        from = %from,
        to = %to,
    );
}

/// Emit event: deployment reached a terminal status.
pub fn emit_deployment_finished(deployment_id: &str, status: &str, cause: Option<&str>) {
    info!(
        event = "deployment.finished",
        deployment_id = %deployment_id,
        status = %status,
        cause = cause.unwrap_or(""),
    );
}

pub fn emit_deployment_cancelled(deployment_id: &str, after_merge: bool) {
    info!(
        event = "deployment.cancelled",
        deployment_id = %deployment_id,
        after_merge = after_merge,
    );
}

pub fn emit_bootstrap_task_finished(service: &str, exit_code: i32) {
    info!(event = "bootstrap.task_finished", service = %service, exit_code = exit_code);
}

/// Emit event: a removed service did not close cleanly (warning level).
pub fn emit_service_close_failed(service: &str, error: &dyn std::fmt::Display) {
    warn!(event = "service.close_failed", service = %service, error = %error);
}

/// Emit event: a status record stays persisted for a later republish.
pub fn emit_status_delivery_deferred(deployment_id: &str, seq: u64, reason: &str) {
    warn!(
        event = "status.delivery_deferred",
        deployment_id = %deployment_id,
        seq = seq,
        reason = %reason,
    );
}

pub fn emit_job_rejected(job_id: &str, reason: &str) {
    info!(event = "job.rejected", job_id = %job_id, reason = %reason);
}
