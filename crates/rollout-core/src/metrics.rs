//! Global atomic counters for rollout observability.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event (e.g. after every finished deployment).

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lock-free atomic counters.
pub struct Metrics {
    deployments_started: AtomicU64,
    deployments_succeeded: AtomicU64,
    deployments_failed: AtomicU64,
    rollbacks_requested: AtomicU64,
    bootstrap_tasks_run: AtomicU64,
    statuses_retained: AtomicU64,
    jobs_rejected: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            deployments_started: AtomicU64::new(0),
            deployments_succeeded: AtomicU64::new(0),
            deployments_failed: AtomicU64::new(0),
            rollbacks_requested: AtomicU64::new(0),
            bootstrap_tasks_run: AtomicU64::new(0),
            statuses_retained: AtomicU64::new(0),
            jobs_rejected: AtomicU64::new(0),
        }
    }

    fn bump(counter: &AtomicU64, name: &'static str) {
        counter.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = name, "counter incremented");
    }

    pub fn inc_deployments_started(&self) {
        Self::bump(&self.deployments_started, "deployments_started");
    }

    pub fn inc_deployments_succeeded(&self) {
        Self::bump(&self.deployments_succeeded, "deployments_succeeded");
    }

    /// Counts every non-successful terminal status, cancellations included.
    pub fn inc_deployments_failed(&self) {
        Self::bump(&self.deployments_failed, "deployments_failed");
    }

    pub fn inc_rollbacks_requested(&self) {
        Self::bump(&self.rollbacks_requested, "rollbacks_requested");
    }

    pub fn inc_bootstrap_tasks_run(&self) {
        Self::bump(&self.bootstrap_tasks_run, "bootstrap_tasks_run");
    }

    /// A published status stayed persisted because its consumer did not accept it.
    pub fn inc_statuses_retained(&self) {
        Self::bump(&self.statuses_retained, "statuses_retained");
    }

    pub fn inc_jobs_rejected(&self) {
        Self::bump(&self.jobs_rejected, "jobs_rejected");
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            deployments_started = self.deployments_started(),
            deployments_succeeded = self.deployments_succeeded(),
            deployments_failed = self.deployments_failed(),
            rollbacks_requested = self.rollbacks_requested(),
            bootstrap_tasks_run = self.bootstrap_tasks_run(),
            statuses_retained = self.statuses_retained(),
            jobs_rejected = self.jobs_rejected(),
        );
    }

    pub fn deployments_started(&self) -> u64 {
        self.deployments_started.load(Ordering::Relaxed)
    }

    pub fn deployments_succeeded(&self) -> u64 {
        self.deployments_succeeded.load(Ordering::Relaxed)
    }

    pub fn deployments_failed(&self) -> u64 {
        self.deployments_failed.load(Ordering::Relaxed)
    }

    pub fn rollbacks_requested(&self) -> u64 {
        self.rollbacks_requested.load(Ordering::Relaxed)
    }

    pub fn bootstrap_tasks_run(&self) -> u64 {
        self.bootstrap_tasks_run.load(Ordering::Relaxed)
    }

    pub fn statuses_retained(&self) -> u64 {
        self.statuses_retained.load(Ordering::Relaxed)
    }

    pub fn jobs_rejected(&self) -> u64 {
        self.jobs_rejected.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        for counter in [
            &self.deployments_started,
            &self.deployments_succeeded,
            &self.deployments_failed,
            &self.rollbacks_requested,
            &self.bootstrap_tasks_run,
            &self.statuses_retained,
            &self.jobs_rejected,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_increment() {
        let m = Metrics::new();
        m.inc_deployments_started();
        m.inc_deployments_started();
        m.inc_rollbacks_requested();
        m.inc_jobs_rejected();
        assert_eq!(m.deployments_started(), 2);
        assert_eq!(m.rollbacks_requested(), 1);
        assert_eq!(m.jobs_rejected(), 1);
        assert_eq!(m.deployments_failed(), 0);
    }

    #[test]
    fn reset_zeroes_all() {
        let m = Metrics::new();
        m.inc_deployments_succeeded();
        m.inc_bootstrap_tasks_run();
        m.inc_statuses_retained();
        m.reset();
        assert_eq!(m.deployments_succeeded(), 0);
        assert_eq!(m.bootstrap_tasks_run(), 0);
        assert_eq!(m.statuses_retained(), 0);
    }
}
