//! Intake queue feeding the sequential deployment worker.

use std::collections::{HashSet, VecDeque};
use std::sync::{Mutex, PoisonError};

use rollout_state::{Deployment, DeploymentStage, DeploymentType};
use tokio::sync::Notify;
use tracing::debug;

/// The deployment the worker is processing right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveDeployment {
    pub id: String,
    pub deployment_type: DeploymentType,
    /// Stage the deployment was taken from the queue at
    pub stage: DeploymentStage,
}

impl ActiveDeployment {
    pub fn of(deployment: &Deployment) -> Self {
        Self {
            id: deployment.id.clone(),
            deployment_type: deployment.deployment_type,
            stage: deployment.stage,
        }
    }

    /// Only fresh deployments can be cancelled; resumed stages run to the end.
    pub fn is_cancellable(&self) -> bool {
        self.stage == DeploymentStage::Default
    }

    fn matches(&self, deployment: &Deployment) -> bool {
        self.id == deployment.id && self.deployment_type == deployment.deployment_type
    }
}

/// FIFO of pending deployments, keyed by `(id, type)`.
///
/// Offer rules for an entry already queued under the same key:
/// - a cancellation replaces it, unless the queued entry is a resumed
///   (non-`DEFAULT`) stage or already a cancellation. The replaced
///   deployment is remembered as withdrawn;
/// - a resumed stage replaces a queued `DEFAULT` entry;
/// - anything else is a duplicate and is rejected.
///
/// Replacements keep the queue position.
#[derive(Debug, Default)]
pub struct DeploymentQueue {
    entries: Mutex<VecDeque<Deployment>>,
    active: Mutex<Option<ActiveDeployment>>,
    withdrawn: Mutex<HashSet<(String, DeploymentType)>>,
    notify: Notify,
}

impl DeploymentQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, VecDeque<Deployment>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns whether the deployment was accepted.
    pub fn offer(&self, deployment: Deployment) -> bool {
        if !deployment.is_cancelled
            && deployment.stage == DeploymentStage::Default
            && self.active().is_some_and(|a| a.matches(&deployment))
        {
            debug!(deployment_id = %deployment.id, "deployment is already in progress");
            return false;
        }

        let accepted = {
            let mut entries = self.entries();
            match entries.iter().position(|queued| {
                queued.id == deployment.id && queued.deployment_type == deployment.deployment_type
            }) {
                None => {
                    entries.push_back(deployment);
                    true
                }
                Some(idx) => {
                    let queued = &entries[idx];
                    let replace = if deployment.is_cancelled {
                        !queued.is_cancelled && queued.stage == DeploymentStage::Default
                    } else {
                        deployment.stage != DeploymentStage::Default
                            && queued.stage == DeploymentStage::Default
                    };
                    if replace {
                        if deployment.is_cancelled {
                            self.withdrawn
                                .lock()
                                .unwrap_or_else(PoisonError::into_inner)
                                .insert((deployment.id.clone(), deployment.deployment_type));
                        }
                        entries[idx] = deployment;
                    }
                    replace
                }
            }
        };
        if accepted {
            self.notify.notify_one();
        }
        accepted
    }

    pub fn poll(&self) -> Option<Deployment> {
        self.entries().pop_front()
    }

    /// Wait for the next deployment.
    pub async fn next(&self) -> Deployment {
        loop {
            if let Some(deployment) = self.poll() {
                return deployment;
            }
            self.notify.notified().await;
        }
    }

    /// Resolve on the next accepted offer.
    pub async fn offered(&self) {
        self.notify.notified().await;
    }

    /// Pop a cancellation aimed at `active`.
    ///
    /// Cloud cancellations carry generated ids and only count at the head of
    /// the queue. Local cancellations name the deployment they cancel.
    pub fn take_cancellation(&self, active: &ActiveDeployment) -> Option<Deployment> {
        let mut entries = self.entries();
        let idx = match active.deployment_type {
            DeploymentType::CloudJob => entries
                .front()
                .is_some_and(|d| d.is_cancelled && d.deployment_type == DeploymentType::CloudJob)
                .then_some(0),
            DeploymentType::LocalRequest => entries
                .iter()
                .position(|d| d.is_cancelled && active.matches(d)),
        }?;
        entries.remove(idx)
    }

    /// Whether `cancellation` replaced a deployment that never started.
    /// Forgets the answer once asked.
    pub fn take_withdrawn(&self, cancellation: &Deployment) -> bool {
        self.withdrawn
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(cancellation.id.clone(), cancellation.deployment_type))
    }

    pub fn set_active(&self, active: ActiveDeployment) {
        *self.active.lock().unwrap_or_else(PoisonError::into_inner) = Some(active);
    }

    pub fn clear_active(&self) {
        *self.active.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn active(&self) -> Option<ActiveDeployment> {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Queued deployments, head first.
    pub fn snapshot(&self) -> Vec<Deployment> {
        self.entries().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn local(id: &str) -> Deployment {
        Deployment::new(id, DeploymentType::LocalRequest, "{}")
    }

    fn ids(queue: &DeploymentQueue) -> Vec<(String, DeploymentStage, bool)> {
        queue
            .snapshot()
            .into_iter()
            .map(|d| (d.id, d.stage, d.is_cancelled))
            .collect()
    }

    #[test]
    fn fifo_and_duplicates_rejected() {
        let q = DeploymentQueue::new();
        assert!(q.offer(local("1")));
        assert!(q.offer(local("2")));
        assert!(!q.offer(local("1")));
        assert_eq!(q.len(), 2);
        assert_eq!(q.poll().unwrap().id, "1");
        assert_eq!(q.poll().unwrap().id, "2");
        assert!(q.poll().is_none());
    }

    #[test]
    fn resumed_stage_replaces_default_in_place() {
        let q = DeploymentQueue::new();
        q.offer(local("1"));
        q.offer(local("2"));
        assert!(q.offer(local("1").at_stage(DeploymentStage::Bootstrap)));
        assert!(!q.offer(local("1").at_stage(DeploymentStage::KernelActivation)));
        assert_eq!(
            ids(&q),
            vec![
                ("1".to_string(), DeploymentStage::Bootstrap, false),
                ("2".to_string(), DeploymentStage::Default, false),
            ]
        );
    }

    #[test]
    fn cancellation_replaces_only_default_entries() {
        let q = DeploymentQueue::new();
        q.offer(local("1"));
        q.offer(local("2").at_stage(DeploymentStage::Bootstrap));
        assert!(q.offer(Deployment::cancellation("1", DeploymentType::LocalRequest)));
        assert!(!q.offer(Deployment::cancellation("2", DeploymentType::LocalRequest)));
        let snapshot = q.snapshot();
        assert!(snapshot[0].is_cancelled);
        assert!(!snapshot[1].is_cancelled);
    }

    #[test]
    fn same_id_of_another_type_is_distinct() {
        let q = DeploymentQueue::new();
        assert!(q.offer(local("1")));
        assert!(q.offer(Deployment::new("1", DeploymentType::CloudJob, "{}")));
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn active_deployment_is_not_queued_again() {
        let q = DeploymentQueue::new();
        let d = local("1");
        q.set_active(ActiveDeployment::of(&d));
        assert!(!q.offer(d.clone()));
        q.clear_active();
        assert!(q.offer(d));
    }

    #[test]
    fn cloud_cancellation_only_counts_at_the_head() {
        let q = DeploymentQueue::new();
        let running = ActiveDeployment::of(&Deployment::new("job", DeploymentType::CloudJob, "{}"));
        q.offer(local("other"));
        q.offer(Deployment::cancellation("c", DeploymentType::CloudJob));
        assert!(q.take_cancellation(&running).is_none());
        q.poll();
        assert!(q.take_cancellation(&running).is_some());
        assert!(q.is_empty());
    }

    #[test]
    fn local_cancellation_must_name_the_active_deployment() {
        let q = DeploymentQueue::new();
        let running = ActiveDeployment::of(&local("slow"));
        q.offer(Deployment::cancellation("unrelated", DeploymentType::LocalRequest));
        assert!(q.take_cancellation(&running).is_none());

        q.offer(Deployment::cancellation("slow", DeploymentType::LocalRequest));
        let taken = q.take_cancellation(&running).unwrap();
        assert_eq!(taken.id, "slow");
        assert_eq!(q.snapshot()[0].id, "unrelated");
    }

    #[test]
    fn replaced_queued_deployment_is_withdrawn_once() {
        let q = DeploymentQueue::new();
        q.offer(local("1"));
        assert!(q.offer(Deployment::cancellation("1", DeploymentType::LocalRequest)));
        assert!(!q.offer(Deployment::cancellation("1", DeploymentType::LocalRequest)));

        let cancel = q.poll().unwrap();
        assert!(q.take_withdrawn(&cancel));
        assert!(!q.take_withdrawn(&cancel));

        let bare = Deployment::cancellation("2", DeploymentType::LocalRequest);
        q.offer(bare.clone());
        assert!(!q.take_withdrawn(&bare));
    }

    #[tokio::test]
    async fn next_waits_for_an_offer() {
        let q = Arc::new(DeploymentQueue::new());
        let waiter = tokio::spawn({
            let q = q.clone();
            async move { q.next().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        q.offer(local("late"));
        let got = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.id, "late");
    }
}
