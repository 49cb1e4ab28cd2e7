//! Startup decisions driven by the persisted resume token.

use std::sync::Arc;

use rollout_state::{DeploymentStage, ResumeStore, ResumeToken, SnapshotKind, SnapshotStore};
use tracing::{info, warn};

use crate::domain::{Result, TargetConfig};

/// What the orchestrator launches with and which deployment it resumes.
#[derive(Debug, Clone)]
pub struct StartupPlan {
    pub token: Option<ResumeToken>,
    /// Snapshot the launch configuration was read from
    pub launch_kind: SnapshotKind,
    /// `None` on a device that never committed a configuration
    pub launch_config: Option<TargetConfig>,
}

impl StartupPlan {
    pub fn resumes(&self) -> bool {
        self.token.is_some()
    }
}

pub struct ResumeCoordinator {
    resume: Arc<dyn ResumeStore>,
    snapshots: Arc<dyn SnapshotStore>,
}

impl ResumeCoordinator {
    pub fn new(resume: Arc<dyn ResumeStore>, snapshots: Arc<dyn SnapshotStore>) -> Self {
        Self { resume, snapshots }
    }

    /// Snapshot to launch from for a deployment persisted at `stage`.
    pub fn launch_kind(stage: Option<DeploymentStage>) -> SnapshotKind {
        match stage {
            Some(DeploymentStage::KernelActivation) => SnapshotKind::Target,
            Some(DeploymentStage::KernelRollback) | Some(DeploymentStage::Bootstrap) => {
                SnapshotKind::Rollback
            }
            Some(DeploymentStage::Default) | None => SnapshotKind::Baseline,
        }
    }

    pub async fn load(&self) -> Result<StartupPlan> {
        let token = self.resume.load_token().await?;
        let mut launch_kind = Self::launch_kind(token.as_ref().map(ResumeToken::stage));

        let mut snapshot = self.snapshots.read_snapshot(launch_kind).await?;
        if snapshot.is_none() && launch_kind != SnapshotKind::Baseline {
            warn!(kind = %launch_kind, "launch snapshot missing, falling back to baseline");
            launch_kind = SnapshotKind::Baseline;
            snapshot = self.snapshots.read_snapshot(launch_kind).await?;
        }
        let launch_config = snapshot
            .map(|s| TargetConfig::from_payload(s.payload))
            .transpose()?;

        if let Some(token) = &token {
            info!(
                deployment_id = %token.deployment.id,
                stage = %token.stage(),
                launch = %launch_kind,
                "resuming persisted deployment"
            );
        }
        Ok(StartupPlan {
            token,
            launch_kind,
            launch_config,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ServiceConfig;
    use rollout_state::fakes::{MemoryResumeStore, MemorySnapshotStore};
    use rollout_state::{ConfigSnapshot, Deployment, DeploymentType};

    async fn write(store: &MemorySnapshotStore, kind: SnapshotKind, service: &str) {
        let target = TargetConfig::new().with_service(service, ServiceConfig::new("1.0.0"));
        let snapshot = ConfigSnapshot::new(kind, target.to_payload().unwrap()).unwrap();
        store.write_snapshot(&snapshot).await.unwrap();
    }

    fn token_at(stage: DeploymentStage) -> ResumeToken {
        let mut token =
            ResumeToken::new(Deployment::new("d1", DeploymentType::LocalRequest, "{}"));
        token.advance(stage);
        token
    }

    #[test]
    fn launch_kind_follows_stage() {
        assert_eq!(ResumeCoordinator::launch_kind(None), SnapshotKind::Baseline);
        assert_eq!(
            ResumeCoordinator::launch_kind(Some(DeploymentStage::KernelActivation)),
            SnapshotKind::Target
        );
        assert_eq!(
            ResumeCoordinator::launch_kind(Some(DeploymentStage::KernelRollback)),
            SnapshotKind::Rollback
        );
    }

    #[tokio::test]
    async fn rollback_stage_launches_the_rollback_snapshot() {
        let resume = Arc::new(MemoryResumeStore::new());
        let snapshots = Arc::new(MemorySnapshotStore::new());
        write(&snapshots, SnapshotKind::Baseline, "base").await;
        write(&snapshots, SnapshotKind::Rollback, "previous").await;
        resume
            .save_token(&token_at(DeploymentStage::KernelRollback))
            .await
            .unwrap();

        let plan = ResumeCoordinator::new(resume, snapshots).load().await.unwrap();
        assert!(plan.resumes());
        assert_eq!(plan.launch_kind, SnapshotKind::Rollback);
        assert!(plan.launch_config.unwrap().contains("previous"));
    }

    #[tokio::test]
    async fn missing_target_falls_back_to_baseline() {
        let resume = Arc::new(MemoryResumeStore::new());
        let snapshots = Arc::new(MemorySnapshotStore::new());
        write(&snapshots, SnapshotKind::Baseline, "base").await;
        resume
            .save_token(&token_at(DeploymentStage::KernelActivation))
            .await
            .unwrap();

        let plan = ResumeCoordinator::new(resume, snapshots).load().await.unwrap();
        assert_eq!(plan.launch_kind, SnapshotKind::Baseline);
        assert!(plan.launch_config.unwrap().contains("base"));
    }

    #[tokio::test]
    async fn fresh_device_has_nothing_to_launch() {
        let plan = ResumeCoordinator::new(
            Arc::new(MemoryResumeStore::new()),
            Arc::new(MemorySnapshotStore::new()),
        )
        .load()
        .await
        .unwrap();
        assert!(!plan.resumes());
        assert!(plan.launch_config.is_none());
    }
}
