//! Rollout-Core: deployment engine for edge service rollouts
//!
//! Computes what a deployment changes, runs one-time bootstrap steps,
//! activates the merged configuration, rolls back across a restart when a
//! service breaks, and reports every status exactly once per consumer
//! acknowledgement.

pub mod activation;
pub mod bootstrap;
pub mod cancel;
pub mod change_set;
pub mod config;
pub mod domain;
pub mod fakes;
pub mod health;
pub mod job_intake;
pub mod local_api;
pub mod metrics;
pub mod obs;
pub mod queue;
pub mod resume;
pub mod runtime;
pub mod service_graph;
pub mod status_ledger;
pub mod telemetry;
pub mod worker;

pub use activation::{ActivationStateMachine, StageOutcome, MAX_COMMIT_RETRIES};
pub use bootstrap::{
    BootstrapSequencer, ExitAction, BOOTSTRAP_NO_OP, REQUEST_REBOOT, REQUEST_RESTART,
};
pub use cancel::{cancel_pair, CancelHandle, CancelSignal};
pub use change_set::ChangeSet;
pub use config::{BackendKind, RolloutConfig};
pub use domain::{
    ConfigError, DeploymentResult, DeploymentStatus, FailureHandlingPolicy, ManagedService,
    Result, RolloutError, ServiceConfig, ServiceState, TargetConfig,
};
pub use health::HealthWatch;
pub use job_intake::{JobIntake, JobStatusForwarder, JobsChanged, LatestQueuedJobs};
pub use local_api::{LocalDeploymentApi, LocalStatusBoard};
pub use queue::{ActiveDeployment, DeploymentQueue};
pub use resume::{ResumeCoordinator, StartupPlan};
pub use runtime::{
    JobSource, JsonDocumentResolver, LifecycleRuntime, Resolver, RestartController, RestartReason,
};
pub use service_graph::ServiceGraph;
pub use status_ledger::{DeploymentStatusLedger, StatusConsumer, StatusDetails};
pub use worker::{DeploymentWorker, WorkerDeps};
