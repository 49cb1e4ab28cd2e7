//! Bootstrap sequencer.
//!
//! Decides which services need their one-time bootstrap step for a target,
//! orders those steps by dependency and runs them one at a time. The plan is
//! persisted after every task so a restart (or device reboot) requested by a
//! step resumes at the first task that is still pending.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use rollout_state::{BootstrapTaskStatus, ExecutionStatus, ResumeStore};
use tracing::{debug, info};

use crate::domain::{BootstrapError, ServiceConfig, TargetConfig};
use crate::metrics::METRICS;
use crate::obs;
use crate::runtime::LifecycleRuntime;
use crate::service_graph::ServiceGraph;

/// Step finished; continue with the next task.
pub const BOOTSTRAP_NO_OP: i32 = 0;
/// Step finished; the orchestrator must restart before continuing.
pub const REQUEST_RESTART: i32 = 100;
/// Step finished; the device must reboot before continuing.
pub const REQUEST_REBOOT: i32 = 101;

/// Meaning of a bootstrap step's exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitAction {
    Continue,
    Restart,
    Reboot,
    Fail,
}

impl ExitAction {
    pub fn classify(exit_code: i32) -> Self {
        match exit_code {
            BOOTSTRAP_NO_OP => ExitAction::Continue,
            REQUEST_RESTART => ExitAction::Restart,
            REQUEST_REBOOT => ExitAction::Reboot,
            _ => ExitAction::Fail,
        }
    }

    pub fn requires_restart(&self) -> bool {
        matches!(self, ExitAction::Restart | ExitAction::Reboot)
    }
}

pub struct BootstrapSequencer {
    resume: Arc<dyn ResumeStore>,
    runtime: Arc<dyn LifecycleRuntime>,
    tasks: Vec<BootstrapTaskStatus>,
}

impl BootstrapSequencer {
    pub fn new(resume: Arc<dyn ResumeStore>, runtime: Arc<dyn LifecycleRuntime>) -> Self {
        Self {
            resume,
            runtime,
            tasks: Vec::new(),
        }
    }

    /// Whether `name` must run its bootstrap step before `proposed` can activate.
    ///
    /// Only services that define a step qualify. Among those, a new service,
    /// a version change or a different step body each require it.
    pub fn service_bootstrap_required(
        graph: &ServiceGraph,
        name: &str,
        proposed: &ServiceConfig,
    ) -> Result<bool, BootstrapError> {
        let Some(step) = proposed.bootstrap_step() else {
            return Ok(false);
        };
        let Some(installed) = graph.installed_config(name)? else {
            debug!(service = %name, "new service defines a bootstrap step");
            return Ok(true);
        };
        if installed.version != proposed.version {
            debug!(
                service = %name,
                from = %installed.version,
                to = %proposed.version,
                "version change requires bootstrap"
            );
            return Ok(true);
        }
        Ok(installed.bootstrap_step() != Some(step))
    }

    pub fn is_bootstrap_required(
        graph: &ServiceGraph,
        target: &TargetConfig,
    ) -> Result<bool, BootstrapError> {
        for (name, config) in &target.services {
            if Self::service_bootstrap_required(graph, name, config)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Services needing bootstrap, each after its in-plan dependencies.
    ///
    /// Dependencies that do not need bootstrap are not inserted. Ties are
    /// broken by target order so the plan is deterministic.
    pub fn plan_bootstrap(
        graph: &ServiceGraph,
        target: &TargetConfig,
    ) -> Result<Vec<BootstrapTaskStatus>, BootstrapError> {
        let mut subset: Vec<&str> = Vec::new();
        for (name, config) in &target.services {
            if Self::service_bootstrap_required(graph, name, config)? {
                subset.push(name);
            }
        }
        let members: HashSet<&str> = subset.iter().copied().collect();

        let mut in_degree: HashMap<&str, usize> = subset.iter().map(|n| (*n, 0)).collect();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for &name in &subset {
            let config = target
                .get(name)
                .ok_or_else(|| BootstrapError::UnknownService {
                    service: name.to_string(),
                })?;
            let mut seen = HashSet::new();
            for dep in &config.dependencies {
                let dep = dep.name.as_str();
                if dep != name && members.contains(dep) && seen.insert(dep) {
                    dependents.entry(dep).or_default().push(name);
                    *in_degree.entry(name).or_default() += 1;
                }
            }
        }

        let mut ready: VecDeque<&str> = subset
            .iter()
            .copied()
            .filter(|n| in_degree[n] == 0)
            .collect();
        let mut ordered = Vec::with_capacity(subset.len());
        while let Some(name) = ready.pop_front() {
            ordered.push(BootstrapTaskStatus::pending(name));
            for &dependent in dependents.get(name).into_iter().flatten() {
                if let Some(degree) = in_degree.get_mut(dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push_back(dependent);
                    }
                }
            }
        }

        if ordered.len() != subset.len() {
            let placed: HashSet<&str> = ordered.iter().map(|t| t.service_name.as_str()).collect();
            let services = subset
                .iter()
                .filter(|n| !placed.contains(*n))
                .map(|n| n.to_string())
                .collect();
            return Err(BootstrapError::DependencyCycle { services });
        }
        Ok(ordered)
    }

    /// Make the plan for `target` current and persist it.
    ///
    /// A persisted plan with finished tasks is resumed as is and never
    /// recomputed.
    pub async fn prepare(
        &mut self,
        graph: &ServiceGraph,
        target: &TargetConfig,
    ) -> Result<&[BootstrapTaskStatus], BootstrapError> {
        let persisted = self.resume.load_bootstrap_tasks().await?;
        if persisted
            .iter()
            .any(|t| t.execution_status == ExecutionStatus::Done)
        {
            debug!(tasks = persisted.len(), "resuming persisted bootstrap plan");
            self.tasks = persisted;
            return Ok(&self.tasks);
        }

        self.tasks = Self::plan_bootstrap(graph, target)?;
        self.resume.save_bootstrap_tasks(&self.tasks).await?;
        info!(
            plan = ?self.tasks.iter().map(|t| t.service_name.as_str()).collect::<Vec<_>>(),
            "bootstrap plan computed"
        );
        Ok(&self.tasks)
    }

    /// Load the persisted plan after a restart. Returns whether work remains.
    pub async fn load(&mut self) -> Result<bool, BootstrapError> {
        self.tasks = self.resume.load_bootstrap_tasks().await?;
        Ok(self.has_next())
    }

    /// Run pending tasks in plan order.
    ///
    /// Returns [`BOOTSTRAP_NO_OP`] once every task has finished, or the exit
    /// code of the first task that asked for a restart or reboot. Any other
    /// non-zero exit code aborts the plan.
    pub async fn run_pending(&mut self, target: &TargetConfig) -> Result<i32, BootstrapError> {
        while let Some(idx) = self.tasks.iter().position(BootstrapTaskStatus::is_pending) {
            let name = self.tasks[idx].service_name.clone();
            let config = target
                .get(&name)
                .ok_or_else(|| BootstrapError::UnknownService {
                    service: name.clone(),
                })?;

            debug!(service = %name, "running bootstrap step");
            let exit_code = self.runtime.run_bootstrap(&name, config).await?;

            let task = &mut self.tasks[idx];
            task.execution_status = ExecutionStatus::Done;
            task.exit_code = Some(exit_code);
            self.resume.save_bootstrap_tasks(&self.tasks).await?;
            METRICS.inc_bootstrap_tasks_run();
            obs::emit_bootstrap_task_finished(&name, exit_code);

            match ExitAction::classify(exit_code) {
                ExitAction::Continue => {}
                ExitAction::Restart | ExitAction::Reboot => return Ok(exit_code),
                ExitAction::Fail => {
                    return Err(BootstrapError::TaskFailed {
                        service: name,
                        exit_code,
                    })
                }
            }
        }
        Ok(BOOTSTRAP_NO_OP)
    }

    pub fn has_next(&self) -> bool {
        self.tasks.iter().any(BootstrapTaskStatus::is_pending)
    }

    pub fn tasks(&self) -> &[BootstrapTaskStatus] {
        &self.tasks
    }

    /// Exit code of the most recently finished task, if any.
    pub fn last_exit_code(&self) -> Option<i32> {
        self.tasks
            .iter()
            .rev()
            .find(|t| t.execution_status == ExecutionStatus::Done)
            .and_then(|t| t.exit_code)
    }

    /// Drop the plan, in memory and persisted.
    pub async fn clear(&mut self) -> Result<(), BootstrapError> {
        self.tasks.clear();
        self.resume.clear_bootstrap_tasks().await?;
        Ok(())
    }
}
