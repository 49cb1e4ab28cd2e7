//! Rollout daemon
//!
//! Runs the deployment worker against shell-script services, resuming any
//! deployment left in flight by the previous process, and offers a few
//! read-only views of the persisted rollout state.
//!
//! ## Commands
//!
//! - `run`: launch services and process deployments until interrupted
//! - `status`: list status records not yet acknowledged
//! - `resume-token`: show the persisted in-flight deployment
//! - `plan`: diff two service name lists

mod restart;
mod script_runtime;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rollout_core::telemetry::{init_tracing, parse_level};
use rollout_core::{
    cancel_pair, BackendKind, ChangeSet, DeploymentQueue, DeploymentStatusLedger,
    DeploymentWorker, JsonDocumentResolver, LocalDeploymentApi, LocalStatusBoard,
    ResumeCoordinator, RolloutConfig, ServiceGraph, WorkerDeps,
};
use rollout_state::{
    DeploymentDirectory, DeploymentType, ResumeStore, SnapshotStore, StatusStore,
    SurrealRolloutStore,
};
use tracing::{info, warn, Level};

use crate::restart::{exit_code, ProcessRestartController};
use crate::script_runtime::ScriptRuntime;

#[derive(Parser)]
#[command(name = "rolloutd")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Edge rollout daemon", long_about = None)]
struct Cli {
    /// TOML configuration file (missing file means defaults)
    #[arg(short, long, global = true, default_value = "rollout.toml")]
    config: PathBuf,

    /// Override the state directory
    #[arg(long, global = true, env = "ROLLOUT_STATE_DIR")]
    state_dir: Option<PathBuf>,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Launch services and process deployments until interrupted
    Run {
        /// Deployment documents to submit as local requests at startup
        #[arg(long)]
        deploy: Vec<PathBuf>,
    },

    /// List status records waiting for acknowledgement
    Status,

    /// Show the persisted in-flight deployment, if any
    ResumeToken,

    /// Show what moving from one service set to another would change
    Plan {
        /// Comma-separated running services
        #[arg(long, value_delimiter = ',', default_value = "")]
        current: Vec<String>,

        /// Comma-separated target services
        #[arg(long, value_delimiter = ',', default_value = "")]
        target: Vec<String>,
    },
}

/// One backend seen through the three store traits.
struct Stores {
    status: Arc<dyn StatusStore>,
    resume: Arc<dyn ResumeStore>,
    snapshots: Arc<dyn SnapshotStore>,
}

impl Stores {
    fn of<S>(store: S) -> Self
    where
        S: StatusStore + ResumeStore + SnapshotStore + 'static,
    {
        let store = Arc::new(store);
        Self {
            status: store.clone(),
            resume: store.clone(),
            snapshots: store,
        }
    }

    async fn open(config: &RolloutConfig) -> Result<Self> {
        let stores = match config.backend {
            BackendKind::Directory => Self::of(
                DeploymentDirectory::open(&config.state_dir)
                    .context("Failed to open deployment directory")?,
            ),
            BackendKind::Surreal => Self::of(
                SurrealRolloutStore::open(config.state_dir.join("db"))
                    .await
                    .context("Failed to open rollout database")?,
            ),
        };
        Ok(stores)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.config, cli.state_dir.as_deref())?;

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        parse_level(&config.log_level).unwrap_or(Level::INFO)
    };
    init_tracing(cli.json || config.log_json, level);

    match cli.command {
        Commands::Run { deploy } => {
            if let Some(code) = cmd_run(&config, &deploy).await? {
                std::process::exit(code);
            }
            Ok(())
        }
        Commands::Status => cmd_status(&config).await,
        Commands::ResumeToken => cmd_resume_token(&config).await,
        Commands::Plan { current, target } => cmd_plan(&current, &target),
    }
}

/// File, then `ROLLOUT_*` environment, then command line.
fn load_config(path: &Path, state_dir: Option<&Path>) -> Result<RolloutConfig> {
    let mut config = RolloutConfig::load(path)
        .with_context(|| format!("Failed to load config {}", path.display()))?;
    config
        .apply_overrides(|key| std::env::var(key).ok())
        .context("Invalid ROLLOUT_* override")?;
    if let Some(dir) = state_dir {
        config.state_dir = dir.to_path_buf();
    }
    Ok(config)
}

/// Run the daemon. Returns the exit code when a restart was requested.
async fn cmd_run(config: &RolloutConfig, deploy: &[PathBuf]) -> Result<Option<i32>> {
    let stores = Stores::open(config).await?;
    let plan = ResumeCoordinator::new(stores.resume.clone(), stores.snapshots.clone())
        .load()
        .await
        .context("Failed to read resume state")?;

    let runtime = Arc::new(
        ScriptRuntime::new(config.state_dir.join("work"))
            .context("Failed to prepare service work directory")?,
    );
    let launch = plan.launch_config.clone().unwrap_or_default();
    let graph =
        ServiceGraph::launch(&launch, runtime.as_ref()).context("Failed to launch services")?;
    info!(services = graph.len(), launch = %plan.launch_kind, "services launched");
    graph.start_services();

    let queue = Arc::new(DeploymentQueue::new());
    let ledger = Arc::new(DeploymentStatusLedger::new(stores.status.clone()));
    let board = Arc::new(LocalStatusBoard::new());
    ledger.register(DeploymentType::LocalRequest, board.clone());
    match ledger.republish_pending(DeploymentType::LocalRequest).await {
        Ok(delivered) if delivered > 0 => info!(delivered, "delivered statuses from previous run"),
        Ok(_) => {}
        Err(e) => warn!(error = %e, "unable to republish pending statuses"),
    }

    let deps = WorkerDeps {
        runtime: runtime.clone(),
        resolver: Arc::new(JsonDocumentResolver::new()),
        queue: queue.clone(),
        ledger,
        resume: stores.resume.clone(),
        snapshots: stores.snapshots.clone(),
        restart: Arc::new(ProcessRestartController::new(runtime.clone())),
    };
    let mut worker = DeploymentWorker::new(graph, deps, config);

    let api = LocalDeploymentApi::new(queue, board);
    for path in deploy {
        let document = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let id = api
            .submit(&document)
            .with_context(|| format!("Failed to submit {}", path.display()))?;
        info!(deployment_id = %id, file = %path.display(), "queued local deployment");
    }

    if let Some(token) = plan.token {
        if let Some(reason) = worker.resume(token).await? {
            return Ok(Some(exit_code(reason)));
        }
    }

    let (stop, shutdown) = cancel_pair();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received");
        }
        stop.cancel();
    });

    let restart = worker.run(shutdown).await?;
    match restart {
        Some(reason) => Ok(Some(exit_code(reason))),
        None => {
            runtime.stop_all(config.shutdown_timeout()).await;
            Ok(None)
        }
    }
}

async fn cmd_status(config: &RolloutConfig) -> Result<()> {
    let stores = Stores::open(config).await?;
    let mut total = 0;
    for deployment_type in [DeploymentType::CloudJob, DeploymentType::LocalRequest] {
        for record in stores.status.pending(deployment_type).await? {
            let update = &record.update;
            println!(
                "{:>6}  {}  {}  {}",
                record.seq,
                deployment_type.as_str(),
                update.job_status.as_str(),
                update.deployment_id
            );
            for (key, value) in &update.status_details {
                println!("        {key}: {value}");
            }
            total += 1;
        }
    }
    if total == 0 {
        println!("No pending status records.");
    }
    Ok(())
}

async fn cmd_resume_token(config: &RolloutConfig) -> Result<()> {
    let stores = Stores::open(config).await?;
    match stores.resume.load_token().await? {
        Some(token) => println!("{}", serde_json::to_string_pretty(&token)?),
        None => println!("No deployment in flight."),
    }
    Ok(())
}

fn cmd_plan(current: &[String], target: &[String]) -> Result<()> {
    let named = |names: &[String]| -> Vec<String> {
        names
            .iter()
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .collect()
    };
    let changes = ChangeSet::from_names(named(current), named(target));
    println!("add:    {}", changes.to_add.join(", "));
    println!("remove: {}", changes.to_remove.join(", "));
    println!("update: {}", changes.to_update.join(", "));
    Ok(())
}
