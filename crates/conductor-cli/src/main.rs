use clap::{Parser, Subcommand};
use conductor_channels::MessageBus;
use conductor_core::{channels, Message, SystemClock, TaskState};
use conductor_orchestrator::{ConductorConfig, WorkflowHost};
use conductor_session::{recover, FileWorkflowStore, WorkflowStore};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "conductor", about = "Conductor — multi-agent workflow coordinator")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "conductor.toml")]
    config: PathBuf,

    /// Data directory (overrides config)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Recover every stored workflow and coordinate until interrupted
    Serve {
        /// Workflows to open even if nothing is stored for them yet
        #[arg(short, long)]
        workflow: Vec<String>,
    },
    /// List stored workflows
    List,
    /// Rebuild a workflow from disk and print its state
    Inspect {
        workflow: String,
        /// Print the full state as JSON
        #[arg(long)]
        json: bool,
    },
}

async fn load_config(path: &Path) -> anyhow::Result<ConductorConfig> {
    match tokio::fs::read_to_string(path).await {
        Ok(raw) => Ok(ConductorConfig::from_toml(&raw)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!(path = %path.display(), "No config file, using defaults");
            Ok(ConductorConfig::default())
        }
        Err(e) => Err(anyhow::anyhow!(
            "Failed to read config file '{}': {}",
            path.display(),
            e
        )),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let cli = Cli::parse();

    let mut config = load_config(&cli.config).await?;
    if let Some(dir) = cli.data_dir {
        config.persistence.data_dir = dir;
    }
    config.validate()?;

    let store = Arc::new(FileWorkflowStore::new(config.persistence.data_dir.clone()).await?);

    match cli.command {
        Commands::Serve { workflow } => {
            let bus = Arc::new(MessageBus::new());
            if let Some(mut alerts) = bus.listen(channels::OPERATOR_ALERTS, "cli/alerts") {
                tokio::spawn(async move {
                    while let Some(envelope) = alerts.recv().await {
                        if let Message::OperatorAlert {
                            workflow_id,
                            message,
                        } = envelope.message
                        {
                            error!(workflow_id = %workflow_id, alert = %message, "Operator alert");
                        }
                    }
                });
            }

            let host = WorkflowHost::new(config, store, bus, Arc::new(SystemClock));
            let outcome = host.recover_all().await?;
            for (workflow_id, reason) in &outcome.failed {
                error!(workflow_id = %workflow_id, reason = %reason, "Workflow left offline");
            }
            for workflow_id in &workflow {
                host.open(workflow_id).await?;
            }
            host.start();
            info!(workflows = ?host.workflow_ids(), "Conductor running");

            tokio::signal::ctrl_c().await?;
            info!("Shutting down");
            host.shutdown().await;
        }
        Commands::List => {
            let workflows = store.list_workflows().await?;
            if workflows.is_empty() {
                println!("No workflows stored in {}", config.persistence.data_dir.display());
            }
            for workflow_id in workflows {
                let versions = store.snapshot_versions(&workflow_id).await?;
                match versions.last() {
                    Some(v) => println!("{workflow_id}  (latest snapshot v{v})"),
                    None => println!("{workflow_id}  (no snapshot)"),
                }
            }
        }
        Commands::Inspect { workflow, json } => {
            let recovered = recover(
                store.as_ref(),
                &workflow,
                config.coordination.max_agent_load,
            )
            .await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&recovered.state)?);
                return Ok(());
            }

            let report = &recovered.report;
            println!("Workflow {workflow}");
            match report.snapshot_version {
                Some(v) => println!("  snapshot: v{v}"),
                None => println!("  snapshot: none"),
            }
            println!(
                "  log: {} replayed, {} duplicate(s), last seq {}",
                report.replayed, report.skipped_duplicates, report.last_seq
            );
            for gap in &report.gaps {
                println!("  gap after seq {}: {}", gap.after_seq, gap.detail);
            }

            let mut by_state: BTreeMap<String, usize> = BTreeMap::new();
            for task in recovered.state.tasks.values() {
                *by_state.entry(task.state.to_string()).or_default() += 1;
            }
            println!("  tasks: {}", recovered.state.tasks.len());
            for (state, count) in &by_state {
                println!("    {state}: {count}");
            }
            println!("  agents: {}", recovered.state.agents.len());
            for agent in recovered.state.agents.values() {
                println!(
                    "    {}  {}  load {:.2}  tasks {}",
                    agent.id,
                    agent.status,
                    agent.load_factor,
                    agent.current_tasks.len()
                );
            }
            let failed = recovered
                .state
                .tasks
                .values()
                .filter(|t| t.state == TaskState::Failed);
            for task in failed {
                println!(
                    "  failed {}: {}",
                    task.id,
                    task.last_error.as_deref().unwrap_or("unknown")
                );
            }
        }
    }

    Ok(())
}
