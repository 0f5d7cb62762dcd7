use clap::{Parser, Subcommand};
use maestro_core::WorkflowId;
use maestro_orchestrator::{
    CheckpointStore, Dispatcher, EchoExecutor, OrchestratorConfig, TaskGraph, WorkflowReport,
    WorkflowSpec,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG: &str = "maestro.toml";

#[derive(Parser)]
#[command(name = "maestro", about = "Maestro: multi-agent task orchestration engine")]
struct Cli {
    /// Path to config file [default: maestro.toml, if present]
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a workflow definition and print its execution order
    Validate {
        /// Workflow file (.toml or .json)
        workflow: PathBuf,
    },
    /// Run a workflow with the echo executor and print the report
    Run {
        /// Workflow file (.toml or .json)
        workflow: PathBuf,
    },
    /// Resume a workflow from its last checkpoint
    Resume {
        /// Workflow id
        workflow_id: WorkflowId,
    },
    /// Inspect stored checkpoints
    Checkpoint {
        #[command(subcommand)]
        action: CheckpointAction,
    },
    /// Print the effective configuration
    Config,
}

#[derive(Subcommand)]
enum CheckpointAction {
    /// List workflows with a stored checkpoint
    List,
    /// Print a checkpoint as JSON
    Show { workflow_id: WorkflowId },
    /// Delete a checkpoint
    Ack { workflow_id: WorkflowId },
}

fn load_config(path: Option<&Path>) -> anyhow::Result<OrchestratorConfig> {
    let path = match path {
        Some(p) => p,
        None if Path::new(DEFAULT_CONFIG).exists() => Path::new(DEFAULT_CONFIG),
        None => return Ok(OrchestratorConfig::default()),
    };
    OrchestratorConfig::load(path).map_err(|e| anyhow::anyhow!("{e}"))
}

fn load_workflow(path: &Path) -> anyhow::Result<WorkflowSpec> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        anyhow::anyhow!("Failed to read workflow file '{}': {}", path.display(), e)
    })?;
    let spec = match path.extension().and_then(|e| e.to_str()) {
        Some("json") => serde_json::from_str(&content)?,
        _ => toml::from_str(&content)?,
    };
    Ok(spec)
}

fn print_report(report: &WorkflowReport) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(report)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .json()
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Validate { workflow } => {
            let spec = load_workflow(&workflow)?;
            let graph = TaskGraph::build(&spec)?;
            println!("Workflow '{}' is valid ({} tasks)", spec.name, graph.len());
            for (step, id) in graph.topological_order().iter().enumerate() {
                let agent = spec
                    .tasks
                    .iter()
                    .find(|t| &t.id == id)
                    .map_or("?", |t| t.agent_id.as_str());
                println!("  {:>3}. {id} [{agent}]", step + 1);
            }
        }
        Commands::Run { workflow } => {
            let spec = load_workflow(&workflow)?;
            let dispatcher = Dispatcher::from_config(config, Arc::new(EchoExecutor)).await?;
            let workflow_id = dispatcher.submit(spec).await?;
            info!(workflow_id = %workflow_id, "Running workflow");
            let report = dispatcher.run(workflow_id).await?;
            print_report(&report)?;
        }
        Commands::Resume { workflow_id } => {
            let dispatcher = Dispatcher::from_config(config, Arc::new(EchoExecutor)).await?;
            let report = dispatcher.resume(workflow_id).await?;
            print_report(&report)?;
        }
        Commands::Checkpoint { action } => {
            let store = CheckpointStore::from_config(&config.checkpoint).await?;
            match action {
                CheckpointAction::List => {
                    let ids = store.list().await?;
                    if ids.is_empty() {
                        println!("No checkpoints stored.");
                    }
                    for id in &ids {
                        let checkpoint = store.load(*id).await?;
                        println!(
                            "{}  v{}  {}  {}",
                            id, checkpoint.version, checkpoint.status, checkpoint.saved_at
                        );
                    }
                }
                CheckpointAction::Show { workflow_id } => {
                    let checkpoint = store.load(workflow_id).await?;
                    println!("{}", serde_json::to_string_pretty(&checkpoint)?);
                }
                CheckpointAction::Ack { workflow_id } => {
                    store.delete(workflow_id).await?;
                    println!("Checkpoint for {workflow_id} deleted");
                }
            }
        }
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
