//! arbor - worker entry point.
//!
//! Enqueues runs, processes job payloads and prints run event streams.

use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use arbor::agents::{JobBudgets, JobPayload, RunController};
use arbor::config::Config;
use arbor::llm::OpenRouterClient;
use arbor::store::{enqueue_run, NewRun, RunScope, SqliteStore, Store};
use arbor::tools::{ContextType, DomainStore};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "arbor", about = "Recursive agent orchestration worker")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a queued run with its root node and print the job payload
    Enqueue {
        #[arg(long)]
        actor: Uuid,
        /// Workspace project; a new one owned by the actor is created when omitted
        #[arg(long)]
        workspace: Option<Uuid>,
        #[arg(long)]
        objective: String,
        #[arg(long)]
        budget_ms: Option<u64>,
        /// Run in the context of this project instead of globally
        #[arg(long)]
        context_project: Option<Uuid>,
    },
    /// Process a job payload (file path, or `-` for stdin)
    Process { job: PathBuf },
    /// Print the event stream of a run as JSON lines
    Events { run_id: Uuid },
}

fn main() -> anyhow::Result<()> {
    // Node recursion nests boxed futures; the default 2 MB worker stack is too small.
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_stack_size(16 * 1024 * 1024)
        .build()?;
    runtime.block_on(async_main())
}

async fn async_main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "arbor=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;
    let store = Arc::new(
        SqliteStore::open(&config.database_path)
            .await
            .with_context(|| format!("opening {}", config.database_path.display()))?,
    );
    info!(
        path = %config.database_path.display(),
        persistent = store.is_persistent(),
        "Store opened"
    );

    match cli.command {
        Command::Enqueue {
            actor,
            workspace,
            objective,
            budget_ms,
            context_project,
        } => {
            let workspace_id = match workspace {
                Some(id) => id,
                None => store.create_project(actor, "Workspace", None).await?.id,
            };
            let (run, root) = enqueue_run(
                store.as_ref(),
                NewRun {
                    actor_id: actor,
                    objective,
                    workspace_id,
                    scope: RunScope::Global,
                },
            )
            .await?;
            let job = JobPayload {
                run_id: run.id,
                root_node_id: root.id,
                workspace_project_id: workspace_id,
                budgets: JobBudgets {
                    max_wall_clock_ms: budget_ms,
                },
                context_type: context_project.map(|_| ContextType::Project),
                context_project_id: context_project,
            };
            info!(run_id = %run.id, "Run enqueued");
            println!("{}", serde_json::to_string_pretty(&job)?);
        }
        Command::Process { job } => {
            let raw = if job.as_os_str() == "-" {
                let mut buf = String::new();
                std::io::stdin().read_to_string(&mut buf)?;
                buf
            } else {
                std::fs::read_to_string(&job)
                    .with_context(|| format!("reading {}", job.display()))?
            };
            let job: JobPayload = serde_json::from_str(&raw).context("parsing job payload")?;

            let llm = Arc::new(OpenRouterClient::new(
                config.require_api_key()?.to_string(),
                config.models.clone(),
            ));
            let controller = RunController::new(
                store.clone(),
                store.clone(),
                llm,
                config.orchestrator.clone(),
            );

            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupt received, canceling run");
                    on_signal.cancel();
                }
            });

            let outcome = controller.process_job_with_cancel(&job, cancel).await;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            if !outcome.success {
                std::process::exit(1);
            }
        }
        Command::Events { run_id } => {
            for event in store.list_events(run_id).await? {
                println!("{}", serde_json::to_string(&event)?);
            }
        }
    }

    Ok(())
}
