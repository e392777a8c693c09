mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "drover", about = "Parallel coding-agent orchestrator")]
struct Cli {
    /// Repository to operate on (defaults to the current directory)
    #[arg(long, global = true)]
    repo: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a feature's task graph to completion
    Run {
        /// Feature name
        feature: String,
        /// Task graph file (defaults to .drover/tasks/<feature>.json)
        #[arg(long)]
        graph: Option<PathBuf>,
        /// Worker pool size override
        #[arg(long)]
        workers: Option<u32>,
        /// Skip quality gates during merges
        #[arg(long)]
        skip_gates: bool,
        /// Skip pre-flight checks
        #[arg(long)]
        skip_preflight: bool,
    },
    /// Simulate a run without executing tasks
    DryRun {
        /// Feature name
        feature: String,
        /// Task graph file (defaults to .drover/tasks/<feature>.json)
        #[arg(long)]
        graph: Option<PathBuf>,
        /// Worker pool size override
        #[arg(long)]
        workers: Option<u32>,
        /// Actually execute the quality gates
        #[arg(long)]
        run_gates: bool,
    },
    /// Run the pre-flight environment checks
    Preflight {
        /// Worker pool size to check for
        #[arg(long)]
        workers: Option<u32>,
    },
    /// Show a feature's execution state
    Status {
        /// Feature name
        feature: String,
    },
    /// Diagnose an error or a failed feature
    Debug {
        /// Error text to analyze
        #[arg(long)]
        error: Option<String>,
        /// Feature whose state should inform the diagnosis
        #[arg(long)]
        feature: Option<String>,
        /// Run test commands for the top hypotheses
        #[arg(long)]
        auto_test: bool,
    },
    /// Remove a feature's worktrees, branches, and state
    Cleanup {
        /// Feature name
        feature: String,
        /// Only remove worktrees
        #[arg(long)]
        worktrees: bool,
    },
    /// Worker entry point (spawned by the orchestrator, not by hand)
    #[command(hide = true)]
    Worker {
        #[arg(long)]
        worker_id: u32,
        #[arg(long)]
        feature: String,
        #[arg(long)]
        worktree: PathBuf,
        #[arg(long)]
        branch: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let repo = match cli.repo {
        Some(path) => path,
        None => std::env::current_dir()?,
    };

    match cli.command {
        Commands::Run {
            feature,
            graph,
            workers,
            skip_gates,
            skip_preflight,
        } => commands::run::execute(&repo, &feature, graph, workers, skip_gates, skip_preflight).await,
        Commands::DryRun {
            feature,
            graph,
            workers,
            run_gates,
        } => commands::dryrun::execute(&repo, &feature, graph, workers, run_gates).await,
        Commands::Preflight { workers } => commands::preflight::execute(&repo, workers),
        Commands::Status { feature } => commands::status::execute(&repo, &feature),
        Commands::Debug {
            error,
            feature,
            auto_test,
        } => commands::debug::execute(&repo, error, feature, auto_test).await,
        Commands::Cleanup { feature, worktrees } => {
            commands::cleanup::execute(&repo, &feature, worktrees)
        }
        Commands::Worker {
            worker_id,
            feature,
            worktree,
            branch,
        } => commands::worker::execute(&repo, worker_id, &feature, worktree, &branch).await,
    }
}
