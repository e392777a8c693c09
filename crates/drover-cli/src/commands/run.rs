//! `drover run`: orchestrate a feature to completion.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio_util::sync::CancellationToken;

use drover_core::config::{DroverConfig, LauncherKind};
use drover_core::git::GitOps;
use drover_core::launcher::{ContainerLauncher, Launcher, LauncherSettings, SubprocessLauncher};
use drover_core::merge::MergeCoordinator;
use drover_core::orchestrator::{Orchestrator, OrchestratorResult};
use drover_core::preflight::PreflightChecker;
use drover_core::worktree::WorktreeManager;
use drover_state::graph::TaskGraph;
use drover_state::store::{default_state_dir, StateStore};

use super::default_graph_path;

pub async fn execute(
    repo: &Path,
    feature: &str,
    graph: Option<PathBuf>,
    workers: Option<u32>,
    skip_gates: bool,
    skip_preflight: bool,
) -> Result<()> {
    let mut config = DroverConfig::load(repo)?;
    if let Some(workers) = workers {
        config.workers.max_concurrent = workers;
        config.validate()?;
    }
    if skip_gates {
        config.merge.skip_gates = true;
    }

    let graph_file = graph.unwrap_or_else(|| default_graph_path(repo, feature));
    let graph = TaskGraph::from_file(&graph_file)
        .with_context(|| format!("failed to load task graph {}", graph_file.display()))?;
    if graph.feature_name() != feature {
        bail!(
            "task graph is for feature {:?}, not {feature:?}",
            graph.feature_name()
        );
    }

    if !skip_preflight {
        let report =
            PreflightChecker::new(repo, &config, config.workers.max_concurrent).run_all();
        print!("{report}");
        if !report.passed() {
            bail!("pre-flight checks failed");
        }
    }

    let state_dir = default_state_dir(repo);
    let store = StateStore::new(feature, &state_dir);
    let settings = LauncherSettings {
        repo_path: repo.to_path_buf(),
        state_dir: state_dir.clone(),
        log_dir: Some(repo.join(&config.logging.directory).join("workers")),
        stall_timeout: Duration::from_secs(config.heartbeat.stall_timeout_seconds),
        env_vars: BTreeMap::new(),
    };
    let launcher: Arc<dyn Launcher> = match config.workers.launcher {
        LauncherKind::Subprocess => Arc::new(SubprocessLauncher::new(settings)),
        LauncherKind::Container => Arc::new(ContainerLauncher::new(
            settings,
            config.container.clone(),
            config.resources.clone(),
        )),
    };

    let worktrees = WorktreeManager::new(repo, None)?;
    let merge = MergeCoordinator::new(
        feature,
        GitOps::new(repo),
        config.quality_gates.clone(),
        config.merge.clone(),
    );

    let cancel = CancellationToken::new();
    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, stopping");
            ctrl_c_cancel.cancel();
        }
    });

    let mut orchestrator =
        Orchestrator::new(graph, config, store, launcher, worktrees, merge, cancel);

    match orchestrator.run().await? {
        OrchestratorResult::Completed => {
            println!("feature {feature} completed");
            Ok(())
        }
        OrchestratorResult::Failed { failed_tasks } => {
            bail!("feature {feature} failed: tasks {}", failed_tasks.join(", "))
        }
        OrchestratorResult::MergeFailed { level, error } => {
            bail!("feature {feature} level {level} merge failed: {error}")
        }
        OrchestratorResult::Interrupted => bail!("feature {feature} interrupted"),
    }
}
