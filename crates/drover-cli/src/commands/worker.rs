//! `drover worker`: the worker entry point (spawned by the launcher).

use std::path::{Path, PathBuf};

use anyhow::Result;

use drover_core::config::DroverConfig;
use drover_core::worker::{WorkerArgs, WorkerProtocol};
use drover_state::store::default_state_dir;

pub async fn execute(
    repo: &Path,
    worker_id: u32,
    feature: &str,
    worktree: PathBuf,
    branch: &str,
) -> Result<()> {
    // The launcher exports the shared state directory; fall back to the
    // repo-relative default when started by hand.
    let state_dir = std::env::var("DROVER_STATE_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| default_state_dir(repo));
    let repo_path = std::env::var("DROVER_REPO_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| repo.to_path_buf());

    let config = DroverConfig::load(&repo_path)?;
    let args = WorkerArgs {
        worker_id,
        feature: feature.to_string(),
        worktree,
        branch: branch.to_string(),
        state_dir,
    };

    let protocol = WorkerProtocol::new(args, config)?;
    match protocol.run().await {
        Ok(exit) => std::process::exit(exit.code()),
        Err(e) => {
            tracing::error!(worker_id, error = %e, "worker crashed");
            protocol.report_crashed(&e.to_string());
            std::process::exit(1);
        }
    }
}
