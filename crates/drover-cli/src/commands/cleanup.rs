//! `drover cleanup`: remove a feature's worktrees, branches, and state.

use std::path::Path;

use anyhow::Result;

use drover_core::git::GitOps;
use drover_core::worktree::WorktreeManager;
use drover_state::heartbeat::HeartbeatMonitor;
use drover_state::store::{default_state_dir, StateStore};

pub fn execute(repo: &Path, feature: &str, worktrees_only: bool) -> Result<()> {
    let worktrees = WorktreeManager::new(repo, None)?;
    let removed = worktrees.delete_all(feature)?;
    worktrees.prune()?;
    println!("removed {removed} worktrees");

    if worktrees_only {
        return Ok(());
    }

    let deleted = GitOps::new(repo).delete_feature_branches(feature, true)?;
    println!("deleted {deleted} branches");

    let store = StateStore::new(feature, default_state_dir(repo));
    HeartbeatMonitor::new(store.heartbeat_dir()).clear_all();
    store.delete()?;
    println!("removed feature state");
    Ok(())
}
