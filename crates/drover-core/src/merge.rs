//! Per-level merge coordination.
//!
//! The coordinator owns the level integration flow: fresh staging branch
//! from the target, pre-merge gates, ordered no-ff merges of the worker
//! branches, post-merge gates, and finalization onto the target branch.
//! Any conflict aborts the staging merge and surfaces the conflicting
//! files; any gate failure stops the flow before the target branch moves.

use drover_state::error::{DroverError, Result};
use drover_state::models::MergeStatus;

use crate::config::{MergeConfig, QualityGate};
use crate::gates::{GateRunResult, GateRunner};
use crate::git::GitOps;

/// One worker branch's merge into staging.
#[derive(Debug, Clone)]
pub struct BranchMerge {
    pub branch: String,
    pub status: MergeStatus,
    pub commit: Option<String>,
}

/// Outcome of a full level merge flow.
#[derive(Debug, Clone)]
pub struct MergeFlowResult {
    pub success: bool,
    pub level: u32,
    pub source_branches: Vec<String>,
    pub target_branch: String,
    pub merge_commit: Option<String>,
    pub error: Option<String>,
    pub conflicts: Vec<String>,
}

impl MergeFlowResult {
    fn failure(level: u32, sources: &[String], target: &str, error: impl Into<String>) -> Self {
        Self {
            success: false,
            level,
            source_branches: sources.to_vec(),
            target_branch: target.to_string(),
            merge_commit: None,
            error: Some(error.into()),
            conflicts: Vec::new(),
        }
    }
}

/// Coordinates level merges for one feature.
pub struct MergeCoordinator {
    feature: String,
    git: GitOps,
    gates: Vec<QualityGate>,
    config: MergeConfig,
}

impl MergeCoordinator {
    pub fn new(
        feature: impl Into<String>,
        git: GitOps,
        gates: Vec<QualityGate>,
        config: MergeConfig,
    ) -> Self {
        Self {
            feature: feature.into(),
            git,
            gates,
            config,
        }
    }

    /// The gates that apply under the current skip flags.
    fn effective_gates(&self) -> Vec<QualityGate> {
        if self.config.skip_gates {
            return Vec::new();
        }
        let mut gates = self.gates.clone();
        if self.config.skip_tests {
            gates.retain(|g| !g.name.to_lowercase().contains("test"));
        }
        gates
    }

    /// Create a fresh staging branch for a level from the target branch.
    pub fn prepare_merge(&self, level: u32, target_branch: &str) -> Result<String> {
        tracing::info!(feature = %self.feature, level, target_branch, "preparing level merge");
        self.git.create_staging_branch(&self.feature, target_branch)
    }

    pub async fn run_pre_merge_gates(&self) -> (bool, Vec<GateRunResult>) {
        let gates = self.effective_gates();
        if gates.is_empty() {
            return (true, Vec::new());
        }
        let mut runner = GateRunner::new(gates);
        runner
            .run_all_gates(None, Some(self.git.repo_path()), true, false)
            .await
    }

    pub async fn run_post_merge_gates(&self) -> (bool, Vec<GateRunResult>) {
        // Same gate list; what changes is the tree they observe.
        self.run_pre_merge_gates().await
    }

    /// Merge worker branches into staging, in the supplied order.
    ///
    /// The first conflict aborts the in-progress merge (GitOps does that)
    /// and propagates as [`DroverError::MergeConflict`].
    pub fn execute_merge(
        &self,
        source_branches: &[String],
        staging_branch: &str,
    ) -> Result<Vec<BranchMerge>> {
        self.git.checkout(staging_branch)?;

        let mut merges = Vec::new();
        for branch in source_branches {
            let message = format!("merge {branch} into {staging_branch}");
            let commit = self.git.merge(branch, Some(&message), true)?;
            merges.push(BranchMerge {
                branch: branch.clone(),
                status: MergeStatus::Merged,
                commit: Some(commit),
            });
        }
        Ok(merges)
    }

    /// Merge staging into the target branch and return the merge commit.
    /// The caller's original branch is restored afterwards when it was
    /// neither staging nor the target.
    pub fn finalize(&self, staging_branch: &str, target_branch: &str) -> Result<String> {
        let original = self.git.current_branch()?;

        self.git.checkout(target_branch)?;
        let message = format!(
            "merge level staging for {feature} into {target_branch}",
            feature = self.feature
        );
        let commit = self.git.merge(staging_branch, Some(&message), true)?;

        if original != staging_branch && original != target_branch {
            self.git.checkout(&original)?;
        }
        Ok(commit)
    }

    /// Delete the staging branch if it exists. Idempotent.
    pub fn abort(&self, staging_branch: Option<&str>) -> Result<()> {
        let staging = match staging_branch {
            Some(name) => name.to_string(),
            None => crate::staging_branch(&self.feature),
        };
        if self.git.branch_exists(&staging)? {
            // Can't delete the checked-out branch; step off it first.
            if self.git.current_branch()? == staging {
                self.git.checkout(&self.config.target_branch)?;
            }
            self.git.delete_branch(&staging, true)?;
            tracing::info!(%staging, "aborted level merge, staging branch deleted");
        }
        Ok(())
    }

    /// The full level-merge flow. Never returns `Err`: every failure mode
    /// is folded into the result so the orchestrator has one shape to
    /// record.
    pub async fn full_merge_flow(
        &self,
        level: u32,
        worker_branches: &[String],
        target_branch: &str,
    ) -> MergeFlowResult {
        // Nothing to merge is success with no commit.
        if worker_branches.is_empty() {
            return MergeFlowResult {
                success: true,
                level,
                source_branches: Vec::new(),
                target_branch: target_branch.to_string(),
                merge_commit: None,
                error: None,
                conflicts: Vec::new(),
            };
        }

        let staging = match self.prepare_merge(level, target_branch) {
            Ok(staging) => staging,
            Err(e) => {
                return MergeFlowResult::failure(
                    level,
                    worker_branches,
                    target_branch,
                    format!("failed to prepare staging branch: {e}"),
                );
            }
        };

        let (pre_ok, _) = self.run_pre_merge_gates().await;
        if !pre_ok {
            let _ = self.abort(Some(&staging));
            return MergeFlowResult::failure(
                level,
                worker_branches,
                target_branch,
                "pre-merge gates failed",
            );
        }

        match self.execute_merge(worker_branches, &staging) {
            Ok(_) => {}
            Err(DroverError::MergeConflict {
                source_branch,
                target_branch: conflict_target,
                conflicting_files,
            }) => {
                let _ = self.abort(Some(&staging));
                let mut result = MergeFlowResult::failure(
                    level,
                    worker_branches,
                    target_branch,
                    format!(
                        "merge conflict: {source_branch} into {conflict_target}, files: {}",
                        conflicting_files.join(", ")
                    ),
                );
                result.conflicts = conflicting_files;
                return result;
            }
            Err(e) => {
                let _ = self.abort(Some(&staging));
                return MergeFlowResult::failure(level, worker_branches, target_branch, e.to_string());
            }
        }

        let (post_ok, _) = self.run_post_merge_gates().await;
        if !post_ok {
            let _ = self.abort(Some(&staging));
            return MergeFlowResult::failure(
                level,
                worker_branches,
                target_branch,
                "post-merge gates failed",
            );
        }

        match self.finalize(&staging, target_branch) {
            Ok(commit) => {
                tracing::info!(
                    level,
                    commit = %&commit[..8.min(commit.len())],
                    target_branch,
                    "level merged"
                );
                MergeFlowResult {
                    success: true,
                    level,
                    source_branches: worker_branches.to_vec(),
                    target_branch: target_branch.to_string(),
                    merge_commit: Some(commit),
                    error: None,
                    conflicts: Vec::new(),
                }
            }
            Err(e) => {
                let _ = self.abort(Some(&staging));
                MergeFlowResult::failure(
                    level,
                    worker_branches,
                    target_branch,
                    format!("finalize failed: {e}"),
                )
            }
        }
    }

    /// Worker branches that exist for this feature, in name order.
    pub fn mergeable_branches(&self) -> Result<Vec<String>> {
        self.git.list_worker_branches(&self.feature)
    }

    /// Delete all worker and staging branches after a successful final
    /// integration.
    pub fn cleanup_feature_branches(&self) -> Result<usize> {
        self.git.delete_feature_branches(&self.feature, true)
    }
}
