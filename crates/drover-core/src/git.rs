//! Typed git operations for branch management and merging.
//!
//! Every operation invokes the git CLI with explicit argv (no shell
//! expansion) and raises typed errors. Merge and rebase detect conflicts,
//! abort the in-progress operation, and surface a structured
//! [`DroverError::MergeConflict`] carrying the conflicting files.

use std::path::{Path, PathBuf};
use std::process::Command;

use drover_state::error::{DroverError, Result};

use crate::{staging_branch, BRANCH_PREFIX};

/// Information about a git branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchInfo {
    pub name: String,
    pub commit: String,
    pub is_current: bool,
}

/// Single-process-safe wrapper over one repository.
#[derive(Debug, Clone)]
pub struct GitOps {
    repo_path: PathBuf,
}

impl GitOps {
    pub fn new(repo_path: impl Into<PathBuf>) -> Self {
        Self {
            repo_path: repo_path.into(),
        }
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    fn run(&self, args: &[&str], check: bool) -> Result<std::process::Output> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.repo_path)
            .output()
            .map_err(|e| DroverError::Git {
                message: format!("failed to run git {}: {e}", args.join(" ")),
                command: Some(args.join(" ")),
                exit_code: None,
            })?;

        if check && !output.status.success() {
            return Err(DroverError::Git {
                message: format!(
                    "git {} failed: {}",
                    args.join(" "),
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
                command: Some(args.join(" ")),
                exit_code: output.status.code(),
            });
        }
        Ok(output)
    }

    fn stdout(&self, args: &[&str]) -> Result<String> {
        let output = self.run(args, true)?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    // -- queries -----------------------------------------------------------

    pub fn current_branch(&self) -> Result<String> {
        self.stdout(&["rev-parse", "--abbrev-ref", "HEAD"])
    }

    pub fn current_commit(&self) -> Result<String> {
        self.stdout(&["rev-parse", "HEAD"])
    }

    pub fn get_commit(&self, reference: &str) -> Result<String> {
        self.stdout(&["rev-parse", reference])
    }

    /// Whether the working tree has uncommitted changes.
    pub fn has_changes(&self) -> Result<bool> {
        Ok(!self.stdout(&["status", "--porcelain"])?.is_empty())
    }

    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let output = self.run(&["branch", "--list", branch], false)?;
        Ok(!String::from_utf8_lossy(&output.stdout).trim().is_empty())
    }

    pub fn has_conflicts(&self) -> Result<bool> {
        let output = self.run(&["diff", "--name-only", "--diff-filter=U"], false)?;
        Ok(!String::from_utf8_lossy(&output.stdout).trim().is_empty())
    }

    pub fn conflicting_files(&self) -> Result<Vec<String>> {
        let output = self.run(&["diff", "--name-only", "--diff-filter=U"], false)?;
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    pub fn list_branches(&self, pattern: Option<&str>) -> Result<Vec<BranchInfo>> {
        let mut args = vec![
            "branch",
            "--format=%(refname:short)|%(objectname:short)|%(HEAD)",
        ];
        if let Some(pattern) = pattern {
            args.push("--list");
            args.push(pattern);
        }
        let stdout = self.stdout(&args)?;

        let mut branches = Vec::new();
        for line in stdout.lines().filter(|l| !l.is_empty()) {
            let parts: Vec<&str> = line.split('|').collect();
            if parts.len() >= 3 {
                branches.push(BranchInfo {
                    name: parts[0].to_string(),
                    commit: parts[1].to_string(),
                    is_current: parts[2] == "*",
                });
            }
        }
        Ok(branches)
    }

    /// All worker branches for a feature, in branch-name order.
    pub fn list_worker_branches(&self, feature: &str) -> Result<Vec<String>> {
        let pattern = format!("{BRANCH_PREFIX}/{feature}/worker-*");
        let mut names: Vec<String> = self
            .list_branches(Some(&pattern))?
            .into_iter()
            .map(|b| b.name)
            .collect();
        names.sort();
        Ok(names)
    }

    // -- mutations ---------------------------------------------------------

    pub fn create_branch(&self, branch: &str, base: &str) -> Result<String> {
        self.run(&["branch", branch, base], true)?;
        tracing::info!(branch, base, "created branch");
        self.get_commit(branch)
    }

    pub fn delete_branch(&self, branch: &str, force: bool) -> Result<()> {
        let flag = if force { "-D" } else { "-d" };
        self.run(&["branch", flag, branch], true)?;
        tracing::info!(branch, "deleted branch");
        Ok(())
    }

    pub fn checkout(&self, reference: &str) -> Result<()> {
        self.run(&["checkout", reference], true)?;
        tracing::debug!(reference, "checked out");
        Ok(())
    }

    pub fn commit(&self, message: &str, add_all: bool, allow_empty: bool) -> Result<String> {
        if add_all {
            self.run(&["add", "-A"], true)?;
        }
        let mut args = vec!["commit", "-m", message];
        if allow_empty {
            args.push("--allow-empty");
        }
        self.run(&args, true)?;
        let sha = self.current_commit()?;
        tracing::info!(commit = %&sha[..8.min(sha.len())], "created commit");
        Ok(sha)
    }

    /// Stash uncommitted changes. Returns false when there was nothing to
    /// stash.
    pub fn stash(&self, message: Option<&str>) -> Result<bool> {
        if !self.has_changes()? {
            return Ok(false);
        }
        let mut args = vec!["stash", "push"];
        if let Some(message) = message {
            args.push("-m");
            args.push(message);
        }
        self.run(&args, true)?;
        Ok(true)
    }

    pub fn stash_pop(&self) -> Result<()> {
        self.run(&["stash", "pop"], true)?;
        Ok(())
    }

    pub fn fetch(&self, remote: &str, branch: Option<&str>) -> Result<()> {
        let mut args = vec!["fetch", remote];
        if let Some(branch) = branch {
            args.push(branch);
        }
        self.run(&args, true)?;
        Ok(())
    }

    // -- integration -------------------------------------------------------

    /// Merge `branch` into the current branch.
    ///
    /// On conflict the merge is aborted and a [`DroverError::MergeConflict`]
    /// is raised with the source branch, target branch, and conflicting
    /// files.
    pub fn merge(&self, branch: &str, message: Option<&str>, no_ff: bool) -> Result<String> {
        let mut args = vec!["merge", branch];
        if no_ff {
            args.push("--no-ff");
        }
        if let Some(message) = message {
            args.push("-m");
            args.push(message);
        }

        if let Err(err) = self.run(&args, true) {
            if self.has_conflicts()? {
                let conflicts = self.conflicting_files()?;
                let target = self.current_branch()?;
                self.abort_merge()?;
                return Err(DroverError::MergeConflict {
                    source_branch: branch.to_string(),
                    target_branch: target,
                    conflicting_files: conflicts,
                });
            }
            return Err(err);
        }

        let sha = self.current_commit()?;
        tracing::info!(branch, commit = %&sha[..8.min(sha.len())], "merged");
        Ok(sha)
    }

    /// Rebase the current branch onto `onto`, with the symmetric conflict
    /// handling to [`Self::merge`].
    pub fn rebase(&self, onto: &str) -> Result<()> {
        if let Err(err) = self.run(&["rebase", onto], true) {
            if self.has_conflicts()? {
                let conflicts = self.conflicting_files()?;
                let source = self.current_branch()?;
                self.abort_rebase()?;
                return Err(DroverError::MergeConflict {
                    source_branch: source,
                    target_branch: onto.to_string(),
                    conflicting_files: conflicts,
                });
            }
            return Err(err);
        }
        Ok(())
    }

    pub fn abort_merge(&self) -> Result<()> {
        self.run(&["merge", "--abort"], false)?;
        Ok(())
    }

    pub fn abort_rebase(&self) -> Result<()> {
        self.run(&["rebase", "--abort"], false)?;
        Ok(())
    }

    // -- staging and cleanup -----------------------------------------------

    /// Create (or recreate) the feature's staging branch from `base`.
    /// Idempotent: an existing staging branch is deleted first, so the
    /// result always points at `base`'s head.
    pub fn create_staging_branch(&self, feature: &str, base: &str) -> Result<String> {
        let staging = staging_branch(feature);
        if self.branch_exists(&staging)? {
            self.delete_branch(&staging, true)?;
        }
        self.create_branch(&staging, base)?;
        tracing::info!(%staging, base, "created staging branch");
        Ok(staging)
    }

    /// Delete every drover branch for a feature (workers + staging),
    /// skipping whichever branch is currently checked out.
    pub fn delete_feature_branches(&self, feature: &str, force: bool) -> Result<usize> {
        let pattern = format!("{BRANCH_PREFIX}/{feature}/*");
        let branches = self.list_branches(Some(&pattern))?;
        let mut count = 0;
        for branch in branches {
            if !branch.is_current {
                self.delete_branch(&branch.name, force)?;
                count += 1;
            }
        }
        tracing::info!(feature, count, "deleted feature branches");
        Ok(count)
    }

    /// Whether `ancestor` is reachable from `descendant`.
    pub fn is_ancestor(&self, ancestor: &str, descendant: &str) -> Result<bool> {
        let output = self.run(&["merge-base", "--is-ancestor", ancestor, descendant], false)?;
        Ok(output.status.success())
    }
}
