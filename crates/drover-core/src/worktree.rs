//! Git worktree management for worker isolation.
//!
//! Each worker runs in its own git worktree on a dedicated branch,
//! providing filesystem isolation without full clones. Worktrees share the
//! object store of the main repository but have independent working
//! directories and index files.

use std::path::{Path, PathBuf};
use std::process::Command;

use drover_state::error::{DroverError, Result};

use crate::git::GitOps;
use crate::worker_branch;

/// Information about a single git worktree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeInfo {
    pub path: PathBuf,
    pub branch: Option<String>,
    pub head_commit: String,
}

/// Creates and removes per-worker worktrees under the repository's
/// worktree root (`.drover/worktrees` by default).
#[derive(Debug, Clone)]
pub struct WorktreeManager {
    repo_path: PathBuf,
    worktree_root: PathBuf,
    git: GitOps,
}

impl WorktreeManager {
    /// Create a manager for `repo_path`. Fails if the path is not a git
    /// repository.
    pub fn new(repo_path: impl Into<PathBuf>, worktree_root: Option<PathBuf>) -> Result<Self> {
        let repo_path = repo_path.into();

        let output = Command::new("git")
            .args(["rev-parse", "--git-dir"])
            .current_dir(&repo_path)
            .output()
            .map_err(|e| DroverError::Worktree {
                message: format!("failed to run git rev-parse: {e}"),
                path: Some(repo_path.clone()),
            })?;
        if !output.status.success() {
            return Err(DroverError::Worktree {
                message: format!("not a git repository: {}", repo_path.display()),
                path: Some(repo_path),
            });
        }

        let worktree_root =
            worktree_root.unwrap_or_else(|| repo_path.join(".drover").join("worktrees"));

        Ok(Self {
            git: GitOps::new(repo_path.clone()),
            repo_path,
            worktree_root,
        })
    }

    pub fn worktree_root(&self) -> &Path {
        &self.worktree_root
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    /// Path of a worker's worktree: `<root>/<feature>/worker-<N>`.
    pub fn worktree_path(&self, feature: &str, worker_id: u32) -> PathBuf {
        self.worktree_root
            .join(feature)
            .join(format!("worker-{worker_id}"))
    }

    fn run_git(&self, args: &[&str], check: bool) -> Result<std::process::Output> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.repo_path)
            .output()
            .map_err(|e| DroverError::Worktree {
                message: format!("failed to run git {}: {e}", args.join(" ")),
                path: None,
            })?;
        if check && !output.status.success() {
            return Err(DroverError::Worktree {
                message: format!(
                    "git {} failed: {}",
                    args.join(" "),
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
                path: None,
            });
        }
        Ok(output)
    }

    /// Create a worker's worktree on its branch, from `base_branch`.
    ///
    /// A stale directory at the target path is forcibly removed first. The
    /// branch is created from `base_branch` if it does not already exist.
    pub fn create(&self, feature: &str, worker_id: u32, base_branch: &str) -> Result<WorktreeInfo> {
        let branch = worker_branch(feature, worker_id);
        let path = self.worktree_path(feature, worker_id);

        if path.exists() {
            tracing::warn!(path = %path.display(), "worktree path exists, removing before create");
            self.delete(&path, true)?;
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| DroverError::Worktree {
                message: format!("failed to create {}: {e}", parent.display()),
                path: Some(parent.to_path_buf()),
            })?;
        }

        let path_str = path.to_string_lossy().to_string();
        let output = if self.git.branch_exists(&branch)? {
            self.run_git(&["worktree", "add", &path_str, &branch], false)?
        } else {
            self.run_git(
                &["worktree", "add", "-b", &branch, &path_str, base_branch],
                false,
            )?
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            // Clean up partial state before surfacing the failure.
            let _ = std::fs::remove_dir_all(&path);
            return Err(DroverError::Worktree {
                message: format!("git worktree add failed: {}", stderr.trim()),
                path: Some(path),
            });
        }

        tracing::info!(worker_id, %branch, path = %path.display(), "created worktree");
        self.get(&path)?.ok_or_else(|| DroverError::Worktree {
            message: "worktree missing from list after create".into(),
            path: Some(path),
        })
    }

    /// Remove a worktree. A conventional remove failure falls back to
    /// prune plus recursive directory removal (a crashed worker leaves a
    /// dirty tree behind).
    pub fn delete(&self, path: &Path, force: bool) -> Result<()> {
        let path_str = path.to_string_lossy().to_string();
        let mut args = vec!["worktree", "remove"];
        if force {
            args.push("--force");
        }
        args.push(&path_str);

        let output = self.run_git(&args, false)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("is not a working tree") && !path.exists() {
                return Ok(());
            }
            tracing::warn!(
                path = %path.display(),
                stderr = %stderr.trim(),
                "worktree remove failed, falling back to prune + rm"
            );
            self.prune()?;
            if path.exists() {
                std::fs::remove_dir_all(path).map_err(|e| DroverError::Worktree {
                    message: format!("failed to remove {}: {e}", path.display()),
                    path: Some(path.to_path_buf()),
                })?;
            }
            self.prune()?;
        }
        Ok(())
    }

    /// Remove every worktree under the feature's directory and the (then
    /// empty) feature directory itself.
    pub fn delete_all(&self, feature: &str) -> Result<usize> {
        let feature_dir = self.worktree_root.join(feature);
        let mut count = 0;
        for info in self.list()? {
            if info.path.starts_with(&feature_dir) {
                self.delete(&info.path, true)?;
                count += 1;
            }
        }
        if feature_dir.exists() {
            let _ = std::fs::remove_dir(&feature_dir);
        }
        tracing::info!(feature, count, "removed feature worktrees");
        Ok(count)
    }

    /// All worktrees registered on the repository, parsed from porcelain
    /// output.
    pub fn list(&self) -> Result<Vec<WorktreeInfo>> {
        let output = self.run_git(&["worktree", "list", "--porcelain"], true)?;
        let stdout = String::from_utf8_lossy(&output.stdout);

        let mut result = Vec::new();
        let mut path: Option<PathBuf> = None;
        let mut head = String::new();
        let mut branch: Option<String> = None;

        for line in stdout.lines() {
            if let Some(p) = line.strip_prefix("worktree ") {
                if let Some(done) = path.take() {
                    result.push(WorktreeInfo {
                        path: done,
                        branch: branch.take(),
                        head_commit: std::mem::take(&mut head),
                    });
                }
                path = Some(PathBuf::from(p));
            } else if let Some(h) = line.strip_prefix("HEAD ") {
                head = h.to_string();
            } else if let Some(b) = line.strip_prefix("branch ") {
                branch = Some(b.trim_start_matches("refs/heads/").to_string());
            }
        }
        if let Some(done) = path {
            result.push(WorktreeInfo {
                path: done,
                branch,
                head_commit: head,
            });
        }
        Ok(result)
    }

    pub fn exists(&self, path: &Path) -> Result<bool> {
        Ok(self.get(path)?.is_some())
    }

    pub fn get(&self, path: &Path) -> Result<Option<WorktreeInfo>> {
        let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        Ok(self.list()?.into_iter().find(|w| {
            w.path == canonical || w.path == path
        }))
    }

    /// Fetch the base branch and rebase the worktree's branch onto it.
    pub fn sync_with_base(&self, path: &Path, base_branch: &str) -> Result<()> {
        let git = GitOps::new(path);
        // Local-only setups have no remote; rebase directly in that case.
        if git.fetch("origin", Some(base_branch)).is_err() {
            tracing::debug!(base_branch, "fetch failed, rebasing onto local base");
        }
        git.rebase(base_branch)
    }

    /// Drop registry entries whose directories vanished from disk.
    pub fn prune(&self) -> Result<()> {
        self.run_git(&["worktree", "prune"], true)?;
        Ok(())
    }
}
