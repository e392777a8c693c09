//! The drover error hierarchy.
//!
//! One tagged enum covers every failure kind in the system. Variants carry
//! structured payloads where callers need to match on them (conflicting
//! files for a merge conflict, captured output for a failed gate), so the
//! discriminant is the only thing propagation code has to inspect.

use std::path::PathBuf;

use thiserror::Error;

/// Result alias used throughout the drover crates.
pub type Result<T> = std::result::Result<T, DroverError>;

/// All drover failures.
#[derive(Debug, Error)]
pub enum DroverError {
    /// Malformed configuration or a field outside its allowed range.
    #[error("configuration error: {message}")]
    Config { message: String },

    /// A task-graph invariant or input-field validation failed.
    #[error("validation error: {message}")]
    Validation {
        message: String,
        field: Option<String>,
    },

    /// Persisted state is missing, unreadable, or unparseable.
    #[error("state error: {message}")]
    State { message: String },

    /// A git command failed.
    #[error("git error: {message}")]
    Git {
        message: String,
        command: Option<String>,
        exit_code: Option<i32>,
    },

    /// A merge (or rebase) hit conflicts and was aborted.
    #[error("merge conflict: {source_branch} into {target_branch} ({} files)", conflicting_files.len())]
    MergeConflict {
        source_branch: String,
        target_branch: String,
        conflicting_files: Vec<String>,
    },

    /// Worktree create/remove failure or an orphaned registry entry.
    #[error("worktree error: {message}")]
    Worktree {
        message: String,
        path: Option<PathBuf>,
    },

    /// Generic worker failure.
    #[error("worker error: {message}")]
    Worker {
        message: String,
        worker_id: Option<u32>,
    },

    /// Worker failed to start.
    #[error("worker {worker_id} failed to start: {message}")]
    WorkerStartup { message: String, worker_id: u32 },

    /// Generic task failure.
    #[error("task error: {message}")]
    Task {
        message: String,
        task_id: Option<String>,
    },

    /// A task's verification command failed.
    #[error("verification failed for {task_id}: {command} exited {exit_code}")]
    VerificationFailed {
        task_id: String,
        command: String,
        exit_code: i32,
        stdout: String,
        stderr: String,
    },

    /// A task has unresolved dependencies.
    #[error("task {task_id} has missing dependencies: {missing:?}")]
    TaskDependency {
        task_id: String,
        missing: Vec<String>,
    },

    /// A task's execution or verification exceeded its timeout.
    #[error("task {task_id} timed out after {timeout_seconds}s")]
    TaskTimeout {
        task_id: String,
        timeout_seconds: u64,
    },

    /// Generic quality-gate failure.
    #[error("gate error: {message}")]
    Gate {
        message: String,
        gate: Option<String>,
    },

    /// A required quality gate failed.
    #[error("gate {gate} failed: {command} exited {exit_code}")]
    GateFailure {
        gate: String,
        command: String,
        exit_code: i32,
        stdout: String,
        stderr: String,
    },

    /// A quality gate exceeded its timeout.
    #[error("gate {gate} timed out after {timeout_seconds}s")]
    GateTimeout { gate: String, timeout_seconds: u64 },

    /// Container runtime failure.
    #[error("container error: {message}")]
    Container {
        message: String,
        container_id: Option<String>,
    },

    /// A command string was rejected by the executor's validation.
    #[error("command validation failed: {message}")]
    CommandValidation { message: String },

    /// Top-level scheduling failure.
    #[error("orchestrator error: {message}")]
    Orchestrator { message: String },
}

impl DroverError {
    /// Shorthand constructor for state errors.
    pub fn state(message: impl Into<String>) -> Self {
        Self::State {
            message: message.into(),
        }
    }

    /// Shorthand constructor for validation errors without a field.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            field: None,
        }
    }

    /// Shorthand constructor for configuration errors.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Shorthand constructor for orchestrator errors.
    pub fn orchestrator(message: impl Into<String>) -> Self {
        Self::Orchestrator {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_conflict_display_counts_files() {
        let err = DroverError::MergeConflict {
            source_branch: "drover/feat/worker-0".into(),
            target_branch: "drover/feat/staging".into(),
            conflicting_files: vec!["src/a.rs".into(), "src/b.rs".into()],
        };
        let text = err.to_string();
        assert!(text.contains("drover/feat/worker-0"));
        assert!(text.contains("2 files"));
    }

    #[test]
    fn verification_failure_carries_output() {
        let err = DroverError::VerificationFailed {
            task_id: "TASK-001".into(),
            command: "cargo test".into(),
            exit_code: 101,
            stdout: "running 3 tests".into(),
            stderr: "assertion failed".into(),
        };
        match err {
            DroverError::VerificationFailed {
                exit_code, stderr, ..
            } => {
                assert_eq!(exit_code, 101);
                assert_eq!(stderr, "assertion failed");
            }
            other => panic!("unexpected variant: {other}"),
        }
    }
}
