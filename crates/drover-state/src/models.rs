//! Persisted data model: task, worker, and feature state.
//!
//! Everything in this module round-trips through serde as the JSON formats
//! of the feature-state file and worker heartbeats. Timestamps are ISO-8601
//! via chrono.

use std::collections::BTreeMap;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

/// Runtime status of a task.
///
/// Transition graph:
///
/// ```text
/// pending     -> ready        (all deps complete)
/// ready       -> claimed      (worker atomic-claim)
/// claimed     -> in_progress  (worker began execution)
/// in_progress -> complete     (verification passed, changes committed)
/// in_progress -> failed       (verification failed after retries)
/// any         -> blocked      (dependency unreachable; terminal)
/// claimed/in_progress -> pending  (stale reclamation)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Ready,
    Claimed,
    InProgress,
    Complete,
    Failed,
    Blocked,
}

impl TaskStatus {
    /// A terminal status ends the task for this run.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Blocked)
    }

    /// A task currently held by a worker.
    pub fn is_held(self) -> bool {
        matches!(self, Self::Claimed | Self::InProgress)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Claimed => "claimed",
            Self::InProgress => "in_progress",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Blocked => "blocked",
        };
        f.write_str(s)
    }
}

/// Status of a worker as observed by the launcher and orchestrator.
///
/// `Stalled` is derived from heartbeat age, never persisted by the worker
/// itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Initializing,
    Ready,
    Running,
    Idle,
    Stalled,
    Checkpointing,
    Blocked,
    Stopped,
    Crashed,
}

impl WorkerStatus {
    /// Whether the worker is still considered a live participant.
    pub fn is_alive(self) -> bool {
        matches!(
            self,
            Self::Initializing | Self::Ready | Self::Running | Self::Idle | Self::Checkpointing
        )
    }
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Idle => "idle",
            Self::Stalled => "stalled",
            Self::Checkpointing => "checkpointing",
            Self::Blocked => "blocked",
            Self::Stopped => "stopped",
            Self::Crashed => "crashed",
        };
        f.write_str(s)
    }
}

/// Merge status of a level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MergeStatus {
    #[default]
    Pending,
    InProgress,
    Merged,
    Conflict,
    Failed,
}

/// Execution status of a level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LevelStatus {
    #[default]
    Pending,
    InProgress,
    Complete,
    Failed,
}

/// The worker exit-code protocol.
///
/// Workers signal their terminal condition through the process exit code;
/// launchers decode it here rather than matching raw integers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// Exit 0: clean shutdown, no more claimable tasks.
    Clean,
    /// Exit 2: checkpoint written, resumable.
    Checkpoint,
    /// Exit 3: worker cannot proceed without external help (e.g. auth).
    Blocked,
    /// Exit 4: worker requests operator attention.
    Escalation,
    /// Any other non-zero exit.
    Crashed(i32),
}

impl WorkerExit {
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => Self::Clean,
            2 => Self::Checkpoint,
            3 => Self::Blocked,
            4 => Self::Escalation,
            other => Self::Crashed(other),
        }
    }

    pub fn code(self) -> i32 {
        match self {
            Self::Clean => 0,
            Self::Checkpoint => 2,
            Self::Blocked => 3,
            Self::Escalation => 4,
            Self::Crashed(code) => code,
        }
    }

    /// The worker status a launcher reports for this exit.
    ///
    /// Escalation maps to `Stopped`: the worker ended deliberately and the
    /// operator signal travels through feature state, not the handle.
    pub fn as_worker_status(self) -> WorkerStatus {
        match self {
            Self::Clean | Self::Escalation => WorkerStatus::Stopped,
            Self::Checkpoint => WorkerStatus::Checkpointing,
            Self::Blocked => WorkerStatus::Blocked,
            Self::Crashed(_) => WorkerStatus::Crashed,
        }
    }
}

/// Per-task runtime record inside the feature state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRuntime {
    pub status: TaskStatus,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub worker_id: Option<u32>,
    #[serde(default)]
    pub owned_files: Vec<String>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    pub updated_at: DateTime<Local>,
}

impl TaskRuntime {
    pub fn new(status: TaskStatus) -> Self {
        Self {
            status,
            error: None,
            retry_count: 0,
            worker_id: None,
            owned_files: Vec::new(),
            duration_ms: None,
            updated_at: Local::now(),
        }
    }
}

/// Per-worker record inside the feature state.
///
/// Owned exclusively by the worker process while it is alive; the
/// orchestrator only writes it when reclaiming a stalled worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerState {
    pub worker_id: u32,
    pub status: WorkerStatus,
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub container_id: Option<String>,
    pub branch: String,
    #[serde(default)]
    pub current_task: Option<String>,
    #[serde(default)]
    pub tasks_completed: u32,
    /// Fraction of the agent's context window consumed, in [0, 1].
    /// Advisory only.
    #[serde(default)]
    pub context_usage: f64,
    pub started_at: DateTime<Local>,
    #[serde(default)]
    pub health_check_at: Option<DateTime<Local>>,
    #[serde(default)]
    pub exit_code: Option<i32>,
}

impl WorkerState {
    pub fn new(worker_id: u32, branch: impl Into<String>) -> Self {
        Self {
            worker_id,
            status: WorkerStatus::Initializing,
            pid: None,
            container_id: None,
            branch: branch.into(),
            current_task: None,
            tasks_completed: 0,
            context_usage: 0.0,
            started_at: Local::now(),
            health_check_at: None,
            exit_code: None,
        }
    }
}

/// Per-level record inside the feature state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LevelState {
    #[serde(default)]
    pub status: LevelStatus,
    #[serde(default)]
    pub merge_status: MergeStatus,
}

/// One entry in the append-only execution log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionEvent {
    pub at: DateTime<Local>,
    pub event: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl ExecutionEvent {
    pub fn new(event: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            at: Local::now(),
            event: event.into(),
            data,
        }
    }
}

/// The durable unit: everything drover persists about one feature.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureState {
    pub feature: String,
    #[serde(default)]
    pub current_level: u32,
    #[serde(default)]
    pub paused: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub tasks: BTreeMap<String, TaskRuntime>,
    #[serde(default)]
    pub workers: BTreeMap<u32, WorkerState>,
    #[serde(default)]
    pub levels: BTreeMap<u32, LevelState>,
    #[serde(default)]
    pub execution_log: Vec<ExecutionEvent>,
}

impl FeatureState {
    /// Fresh state for a feature that has never run.
    pub fn new(feature: impl Into<String>) -> Self {
        Self {
            feature: feature.into(),
            current_level: 0,
            paused: false,
            error: None,
            tasks: BTreeMap::new(),
            workers: BTreeMap::new(),
            levels: BTreeMap::new(),
            execution_log: Vec::new(),
        }
    }

    /// Ids of tasks currently in the given status.
    pub fn tasks_with_status(&self, status: TaskStatus) -> Vec<String> {
        self.tasks
            .iter()
            .filter(|(_, t)| t.status == status)
            .map(|(id, _)| id.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_exit_protocol_round_trips() {
        for code in [0, 2, 3, 4, 1, 137] {
            assert_eq!(WorkerExit::from_code(code).code(), code);
        }
        assert_eq!(
            WorkerExit::from_code(0).as_worker_status(),
            WorkerStatus::Stopped
        );
        assert_eq!(
            WorkerExit::from_code(2).as_worker_status(),
            WorkerStatus::Checkpointing
        );
        assert_eq!(
            WorkerExit::from_code(3).as_worker_status(),
            WorkerStatus::Blocked
        );
        assert_eq!(
            WorkerExit::from_code(4).as_worker_status(),
            WorkerStatus::Stopped
        );
        assert_eq!(
            WorkerExit::from_code(1).as_worker_status(),
            WorkerStatus::Crashed
        );
    }

    #[test]
    fn alive_statuses_match_protocol() {
        assert!(WorkerStatus::Initializing.is_alive());
        assert!(WorkerStatus::Ready.is_alive());
        assert!(WorkerStatus::Running.is_alive());
        assert!(WorkerStatus::Idle.is_alive());
        assert!(WorkerStatus::Checkpointing.is_alive());
        assert!(!WorkerStatus::Stalled.is_alive());
        assert!(!WorkerStatus::Blocked.is_alive());
        assert!(!WorkerStatus::Stopped.is_alive());
        assert!(!WorkerStatus::Crashed.is_alive());
    }

    #[test]
    fn task_status_serializes_snake_case() {
        let json = serde_json::to_string(&TaskStatus::InProgress).unwrap();
        assert_eq!(json, "\"in_progress\"");
        let back: TaskStatus = serde_json::from_str("\"in_progress\"").unwrap();
        assert_eq!(back, TaskStatus::InProgress);
    }

    #[test]
    fn feature_state_round_trips() {
        let mut state = FeatureState::new("auth-flow");
        state
            .tasks
            .insert("TASK-001".into(), TaskRuntime::new(TaskStatus::Pending));
        state
            .workers
            .insert(0, WorkerState::new(0, "drover/auth-flow/worker-0"));
        state.levels.insert(1, LevelState::default());

        let json = serde_json::to_string_pretty(&state).unwrap();
        let back: FeatureState = serde_json::from_str(&json).unwrap();
        assert_eq!(back.feature, "auth-flow");
        assert_eq!(back.tasks["TASK-001"].status, TaskStatus::Pending);
        assert_eq!(back.workers[&0].branch, "drover/auth-flow/worker-0");
    }
}
