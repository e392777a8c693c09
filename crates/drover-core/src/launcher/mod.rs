//! Polymorphic worker launchers.
//!
//! One [`Launcher`] contract over two backends: [`SubprocessLauncher`]
//! spawns workers as child processes of the orchestrator;
//! [`ContainerLauncher`] runs them in detached containers. The orchestrator
//! holds an `Arc<dyn Launcher>` and never cares which.

pub mod backoff;
pub mod container;
pub mod env;
pub mod subprocess;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Local};

use drover_state::models::WorkerStatus;

pub use backoff::{calculate_delay, BackoffStrategy, RetryPolicy};
pub use container::ContainerLauncher;
pub use subprocess::{LauncherSettings, SubprocessLauncher};

/// Everything a launcher needs to start one worker.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub worker_id: u32,
    pub feature: String,
    pub worktree_path: PathBuf,
    pub branch: String,
    pub env: BTreeMap<String, String>,
}

/// In-memory handle to a running worker. Owned by the launcher; absence of
/// a handle is how "terminated" is expressed.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    pub worker_id: u32,
    pub pid: Option<u32>,
    pub container_id: Option<String>,
    pub status: WorkerStatus,
    pub started_at: DateTime<Local>,
    /// Last time the backend was actually consulted (container monitor
    /// cooldown).
    pub health_check_at: Option<Instant>,
    pub exit_code: Option<i32>,
}

impl WorkerHandle {
    pub fn new(worker_id: u32) -> Self {
        Self {
            worker_id,
            pid: None,
            container_id: None,
            status: WorkerStatus::Initializing,
            started_at: Local::now(),
            health_check_at: None,
            exit_code: None,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.status.is_alive()
    }
}

/// Result of one spawn attempt. Foreseeable failures (OS error, image
/// missing, bad spec) come back as `success = false` with an error string,
/// never as an `Err`.
#[derive(Debug, Clone)]
pub struct SpawnResult {
    pub success: bool,
    pub worker_id: u32,
    pub handle: Option<WorkerHandle>,
    pub error: Option<String>,
}

impl SpawnResult {
    pub fn ok(handle: WorkerHandle) -> Self {
        Self {
            success: true,
            worker_id: handle.worker_id,
            handle: Some(handle),
            error: None,
        }
    }

    pub fn failure(worker_id: u32, error: impl Into<String>) -> Self {
        Self {
            success: false,
            worker_id,
            handle: None,
            error: Some(error.into()),
        }
    }
}

/// Counts of workers per status plus the alive total.
#[derive(Debug, Clone, Default)]
pub struct LauncherSummary {
    pub total: usize,
    pub alive: usize,
    pub by_status: BTreeMap<WorkerStatus, usize>,
}

/// The launcher contract. See module docs.
#[async_trait]
pub trait Launcher: Send + Sync {
    /// Spawn a worker. Cheap sanity failures and OS errors surface in the
    /// [`SpawnResult`], not as panics or errors.
    async fn spawn(&self, spec: &SpawnSpec) -> SpawnResult;

    /// Cheap, idempotent status check. Unknown workers are `Stopped`.
    async fn monitor(&self, worker_id: u32) -> WorkerStatus;

    /// Graceful-then-forceful termination. On success the handle is
    /// removed, so `monitor` subsequently reports `Stopped`.
    async fn terminate(&self, worker_id: u32, force: bool) -> bool;

    /// Tail of the worker's captured output.
    async fn get_output(&self, worker_id: u32, tail: usize) -> String;

    async fn get_handle(&self, worker_id: u32) -> Option<WorkerHandle>;

    async fn get_all_workers(&self) -> BTreeMap<u32, WorkerHandle>;

    /// Drop a worker's handle without touching the backend. Used by
    /// `sync_state` to reap finished workers.
    async fn remove_handle(&self, worker_id: u32);

    /// Terminate every tracked worker, fanning out concurrently and
    /// waiting for all of them.
    async fn terminate_all(&self, force: bool) -> BTreeMap<u32, bool> {
        let ids: Vec<u32> = self.get_all_workers().await.into_keys().collect();
        let results = futures::future::join_all(
            ids.into_iter()
                .map(|worker_id| async move { (worker_id, self.terminate(worker_id, force).await) }),
        )
        .await;
        results.into_iter().collect()
    }

    /// Reconcile tracked handles with actual worker status, reaping
    /// handles for workers that stopped or crashed.
    async fn sync_state(&self) -> BTreeMap<u32, WorkerStatus> {
        let ids: Vec<u32> = self.get_all_workers().await.into_keys().collect();
        let mut results = BTreeMap::new();
        for worker_id in ids {
            let status = self.monitor(worker_id).await;
            results.insert(worker_id, status);
            if matches!(status, WorkerStatus::Stopped | WorkerStatus::Crashed) {
                tracing::debug!(worker_id, %status, "removing finished worker from tracking");
                self.remove_handle(worker_id).await;
            }
        }
        results
    }

    /// Poll until no tracked worker is alive or the timeout elapses.
    /// Returns the final status of every tracked worker.
    async fn wait_all(&self, timeout: Option<Duration>) -> BTreeMap<u32, WorkerStatus> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let mut statuses = BTreeMap::new();
            let mut any_alive = false;
            for worker_id in self.get_all_workers().await.into_keys() {
                let status = self.monitor(worker_id).await;
                any_alive |= status.is_alive();
                statuses.insert(worker_id, status);
            }
            if !any_alive {
                return statuses;
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return statuses;
                }
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    /// Poll until the worker reports ready/running, it dies, or the
    /// timeout elapses.
    async fn wait_for_ready(&self, worker_id: u32, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            match self.monitor(worker_id).await {
                WorkerStatus::Ready | WorkerStatus::Running => return true,
                WorkerStatus::Crashed | WorkerStatus::Stopped | WorkerStatus::Blocked => {
                    return false
                }
                _ => {}
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    /// Spawn with retry, driven by the shared backoff core with this
    /// launcher's `spawn` and tokio's sleep.
    async fn spawn_with_retry(&self, spec: &SpawnSpec, policy: &RetryPolicy) -> SpawnResult {
        backoff::spawn_with_retry(
            spec.worker_id,
            policy,
            || self.spawn(spec),
            |delay| tokio::time::sleep(delay),
        )
        .await
    }

    /// Counts by status across tracked workers.
    async fn status_summary(&self) -> LauncherSummary {
        let workers = self.get_all_workers().await;
        let mut summary = LauncherSummary {
            total: workers.len(),
            ..Default::default()
        };
        for handle in workers.values() {
            *summary.by_status.entry(handle.status).or_insert(0) += 1;
            if handle.is_alive() {
                summary.alive += 1;
            }
        }
        summary
    }
}
