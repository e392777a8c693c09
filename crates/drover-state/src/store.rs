//! Durable, concurrency-safe feature state.
//!
//! One [`StateStore`] fronts the feature's JSON file on disk. Reads go
//! through an mtime-gated cache: while the file's mtime is unchanged,
//! `load` returns the same in-memory instance. Writes serialize to pretty
//! JSON and go through the atomic-write helper, so concurrent writers
//! across processes see either the old or the new file, never a torn one.
//!
//! Cross-process ordering is last-writer-wins at the file level. The one
//! transition that must be exclusive — claiming a task — uses a
//! compare-and-swap: re-read, check, write, re-read to confirm.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use crate::atomic::write_atomic;
use crate::error::{DroverError, Result};
use crate::models::{ExecutionEvent, FeatureState, TaskStatus, WorkerState};

/// How many times `claim_task` retries its compare-and-swap before giving
/// up the claim to a faster worker.
const CLAIM_RETRIES: u32 = 3;

struct CacheEntry {
    mtime: SystemTime,
    state: Arc<FeatureState>,
}

/// Mtime-cached store for one feature's durable state.
pub struct StateStore {
    feature: String,
    state_dir: PathBuf,
    cache: Mutex<Option<CacheEntry>>,
}

impl StateStore {
    pub fn new(feature: impl Into<String>, state_dir: impl Into<PathBuf>) -> Self {
        Self {
            feature: feature.into(),
            state_dir: state_dir.into(),
            cache: Mutex::new(None),
        }
    }

    pub fn feature(&self) -> &str {
        &self.feature
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    /// Path of the feature's state file.
    pub fn path(&self) -> PathBuf {
        self.state_dir.join(format!("{}.json", self.feature))
    }

    /// Directory heartbeats are written under.
    pub fn heartbeat_dir(&self) -> PathBuf {
        self.state_dir.join("heartbeats")
    }

    /// Load the feature state.
    ///
    /// Returns the cached instance while the on-disk mtime is unchanged.
    /// A missing file yields a fresh initial state (not cached — it only
    /// becomes durable on the first `save`). Corrupt JSON is a typed
    /// [`DroverError::State`]; the caller decides whether to reinitialize.
    pub fn load(&self) -> Result<Arc<FeatureState>> {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        self.load_locked(&mut cache)
    }

    /// Atomically persist `state` and refresh the cache.
    pub fn save(&self, state: &FeatureState) -> Result<()> {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        self.save_locked(&mut cache, state)
    }

    /// Force the next `load` to re-read from disk.
    pub fn invalidate_cache(&self) {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        *cache = None;
    }

    /// Load, mutate, save — all under the store lock.
    ///
    /// Always re-reads from disk first: another process may have written
    /// since the cache was filled, and a stale read-modify-write would
    /// silently drop its update.
    pub fn update<F>(&self, mutate: F) -> Result<Arc<FeatureState>>
    where
        F: FnOnce(&mut FeatureState),
    {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        *cache = None;
        let mut state = (*self.load_locked(&mut cache)?).clone();
        mutate(&mut state);
        self.save_locked(&mut cache, &state)?;
        Ok(Arc::new(state))
    }

    /// Remove the state file. Only called by explicit cleanup.
    pub fn delete(&self) -> Result<()> {
        let path = self.path();
        if path.exists() {
            std::fs::remove_file(&path).map_err(|e| {
                DroverError::state(format!("failed to remove {}: {e}", path.display()))
            })?;
        }
        self.invalidate_cache();
        Ok(())
    }

    // -- accessors ---------------------------------------------------------

    /// Set a task's status, maintaining the worker_id/held-status invariant.
    pub fn set_task_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        error: Option<String>,
    ) -> Result<()> {
        self.update(|state| {
            let task = state
                .tasks
                .entry(task_id.to_string())
                .or_insert_with(|| crate::models::TaskRuntime::new(status));
            task.status = status;
            task.error = error;
            task.updated_at = chrono::Local::now();
            // worker_id is only meaningful while a worker holds the task.
            if !status.is_held() {
                task.worker_id = None;
            }
        })?;
        Ok(())
    }

    pub fn record_task_duration(&self, task_id: &str, duration_ms: u64) -> Result<()> {
        self.update(|state| {
            if let Some(task) = state.tasks.get_mut(task_id) {
                task.duration_ms = Some(duration_ms);
                task.updated_at = chrono::Local::now();
            }
        })?;
        Ok(())
    }

    pub fn get_worker_state(&self, worker_id: u32) -> Result<Option<WorkerState>> {
        Ok(self.load()?.workers.get(&worker_id).cloned())
    }

    pub fn set_worker_state(&self, ws: WorkerState) -> Result<()> {
        self.update(|state| {
            state.workers.insert(ws.worker_id, ws);
        })?;
        Ok(())
    }

    pub fn get_tasks_by_status(&self, status: TaskStatus) -> Result<Vec<String>> {
        Ok(self.load()?.tasks_with_status(status))
    }

    pub fn append_event(&self, event: &str, data: serde_json::Value) -> Result<()> {
        self.update(|state| {
            state.execution_log.push(ExecutionEvent::new(event, data));
        })?;
        Ok(())
    }

    // -- compare-and-swap claim -------------------------------------------

    /// Claim a `ready` task for a worker.
    ///
    /// Re-reads from disk, checks the task is still `ready`, writes
    /// `claimed` with this worker's id, then re-reads to confirm the write
    /// stuck. Returns `Ok(false)` when another worker won the race after
    /// the retry budget is spent.
    pub fn claim_task(&self, task_id: &str, worker_id: u32) -> Result<bool> {
        for attempt in 0..CLAIM_RETRIES {
            self.invalidate_cache();
            let current = self.load()?;
            match current.tasks.get(task_id) {
                Some(task) if task.status == TaskStatus::Ready => {}
                _ => return Ok(false),
            }

            self.update(|state| {
                if let Some(task) = state.tasks.get_mut(task_id) {
                    if task.status == TaskStatus::Ready {
                        task.status = TaskStatus::Claimed;
                        task.worker_id = Some(worker_id);
                        task.updated_at = chrono::Local::now();
                    }
                }
            })?;

            self.invalidate_cache();
            let confirmed = self.load()?;
            if let Some(task) = confirmed.tasks.get(task_id) {
                if task.status == TaskStatus::Claimed && task.worker_id == Some(worker_id) {
                    return Ok(true);
                }
            }
            tracing::debug!(
                task_id,
                worker_id,
                attempt,
                "task claim lost the race, retrying"
            );
        }
        Ok(false)
    }

    // -- internals ---------------------------------------------------------

    fn load_locked(&self, cache: &mut Option<CacheEntry>) -> Result<Arc<FeatureState>> {
        let path = self.path();
        let Ok(metadata) = std::fs::metadata(&path) else {
            // No file yet: a fresh state the first save will make durable.
            return Ok(Arc::new(FeatureState::new(self.feature.clone())));
        };
        let mtime = metadata.modified().map_err(|e| {
            DroverError::state(format!("failed to stat {}: {e}", path.display()))
        })?;

        if let Some(entry) = cache.as_ref() {
            if entry.mtime == mtime {
                return Ok(Arc::clone(&entry.state));
            }
        }

        let contents = std::fs::read_to_string(&path).map_err(|e| {
            DroverError::state(format!("failed to read state file {}: {e}", path.display()))
        })?;
        let state: FeatureState = serde_json::from_str(&contents).map_err(|e| {
            DroverError::state(format!(
                "failed to parse state file {}: {e}",
                path.display()
            ))
        })?;

        let state = Arc::new(state);
        *cache = Some(CacheEntry {
            mtime,
            state: Arc::clone(&state),
        });
        Ok(state)
    }

    fn save_locked(&self, cache: &mut Option<CacheEntry>, state: &FeatureState) -> Result<()> {
        let path = self.path();
        let json = serde_json::to_string_pretty(state)
            .map_err(|e| DroverError::state(format!("failed to serialize state: {e}")))?;
        write_atomic(&path, json.as_bytes())?;

        let mtime = std::fs::metadata(&path)
            .and_then(|m| m.modified())
            .map_err(|e| DroverError::state(format!("failed to stat {}: {e}", path.display())))?;
        *cache = Some(CacheEntry {
            mtime,
            state: Arc::new(state.clone()),
        });
        Ok(())
    }
}

/// Convenience: default state directory relative to a repository root.
pub fn default_state_dir(repo_path: &Path) -> PathBuf {
    repo_path.join(".drover").join("state")
}

/// Where the orchestrator snapshots the feature's task graph so workers can
/// load it from shared state.
pub fn graph_path(state_dir: &Path, feature: &str) -> PathBuf {
    state_dir.join(format!("{feature}.graph.json"))
}
