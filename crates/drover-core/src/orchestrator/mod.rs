//! The top-level scheduler.
//!
//! One orchestrator instance drives one feature, level by level: mark
//! ready tasks, assign them across the worker pool, provision worktrees,
//! spawn workers, poll until the level's tasks are terminal (reclaiming
//! stalled tasks and respawning crashed workers along the way), then merge
//! the level's worker branches through the merge coordinator before
//! advancing. Every invocation is short-lived and reconciles from durable
//! state, so a killed orchestrator resumes where it stopped.

pub mod circuit;

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use drover_state::graph::TaskGraph;
use drover_state::heartbeat::HeartbeatMonitor;
use drover_state::models::{
    LevelStatus, MergeStatus, TaskStatus, WorkerState, WorkerStatus,
};
use drover_state::store::{graph_path, StateStore};

use crate::assign::WorkerAssignment;
use crate::config::DroverConfig;
use crate::launcher::{Launcher, RetryPolicy, SpawnSpec};
use crate::merge::MergeCoordinator;
use crate::worker_branch;
use crate::worktree::WorktreeManager;
use circuit::CircuitBreaker;

/// Poll cadence of the orchestrator loop.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Terminal outcome of one orchestrator run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorResult {
    /// Every level completed and merged.
    Completed,
    /// One or more tasks ended failed or blocked.
    Failed { failed_tasks: Vec<String> },
    /// A level's merge flow failed; the level did not advance.
    MergeFailed { level: u32, error: String },
    /// Cancelled from outside.
    Interrupted,
}

/// Drives one feature to completion.
pub struct Orchestrator {
    graph: TaskGraph,
    config: DroverConfig,
    store: StateStore,
    launcher: Arc<dyn Launcher>,
    worktrees: WorktreeManager,
    merge: MergeCoordinator,
    heartbeats: HeartbeatMonitor,
    cancel: CancellationToken,
    breaker: CircuitBreaker,
    respawn_counts: BTreeMap<u32, u32>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        graph: TaskGraph,
        config: DroverConfig,
        store: StateStore,
        launcher: Arc<dyn Launcher>,
        worktrees: WorktreeManager,
        merge: MergeCoordinator,
        cancel: CancellationToken,
    ) -> Self {
        let heartbeats = HeartbeatMonitor::new(store.heartbeat_dir());
        let breaker = CircuitBreaker::new(&config.circuit_breaker);
        Self {
            graph,
            config,
            store,
            launcher,
            worktrees,
            merge,
            heartbeats,
            cancel,
            breaker,
            respawn_counts: BTreeMap::new(),
        }
    }

    /// Run the feature to a terminal result.
    pub async fn run(&mut self) -> Result<OrchestratorResult> {
        let feature = self.store.feature().to_string();

        // An empty graph finishes immediately.
        if self.graph.total_tasks() == 0 {
            tracing::info!(%feature, "task graph is empty, nothing to do");
            return Ok(OrchestratorResult::Completed);
        }

        self.snapshot_graph()
            .context("failed to snapshot task graph into shared state")?;
        self.seed_tasks()?;

        for level in self.graph.levels() {
            if self.level_already_merged(level)? {
                tracing::info!(level, "level already merged, skipping");
                continue;
            }
            if self.graph.tasks_for_level(level).is_empty() {
                // A declared but empty level advances immediately.
                self.store.update(|state| {
                    state.current_level = state.current_level.max(level);
                    let entry = state.levels.entry(level).or_default();
                    entry.status = LevelStatus::Complete;
                    entry.merge_status = MergeStatus::Merged;
                })?;
                continue;
            }

            match self.run_level(level).await? {
                LevelOutcome::Complete => {}
                LevelOutcome::Interrupted => return Ok(OrchestratorResult::Interrupted),
                LevelOutcome::TasksFailed(failed) => {
                    self.store.update(|state| {
                        state
                            .levels
                            .entry(level)
                            .or_default()
                            .status = LevelStatus::Failed;
                        state.error = Some(format!(
                            "level {level} failed: tasks {} did not complete",
                            failed.join(", ")
                        ));
                    })?;
                    self.store.append_event(
                        "level_failed",
                        serde_json::json!({"level": level, "tasks": failed}),
                    )?;
                    return Ok(OrchestratorResult::Failed {
                        failed_tasks: failed,
                    });
                }
            }

            match self.merge_level(level).await? {
                Ok(()) => {}
                Err(error) => {
                    return Ok(OrchestratorResult::MergeFailed { level, error });
                }
            }
        }

        // Final integration done level by level; drop the scaffolding.
        if let Err(e) = self.merge.cleanup_feature_branches() {
            tracing::warn!(error = %e, "failed to clean up feature branches");
        }
        if let Err(e) = self.worktrees.delete_all(&feature) {
            tracing::warn!(error = %e, "failed to clean up worktrees");
        }
        self.store
            .append_event("feature_complete", serde_json::json!({}))?;
        Ok(OrchestratorResult::Completed)
    }

    // -- setup -------------------------------------------------------------

    /// Write the graph snapshot workers load from shared state.
    fn snapshot_graph(&self) -> Result<()> {
        let path = graph_path(self.store.state_dir(), self.store.feature());
        let tasks: Vec<_> = self.graph.all_tasks().cloned().collect();
        let levels: BTreeMap<String, _> = self
            .graph
            .levels()
            .into_iter()
            .filter_map(|l| self.graph.level_spec(l).map(|s| (l.to_string(), s.clone())))
            .collect();
        let value = serde_json::json!({
            "feature": self.graph.feature_name(),
            "tasks": tasks,
            "levels": levels,
            "critical_path": self.graph.critical_path(),
        });
        drover_state::atomic::write_atomic(
            &path,
            serde_json::to_string_pretty(&value)?.as_bytes(),
        )?;
        Ok(())
    }

    /// Ensure every graph task has a runtime record.
    fn seed_tasks(&self) -> Result<()> {
        let task_ids: Vec<(String, Vec<String>)> = self
            .graph
            .all_tasks()
            .map(|t| {
                (
                    t.id.clone(),
                    t.files.written().cloned().collect::<Vec<String>>(),
                )
            })
            .collect();
        self.store.update(|state| {
            for (id, owned_files) in task_ids {
                state
                    .tasks
                    .entry(id)
                    .or_insert_with(|| {
                        let mut rt = drover_state::models::TaskRuntime::new(TaskStatus::Pending);
                        rt.owned_files = owned_files;
                        rt
                    });
            }
        })?;
        Ok(())
    }

    fn level_already_merged(&self, level: u32) -> Result<bool> {
        let state = self.store.load()?;
        Ok(state
            .levels
            .get(&level)
            .map(|l| l.merge_status == MergeStatus::Merged)
            .unwrap_or(false))
    }

    // -- level execution ---------------------------------------------------

    async fn run_level(&mut self, level: u32) -> Result<LevelOutcome> {
        let feature = self.store.feature().to_string();
        tracing::info!(level, %feature, "starting level");

        self.store.update(|state| {
            state.current_level = state.current_level.max(level);
            state.levels.entry(level).or_default().status = LevelStatus::InProgress;
        })?;
        self.store
            .append_event("level_start", serde_json::json!({"level": level}))?;

        self.mark_ready_tasks(level)?;

        // Assign and provision workers.
        let tasks = self.graph.tasks_for_level(level);
        let worker_count = (tasks.len() as u32).min(self.config.workers.max_concurrent);
        let assignment = WorkerAssignment::assign(&tasks, worker_count);

        for worker_id in assignment.busy_workers() {
            if self.cancel.is_cancelled() {
                return Ok(LevelOutcome::Interrupted);
            }
            self.ensure_worker(&feature, worker_id).await?;
        }

        // Poll until every level task is terminal.
        let mut poll = tokio::time::interval(POLL_INTERVAL);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut stagnant_iterations = 0u32;

        let outcome = loop {
            tokio::select! {
                _ = poll.tick() => {}
                _ = self.cancel.cancelled() => {
                    tracing::info!(level, "cancelled, terminating workers");
                    self.launcher.terminate_all(false).await;
                    break LevelOutcome::Interrupted;
                }
            }

            // Pause halts the loop at the iteration boundary.
            self.store.invalidate_cache();
            if self.store.load()?.paused {
                tracing::debug!("paused, waiting");
                continue;
            }

            let statuses = self.launcher.sync_state().await;
            self.handle_stalled_and_crashed(&feature, &statuses).await?;
            self.retry_failed_tasks(level)?;
            self.mark_ready_tasks(level)?;

            let snapshot = self.level_snapshot(level)?;
            if snapshot.all_terminal {
                if snapshot.failed.is_empty() {
                    break LevelOutcome::Complete;
                }
                break LevelOutcome::TasksFailed(snapshot.failed);
            }

            // Tasks remain but nobody is alive to run them: try to bring
            // workers back; when that stops working, surface the failure
            // instead of spinning.
            let alive = self
                .launcher
                .get_all_workers()
                .await
                .values()
                .filter(|h| h.is_alive())
                .count();
            if alive == 0 {
                if self.respawn_for_pending(&feature, level).await? {
                    // A spawn happened; let the next tick re-evaluate.
                    stagnant_iterations = 0;
                    continue;
                }
                stagnant_iterations += 1;
                if stagnant_iterations >= 3 {
                    tracing::error!(level, "tasks remain but no workers can run them");
                    break LevelOutcome::TasksFailed(snapshot.not_terminal);
                }
            } else {
                stagnant_iterations = 0;
            }
        };

        // The level is done one way or another; stop its workers.
        self.launcher.terminate_all(false).await;
        self.heartbeats.clear_all();

        if matches!(outcome, LevelOutcome::Complete) {
            self.store.update(|state| {
                state.levels.entry(level).or_default().status = LevelStatus::Complete;
            })?;
            self.store
                .append_event("level_complete", serde_json::json!({"level": level}))?;
        }
        Ok(outcome)
    }

    /// Pending tasks at `level` whose dependencies are complete become
    /// ready. The orchestrator exclusively owns this transition.
    fn mark_ready_tasks(&self, level: u32) -> Result<()> {
        let completed: HashSet<String> = {
            let state = self.store.load()?;
            state
                .tasks
                .iter()
                .filter(|(_, t)| t.status == TaskStatus::Complete)
                .map(|(id, _)| id.clone())
                .collect()
        };
        let newly_ready: Vec<String> = self
            .graph
            .tasks_for_level(level)
            .iter()
            .filter(|t| self.graph.are_dependencies_complete(&t.id, &completed))
            .map(|t| t.id.clone())
            .collect();

        self.store.update(|state| {
            for id in &newly_ready {
                if let Some(t) = state.tasks.get_mut(id) {
                    if t.status == TaskStatus::Pending {
                        t.status = TaskStatus::Ready;
                        t.updated_at = chrono::Local::now();
                    }
                }
            }
        })?;
        Ok(())
    }

    /// Spawn a worker (with retry and circuit breaking) if it is not
    /// already alive. Failure leaves its tasks pending for other workers.
    /// Returns whether a spawn attempt actually went through the launcher.
    async fn ensure_worker(&mut self, feature: &str, worker_id: u32) -> Result<bool> {
        if let Some(handle) = self.launcher.get_handle(worker_id).await {
            if handle.is_alive() {
                return Ok(false);
            }
        }
        if !self.breaker.allows_spawn() {
            tracing::warn!(worker_id, "circuit open, not spawning");
            return Ok(false);
        }

        let branch = worker_branch(feature, worker_id);
        let worktree = match self.worktrees.create(
            feature,
            worker_id,
            &self.config.merge.target_branch,
        ) {
            Ok(info) => info,
            Err(e) => {
                tracing::error!(worker_id, error = %e, "failed to create worktree");
                self.breaker.record_failure();
                return Ok(false);
            }
        };

        let spec = SpawnSpec {
            worker_id,
            feature: feature.to_string(),
            worktree_path: worktree.path.clone(),
            branch: branch.clone(),
            env: BTreeMap::new(),
        };
        let policy = RetryPolicy {
            max_attempts: self.config.workers.spawn_retry_attempts,
            strategy: self.config.workers.spawn_backoff_strategy,
            base_seconds: self.config.workers.spawn_backoff_base_seconds,
            max_seconds: self.config.workers.spawn_backoff_max_seconds,
        };

        let result = self.launcher.spawn_with_retry(&spec, &policy).await;
        if result.success {
            self.breaker.record_success();
            if let Some(handle) = result.handle.as_ref() {
                let mut ws = WorkerState::new(worker_id, branch);
                ws.pid = handle.pid;
                ws.container_id = handle.container_id.clone();
                self.store.set_worker_state(ws)?;
            }
            self.store.append_event(
                "worker_spawned",
                serde_json::json!({"worker_id": worker_id}),
            )?;
            Ok(true)
        } else {
            self.breaker.record_failure();
            tracing::error!(
                worker_id,
                error = ?result.error,
                "worker could not be spawned; its tasks stay pending"
            );
            Ok(false)
        }
    }

    /// Stall and crash recovery for one poll iteration.
    async fn handle_stalled_and_crashed(
        &mut self,
        feature: &str,
        statuses: &BTreeMap<u32, WorkerStatus>,
    ) -> Result<()> {
        let stall_threshold = Duration::from_secs(self.config.heartbeat.stall_timeout_seconds);

        for (&worker_id, &status) in statuses {
            let stalled = status == WorkerStatus::Stalled
                || (status.is_alive() && self.heartbeats.is_stale(worker_id, stall_threshold));

            if stalled {
                tracing::warn!(worker_id, "worker stalled, reclaiming its task");
                self.reclaim_worker_task(worker_id)?;
                self.launcher.terminate(worker_id, true).await;
                self.store.append_event(
                    "worker_stalled",
                    serde_json::json!({"worker_id": worker_id}),
                )?;
                self.maybe_respawn(feature, worker_id).await?;
            } else if status == WorkerStatus::Crashed {
                tracing::warn!(worker_id, "worker crashed, reclaiming its task");
                self.reclaim_worker_task(worker_id)?;
                self.store.append_event(
                    "worker_crashed",
                    serde_json::json!({"worker_id": worker_id}),
                )?;
                self.maybe_respawn(feature, worker_id).await?;
            }
        }
        Ok(())
    }

    /// Reset any task held by `worker_id` back to pending.
    fn reclaim_worker_task(&self, worker_id: u32) -> Result<()> {
        self.store.update(|state| {
            let held: Vec<String> = state
                .tasks
                .iter()
                .filter(|(_, t)| t.status.is_held() && t.worker_id == Some(worker_id))
                .map(|(id, _)| id.clone())
                .collect();
            for id in held {
                if let Some(t) = state.tasks.get_mut(&id) {
                    tracing::info!(task_id = %id, worker_id, "reclaimed task to pending");
                    t.status = TaskStatus::Pending;
                    t.worker_id = None;
                    t.updated_at = chrono::Local::now();
                }
            }
            if let Some(ws) = state.workers.get_mut(&worker_id) {
                ws.current_task = None;
            }
        })?;
        self.heartbeats.clear(worker_id);
        Ok(())
    }

    /// Respawn a worker if policy and budget allow. Returns whether a
    /// spawn attempt was made.
    async fn maybe_respawn(&mut self, feature: &str, worker_id: u32) -> Result<bool> {
        if !self.config.workers.auto_respawn {
            return Ok(false);
        }
        let count = self.respawn_counts.entry(worker_id).or_insert(0);
        if *count >= self.config.workers.max_respawn_attempts {
            tracing::warn!(worker_id, "respawn budget exhausted");
            return Ok(false);
        }
        *count += 1;
        tracing::info!(worker_id, attempt = *count, "respawning worker");
        self.ensure_worker(feature, worker_id).await
    }

    /// When the pool died entirely but claimable work remains, try to
    /// bring workers back. Returns whether any spawn attempt was made.
    async fn respawn_for_pending(&mut self, feature: &str, level: u32) -> Result<bool> {
        let snapshot = self.level_snapshot(level)?;
        if snapshot.not_terminal.is_empty() {
            return Ok(false);
        }
        let tasks = self.graph.tasks_for_level(level);
        let worker_count = (tasks.len() as u32).min(self.config.workers.max_concurrent);
        let mut spawned_any = false;
        for worker_id in 0..worker_count {
            spawned_any |= self.maybe_respawn(feature, worker_id).await?;
        }
        Ok(spawned_any)
    }

    /// One policy retry per failed task, bounded by `retry_attempts`.
    fn retry_failed_tasks(&self, level: u32) -> Result<()> {
        let retry_budget = self.config.workers.retry_attempts;
        if retry_budget == 0 {
            return Ok(());
        }
        let level_tasks: HashSet<String> = self
            .graph
            .tasks_for_level(level)
            .iter()
            .map(|t| t.id.clone())
            .collect();

        self.store.update(|state| {
            for (id, t) in state.tasks.iter_mut() {
                if level_tasks.contains(id)
                    && t.status == TaskStatus::Failed
                    && t.retry_count < retry_budget
                {
                    t.retry_count += 1;
                    t.status = TaskStatus::Pending;
                    t.updated_at = chrono::Local::now();
                    tracing::info!(task_id = %id, retry = t.retry_count, "retrying failed task");
                }
            }
        })?;
        Ok(())
    }

    fn level_snapshot(&self, level: u32) -> Result<LevelSnapshot> {
        self.store.invalidate_cache();
        let state = self.store.load()?;
        let mut snapshot = LevelSnapshot {
            all_terminal: true,
            failed: Vec::new(),
            not_terminal: Vec::new(),
        };
        for task in self.graph.tasks_for_level(level) {
            match state.tasks.get(&task.id).map(|t| t.status) {
                Some(status) if status.is_terminal() => {
                    if status != TaskStatus::Complete {
                        snapshot.failed.push(task.id.clone());
                    }
                }
                _ => {
                    snapshot.all_terminal = false;
                    snapshot.not_terminal.push(task.id.clone());
                }
            }
        }
        Ok(snapshot)
    }

    // -- merge -------------------------------------------------------------

    async fn merge_level(&mut self, level: u32) -> Result<std::result::Result<(), String>> {
        let target = self.config.merge.target_branch.clone();
        let branches = self
            .merge
            .mergeable_branches()
            .context("failed to list worker branches")?;

        self.store.update(|state| {
            state.levels.entry(level).or_default().merge_status = MergeStatus::InProgress;
        })?;

        let result = self.merge.full_merge_flow(level, &branches, &target).await;

        if result.success {
            self.store.update(|state| {
                let entry = state.levels.entry(level).or_default();
                entry.merge_status = MergeStatus::Merged;
                state.current_level = state.current_level.max(level);
            })?;
            self.store.append_event(
                "level_merged",
                serde_json::json!({
                    "level": level,
                    "commit": result.merge_commit,
                    "branches": result.source_branches,
                }),
            )?;
            Ok(Ok(()))
        } else {
            let error = result
                .error
                .clone()
                .unwrap_or_else(|| "merge failed".into());
            self.store.update(|state| {
                let entry = state.levels.entry(level).or_default();
                entry.merge_status = if result.conflicts.is_empty() {
                    MergeStatus::Failed
                } else {
                    MergeStatus::Conflict
                };
                state.error = Some(format!("level {level} merge failed: {error}"));
            })?;
            self.store.append_event(
                "level_merge_failed",
                serde_json::json!({
                    "level": level,
                    "error": error,
                    "conflicts": result.conflicts,
                }),
            )?;
            Ok(Err(error))
        }
    }
}

#[derive(Debug)]
enum LevelOutcome {
    Complete,
    TasksFailed(Vec<String>),
    Interrupted,
}

#[derive(Debug)]
struct LevelSnapshot {
    all_terminal: bool,
    failed: Vec<String>,
    not_terminal: Vec<String>,
}
