//! The worker protocol: the code that runs inside each worker process.
//!
//! A worker signals ready, then loops: atomically claim a ready task at
//! the current level, invoke the coding agent in the worktree, commit
//! whatever the agent produced, run the task's verification, and report
//! complete or failed through the shared state store. A background task
//! writes heartbeats on a fixed interval the whole time. The worker's exit
//! code is a protocol (see [`WorkerExit`]).

use std::collections::HashSet;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use drover_state::error::{DroverError, Result};
use drover_state::graph::{Task, TaskGraph};
use drover_state::heartbeat::{Heartbeat, HeartbeatMonitor};
use drover_state::models::{TaskStatus, WorkerExit, WorkerStatus};
use drover_state::store::{graph_path, StateStore};

use crate::config::DroverConfig;
use crate::git::GitOps;
use crate::verify::VerificationExecutor;

/// Shared snapshot the heartbeat ticker reads.
#[derive(Debug, Default, Clone)]
struct Pulse {
    current_task: Option<String>,
    phase: String,
}

/// Arguments a worker is spawned with (see the worker command surface).
#[derive(Debug, Clone)]
pub struct WorkerArgs {
    pub worker_id: u32,
    pub feature: String,
    pub worktree: PathBuf,
    pub branch: String,
    pub state_dir: PathBuf,
}

/// One worker process's protocol driver.
pub struct WorkerProtocol {
    args: WorkerArgs,
    config: DroverConfig,
    store: StateStore,
    heartbeats: HeartbeatMonitor,
    graph: TaskGraph,
    git: GitOps,
    verifier: VerificationExecutor,
    pulse: Arc<Mutex<Pulse>>,
}

impl WorkerProtocol {
    /// Build a protocol driver from spawn arguments. Loads the task graph
    /// snapshot the orchestrator wrote into shared state.
    pub fn new(args: WorkerArgs, config: DroverConfig) -> Result<Self> {
        let store = StateStore::new(args.feature.clone(), args.state_dir.clone());
        let heartbeats = HeartbeatMonitor::new(store.heartbeat_dir());
        let graph = TaskGraph::from_file(&graph_path(&args.state_dir, &args.feature))?;
        let git = GitOps::new(args.worktree.clone());
        let verifier = VerificationExecutor::new(config.verification.clone());
        Ok(Self {
            args,
            config,
            store,
            heartbeats,
            graph,
            git,
            verifier,
            pulse: Arc::new(Mutex::new(Pulse::default())),
        })
    }

    /// Run the worker loop to completion.
    pub async fn run(&self) -> Result<WorkerExit> {
        self.signal_ready()?;
        let _ticker = self.start_heartbeat_ticker();

        let exit = loop {
            match self.claim_next_task()? {
                Some(task) => {
                    if let Some(exit) = self.execute_task(&task).await? {
                        break exit;
                    }
                }
                None => {
                    tracing::info!(
                        worker_id = self.args.worker_id,
                        "no claimable tasks remain, exiting clean"
                    );
                    break WorkerExit::Clean;
                }
            }
        };

        self.store.update(|state| {
            if let Some(ws) = state.workers.get_mut(&self.args.worker_id) {
                ws.status = match exit {
                    WorkerExit::Blocked => WorkerStatus::Blocked,
                    _ => WorkerStatus::Stopped,
                };
                ws.current_task = None;
                ws.exit_code = Some(exit.code());
            }
        })?;
        Ok(exit)
    }

    /// Record the worker as alive in shared state and write the first
    /// heartbeat.
    fn signal_ready(&self) -> Result<()> {
        self.store.update(|state| {
            let ws = state
                .workers
                .entry(self.args.worker_id)
                .or_insert_with(|| {
                    drover_state::models::WorkerState::new(
                        self.args.worker_id,
                        self.args.branch.clone(),
                    )
                });
            ws.status = WorkerStatus::Ready;
            ws.pid = Some(std::process::id());
            ws.branch = self.args.branch.clone();
        })?;
        self.beat(None, "ready")?;
        tracing::info!(worker_id = self.args.worker_id, "worker ready");
        Ok(())
    }

    /// Compare-and-swap claim of a ready task at the current level whose
    /// dependencies are complete.
    fn claim_next_task(&self) -> Result<Option<Task>> {
        self.store.invalidate_cache();
        let state = self.store.load()?;
        let level = state.current_level;

        let completed: HashSet<String> = state
            .tasks
            .iter()
            .filter(|(_, t)| t.status == TaskStatus::Complete)
            .map(|(id, _)| id.clone())
            .collect();

        let mut candidates: Vec<&str> = state
            .tasks
            .iter()
            .filter(|(id, t)| {
                t.status == TaskStatus::Ready
                    && self
                        .graph
                        .get_task(id)
                        .is_some_and(|task| task.level == level)
            })
            .map(|(id, _)| id.as_str())
            .collect();
        candidates.sort();

        for id in candidates {
            if !self.graph.are_dependencies_complete(id, &completed) {
                continue;
            }
            if self.store.claim_task(id, self.args.worker_id)? {
                tracing::info!(worker_id = self.args.worker_id, task_id = id, "claimed task");
                let task = self
                    .graph
                    .get_task(id)
                    .cloned()
                    .ok_or_else(|| DroverError::Task {
                        message: format!("claimed task {id} missing from graph"),
                        task_id: Some(id.to_string()),
                    })?;
                return Ok(Some(task));
            }
        }
        Ok(None)
    }

    /// Execute one claimed task end to end. Returns `Some(exit)` when the
    /// worker must stop with a protocol exit (agent unavailable), `None`
    /// to continue claiming.
    async fn execute_task(&self, task: &Task) -> Result<Option<WorkerExit>> {
        let started = Instant::now();

        self.store.update(|state| {
            if let Some(ws) = state.workers.get_mut(&self.args.worker_id) {
                ws.status = WorkerStatus::Running;
                ws.current_task = Some(task.id.clone());
            }
            if let Some(t) = state.tasks.get_mut(&task.id) {
                t.status = TaskStatus::InProgress;
                t.updated_at = chrono::Local::now();
            }
        })?;
        self.beat(Some(task.id.clone()), "executing")?;

        // Invoke the coding agent. The agent is an external collaborator:
        // drover feeds it the task and reads its exit code and output.
        let agent_outcome = match self.run_agent(task).await {
            Ok(outcome) => outcome,
            Err(DroverError::Worker { message, .. }) if message.contains("not found") => {
                // No agent binary means no worker can make progress here.
                tracing::error!(worker_id = self.args.worker_id, %message, "agent unavailable");
                self.report_failed(task, &format!("agent unavailable: {message}"))?;
                return Ok(Some(WorkerExit::Blocked));
            }
            Err(e) => {
                self.report_failed(task, &e.to_string())?;
                return Ok(None);
            }
        };

        if !agent_outcome.success {
            self.report_failed(
                task,
                &format!(
                    "agent exited {}: {}",
                    agent_outcome.exit_code,
                    tail(&agent_outcome.stderr, 500)
                ),
            )?;
            return Ok(None);
        }

        // Commit whatever the agent produced. A clean tree is fine when
        // verification does not require changes.
        if self.git.has_changes()? {
            let message = format!("drover: {} {}", task.id, task.title);
            self.git.commit(&message, true, false)?;
        } else {
            tracing::info!(task_id = %task.id, "agent produced no changes");
        }

        self.beat(Some(task.id.clone()), "verifying")?;
        let verification = self
            .verifier
            .verify_task(task, &self.args.worktree, &Default::default())
            .await?;

        if verification.success {
            self.report_complete(task, started.elapsed())?;
        } else {
            // Leave the worktree diff in place for inspection.
            self.report_failed(
                task,
                &format!(
                    "verification failed ({}): {}",
                    verification.exit_code,
                    tail(&verification.stderr, 500)
                ),
            )?;
        }
        Ok(None)
    }

    async fn run_agent(&self, task: &Task) -> Result<AgentOutcome> {
        let agent = &self.config.agent;
        let timeout = Duration::from_secs(u64::from(self.config.workers.timeout_minutes) * 60);

        let mut cmd = Command::new(&agent.command);
        cmd.args(&agent.args)
            .current_dir(&self.args.worktree)
            .env("DROVER_TASK_ID", &task.id)
            .env("DROVER_WORKER_ID", self.args.worker_id.to_string())
            .env("DROVER_FEATURE", &self.args.feature)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| DroverError::Worker {
            message: if e.kind() == std::io::ErrorKind::NotFound {
                format!("agent command not found: {}", agent.command)
            } else {
                format!("failed to spawn agent: {e}")
            },
            worker_id: Some(self.args.worker_id),
        })?;

        // The agent reads the task description from stdin.
        if let Some(mut stdin) = child.stdin.take() {
            let prompt = task_prompt(task);
            if let Err(e) = stdin.write_all(prompt.as_bytes()).await {
                tracing::warn!(task_id = %task.id, error = %e, "failed to write agent prompt");
            }
            drop(stdin);
        }

        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| DroverError::TaskTimeout {
                task_id: task.id.clone(),
                timeout_seconds: timeout.as_secs(),
            })?
            .map_err(|e| DroverError::Worker {
                message: format!("failed to collect agent output: {e}"),
                worker_id: Some(self.args.worker_id),
            })?;

        Ok(AgentOutcome {
            success: output.status.success(),
            exit_code: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn report_complete(&self, task: &Task, elapsed: Duration) -> Result<()> {
        self.store.update(|state| {
            if let Some(t) = state.tasks.get_mut(&task.id) {
                t.status = TaskStatus::Complete;
                t.error = None;
                t.worker_id = None;
                t.duration_ms = Some(elapsed.as_millis() as u64);
                t.updated_at = chrono::Local::now();
            }
            if let Some(ws) = state.workers.get_mut(&self.args.worker_id) {
                ws.tasks_completed += 1;
                ws.current_task = None;
                ws.status = WorkerStatus::Idle;
            }
        })?;
        self.beat(None, "idle")?;
        tracing::info!(
            worker_id = self.args.worker_id,
            task_id = %task.id,
            duration_ms = elapsed.as_millis() as u64,
            "task complete"
        );
        Ok(())
    }

    fn report_failed(&self, task: &Task, reason: &str) -> Result<()> {
        self.store.update(|state| {
            if let Some(t) = state.tasks.get_mut(&task.id) {
                t.status = TaskStatus::Failed;
                t.error = Some(reason.to_string());
                t.worker_id = None;
                t.updated_at = chrono::Local::now();
            }
            if let Some(ws) = state.workers.get_mut(&self.args.worker_id) {
                ws.current_task = None;
                ws.status = WorkerStatus::Idle;
            }
        })?;
        self.beat(None, "idle")?;
        tracing::warn!(
            worker_id = self.args.worker_id,
            task_id = %task.id,
            reason,
            "task failed"
        );
        Ok(())
    }

    /// Record a crash in shared state before the process dies. Called by
    /// the entry point's error path.
    pub fn report_crashed(&self, error: &str) {
        let _ = self.store.update(|state| {
            if let Some(ws) = state.workers.get_mut(&self.args.worker_id) {
                ws.status = WorkerStatus::Crashed;
            }
            state.error = Some(format!(
                "worker {} crashed: {error}",
                self.args.worker_id
            ));
        });
    }

    fn beat(&self, current_task: Option<String>, phase: &str) -> Result<()> {
        {
            let mut pulse = self.pulse.lock().unwrap_or_else(|e| e.into_inner());
            pulse.current_task = current_task.clone();
            pulse.phase = phase.to_string();
        }
        self.heartbeats
            .write(&Heartbeat::now(self.args.worker_id, current_task, phase))
    }

    /// Background heartbeat every `heartbeat.interval_seconds`, carrying
    /// the latest phase snapshot. The task aborts when its handle drops.
    fn start_heartbeat_ticker(&self) -> HeartbeatTicker {
        let interval = Duration::from_secs(self.config.heartbeat.interval_seconds);
        let monitor = self.heartbeats.clone();
        let pulse = Arc::clone(&self.pulse);
        let worker_id = self.args.worker_id;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let snapshot = pulse.lock().unwrap_or_else(|e| e.into_inner()).clone();
                let _ = monitor.write(&Heartbeat::now(
                    worker_id,
                    snapshot.current_task,
                    snapshot.phase,
                ));
            }
        });
        HeartbeatTicker { handle }
    }
}

struct HeartbeatTicker {
    handle: tokio::task::JoinHandle<()>,
}

impl Drop for HeartbeatTicker {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

struct AgentOutcome {
    success: bool,
    exit_code: i32,
    stderr: String,
}

/// The task description fed to the agent on stdin.
fn task_prompt(task: &Task) -> String {
    let mut prompt = format!("Task {}: {}\n", task.id, task.title);
    if !task.files.create.is_empty() {
        prompt.push_str(&format!("Create files: {}\n", task.files.create.join(", ")));
    }
    if !task.files.modify.is_empty() {
        prompt.push_str(&format!("Modify files: {}\n", task.files.modify.join(", ")));
    }
    if !task.files.read.is_empty() {
        prompt.push_str(&format!(
            "Read-only context: {}\n",
            task.files.read.join(", ")
        ));
    }
    if let Some(v) = &task.verification {
        prompt.push_str(&format!("Must pass: {}\n", v.command));
    }
    prompt
}

fn tail(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut start = s.len() - max;
    while start < s.len() && !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}
