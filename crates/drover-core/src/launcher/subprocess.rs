//! Subprocess launcher: workers as child processes of the orchestrator.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use drover_state::heartbeat::HeartbeatMonitor;
use drover_state::models::{WorkerExit, WorkerStatus};

use super::{env::validate_env_vars, Launcher, SpawnResult, SpawnSpec, WorkerHandle};

/// Grace period between SIGTERM and SIGKILL during terminate.
const TERMINATE_GRACE: Duration = Duration::from_secs(10);

/// Settings shared by both launcher backends.
#[derive(Debug, Clone)]
pub struct LauncherSettings {
    /// Main repository path (workers run in worktrees but state lives here).
    pub repo_path: PathBuf,
    /// Shared feature-state directory.
    pub state_dir: PathBuf,
    /// Where worker stdout/stderr logs land; `None` keeps pipes.
    pub log_dir: Option<PathBuf>,
    /// Heartbeat age beyond which a running worker counts as stalled.
    pub stall_timeout: Duration,
    /// Extra environment entries from config, validated before use.
    pub env_vars: BTreeMap<String, String>,
}

struct Inner {
    handles: BTreeMap<u32, WorkerHandle>,
    children: BTreeMap<u32, Child>,
}

/// Launches workers by re-invoking this binary's `worker` subcommand in
/// the worker's worktree.
pub struct SubprocessLauncher {
    settings: LauncherSettings,
    heartbeats: HeartbeatMonitor,
    /// Program + leading args used to start a worker. Defaults to the
    /// current executable with the `worker` subcommand; tests substitute
    /// stub programs.
    worker_command: Vec<String>,
    inner: Mutex<Inner>,
}

impl SubprocessLauncher {
    pub fn new(settings: LauncherSettings) -> Self {
        let current_exe = std::env::current_exe()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "drover".to_string());
        Self::with_worker_command(settings, vec![current_exe, "worker".into()])
    }

    /// Use an explicit program to start workers (tests use stub scripts).
    pub fn with_worker_command(settings: LauncherSettings, worker_command: Vec<String>) -> Self {
        let heartbeats = HeartbeatMonitor::new(settings.state_dir.join("heartbeats"));
        Self {
            settings,
            heartbeats,
            worker_command,
            inner: Mutex::new(Inner {
                handles: BTreeMap::new(),
                children: BTreeMap::new(),
            }),
        }
    }

    fn build_env(&self, spec: &SpawnSpec) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        env.insert("DROVER_WORKER_ID".into(), spec.worker_id.to_string());
        env.insert("DROVER_FEATURE".into(), spec.feature.clone());
        env.insert(
            "DROVER_WORKTREE".into(),
            spec.worktree_path.to_string_lossy().into_owned(),
        );
        env.insert("DROVER_BRANCH".into(), spec.branch.clone());
        env.insert(
            "DROVER_STATE_DIR".into(),
            self.settings.state_dir.to_string_lossy().into_owned(),
        );
        env.insert(
            "DROVER_REPO_PATH".into(),
            self.settings.repo_path.to_string_lossy().into_owned(),
        );
        if let Some(log_dir) = &self.settings.log_dir {
            env.insert("DROVER_LOG_DIR".into(), log_dir.to_string_lossy().into_owned());
        }
        env.extend(validate_env_vars(&self.settings.env_vars));
        env.extend(validate_env_vars(&spec.env));
        env
    }

    fn log_path(&self, worker_id: u32, stream: &str) -> Option<PathBuf> {
        self.settings
            .log_dir
            .as_ref()
            .map(|dir| dir.join(format!("worker-{worker_id}.{stream}.log")))
    }
}

#[async_trait]
impl Launcher for SubprocessLauncher {
    async fn spawn(&self, spec: &SpawnSpec) -> SpawnResult {
        let worker_id = spec.worker_id;

        if !spec.worktree_path.exists() {
            return SpawnResult::failure(
                worker_id,
                format!("worktree does not exist: {}", spec.worktree_path.display()),
            );
        }
        if self.worker_command.is_empty() {
            return SpawnResult::failure(worker_id, "empty worker command");
        }

        let (stdout, stderr) = match self.log_path(worker_id, "stdout") {
            Some(stdout_path) => {
                if let Some(dir) = &self.settings.log_dir {
                    if let Err(e) = std::fs::create_dir_all(dir) {
                        return SpawnResult::failure(
                            worker_id,
                            format!("failed to create log dir {}: {e}", dir.display()),
                        );
                    }
                }
                let stderr_path = self.log_path(worker_id, "stderr").expect("log dir set");
                let open = |p: &PathBuf| std::fs::File::create(p);
                match (open(&stdout_path), open(&stderr_path)) {
                    (Ok(out), Ok(err)) => (Stdio::from(out), Stdio::from(err)),
                    (Err(e), _) | (_, Err(e)) => {
                        return SpawnResult::failure(
                            worker_id,
                            format!("failed to open worker log file: {e}"),
                        );
                    }
                }
            }
            None => (Stdio::piped(), Stdio::piped()),
        };

        let mut cmd = Command::new(&self.worker_command[0]);
        cmd.args(&self.worker_command[1..])
            .arg("--worker-id")
            .arg(worker_id.to_string())
            .arg("--feature")
            .arg(&spec.feature)
            .arg("--worktree")
            .arg(&spec.worktree_path)
            .arg("--branch")
            .arg(&spec.branch)
            .current_dir(&spec.worktree_path)
            .envs(self.build_env(spec))
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr);

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return SpawnResult::failure(worker_id, format!("failed to spawn worker: {e}"));
            }
        };

        let mut handle = WorkerHandle::new(worker_id);
        handle.pid = child.id();

        let mut inner = self.inner.lock().await;
        inner.handles.insert(worker_id, handle.clone());
        inner.children.insert(worker_id, child);

        tracing::info!(worker_id, pid = ?handle.pid, "spawned worker subprocess");
        SpawnResult::ok(handle)
    }

    async fn monitor(&self, worker_id: u32) -> WorkerStatus {
        let mut inner = self.inner.lock().await;
        let Inner { handles, children } = &mut *inner;
        let (Some(handle), Some(child)) = (handles.get_mut(&worker_id), children.get_mut(&worker_id))
        else {
            return WorkerStatus::Stopped;
        };

        handle.health_check_at = Some(Instant::now());

        match child.try_wait() {
            Ok(None) => {
                // Still running.
                if handle.status == WorkerStatus::Initializing {
                    handle.status = WorkerStatus::Running;
                }
                if handle.status == WorkerStatus::Running
                    && self.heartbeats.is_stale(worker_id, self.settings.stall_timeout)
                {
                    handle.status = WorkerStatus::Stalled;
                }
                handle.status
            }
            Ok(Some(status)) => {
                let code = status.code().unwrap_or(-1);
                handle.exit_code = Some(code);
                handle.status = WorkerExit::from_code(code).as_worker_status();
                handle.status
            }
            Err(e) => {
                tracing::error!(worker_id, error = %e, "failed to poll worker");
                handle.status = WorkerStatus::Crashed;
                handle.status
            }
        }
    }

    async fn terminate(&self, worker_id: u32, force: bool) -> bool {
        let mut inner = self.inner.lock().await;
        let Some(mut child) = inner.children.remove(&worker_id) else {
            inner.handles.remove(&worker_id);
            return false;
        };

        let result = async {
            if force {
                child.start_kill()?;
            } else {
                #[cfg(unix)]
                if let Some(pid) = child.id() {
                    // SIGTERM first so the worker can record a checkpoint.
                    unsafe {
                        libc::kill(pid as libc::pid_t, libc::SIGTERM);
                    }
                }
                #[cfg(not(unix))]
                child.start_kill()?;
            }

            match tokio::time::timeout(TERMINATE_GRACE, child.wait()).await {
                Ok(status) => status,
                Err(_) => {
                    child.start_kill()?;
                    child.wait().await
                }
            }
        }
        .await;

        inner.handles.remove(&worker_id);

        match result {
            Ok(status) => {
                tracing::info!(worker_id, code = ?status.code(), "terminated worker");
                true
            }
            Err(e) => {
                tracing::error!(worker_id, error = %e, "failed to terminate worker");
                false
            }
        }
    }

    async fn get_output(&self, worker_id: u32, tail: usize) -> String {
        if let Some(path) = self.log_path(worker_id, "stdout") {
            if let Ok(contents) = std::fs::read_to_string(&path) {
                let lines: Vec<&str> = contents.lines().collect();
                let start = lines.len().saturating_sub(tail);
                return lines[start..].join("\n");
            }
        }
        String::new()
    }

    async fn get_handle(&self, worker_id: u32) -> Option<WorkerHandle> {
        self.inner.lock().await.handles.get(&worker_id).cloned()
    }

    async fn get_all_workers(&self) -> BTreeMap<u32, WorkerHandle> {
        self.inner.lock().await.handles.clone()
    }

    async fn remove_handle(&self, worker_id: u32) {
        let mut inner = self.inner.lock().await;
        inner.handles.remove(&worker_id);
        inner.children.remove(&worker_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn settings(dir: &TempDir) -> LauncherSettings {
        LauncherSettings {
            repo_path: dir.path().to_path_buf(),
            state_dir: dir.path().join(".drover/state"),
            log_dir: Some(dir.path().join(".drover/logs")),
            stall_timeout: Duration::from_secs(120),
            env_vars: BTreeMap::new(),
        }
    }

    fn spec(dir: &TempDir, worker_id: u32) -> SpawnSpec {
        SpawnSpec {
            worker_id,
            feature: "demo".into(),
            worktree_path: dir.path().to_path_buf(),
            branch: format!("drover/demo/worker-{worker_id}"),
            env: BTreeMap::new(),
        }
    }

    /// A stub worker that exits immediately with the requested code. The
    /// extra worker args appended by the launcher are harmless to `sh -c`.
    fn stub_launcher(dir: &TempDir, exit_code: i32) -> SubprocessLauncher {
        SubprocessLauncher::with_worker_command(
            settings(dir),
            vec![
                "sh".into(),
                "-c".into(),
                format!("exit {exit_code}"),
                "worker-stub".into(),
            ],
        )
    }

    fn sleeper_launcher(dir: &TempDir) -> SubprocessLauncher {
        SubprocessLauncher::with_worker_command(
            settings(dir),
            vec!["sh".into(), "-c".into(), "sleep 30".into(), "worker-stub".into()],
        )
    }

    #[tokio::test]
    async fn spawn_missing_worktree_fails_without_handle() {
        let dir = TempDir::new().unwrap();
        let launcher = stub_launcher(&dir, 0);
        let mut spec = spec(&dir, 0);
        spec.worktree_path = dir.path().join("missing");

        let result = launcher.spawn(&spec).await;
        assert!(!result.success);
        assert!(launcher.get_handle(0).await.is_none());
    }

    /// Poll until the stub process has exited and the status settled.
    async fn wait_terminal(launcher: &SubprocessLauncher, worker_id: u32) -> WorkerStatus {
        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        loop {
            let status = launcher.monitor(worker_id).await;
            if !matches!(status, WorkerStatus::Initializing | WorkerStatus::Running) {
                return status;
            }
            assert!(
                std::time::Instant::now() < deadline,
                "stub worker did not exit"
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    #[tokio::test]
    async fn clean_exit_maps_to_stopped_and_is_reaped() {
        let dir = TempDir::new().unwrap();
        let launcher = stub_launcher(&dir, 0);
        assert!(launcher.spawn(&spec(&dir, 0)).await.success);

        assert_eq!(wait_terminal(&launcher, 0).await, WorkerStatus::Stopped);

        let statuses = launcher.sync_state().await;
        assert_eq!(statuses[&0], WorkerStatus::Stopped);
        assert!(launcher.get_handle(0).await.is_none());
    }

    #[tokio::test]
    async fn exit_code_protocol_mapping() {
        let dir = TempDir::new().unwrap();
        for (code, expected) in [
            (2, WorkerStatus::Checkpointing),
            (3, WorkerStatus::Blocked),
            (4, WorkerStatus::Stopped),
            (9, WorkerStatus::Crashed),
        ] {
            let launcher = stub_launcher(&dir, code);
            assert!(launcher.spawn(&spec(&dir, 1)).await.success);
            assert_eq!(wait_terminal(&launcher, 1).await, expected, "exit code {code}");
        }
    }

    #[tokio::test]
    async fn terminate_removes_handle() {
        let dir = TempDir::new().unwrap();
        let launcher = sleeper_launcher(&dir);
        assert!(launcher.spawn(&spec(&dir, 3)).await.success);
        assert!(launcher.get_handle(3).await.is_some());

        assert!(launcher.terminate(3, false).await);
        assert!(launcher.get_handle(3).await.is_none());
        assert_eq!(launcher.monitor(3).await, WorkerStatus::Stopped);
    }

    #[tokio::test]
    async fn terminate_unknown_worker_is_false() {
        let dir = TempDir::new().unwrap();
        let launcher = stub_launcher(&dir, 0);
        assert!(!launcher.terminate(42, false).await);
    }

    #[tokio::test]
    async fn running_worker_reports_running() {
        let dir = TempDir::new().unwrap();
        let launcher = sleeper_launcher(&dir);
        assert!(launcher.spawn(&spec(&dir, 5)).await.success);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(launcher.monitor(5).await, WorkerStatus::Running);
        launcher.terminate(5, true).await;
    }
}
