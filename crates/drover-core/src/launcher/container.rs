//! Container launcher: workers in detached containers.
//!
//! The container mounts the worker's worktree at `/workspace`, the main
//! repo's state directory (so orchestrator and worker share feature state
//! through the host filesystem), and the repository metadata so commits
//! made inside the container land on the worker branch. The entry command
//! runs the worker under a shell and keeps the container alive afterwards
//! for post-mortem inspection; an alive-marker file distinguishes "worker
//! still running" from "worker done, container idling".

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::Mutex;

use drover_state::heartbeat::HeartbeatMonitor;
use drover_state::models::{WorkerExit, WorkerStatus};

use super::subprocess::LauncherSettings;
use super::{env::validate_env_vars, Launcher, SpawnResult, SpawnSpec, WorkerHandle};
use crate::config::{ContainerConfig, ResourcesConfig};

/// Marker file present inside the container while the worker runs.
const ALIVE_MARKER: &str = "/tmp/.drover-alive";
/// File the entry script writes the worker's exit code to.
const EXIT_FILE: &str = "/tmp/.drover-exit";

/// How long to wait for the container itself to reach Running.
const CONTAINER_START_TIMEOUT: Duration = Duration::from_secs(30);
/// How long to wait for the worker process to become visible. Dependency
/// installation may happen first, so this is generous.
const WORKER_VISIBLE_TIMEOUT: Duration = Duration::from_secs(120);
/// Backend queries are throttled per handle; between queries the cached
/// status is returned.
const MONITOR_COOLDOWN: Duration = Duration::from_secs(10);
/// Graceful stop window before the container is killed.
const STOP_TIMEOUT_SECS: u32 = 10;

struct Inner {
    handles: BTreeMap<u32, WorkerHandle>,
}

/// Launches workers as detached containers from a pre-built image.
pub struct ContainerLauncher {
    settings: LauncherSettings,
    container: ContainerConfig,
    resources: ResourcesConfig,
    heartbeats: HeartbeatMonitor,
    inner: Mutex<Inner>,
}

impl ContainerLauncher {
    pub fn new(
        settings: LauncherSettings,
        container: ContainerConfig,
        resources: ResourcesConfig,
    ) -> Self {
        let heartbeats = HeartbeatMonitor::new(settings.state_dir.join("heartbeats"));
        Self {
            settings,
            container,
            resources,
            heartbeats,
            inner: Mutex::new(Inner {
                handles: BTreeMap::new(),
            }),
        }
    }

    fn container_name(feature: &str, worker_id: u32) -> String {
        let sanitized: String = feature
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' { c } else { '-' })
            .collect();
        format!("drover-{sanitized}-worker-{worker_id}")
    }

    async fn run_docker(args: &[String]) -> (i32, String, String) {
        match Command::new("docker").args(args).output().await {
            Ok(output) => (
                output.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&output.stdout).trim().to_string(),
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ),
            Err(e) => (-1, String::new(), format!("failed to run docker: {e}")),
        }
    }

    fn build_run_args(&self, spec: &SpawnSpec, name: &str) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "run".into(),
            "--detach".into(),
            "--name".into(),
            name.to_string(),
            "--memory".into(),
            self.resources.container_memory_limit.clone(),
            "--cpus".into(),
            self.resources.container_cpu_limit.to_string(),
            "--network".into(),
            self.container.network.clone(),
            "-w".into(),
            "/workspace".into(),
        ];

        if self.resources.gpu_enabled {
            args.push("--gpus".into());
            args.push("all".into());
        }

        // Run as the host user so commits and state writes stay owned by
        // the operator.
        #[cfg(unix)]
        {
            let uid = unsafe { libc::getuid() };
            let gid = unsafe { libc::getgid() };
            args.push("--user".into());
            args.push(format!("{uid}:{gid}"));
        }

        // Worktree, shared state, and repository metadata mounts. The .git
        // mount is read-write: worker commits must land on the branch.
        args.push("-v".into());
        args.push(format!("{}:/workspace", spec.worktree_path.display()));
        args.push("-v".into());
        args.push(format!(
            "{}:/workspace/.drover/state",
            self.settings.state_dir.display()
        ));
        args.push("-v".into());
        args.push(format!(
            "{}:/repo/.git",
            self.settings.repo_path.join(".git").display()
        ));
        for dir in &self.container.credential_dirs {
            args.push("-v".into());
            args.push(format!("{0}:{0}:ro", dir.display()));
        }

        let mut env = BTreeMap::new();
        env.insert("DROVER_WORKER_ID".to_string(), spec.worker_id.to_string());
        env.insert("DROVER_FEATURE".to_string(), spec.feature.clone());
        env.insert("DROVER_WORKTREE".to_string(), "/workspace".to_string());
        env.insert("DROVER_BRANCH".to_string(), spec.branch.clone());
        env.insert(
            "DROVER_STATE_DIR".to_string(),
            "/workspace/.drover/state".to_string(),
        );
        env.insert("DROVER_REPO_PATH".to_string(), "/repo".to_string());
        // Tells the entry script how to rewrite git paths inside the
        // container.
        env.insert("DROVER_GIT_DIR".to_string(), "/repo/.git".to_string());
        env.extend(validate_env_vars(&self.settings.env_vars));
        env.extend(validate_env_vars(&spec.env));
        for (key, value) in env {
            args.push("-e".into());
            args.push(format!("{key}={value}"));
        }

        args.push(self.container.image.clone());

        // Entry: worker under a shell; the container stays alive after the
        // worker exits so its filesystem can be inspected.
        let entry = format!(
            "touch {ALIVE_MARKER}; drover worker --worker-id {id} --feature {feature} \
             --worktree /workspace --branch {branch}; echo $? > {EXIT_FILE}; \
             rm -f {ALIVE_MARKER}; sleep infinity",
            id = spec.worker_id,
            feature = spec.feature,
            branch = spec.branch,
        );
        args.push("sh".into());
        args.push("-c".into());
        args.push(entry);

        args
    }

    async fn wait_until_running(&self, container_id: &str) -> bool {
        let deadline = Instant::now() + CONTAINER_START_TIMEOUT;
        while Instant::now() < deadline {
            let (code, stdout, _) = Self::run_docker(&[
                "inspect".into(),
                "-f".into(),
                "{{.State.Running}}".into(),
                container_id.into(),
            ])
            .await;
            if code == 0 && stdout == "true" {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        false
    }

    async fn wait_until_worker_visible(&self, container_id: &str) -> bool {
        let deadline = Instant::now() + WORKER_VISIBLE_TIMEOUT;
        while Instant::now() < deadline {
            let (code, _, _) = Self::run_docker(&[
                "exec".into(),
                container_id.into(),
                "test".into(),
                "-f".into(),
                ALIVE_MARKER.into(),
            ])
            .await;
            if code == 0 {
                return true;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        false
    }

    async fn remove_container(container_id: &str) {
        let _ = Self::run_docker(&["rm".into(), "-f".into(), container_id.into()]).await;
    }

    /// Worker exit code recorded by the entry script, if it finished.
    async fn read_exit_code(container_id: &str) -> Option<i32> {
        let (code, stdout, _) = Self::run_docker(&[
            "exec".into(),
            container_id.into(),
            "cat".into(),
            EXIT_FILE.into(),
        ])
        .await;
        if code == 0 {
            stdout.trim().parse().ok()
        } else {
            None
        }
    }

    /// Whether the worker image is present locally.
    pub async fn image_exists(&self) -> bool {
        let (code, _, _) = Self::run_docker(&[
            "image".into(),
            "inspect".into(),
            self.container.image.clone(),
        ])
        .await;
        code == 0
    }

    /// Create the worker network if missing.
    pub async fn ensure_network(&self) -> bool {
        let (code, _, _) = Self::run_docker(&[
            "network".into(),
            "inspect".into(),
            self.container.network.clone(),
        ])
        .await;
        if code == 0 {
            return true;
        }
        let (code, _, stderr) = Self::run_docker(&[
            "network".into(),
            "create".into(),
            self.container.network.clone(),
        ])
        .await;
        if code != 0 {
            tracing::error!(network = %self.container.network, %stderr, "failed to create network");
        }
        code == 0
    }
}

#[async_trait]
impl Launcher for ContainerLauncher {
    async fn spawn(&self, spec: &SpawnSpec) -> SpawnResult {
        let worker_id = spec.worker_id;
        let name = Self::container_name(&spec.feature, worker_id);

        // A leftover container from a previous run blocks the name.
        Self::remove_container(&name).await;

        let args = self.build_run_args(spec, &name);
        let (code, stdout, stderr) = Self::run_docker(&args).await;
        if code != 0 {
            return SpawnResult::failure(worker_id, format!("docker run failed: {stderr}"));
        }
        let container_id = stdout;

        if !self.wait_until_running(&container_id).await {
            Self::remove_container(&container_id).await;
            return SpawnResult::failure(
                worker_id,
                format!(
                    "container did not reach running within {}s",
                    CONTAINER_START_TIMEOUT.as_secs()
                ),
            );
        }

        if !self.wait_until_worker_visible(&container_id).await {
            Self::remove_container(&container_id).await;
            return SpawnResult::failure(
                worker_id,
                format!(
                    "worker process not visible within {}s",
                    WORKER_VISIBLE_TIMEOUT.as_secs()
                ),
            );
        }

        let mut handle = WorkerHandle::new(worker_id);
        handle.container_id = Some(container_id.clone());
        handle.status = WorkerStatus::Running;
        handle.health_check_at = Some(Instant::now());

        self.inner.lock().await.handles.insert(worker_id, handle.clone());
        tracing::info!(worker_id, container_id = %&container_id[..12.min(container_id.len())], "spawned container worker");
        SpawnResult::ok(handle)
    }

    async fn monitor(&self, worker_id: u32) -> WorkerStatus {
        let container_id = {
            let mut inner = self.inner.lock().await;
            let Some(handle) = inner.handles.get_mut(&worker_id) else {
                return WorkerStatus::Stopped;
            };
            // Cooldown: within the window, return the cached status without
            // querying the runtime.
            if let Some(last) = handle.health_check_at {
                if last.elapsed() < MONITOR_COOLDOWN {
                    return handle.status;
                }
            }
            handle.container_id.clone().unwrap_or_default()
        };

        let (code, stdout, _) = Self::run_docker(&[
            "inspect".into(),
            "-f".into(),
            "{{.State.Running}} {{.State.ExitCode}}".into(),
            container_id.clone(),
        ])
        .await;

        let status = if code != 0 {
            // Container vanished underneath us.
            WorkerStatus::Crashed
        } else {
            let mut parts = stdout.split_whitespace();
            let running = parts.next() == Some("true");
            let container_exit: i32 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(-1);

            if running {
                // Container alive; did the worker inside finish?
                let (marker_code, _, _) = Self::run_docker(&[
                    "exec".into(),
                    container_id.clone(),
                    "test".into(),
                    "-f".into(),
                    ALIVE_MARKER.into(),
                ])
                .await;
                if marker_code == 0 {
                    if self.heartbeats.is_stale(worker_id, self.settings.stall_timeout) {
                        WorkerStatus::Stalled
                    } else {
                        WorkerStatus::Running
                    }
                } else {
                    match Self::read_exit_code(&container_id).await {
                        Some(code) => WorkerExit::from_code(code).as_worker_status(),
                        None => WorkerStatus::Stopped,
                    }
                }
            } else {
                WorkerExit::from_code(container_exit).as_worker_status()
            }
        };

        let mut inner = self.inner.lock().await;
        if let Some(handle) = inner.handles.get_mut(&worker_id) {
            handle.status = status;
            handle.health_check_at = Some(Instant::now());
            if !status.is_alive() {
                handle.exit_code = Self::read_exit_code(&container_id).await;
            }
        }
        status
    }

    async fn terminate(&self, worker_id: u32, force: bool) -> bool {
        let container_id = {
            let inner = self.inner.lock().await;
            match inner.handles.get(&worker_id).and_then(|h| h.container_id.clone()) {
                Some(id) => id,
                None => return false,
            }
        };

        if !force {
            let (code, _, stderr) = Self::run_docker(&[
                "stop".into(),
                "-t".into(),
                STOP_TIMEOUT_SECS.to_string(),
                container_id.clone(),
            ])
            .await;
            if code != 0 {
                tracing::warn!(worker_id, %stderr, "graceful container stop failed, killing");
            }
        }
        Self::remove_container(&container_id).await;

        // Dropping the handle is how "terminated" is expressed.
        self.inner.lock().await.handles.remove(&worker_id);
        tracing::info!(worker_id, "terminated container worker");
        true
    }

    async fn get_output(&self, worker_id: u32, tail: usize) -> String {
        let container_id = {
            let inner = self.inner.lock().await;
            match inner.handles.get(&worker_id).and_then(|h| h.container_id.clone()) {
                Some(id) => id,
                None => return String::new(),
            }
        };
        let (_, stdout, stderr) = Self::run_docker(&[
            "logs".into(),
            "--tail".into(),
            tail.to_string(),
            container_id,
        ])
        .await;
        if stderr.is_empty() {
            stdout
        } else {
            format!("{stdout}\n{stderr}")
        }
    }

    async fn get_handle(&self, worker_id: u32) -> Option<WorkerHandle> {
        self.inner.lock().await.handles.get(&worker_id).cloned()
    }

    async fn get_all_workers(&self) -> BTreeMap<u32, WorkerHandle> {
        self.inner.lock().await.handles.clone()
    }

    async fn remove_handle(&self, worker_id: u32) {
        self.inner.lock().await.handles.remove(&worker_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_name_is_sanitized() {
        assert_eq!(
            ContainerLauncher::container_name("auth/flow v2", 3),
            "drover-auth-flow-v2-worker-3"
        );
    }

    #[test]
    fn run_args_include_mounts_and_limits() {
        let settings = LauncherSettings {
            repo_path: "/repo".into(),
            state_dir: "/repo/.drover/state".into(),
            log_dir: None,
            stall_timeout: Duration::from_secs(120),
            env_vars: BTreeMap::new(),
        };
        let launcher = ContainerLauncher::new(
            settings,
            ContainerConfig::default(),
            ResourcesConfig::default(),
        );
        let spec = SpawnSpec {
            worker_id: 0,
            feature: "demo".into(),
            worktree_path: "/repo/.drover/worktrees/demo/worker-0".into(),
            branch: "drover/demo/worker-0".into(),
            env: BTreeMap::new(),
        };
        let args = launcher.build_run_args(&spec, "drover-demo-worker-0");
        let joined = args.join(" ");
        assert!(joined.contains("--detach"));
        assert!(joined.contains("--memory 4g"));
        assert!(joined.contains("/repo/.drover/worktrees/demo/worker-0:/workspace"));
        assert!(joined.contains("/repo/.git:/repo/.git"));
        assert!(joined.contains("DROVER_WORKER_ID=0"));
        assert!(joined.contains("sleep infinity"));
        // Entry script records the worker's exit code for the monitor.
        assert!(joined.contains(EXIT_FILE));
    }
}
