//! Pre-flight environment checks.
//!
//! The gate before a run: disk space, repository presence, container
//! runtime readiness (container mode only), port availability, and
//! worktree feasibility. Error-severity failures block the run; warnings
//! do not.

use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use crate::config::{DroverConfig, LauncherKind};

/// Severity of a failed check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckSeverity {
    Error,
    Warning,
}

/// Result of a single pre-flight check.
#[derive(Debug, Clone)]
pub struct CheckResult {
    pub name: &'static str,
    pub passed: bool,
    pub message: String,
    pub severity: CheckSeverity,
}

impl CheckResult {
    fn pass(name: &'static str, message: impl Into<String>) -> Self {
        Self {
            name,
            passed: true,
            message: message.into(),
            severity: CheckSeverity::Error,
        }
    }

    fn fail(name: &'static str, message: impl Into<String>) -> Self {
        Self {
            name,
            passed: false,
            message: message.into(),
            severity: CheckSeverity::Error,
        }
    }

    fn warn(name: &'static str, message: impl Into<String>) -> Self {
        Self {
            name,
            passed: false,
            message: message.into(),
            severity: CheckSeverity::Warning,
        }
    }
}

/// Aggregate of all pre-flight checks.
#[derive(Debug, Clone, Default)]
pub struct PreflightReport {
    pub checks: Vec<CheckResult>,
}

impl PreflightReport {
    /// All error-severity checks passed.
    pub fn passed(&self) -> bool {
        self.checks
            .iter()
            .filter(|c| c.severity == CheckSeverity::Error)
            .all(|c| c.passed)
    }

    pub fn errors(&self) -> Vec<&CheckResult> {
        self.checks
            .iter()
            .filter(|c| !c.passed && c.severity == CheckSeverity::Error)
            .collect()
    }

    pub fn warnings(&self) -> Vec<&CheckResult> {
        self.checks
            .iter()
            .filter(|c| !c.passed && c.severity == CheckSeverity::Warning)
            .collect()
    }
}

impl std::fmt::Display for PreflightReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for check in &self.checks {
            let symbol = if check.passed { "PASS" } else { "FAIL" };
            writeln!(f, "[{symbol}] {}: {}", check.name, check.message)?;
        }
        Ok(())
    }
}

/// Runs the pre-flight checks for a planned run.
pub struct PreflightChecker {
    repo_path: PathBuf,
    launcher: LauncherKind,
    worker_count: u32,
    port_range: (u16, u16),
    min_disk_gb: f64,
    image: String,
}

impl PreflightChecker {
    pub fn new(repo_path: impl Into<PathBuf>, config: &DroverConfig, worker_count: u32) -> Self {
        Self {
            repo_path: repo_path.into(),
            launcher: config.workers.launcher,
            worker_count,
            port_range: (config.ports.range_start, config.ports.range_end),
            min_disk_gb: config.resources.min_disk_gb,
            image: config.container.image.clone(),
        }
    }

    pub fn run_all(&self) -> PreflightReport {
        let mut report = PreflightReport::default();
        report.checks.push(self.check_disk_space());
        report.checks.push(self.check_git_repo());
        if self.launcher == LauncherKind::Container {
            report.checks.push(self.check_docker_daemon());
            report.checks.push(self.check_docker_image());
            report.checks.push(self.check_auth());
        }
        report.checks.push(self.check_ports());
        report.checks.push(self.check_worktree_feasibility());
        report
    }

    fn check_disk_space(&self) -> CheckResult {
        match available_gb(&self.repo_path) {
            Some(free_gb) if free_gb >= self.min_disk_gb => {
                CheckResult::pass("disk space", format!("{free_gb:.1} GB free"))
            }
            Some(free_gb) => CheckResult::fail(
                "disk space",
                format!("{free_gb:.1} GB free (need {:.1} GB)", self.min_disk_gb),
            ),
            None => CheckResult::warn("disk space", "could not determine free space"),
        }
    }

    fn check_git_repo(&self) -> CheckResult {
        if self.repo_path.join(".git").exists() {
            CheckResult::pass("git repository", "repository detected")
        } else {
            CheckResult::fail(
                "git repository",
                format!("no .git directory under {}", self.repo_path.display()),
            )
        }
    }

    fn check_docker_daemon(&self) -> CheckResult {
        match run_with_timeout("docker", &["info"], Duration::from_secs(10)) {
            Some(true) => CheckResult::pass("container daemon", "docker is running"),
            Some(false) => CheckResult::fail("container daemon", "docker daemon not responding"),
            None => CheckResult::fail("container daemon", "docker CLI not found on PATH"),
        }
    }

    fn check_docker_image(&self) -> CheckResult {
        match run_with_timeout(
            "docker",
            &["image", "inspect", &self.image],
            Duration::from_secs(10),
        ) {
            Some(true) => CheckResult::pass("container image", format!("image '{}' found", self.image)),
            Some(false) => CheckResult::fail(
                "container image",
                format!("image '{}' not found locally", self.image),
            ),
            None => CheckResult::fail("container image", "could not inspect the worker image"),
        }
    }

    /// Worker authentication: an API key in the environment or a
    /// credentials directory.
    fn check_auth(&self) -> CheckResult {
        if std::env::var("ANTHROPIC_API_KEY").map(|v| !v.is_empty()).unwrap_or(false) {
            return CheckResult::pass("authentication", "ANTHROPIC_API_KEY is set");
        }
        let claude_dir = dirs::home_dir().map(|h| h.join(".claude"));
        if claude_dir.as_ref().map(|d| d.is_dir()).unwrap_or(false) {
            return CheckResult::pass("authentication", "~/.claude directory found");
        }
        CheckResult::fail(
            "authentication",
            "no ANTHROPIC_API_KEY and no ~/.claude directory",
        )
    }

    fn check_ports(&self) -> CheckResult {
        let needed = self.worker_count as usize;
        let mut available = 0usize;
        for port in self.port_range.0..self.port_range.1 {
            if available >= needed {
                break;
            }
            if TcpListener::bind(("127.0.0.1", port)).is_ok() {
                available += 1;
            }
        }
        if available >= needed {
            CheckResult::pass(
                "port availability",
                format!("{available} ports available (need {needed})"),
            )
        } else {
            CheckResult::fail(
                "port availability",
                format!(
                    "only {available}/{needed} ports available in {}-{}",
                    self.port_range.0, self.port_range.1
                ),
            )
        }
    }

    fn check_worktree_feasibility(&self) -> CheckResult {
        if !self.repo_path.join(".git").exists() {
            return CheckResult::warn("git worktree", "not a git repository");
        }
        match run_with_timeout_in(
            "git",
            &["worktree", "list"],
            &self.repo_path,
            Duration::from_secs(5),
        ) {
            Some(true) => CheckResult::pass(
                "git worktree",
                format!("worktrees supported ({} workers)", self.worker_count),
            ),
            Some(false) => CheckResult::warn("git worktree", "git worktree command failed"),
            None => CheckResult::warn("git worktree", "could not verify worktree support"),
        }
    }
}

/// Free gigabytes at `path`, via `df -Pk` (POSIX output).
fn available_gb(path: &Path) -> Option<f64> {
    let output = Command::new("df")
        .arg("-Pk")
        .arg(path)
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    let line = stdout.lines().nth(1)?;
    let avail_kb: f64 = line.split_whitespace().nth(3)?.parse().ok()?;
    Some(avail_kb / (1024.0 * 1024.0))
}

/// Run a probe command: Some(success) or None when the binary is missing
/// or hangs past the timeout.
fn run_with_timeout(program: &str, args: &[&str], timeout: Duration) -> Option<bool> {
    run_with_timeout_in(program, args, Path::new("."), timeout)
}

fn run_with_timeout_in(
    program: &str,
    args: &[&str],
    cwd: &Path,
    timeout: Duration,
) -> Option<bool> {
    let mut child = Command::new(program)
        .args(args)
        .current_dir(cwd)
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()
        .ok()?;

    let deadline = std::time::Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Some(status.success()),
            Ok(None) => {
                if std::time::Instant::now() >= deadline {
                    let _ = child.kill();
                    let _ = child.wait();
                    return None;
                }
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(_) => return None,
        }
    }
}
