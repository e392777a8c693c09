//! Shared external-command execution.
//!
//! Every gate, verification, diagnostic test, and recovery step runs
//! through [`CommandExecutor`]. Command strings are tokenized with shlex
//! (never handed to a shell), checked against an allowlist, and executed
//! as argv with a hard timeout. Shell metacharacters anywhere in the raw
//! string are refused unless the program is a known-safe command.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::AsyncReadExt;
use tokio::process::Command;

use drover_state::error::{DroverError, Result};

/// Programs allowed without `allow_unlisted`.
const SAFE_COMMANDS: &[&str] = &[
    "git", "cargo", "rustc", "python", "python3", "pytest", "pip", "node", "npm", "npx", "go",
    "ruff", "mypy", "eslint", "tsc", "make", "docker", "ls", "cat", "echo", "true", "false",
    "test", "df", "du", "lsof", "grep", "find", "wc", "sh", "sleep",
];

/// Characters that would change meaning under a shell. The executor never
/// invokes a shell, but refusing them keeps command strings from smuggling
/// intent past review.
const SHELL_METACHARACTERS: &[char] = &[';', '|', '&', '`', '$', '(', ')', '<', '>'];

/// Outcome of one command execution.
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub success: bool,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub timed_out: bool,
}

/// Stateless, freely instantiable command executor.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    working_dir: Option<PathBuf>,
    timeout: Duration,
    allow_unlisted: bool,
}

impl Default for CommandExecutor {
    fn default() -> Self {
        Self {
            working_dir: None,
            timeout: Duration::from_secs(60),
            allow_unlisted: false,
        }
    }
}

impl CommandExecutor {
    pub fn new(working_dir: Option<PathBuf>, timeout: Duration, allow_unlisted: bool) -> Self {
        Self {
            working_dir,
            timeout,
            allow_unlisted,
        }
    }

    /// Tokenize and validate a command string.
    ///
    /// Returns the argv on success. Rejections are typed
    /// [`DroverError::CommandValidation`] errors naming the offending part.
    pub fn validate(&self, command: &str) -> Result<Vec<String>> {
        if command.trim().is_empty() {
            return Err(DroverError::CommandValidation {
                message: "empty command".into(),
            });
        }

        let argv = shlex::split(command).ok_or_else(|| DroverError::CommandValidation {
            message: format!("unbalanced quoting in command: {command:?}"),
        })?;
        if argv.is_empty() {
            return Err(DroverError::CommandValidation {
                message: "empty command".into(),
            });
        }

        let program = program_name(&argv[0]);
        let listed = SAFE_COMMANDS.contains(&program);

        if let Some(c) = command.chars().find(|c| SHELL_METACHARACTERS.contains(c)) {
            if !listed {
                return Err(DroverError::CommandValidation {
                    message: format!("shell metacharacter {c:?} in command: {command:?}"),
                });
            }
        }

        if !listed {
            if !self.allow_unlisted {
                return Err(DroverError::CommandValidation {
                    message: format!("program {program:?} is not on the allowlist"),
                });
            }
            tracing::warn!(program, "running unlisted command");
        }

        Ok(argv)
    }

    /// Execute a command string with a timeout.
    ///
    /// The timeout is expressed in the result (`timed_out = true`,
    /// `success = false`), not as an error: callers decide whether a
    /// timeout is fatal.
    pub async fn execute(
        &self,
        command: &str,
        timeout: Option<Duration>,
        env: &BTreeMap<String, String>,
        cwd: Option<&Path>,
    ) -> Result<CommandResult> {
        let argv = self.validate(command)?;
        let timeout = timeout.unwrap_or(self.timeout);
        let cwd = cwd
            .map(Path::to_path_buf)
            .or_else(|| self.working_dir.clone());

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &cwd {
            cmd.current_dir(dir);
        }
        for (key, value) in env {
            cmd.env(key, value);
        }

        let started = Instant::now();
        let mut child = cmd.spawn().map_err(|e| DroverError::CommandValidation {
            message: format!("failed to spawn {:?}: {e}", argv[0]),
        })?;

        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();

        let wait = async {
            let status = child.wait().await;
            let mut stdout = String::new();
            let mut stderr = String::new();
            if let Some(pipe) = stdout_pipe.as_mut() {
                let _ = pipe.read_to_string(&mut stdout).await;
            }
            if let Some(pipe) = stderr_pipe.as_mut() {
                let _ = pipe.read_to_string(&mut stderr).await;
            }
            (status, stdout, stderr)
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok((status, stdout, stderr)) => {
                let status = status.map_err(|e| DroverError::CommandValidation {
                    message: format!("failed to wait for {:?}: {e}", argv[0]),
                })?;
                let exit_code = status.code().unwrap_or(-1);
                Ok(CommandResult {
                    success: status.success(),
                    exit_code,
                    stdout,
                    stderr,
                    duration_ms: started.elapsed().as_millis() as u64,
                    timed_out: false,
                })
            }
            Err(_) => {
                let _ = child.kill().await;
                Ok(CommandResult {
                    success: false,
                    exit_code: -1,
                    stdout: String::new(),
                    stderr: format!("command timed out after {}s", timeout.as_secs()),
                    duration_ms: started.elapsed().as_millis() as u64,
                    timed_out: true,
                })
            }
        }
    }
}

/// Basename of the program token, so `/usr/bin/git` matches `git`.
fn program_name(token: &str) -> &str {
    token.rsplit('/').next().unwrap_or(token)
}
