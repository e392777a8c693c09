//! Task verification.
//!
//! Runs a task's verification command through the shared command executor
//! with the task's timeout, records results, and optionally runs the
//! three-tier variant (syntax / correctness / quality).

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Local};

use drover_state::error::{DroverError, Result};
use drover_state::graph::Task;

use crate::config::{VerificationConfig, VerificationTiersConfig};
use crate::exec::CommandExecutor;

/// Outcome of one verification attempt.
#[derive(Debug, Clone)]
pub struct VerificationResult {
    pub task_id: String,
    pub success: bool,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub command: String,
    pub timestamp: DateTime<Local>,
    pub timed_out: bool,
}

impl VerificationResult {
    fn auto_pass(task_id: &str) -> Self {
        Self {
            task_id: task_id.to_string(),
            success: true,
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
            duration_ms: 0,
            command: String::new(),
            timestamp: Local::now(),
            timed_out: false,
        }
    }
}

/// Executes verification commands with the configured timeout bounds.
#[derive(Debug, Clone)]
pub struct VerificationExecutor {
    config: VerificationConfig,
    executor: CommandExecutor,
}

impl VerificationExecutor {
    pub fn new(config: VerificationConfig) -> Self {
        let executor = CommandExecutor::new(
            None,
            Duration::from_secs(config.default_timeout_seconds),
            true,
        );
        Self { config, executor }
    }

    fn effective_timeout(&self, requested: Option<u64>) -> Duration {
        let seconds = requested
            .unwrap_or(self.config.default_timeout_seconds)
            .min(self.config.max_timeout_seconds);
        Duration::from_secs(seconds)
    }

    /// Verify a task in `cwd`. A task without a verification spec
    /// auto-passes.
    pub async fn verify_task(
        &self,
        task: &Task,
        cwd: &Path,
        env: &BTreeMap<String, String>,
    ) -> Result<VerificationResult> {
        let Some(spec) = &task.verification else {
            tracing::debug!(task_id = %task.id, "no verification command, auto-pass");
            return Ok(VerificationResult::auto_pass(&task.id));
        };
        self.run_command(&spec.command, &task.id, spec.timeout_seconds, cwd, env)
            .await
    }

    /// Re-execute a failing command up to `max_retries` extra times. Every
    /// attempt is recorded; the final attempt is the result.
    pub async fn verify_with_retry(
        &self,
        command: &str,
        task_id: &str,
        cwd: &Path,
        max_retries: u32,
        retry_delay: Duration,
    ) -> Result<(VerificationResult, Vec<VerificationResult>)> {
        let mut attempts = Vec::new();
        let env = BTreeMap::new();

        for attempt in 0..=max_retries {
            let result = self.run_command(command, task_id, None, cwd, &env).await?;
            let success = result.success;
            attempts.push(result);
            if success {
                break;
            }
            if attempt < max_retries {
                tracing::info!(task_id, attempt = attempt + 1, "verification failed, retrying");
                tokio::time::sleep(retry_delay).await;
            }
        }

        let last = attempts.last().cloned().expect("at least one attempt");
        Ok((last, attempts))
    }

    /// Map a failed result to a typed error when the caller wants one.
    pub fn check_result(&self, result: &VerificationResult, raise_on_failure: bool) -> Result<bool> {
        if result.success {
            return Ok(true);
        }
        if !raise_on_failure {
            return Ok(false);
        }
        if result.timed_out {
            return Err(DroverError::TaskTimeout {
                task_id: result.task_id.clone(),
                timeout_seconds: result.duration_ms / 1000,
            });
        }
        Err(DroverError::VerificationFailed {
            task_id: result.task_id.clone(),
            command: result.command.clone(),
            exit_code: result.exit_code,
            stdout: result.stdout.clone(),
            stderr: result.stderr.clone(),
        })
    }

    async fn run_command(
        &self,
        command: &str,
        task_id: &str,
        timeout_seconds: Option<u64>,
        cwd: &Path,
        env: &BTreeMap<String, String>,
    ) -> Result<VerificationResult> {
        let timeout = self.effective_timeout(timeout_seconds);
        let outcome = self
            .executor
            .execute(command, Some(timeout), env, Some(cwd))
            .await?;

        if outcome.success {
            tracing::info!(task_id, duration_ms = outcome.duration_ms, "verification passed");
        } else {
            tracing::warn!(
                task_id,
                exit_code = outcome.exit_code,
                timed_out = outcome.timed_out,
                "verification failed"
            );
        }

        Ok(VerificationResult {
            task_id: task_id.to_string(),
            success: outcome.success,
            exit_code: outcome.exit_code,
            stdout: outcome.stdout,
            stderr: outcome.stderr,
            duration_ms: outcome.duration_ms,
            command: command.to_string(),
            timestamp: Local::now(),
            timed_out: outcome.timed_out,
        })
    }
}

/// Which tier a result belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Syntax,
    Correctness,
    Quality,
}

/// Combined outcome of a tiered verification run.
#[derive(Debug, Clone)]
pub struct TierOutcome {
    /// False as soon as a blocking tier (syntax or correctness) fails.
    pub overall_pass: bool,
    /// The advisory quality tier's verdict, if it ran.
    pub overall_quality: Option<bool>,
    pub results: Vec<(Tier, VerificationResult)>,
}

/// Three-tier verification: syntax and correctness block, quality advises.
#[derive(Debug, Clone)]
pub struct VerificationTiers {
    tiers: VerificationTiersConfig,
    executor: VerificationExecutor,
}

impl VerificationTiers {
    pub fn new(tiers: VerificationTiersConfig, config: VerificationConfig) -> Self {
        Self {
            tiers,
            executor: VerificationExecutor::new(config),
        }
    }

    /// Run the configured tiers for a task. Tier 2 falls back to the
    /// task's own verification command when no correctness command is
    /// configured.
    pub async fn run(&self, task: &Task, cwd: &Path) -> Result<TierOutcome> {
        let env = BTreeMap::new();
        let mut outcome = TierOutcome {
            overall_pass: true,
            overall_quality: None,
            results: Vec::new(),
        };

        if let Some(command) = &self.tiers.syntax {
            let result = self
                .executor
                .run_command(command, &task.id, None, cwd, &env)
                .await?;
            let passed = result.success;
            outcome.results.push((Tier::Syntax, result));
            if !passed {
                outcome.overall_pass = false;
                return Ok(outcome);
            }
        }

        let correctness = self
            .tiers
            .correctness
            .clone()
            .or_else(|| task.verification.as_ref().map(|v| v.command.clone()));
        if let Some(command) = correctness {
            let result = self
                .executor
                .run_command(&command, &task.id, None, cwd, &env)
                .await?;
            let passed = result.success;
            outcome.results.push((Tier::Correctness, result));
            if !passed {
                outcome.overall_pass = false;
                return Ok(outcome);
            }
        }

        if let Some(command) = &self.tiers.quality {
            let result = self
                .executor
                .run_command(command, &task.id, None, cwd, &env)
                .await?;
            outcome.overall_quality = Some(result.success);
            outcome.results.push((Tier::Quality, result));
        }

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drover_state::graph::{FileSet, Verification};
    use tempfile::TempDir;

    fn task(id: &str, verification: Option<Verification>) -> Task {
        Task {
            id: id.into(),
            title: "test task".into(),
            level: 1,
            dependencies: vec![],
            files: FileSet::default(),
            verification,
            estimate_minutes: 5,
            critical_path: false,
        }
    }

    fn executor() -> VerificationExecutor {
        VerificationExecutor::new(VerificationConfig::default())
    }

    #[tokio::test]
    async fn task_without_verification_auto_passes() {
        let dir = TempDir::new().unwrap();
        let result = executor()
            .verify_task(&task("T1", None), dir.path(), &BTreeMap::new())
            .await
            .unwrap();
        assert!(result.success);
        assert!(result.command.is_empty());
    }

    #[tokio::test]
    async fn passing_command_succeeds() {
        let dir = TempDir::new().unwrap();
        let t = task(
            "T1",
            Some(Verification {
                command: "true".into(),
                timeout_seconds: Some(10),
            }),
        );
        let result = executor()
            .verify_task(&t, dir.path(), &BTreeMap::new())
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.exit_code, 0);
    }

    #[tokio::test]
    async fn failing_command_maps_to_typed_error() {
        let dir = TempDir::new().unwrap();
        let t = task(
            "T1",
            Some(Verification {
                command: "false".into(),
                timeout_seconds: None,
            }),
        );
        let exec = executor();
        let result = exec
            .verify_task(&t, dir.path(), &BTreeMap::new())
            .await
            .unwrap();
        assert!(!result.success);

        let err = exec.check_result(&result, true).unwrap_err();
        match err {
            DroverError::VerificationFailed { task_id, .. } => assert_eq!(task_id, "T1"),
            other => panic!("unexpected error: {other}"),
        }
        assert!(!exec.check_result(&result, false).unwrap());
    }

    #[tokio::test]
    async fn retry_records_every_attempt() {
        let dir = TempDir::new().unwrap();
        let exec = executor();
        let (last, attempts) = exec
            .verify_with_retry("false", "T1", dir.path(), 2, Duration::from_millis(10))
            .await
            .unwrap();
        assert!(!last.success);
        assert_eq!(attempts.len(), 3);
    }

    #[tokio::test]
    async fn retry_stops_on_success() {
        let dir = TempDir::new().unwrap();
        let exec = executor();
        let (last, attempts) = exec
            .verify_with_retry("true", "T1", dir.path(), 3, Duration::from_millis(10))
            .await
            .unwrap();
        assert!(last.success);
        assert_eq!(attempts.len(), 1);
    }

    #[tokio::test]
    async fn tiers_stop_on_blocking_failure() {
        let dir = TempDir::new().unwrap();
        let tiers = VerificationTiers::new(
            VerificationTiersConfig {
                syntax: Some("false".into()),
                correctness: Some("true".into()),
                quality: Some("true".into()),
            },
            VerificationConfig::default(),
        );
        let outcome = tiers.run(&task("T1", None), dir.path()).await.unwrap();
        assert!(!outcome.overall_pass);
        assert_eq!(outcome.results.len(), 1);
        assert!(outcome.overall_quality.is_none());
    }

    #[tokio::test]
    async fn quality_tier_is_advisory() {
        let dir = TempDir::new().unwrap();
        let tiers = VerificationTiers::new(
            VerificationTiersConfig {
                syntax: Some("true".into()),
                correctness: Some("true".into()),
                quality: Some("false".into()),
            },
            VerificationConfig::default(),
        );
        let outcome = tiers.run(&task("T1", None), dir.path()).await.unwrap();
        assert!(outcome.overall_pass);
        assert_eq!(outcome.overall_quality, Some(false));
        assert_eq!(outcome.results.len(), 3);
    }

    #[tokio::test]
    async fn tier_two_falls_back_to_task_verification() {
        let dir = TempDir::new().unwrap();
        let tiers = VerificationTiers::new(
            VerificationTiersConfig::default(),
            VerificationConfig::default(),
        );
        let t = task(
            "T1",
            Some(Verification {
                command: "false".into(),
                timeout_seconds: None,
            }),
        );
        let outcome = tiers.run(&t, dir.path()).await.unwrap();
        assert!(!outcome.overall_pass);
        assert_eq!(outcome.results[0].0, Tier::Correctness);
    }
}
