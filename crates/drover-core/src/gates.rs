//! Quality gate execution.
//!
//! Gates are configured commands (lint, tests, type checks) run through
//! the shared command executor and categorized as pass / fail / timeout /
//! error / skip. Required gates decide merges; optional gates only warn.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use drover_state::error::{DroverError, Result};

use crate::config::QualityGate;
use crate::exec::CommandExecutor;

/// Categorized gate outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateOutcome {
    Pass,
    Fail,
    Timeout,
    Error,
    Skip,
}

/// Result of running one gate.
#[derive(Debug, Clone)]
pub struct GateRunResult {
    pub gate_name: String,
    pub outcome: GateOutcome,
    pub command: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

/// Counts per category for a runner's session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GateSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub timeout: usize,
    pub error: usize,
    pub skipped: usize,
}

/// Executes quality gates and keeps their results for summary queries.
pub struct GateRunner {
    gates: Vec<QualityGate>,
    results: Vec<GateRunResult>,
}

impl GateRunner {
    pub fn new(gates: Vec<QualityGate>) -> Self {
        Self {
            gates,
            results: Vec::new(),
        }
    }

    fn executor(timeout: Duration) -> CommandExecutor {
        // Custom gate commands are allowed (with a warning) since operators
        // configure them deliberately.
        CommandExecutor::new(None, timeout, true)
    }

    /// Run a single gate in `cwd`.
    pub async fn run_gate(
        &mut self,
        gate: &QualityGate,
        cwd: Option<&Path>,
        env: &BTreeMap<String, String>,
    ) -> GateRunResult {
        tracing::info!(gate = %gate.name, command = %gate.command, "running gate");
        let timeout = Duration::from_secs(gate.timeout);

        let run_result = Self::executor(timeout)
            .execute(&gate.command, Some(timeout), env, cwd)
            .await;

        let result = match run_result {
            Ok(outcome) => {
                let category = if outcome.success {
                    GateOutcome::Pass
                } else if outcome.timed_out {
                    GateOutcome::Timeout
                } else {
                    GateOutcome::Fail
                };
                match category {
                    GateOutcome::Pass => {
                        tracing::info!(gate = %gate.name, duration_ms = outcome.duration_ms, "gate passed")
                    }
                    GateOutcome::Timeout => tracing::warn!(gate = %gate.name, "gate timed out"),
                    _ => tracing::warn!(
                        gate = %gate.name,
                        exit_code = outcome.exit_code,
                        "gate failed"
                    ),
                }
                GateRunResult {
                    gate_name: gate.name.clone(),
                    outcome: category,
                    command: gate.command.clone(),
                    exit_code: outcome.exit_code,
                    stdout: outcome.stdout,
                    stderr: outcome.stderr,
                    duration_ms: outcome.duration_ms,
                }
            }
            Err(e) => {
                tracing::error!(gate = %gate.name, error = %e, "gate command invalid");
                GateRunResult {
                    gate_name: gate.name.clone(),
                    outcome: GateOutcome::Error,
                    command: gate.command.clone(),
                    exit_code: -1,
                    stdout: String::new(),
                    stderr: format!("command validation failed: {e}"),
                    duration_ms: 0,
                }
            }
        };

        self.results.push(result.clone());
        result
    }

    /// Run gates in declared order.
    ///
    /// A required gate that does not pass flips `all_passed`; with
    /// `stop_on_failure` it also aborts the remaining gates. Optional gate
    /// failures never abort and never flip `all_passed`.
    pub async fn run_all_gates(
        &mut self,
        gates: Option<Vec<QualityGate>>,
        cwd: Option<&Path>,
        stop_on_failure: bool,
        required_only: bool,
    ) -> (bool, Vec<GateRunResult>) {
        let mut gates = gates.unwrap_or_else(|| self.gates.clone());
        if required_only {
            gates.retain(|g| g.required);
        }
        if gates.is_empty() {
            tracing::info!("no gates to run");
            return (true, Vec::new());
        }

        let env = BTreeMap::new();
        let mut results = Vec::new();
        let mut all_passed = true;

        for gate in &gates {
            let result = self.run_gate(gate, cwd, &env).await;
            let ok = matches!(result.outcome, GateOutcome::Pass | GateOutcome::Skip);
            results.push(result);

            if !ok {
                if gate.required {
                    all_passed = false;
                    if stop_on_failure {
                        tracing::error!(gate = %gate.name, "stopping: required gate failed");
                        break;
                    }
                } else {
                    tracing::warn!(gate = %gate.name, "optional gate failed, continuing");
                }
            }
        }

        (all_passed, results)
    }

    /// Run a configured gate by name.
    pub async fn run_gate_by_name(&mut self, name: &str, cwd: Option<&Path>) -> Result<GateRunResult> {
        let gate = self
            .gates
            .iter()
            .find(|g| g.name == name)
            .cloned()
            .ok_or_else(|| DroverError::Gate {
                message: format!("gate not found: {name}"),
                gate: Some(name.to_string()),
            })?;
        Ok(self.run_gate(&gate, cwd, &BTreeMap::new()).await)
    }

    /// Map a gate result to a typed error when requested.
    pub fn check_result(&self, result: &GateRunResult, raise_on_failure: bool) -> Result<bool> {
        match result.outcome {
            GateOutcome::Pass | GateOutcome::Skip => Ok(true),
            _ if !raise_on_failure => Ok(false),
            GateOutcome::Timeout => Err(DroverError::GateTimeout {
                gate: result.gate_name.clone(),
                timeout_seconds: result.duration_ms / 1000,
            }),
            _ => Err(DroverError::GateFailure {
                gate: result.gate_name.clone(),
                command: result.command.clone(),
                exit_code: result.exit_code,
                stdout: result.stdout.clone(),
                stderr: result.stderr.clone(),
            }),
        }
    }

    pub fn results(&self) -> &[GateRunResult] {
        &self.results
    }

    pub fn clear_results(&mut self) {
        self.results.clear();
    }

    pub fn summary(&self) -> GateSummary {
        let mut summary = GateSummary {
            total: self.results.len(),
            ..Default::default()
        };
        for result in &self.results {
            match result.outcome {
                GateOutcome::Pass => summary.passed += 1,
                GateOutcome::Fail => summary.failed += 1,
                GateOutcome::Timeout => summary.timeout += 1,
                GateOutcome::Error => summary.error += 1,
                GateOutcome::Skip => summary.skipped += 1,
            }
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate(name: &str, command: &str, required: bool) -> QualityGate {
        QualityGate {
            name: name.into(),
            command: command.into(),
            required,
            timeout: 30,
            coverage_threshold: None,
        }
    }

    #[tokio::test]
    async fn passing_gate_is_pass() {
        let mut runner = GateRunner::new(vec![]);
        let result = runner
            .run_gate(&gate("ok", "true", true), None, &BTreeMap::new())
            .await;
        assert_eq!(result.outcome, GateOutcome::Pass);
    }

    #[tokio::test]
    async fn failing_gate_is_fail() {
        let mut runner = GateRunner::new(vec![]);
        let result = runner
            .run_gate(&gate("bad", "false", true), None, &BTreeMap::new())
            .await;
        assert_eq!(result.outcome, GateOutcome::Fail);
        assert_ne!(result.exit_code, 0);
    }

    #[tokio::test]
    async fn invalid_command_is_error() {
        let mut runner = GateRunner::new(vec![]);
        let result = runner
            .run_gate(&gate("broken", "", true), None, &BTreeMap::new())
            .await;
        assert_eq!(result.outcome, GateOutcome::Error);
    }

    #[tokio::test]
    async fn required_failure_stops_and_flips() {
        let mut runner = GateRunner::new(vec![
            gate("first", "false", true),
            gate("second", "true", true),
        ]);
        let (all_passed, results) = runner.run_all_gates(None, None, true, false).await;
        assert!(!all_passed);
        assert_eq!(results.len(), 1);
    }

    #[tokio::test]
    async fn optional_failure_continues_and_passes() {
        let mut runner = GateRunner::new(vec![
            gate("optional", "false", false),
            gate("required", "true", true),
        ]);
        let (all_passed, results) = runner.run_all_gates(None, None, true, false).await;
        assert!(all_passed);
        assert_eq!(results.len(), 2);
    }

    #[tokio::test]
    async fn required_failure_without_stop_runs_all() {
        let mut runner = GateRunner::new(vec![
            gate("first", "false", true),
            gate("second", "true", true),
        ]);
        let (all_passed, results) = runner.run_all_gates(None, None, false, false).await;
        assert!(!all_passed);
        assert_eq!(results.len(), 2);
    }

    #[tokio::test]
    async fn required_only_filters() {
        let mut runner = GateRunner::new(vec![
            gate("optional", "false", false),
            gate("required", "true", true),
        ]);
        let (all_passed, results) = runner.run_all_gates(None, None, true, true).await;
        assert!(all_passed);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].gate_name, "required");
    }

    #[tokio::test]
    async fn empty_gate_list_passes() {
        let mut runner = GateRunner::new(vec![]);
        let (all_passed, results) = runner.run_all_gates(None, None, true, false).await;
        assert!(all_passed);
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn summary_counts_categories() {
        let mut runner = GateRunner::new(vec![
            gate("a", "true", true),
            gate("b", "false", false),
            gate("c", "", false),
        ]);
        let _ = runner.run_all_gates(None, None, false, false).await;
        let summary = runner.summary();
        assert_eq!(summary.total, 3);
        assert_eq!(summary.passed, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.error, 1);
    }

    #[tokio::test]
    async fn check_result_raises_typed_failure() {
        let mut runner = GateRunner::new(vec![]);
        let result = runner
            .run_gate(&gate("bad", "false", true), None, &BTreeMap::new())
            .await;
        let err = runner.check_result(&result, true).unwrap_err();
        match err {
            DroverError::GateFailure { gate, exit_code, .. } => {
                assert_eq!(gate, "bad");
                assert_ne!(exit_code, 0);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn run_gate_by_name_unknown_is_error() {
        let mut runner = GateRunner::new(vec![gate("known", "true", true)]);
        assert!(runner.run_gate_by_name("missing", None).await.is_err());
        assert!(runner.run_gate_by_name("known", None).await.is_ok());
    }
}
