//! Diagnostic engine: fingerprint, score, match, plan.
//!
//! A hybrid pipeline used by the `debug` command and by auto-fix helpers:
//! parse an error into a canonical fingerprint, match it against the known
//! failure catalogue, generate Bayesian-scored hypotheses, and produce a
//! recovery plan classified by risk and reversibility.

pub mod fingerprint;
pub mod hypothesis;
pub mod knowledge;
pub mod recovery;

use serde::{Deserialize, Serialize};

pub use fingerprint::{ErrorFingerprint, FingerprintEngine};
pub use hypothesis::HypothesisEngine;
pub use knowledge::{KnownPattern, PatternMatcher};
pub use recovery::{RecoveryPlan, RecoveryPlanner, RecoveryStep, Risk};

/// Severity levels for diagnostic findings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    Critical,
    Error,
    Warning,
    Info,
}

/// Categories for classifying diagnostic errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    WorkerFailure,
    TaskFailure,
    StateCorruption,
    Infrastructure,
    CodeError,
    Dependency,
    MergeConflict,
    Environment,
    Configuration,
    Unknown,
}

/// A piece of evidence supporting or contradicting a hypothesis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evidence {
    pub description: String,
    /// Where the evidence came from: log / state / git / system / code.
    pub source: String,
    /// Confidence in [0, 1].
    pub confidence: f64,
}

impl Evidence {
    pub fn new(description: impl Into<String>, source: impl Into<String>, confidence: f64) -> Self {
        Self {
            description: description.into(),
            source: source.into(),
            confidence: confidence.clamp(0.0, 1.0),
        }
    }
}

/// A diagnostic hypothesis with Bayesian scoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredHypothesis {
    pub description: String,
    pub category: ErrorCategory,
    pub prior_probability: f64,
    #[serde(default)]
    pub evidence_for: Vec<Evidence>,
    #[serde(default)]
    pub evidence_against: Vec<Evidence>,
    pub posterior_probability: f64,
    #[serde(default)]
    pub test_command: String,
    #[serde(default)]
    pub test_result: Option<String>,
    #[serde(default)]
    pub suggested_fix: String,
}

/// Health context the planner consults: the failed tasks of a feature and
/// its global error, extracted from feature state.
#[derive(Debug, Clone, Default)]
pub struct FeatureHealth {
    pub feature: String,
    /// (task id, level, worker id, owned files) for each failed task.
    pub failed_tasks: Vec<FailedTask>,
    pub global_error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FailedTask {
    pub task_id: String,
    pub level: u32,
    pub worker_id: Option<u32>,
    pub owned_files: Vec<String>,
}

impl FeatureHealth {
    /// Extract health from a feature state snapshot.
    pub fn from_state(
        state: &drover_state::models::FeatureState,
        graph: Option<&drover_state::graph::TaskGraph>,
    ) -> Self {
        let failed_tasks = state
            .tasks
            .iter()
            .filter(|(_, t)| t.status == drover_state::models::TaskStatus::Failed)
            .map(|(id, t)| FailedTask {
                task_id: id.clone(),
                level: graph
                    .and_then(|g| g.get_task(id))
                    .map(|task| task.level)
                    .unwrap_or(0),
                worker_id: t.worker_id,
                owned_files: t.owned_files.clone(),
            })
            .collect();
        Self {
            feature: state.feature.clone(),
            failed_tasks,
            global_error: state.error.clone(),
        }
    }
}

/// Result of a full diagnostic analysis.
#[derive(Debug, Clone)]
pub struct DiagnosticResult {
    pub symptom: String,
    pub root_cause: String,
    pub recommendation: String,
    pub confidence: f64,
    pub fingerprint: Option<ErrorFingerprint>,
    pub hypotheses: Vec<ScoredHypothesis>,
    pub recovery_plan: Option<RecoveryPlan>,
    pub design_escalation: bool,
    pub design_escalation_reason: String,
}
