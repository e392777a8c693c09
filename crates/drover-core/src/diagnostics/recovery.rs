//! Recovery planning.
//!
//! Classifies a diagnosed failure into a recovery category, instantiates
//! the category's step templates (with shell-escaped variable
//! substitution), attaches verification and prevention guidance, and
//! decides whether the failure needs a graph redesign instead of a patch.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{DiagnosticResult, FeatureHealth};
use crate::exec::{CommandExecutor, CommandResult};

/// Multi-task-failure threshold for design escalation. A bare constant in
/// the planner; the check takes it as a parameter so callers can vary it.
pub const DESIGN_ESCALATION_TASK_THRESHOLD: usize = 3;

/// Keywords in fix text that signal architectural change rather than a
/// local patch.
const ARCHITECTURAL_KEYWORDS: &[&str] = &[
    "refactor",
    "redesign",
    "new component",
    "restructure",
    "rearchitect",
    "split module",
    "extract service",
    "new abstraction",
    "rewrite",
];

/// Risk classification of a recovery step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Risk {
    Safe,
    Moderate,
    Destructive,
}

/// A single recovery action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryStep {
    pub description: String,
    pub command: String,
    pub risk: Risk,
    pub reversible: bool,
}

/// A complete recovery plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryPlan {
    pub problem: String,
    pub root_cause: String,
    pub steps: Vec<RecoveryStep>,
    pub verification_command: String,
    pub prevention: String,
    pub needs_design: bool,
    pub design_reason: String,
}

/// Recovery categories the classifier can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryCategory {
    WorkerCrash,
    StateCorruption,
    GitConflict,
    PortConflict,
    DiskSpace,
    ImportError,
    TaskFailure,
}

impl RecoveryCategory {
    fn key(self) -> &'static str {
        match self {
            Self::WorkerCrash => "worker_crash",
            Self::StateCorruption => "state_corruption",
            Self::GitConflict => "git_conflict",
            Self::PortConflict => "port_conflict",
            Self::DiskSpace => "disk_space",
            Self::ImportError => "import_error",
            Self::TaskFailure => "task_failure",
        }
    }
}

struct StepTemplate {
    description: &'static str,
    command: &'static str,
    risk: Risk,
    reversible: bool,
}

fn templates(category: RecoveryCategory) -> &'static [StepTemplate] {
    match category {
        RecoveryCategory::WorkerCrash => &[
            StepTemplate {
                description: "Clean up stale worktrees",
                command: "git worktree prune",
                risk: Risk::Safe,
                reversible: true,
            },
            StepTemplate {
                description: "Reset failed task states to pending",
                command: "drover debug --feature {feature} --auto-fix",
                risk: Risk::Moderate,
                reversible: true,
            },
            StepTemplate {
                description: "Resume the run",
                command: "drover run --feature {feature}",
                risk: Risk::Safe,
                reversible: true,
            },
        ],
        RecoveryCategory::StateCorruption => &[
            StepTemplate {
                description: "Restore state from backup",
                command: "cp .drover/state/{feature}.json.bak .drover/state/{feature}.json",
                risk: Risk::Moderate,
                reversible: true,
            },
            StepTemplate {
                description: "Validate restored state",
                command: "cat .drover/state/{feature}.json",
                risk: Risk::Safe,
                reversible: true,
            },
        ],
        RecoveryCategory::GitConflict => &[
            StepTemplate {
                description: "Abort any in-progress merge",
                command: "git merge --abort",
                risk: Risk::Moderate,
                reversible: true,
            },
            StepTemplate {
                description: "Prune worktrees",
                command: "git worktree prune",
                risk: Risk::Safe,
                reversible: true,
            },
        ],
        RecoveryCategory::PortConflict => &[StepTemplate {
            description: "List processes on the conflicting port",
            command: "lsof -i :{port}",
            risk: Risk::Safe,
            reversible: true,
        }],
        RecoveryCategory::DiskSpace => &[
            StepTemplate {
                description: "Remove feature worktrees",
                command: "drover cleanup --feature {feature} --worktrees",
                risk: Risk::Moderate,
                reversible: false,
            },
            StepTemplate {
                description: "Clean container artifacts",
                command: "docker system prune -f",
                risk: Risk::Moderate,
                reversible: false,
            },
        ],
        RecoveryCategory::ImportError => &[StepTemplate {
            description: "Install missing dependencies",
            command: "pip install -e .",
            risk: Risk::Safe,
            reversible: true,
        }],
        RecoveryCategory::TaskFailure => &[
            StepTemplate {
                description: "Review the failed worker's log",
                command: "drover status --feature {feature} --worker {worker_id}",
                risk: Risk::Safe,
                reversible: true,
            },
            StepTemplate {
                description: "Retry failed tasks",
                command: "drover run --feature {feature}",
                risk: Risk::Safe,
                reversible: true,
            },
        ],
    }
}

/// Generates and executes recovery plans.
pub struct RecoveryPlanner {
    executor: CommandExecutor,
}

impl Default for RecoveryPlanner {
    fn default() -> Self {
        Self {
            executor: CommandExecutor::new(None, Duration::from_secs(10), true),
        }
    }
}

impl RecoveryPlanner {
    /// Build a plan from a diagnostic result and optional feature health.
    pub fn plan(&self, result: &DiagnosticResult, health: Option<&FeatureHealth>) -> RecoveryPlan {
        let category = self.classify(result, health);
        let feature = health.map(|h| h.feature.as_str()).unwrap_or("unknown");
        let worker_id = health
            .and_then(|h| h.failed_tasks.first())
            .and_then(|t| t.worker_id)
            .map(|id| id.to_string())
            .unwrap_or_default();

        let steps = templates(category)
            .iter()
            .map(|t| RecoveryStep {
                description: t.description.to_string(),
                command: substitute(t.command, feature, &worker_id, ""),
                risk: t.risk,
                reversible: t.reversible,
            })
            .collect();

        let (needs_design, design_reason) = check_design_escalation(
            category,
            result,
            health,
            DESIGN_ESCALATION_TASK_THRESHOLD,
        );

        RecoveryPlan {
            problem: result.symptom.clone(),
            root_cause: result.root_cause.clone(),
            steps,
            verification_command: verification_for(category, feature),
            prevention: prevention_for(category).to_string(),
            needs_design,
            design_reason,
        }
    }

    /// Keyword classification over symptom, root cause, and global error.
    pub fn classify(
        &self,
        result: &DiagnosticResult,
        health: Option<&FeatureHealth>,
    ) -> RecoveryCategory {
        let mut combined = format!(
            "{} {}",
            result.symptom.to_lowercase(),
            result.root_cause.to_lowercase()
        );
        if let Some(error) = health.and_then(|h| h.global_error.as_ref()) {
            combined.push(' ');
            combined.push_str(&error.to_lowercase());
        }

        if combined.contains("corrupt") || combined.contains("json") {
            return RecoveryCategory::StateCorruption;
        }
        if combined.contains("worker")
            && (combined.contains("crash") || combined.contains("fail"))
        {
            return RecoveryCategory::WorkerCrash;
        }
        if (combined.contains("port") && combined.contains("conflict"))
            || combined.contains("address already in use")
        {
            return RecoveryCategory::PortConflict;
        }
        if combined.contains("merge") || combined.contains("conflict") {
            return RecoveryCategory::GitConflict;
        }
        if combined.contains("disk") || combined.contains("no space") {
            return RecoveryCategory::DiskSpace;
        }
        if combined.contains("importerror")
            || combined.contains("modulenotfounderror")
            || combined.contains("missing module")
            || combined.contains("no module")
        {
            return RecoveryCategory::ImportError;
        }
        RecoveryCategory::TaskFailure
    }

    /// Execute one step through the validated executor.
    pub async fn execute_step(&self, step: &RecoveryStep) -> CommandResult {
        match self
            .executor
            .execute(&step.command, None, &Default::default(), None)
            .await
        {
            Ok(result) => result,
            Err(e) => CommandResult {
                success: false,
                exit_code: -1,
                stdout: String::new(),
                stderr: format!("command validation failed: {e}"),
                duration_ms: 0,
                timed_out: false,
            },
        }
    }
}

/// Substitute `{feature}` / `{worker_id}` / `{port}` with shell-escaped
/// values. Substitution happens before tokenization, so escaped values
/// survive the executor's shlex split as single tokens.
fn substitute(template: &str, feature: &str, worker_id: &str, port: &str) -> String {
    template
        .replace("{feature}", &shell_quote(feature))
        .replace("{worker_id}", &shell_quote(worker_id))
        .replace("{port}", &shell_quote(port))
}

/// Minimal POSIX-style quoting: values that are purely word characters
/// pass through; anything else is single-quoted with embedded quotes
/// escaped.
fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/'))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}

fn verification_for(category: RecoveryCategory, feature: &str) -> String {
    match category {
        RecoveryCategory::StateCorruption => {
            format!("cat .drover/state/{}.json", shell_quote(feature))
        }
        RecoveryCategory::GitConflict => "git status".to_string(),
        RecoveryCategory::DiskSpace => "df -h .".to_string(),
        RecoveryCategory::ImportError => "python3 -c 'import sys'".to_string(),
        _ => format!("drover status --feature {}", shell_quote(feature)),
    }
}

fn prevention_for(category: RecoveryCategory) -> &'static str {
    match category {
        RecoveryCategory::StateCorruption => {
            "Enable state file backups and validate JSON after writes"
        }
        RecoveryCategory::WorkerCrash => "Monitor worker health, set appropriate timeouts",
        RecoveryCategory::GitConflict => "Ensure strict file ownership in the task graph",
        RecoveryCategory::PortConflict => "Use unique port ranges per feature",
        RecoveryCategory::DiskSpace => "Clean up worktrees after each run",
        RecoveryCategory::ImportError => "Pin dependencies and use isolated environments",
        RecoveryCategory::TaskFailure => "Add retry budget and improve verification commands",
    }
}

/// The design-escalation heuristics. Returns (needs_design, reason).
pub fn check_design_escalation(
    category: RecoveryCategory,
    result: &DiagnosticResult,
    health: Option<&FeatureHealth>,
    threshold: usize,
) -> (bool, String) {
    // Heuristic 1: many tasks failed at the same level.
    if let Some(health) = health {
        let mut per_level: std::collections::BTreeMap<u32, usize> = Default::default();
        for task in &health.failed_tasks {
            *per_level.entry(task.level).or_insert(0) += 1;
        }
        for (level, count) in per_level {
            if count >= threshold {
                return (
                    true,
                    format!("{count} tasks failed at level {level}: the task graph may have a design flaw"),
                );
            }
        }
    }

    // Heuristic 2: git conflicts with live health data point at file
    // ownership.
    if category == RecoveryCategory::GitConflict && health.is_some() {
        return (
            true,
            "Git conflicts with active health data: file ownership needs redesign".to_string(),
        );
    }

    // Heuristic 3: the fix text itself asks for architecture.
    let combined = format!(
        "{} {}",
        result.root_cause.to_lowercase(),
        result.recommendation.to_lowercase()
    );
    for keyword in ARCHITECTURAL_KEYWORDS {
        if combined.contains(keyword) {
            return (
                true,
                format!("Root cause or recommendation mentions '{keyword}': architectural change needed"),
            );
        }
    }

    // Heuristic 4: wide blast radius.
    if let Some(health) = health {
        let files: std::collections::HashSet<&str> = health
            .failed_tasks
            .iter()
            .flat_map(|t| t.owned_files.iter().map(String::as_str))
            .collect();
        if files.len() >= threshold {
            return (
                true,
                format!(
                    "Failures span {} files: wide blast radius needs coordinated design",
                    files.len()
                ),
            );
        }
    }

    (false, String::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::FailedTask;

    fn diagnostic(symptom: &str, root_cause: &str) -> DiagnosticResult {
        DiagnosticResult {
            symptom: symptom.into(),
            root_cause: root_cause.into(),
            recommendation: String::new(),
            confidence: 0.8,
            fingerprint: None,
            hypotheses: vec![],
            recovery_plan: None,
            design_escalation: false,
            design_escalation_reason: String::new(),
        }
    }

    fn health(feature: &str, failed: Vec<FailedTask>) -> FeatureHealth {
        FeatureHealth {
            feature: feature.into(),
            failed_tasks: failed,
            global_error: None,
        }
    }

    fn failed_task(id: &str, level: u32, files: &[&str]) -> FailedTask {
        FailedTask {
            task_id: id.into(),
            level,
            worker_id: Some(0),
            owned_files: files.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn classifies_import_error() {
        let planner = RecoveryPlanner::default();
        let result = diagnostic(
            "ModuleNotFoundError: No module named 'foo'",
            "missing dependency",
        );
        assert_eq!(
            planner.classify(&result, None),
            RecoveryCategory::ImportError
        );
        let plan = planner.plan(&result, None);
        assert!(plan.steps.iter().any(|s| s.command.contains("pip install")));
    }

    #[test]
    fn classifies_state_corruption() {
        let planner = RecoveryPlanner::default();
        let result = diagnostic("state file unreadable", "corrupt json in state file");
        assert_eq!(
            planner.classify(&result, None),
            RecoveryCategory::StateCorruption
        );
    }

    #[test]
    fn classifies_worker_crash_and_substitutes_feature() {
        let planner = RecoveryPlanner::default();
        let result = diagnostic("worker 2 crashed", "agent died");
        let h = health("auth-flow", vec![failed_task("T1", 1, &[])]);
        assert_eq!(
            planner.classify(&result, Some(&h)),
            RecoveryCategory::WorkerCrash
        );
        let plan = planner.plan(&result, Some(&h));
        assert!(plan
            .steps
            .iter()
            .any(|s| s.command.contains("--feature auth-flow")));
        assert!(!plan.prevention.is_empty());
    }

    #[test]
    fn substitution_escapes_hostile_values() {
        let quoted = substitute("drover run --feature {feature}", "x; rm -rf /", "", "");
        assert!(quoted.contains("'x; rm -rf /'"));
    }

    #[test]
    fn escalates_on_many_failures_at_one_level() {
        let result = diagnostic("tasks failed", "unknown");
        let h = health(
            "f",
            vec![
                failed_task("T1", 2, &[]),
                failed_task("T2", 2, &[]),
                failed_task("T3", 2, &[]),
            ],
        );
        let (needs, reason) = check_design_escalation(
            RecoveryCategory::TaskFailure,
            &result,
            Some(&h),
            DESIGN_ESCALATION_TASK_THRESHOLD,
        );
        assert!(needs);
        assert!(reason.contains("level 2"));
    }

    #[test]
    fn escalates_on_git_conflict_with_health() {
        let result = diagnostic("merge conflict in src", "overlapping edits");
        let h = health("f", vec![]);
        let (needs, reason) = check_design_escalation(
            RecoveryCategory::GitConflict,
            &result,
            Some(&h),
            DESIGN_ESCALATION_TASK_THRESHOLD,
        );
        assert!(needs);
        assert!(reason.contains("ownership"));
    }

    #[test]
    fn escalates_on_architectural_keyword() {
        let mut result = diagnostic("failure", "the module needs a redesign");
        result.recommendation = "consider splitting".into();
        let (needs, reason) = check_design_escalation(
            RecoveryCategory::TaskFailure,
            &result,
            None,
            DESIGN_ESCALATION_TASK_THRESHOLD,
        );
        assert!(needs);
        assert!(reason.contains("redesign"));
    }

    #[test]
    fn escalates_on_wide_blast_radius() {
        let result = diagnostic("failure", "unknown");
        let h = health(
            "f",
            vec![
                failed_task("T1", 1, &["a.rs", "b.rs"]),
                failed_task("T2", 2, &["c.rs"]),
            ],
        );
        let (needs, reason) = check_design_escalation(
            RecoveryCategory::TaskFailure,
            &result,
            Some(&h),
            DESIGN_ESCALATION_TASK_THRESHOLD,
        );
        assert!(needs);
        assert!(reason.contains("3 files"));
    }

    #[test]
    fn no_escalation_for_isolated_failure() {
        let result = diagnostic("one task failed", "flaky verification");
        let h = health("f", vec![failed_task("T1", 1, &["a.rs"])]);
        let (needs, _) = check_design_escalation(
            RecoveryCategory::TaskFailure,
            &result,
            Some(&h),
            DESIGN_ESCALATION_TASK_THRESHOLD,
        );
        assert!(!needs);
    }

    #[test]
    fn plan_carries_verification_and_reversibility() {
        let planner = RecoveryPlanner::default();
        let result = diagnostic("no space left on device", "disk full");
        let plan = planner.plan(&result, None);
        assert_eq!(plan.verification_command, "df -h .");
        assert!(plan.steps.iter().any(|s| !s.reversible));
    }
}
