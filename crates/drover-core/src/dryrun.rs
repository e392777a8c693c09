//! Dry-run simulation.
//!
//! Validates everything a real run would validate, computes the timeline
//! from the same assignment algorithm the orchestrator uses, projects
//! progress snapshots at the midpoint and end of each level, and
//! optionally pre-runs the quality gates.

use std::collections::BTreeMap;
use std::path::Path;

use drover_state::graph::TaskGraph;

use crate::assign::WorkerAssignment;
use crate::config::DroverConfig;
use crate::gates::{GateOutcome, GateRunner};
use crate::preflight::{PreflightChecker, PreflightReport};
use crate::risk::{RiskReport, RiskScorer};

/// Timeline estimate for one level.
#[derive(Debug, Clone)]
pub struct LevelTimeline {
    pub level: u32,
    pub task_count: usize,
    pub wall_minutes: u32,
    pub worker_loads: BTreeMap<u32, u32>,
}

/// Overall timeline estimate.
#[derive(Debug, Clone, Default)]
pub struct TimelineEstimate {
    pub total_sequential_minutes: u32,
    pub estimated_wall_minutes: u32,
    pub critical_path_minutes: u32,
    /// sequential / (wall * workers), clamped to [0, 1].
    pub parallelization_efficiency: f64,
    pub per_level: BTreeMap<u32, LevelTimeline>,
}

/// Where in a level a snapshot is projected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotPoint {
    Midpoint,
    End,
}

/// A projected view of the run at a point in time.
#[derive(Debug, Clone)]
pub struct ProjectedSnapshot {
    pub level: u32,
    pub point: SnapshotPoint,
    /// Minutes from the start of the run.
    pub minutes_elapsed: u32,
    /// Tasks expected to be complete by then.
    pub tasks_done: usize,
}

/// Status of a gate in the dry-run report.
#[derive(Debug, Clone)]
pub struct GateCheck {
    pub name: String,
    pub command: String,
    pub required: bool,
    /// passed | failed | error | not_run
    pub status: &'static str,
    pub duration_ms: Option<u64>,
}

/// Complete dry-run report.
#[derive(Debug, Clone)]
pub struct DryRunReport {
    pub feature: String,
    pub workers: u32,
    pub level_issues: Vec<String>,
    pub missing_verifications: Vec<String>,
    pub resource_issues: Vec<String>,
    pub timeline: TimelineEstimate,
    pub snapshots: Vec<ProjectedSnapshot>,
    pub gate_results: Vec<GateCheck>,
    pub worker_loads: BTreeMap<u32, Vec<String>>,
    pub preflight: PreflightReport,
    pub risk: RiskReport,
}

impl DryRunReport {
    pub fn has_errors(&self) -> bool {
        !self.level_issues.is_empty()
            || !self.resource_issues.is_empty()
            || self
                .gate_results
                .iter()
                .any(|g| g.status == "failed" && g.required)
            || !self.preflight.passed()
    }

    pub fn has_warnings(&self) -> bool {
        !self.missing_verifications.is_empty()
            || self
                .gate_results
                .iter()
                .any(|g| g.status == "failed" && !g.required)
            || !self.preflight.warnings().is_empty()
            || matches!(self.risk.grade, 'C' | 'D')
    }
}

/// Simulates a full run without executing tasks.
pub struct DryRunSimulator<'a> {
    graph: &'a TaskGraph,
    config: &'a DroverConfig,
    repo_path: &'a Path,
    workers: u32,
    run_gates: bool,
}

impl<'a> DryRunSimulator<'a> {
    pub fn new(
        graph: &'a TaskGraph,
        config: &'a DroverConfig,
        repo_path: &'a Path,
        workers: u32,
        run_gates: bool,
    ) -> Self {
        Self {
            graph,
            config,
            repo_path,
            workers,
            run_gates,
        }
    }

    pub async fn run(&self) -> DryRunReport {
        // Graph-structure validation (ownership and dependency invariants
        // were enforced at load; level gaps are advisory).
        let level_issues = self.validate_level_structure();
        let missing_verifications = self.missing_verifications();
        let resource_issues = self.check_resources();

        let preflight =
            PreflightChecker::new(self.repo_path, self.config, self.workers).run_all();
        let risk = RiskScorer::new(self.graph, self.workers).score();

        let (timeline, snapshots, worker_loads) = self.compute_timeline();
        let gate_results = self.check_gates().await;

        DryRunReport {
            feature: self.graph.feature_name().to_string(),
            workers: self.workers,
            level_issues,
            missing_verifications,
            resource_issues,
            timeline,
            snapshots,
            gate_results,
            worker_loads,
            preflight,
            risk,
        }
    }

    fn validate_level_structure(&self) -> Vec<String> {
        let mut issues = Vec::new();
        let levels = self.graph.levels();
        if self.graph.total_tasks() == 0 {
            issues.push("no tasks defined in task graph".to_string());
            return issues;
        }
        if let (Some(&first), Some(&last)) = (levels.first(), levels.last()) {
            let missing: Vec<u32> = (first..=last)
                .filter(|l| !levels.contains(l))
                .collect();
            if !missing.is_empty() {
                issues.push(format!("gap in level numbering: missing levels {missing:?}"));
            }
        }
        issues
    }

    fn missing_verifications(&self) -> Vec<String> {
        self.graph
            .all_tasks()
            .filter(|t| {
                t.verification
                    .as_ref()
                    .map(|v| v.command.is_empty())
                    .unwrap_or(true)
            })
            .map(|t| format!("task {} has no verification command", t.id))
            .collect()
    }

    fn check_resources(&self) -> Vec<String> {
        let mut issues = Vec::new();
        if !self.repo_path.join(".git").exists() {
            issues.push("not a git repository".to_string());
        }
        issues
    }

    fn compute_timeline(
        &self,
    ) -> (
        TimelineEstimate,
        Vec<ProjectedSnapshot>,
        BTreeMap<u32, Vec<String>>,
    ) {
        let total_sequential: u32 = self.graph.all_tasks().map(|t| t.estimate_minutes).sum();

        let mut per_level = BTreeMap::new();
        let mut snapshots = Vec::new();
        let mut all_loads: BTreeMap<u32, Vec<String>> = BTreeMap::new();
        let mut elapsed = 0u32;
        let mut tasks_done = 0usize;

        for level in self.graph.levels() {
            let tasks = self.graph.tasks_for_level(level);
            if tasks.is_empty() {
                continue;
            }
            let worker_count = (tasks.len() as u32).min(self.workers.max(1));
            let assignment = WorkerAssignment::assign(&tasks, worker_count);
            let wall = assignment.max_load();

            for worker_id in assignment.busy_workers() {
                all_loads
                    .entry(worker_id)
                    .or_default()
                    .extend(assignment.tasks_for_worker(worker_id).iter().cloned());
            }

            // Projected snapshots: halfway through the level and at its end.
            snapshots.push(ProjectedSnapshot {
                level,
                point: SnapshotPoint::Midpoint,
                minutes_elapsed: elapsed + wall / 2,
                tasks_done: tasks_done + tasks.len() / 2,
            });
            tasks_done += tasks.len();
            elapsed += wall;
            snapshots.push(ProjectedSnapshot {
                level,
                point: SnapshotPoint::End,
                minutes_elapsed: elapsed,
                tasks_done,
            });

            per_level.insert(
                level,
                LevelTimeline {
                    level,
                    task_count: tasks.len(),
                    wall_minutes: wall,
                    worker_loads: assignment.worker_loads().clone(),
                },
            );
        }

        let estimated_wall: u32 = per_level.values().map(|l| l.wall_minutes).sum();
        let critical_path_minutes: u32 = self
            .graph
            .critical_path()
            .iter()
            .filter_map(|id| self.graph.get_task(id))
            .map(|t| t.estimate_minutes)
            .sum();
        let efficiency = if estimated_wall > 0 && self.workers > 0 {
            (f64::from(total_sequential) / (f64::from(estimated_wall) * f64::from(self.workers)))
                .clamp(0.0, 1.0)
        } else {
            0.0
        };

        (
            TimelineEstimate {
                total_sequential_minutes: total_sequential,
                estimated_wall_minutes: estimated_wall,
                critical_path_minutes,
                parallelization_efficiency: efficiency,
                per_level,
            },
            snapshots,
            all_loads,
        )
    }

    async fn check_gates(&self) -> Vec<GateCheck> {
        let gates = &self.config.quality_gates;
        if gates.is_empty() {
            return Vec::new();
        }
        if !self.run_gates {
            return gates
                .iter()
                .map(|g| GateCheck {
                    name: g.name.clone(),
                    command: g.command.clone(),
                    required: g.required,
                    status: "not_run",
                    duration_ms: None,
                })
                .collect();
        }

        let mut runner = GateRunner::new(gates.clone());
        let (_, results) = runner
            .run_all_gates(None, Some(self.repo_path), false, false)
            .await;
        results
            .into_iter()
            .map(|r| {
                let required = gates
                    .iter()
                    .find(|g| g.name == r.gate_name)
                    .map(|g| g.required)
                    .unwrap_or(false);
                GateCheck {
                    name: r.gate_name,
                    command: r.command,
                    required,
                    status: match r.outcome {
                        GateOutcome::Pass => "passed",
                        GateOutcome::Fail => "failed",
                        GateOutcome::Skip => "passed",
                        GateOutcome::Timeout | GateOutcome::Error => "error",
                    },
                    duration_ms: Some(r.duration_ms),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QualityGate;
    use serde_json::json;
    use tempfile::TempDir;

    fn graph() -> TaskGraph {
        TaskGraph::from_json_value(json!({
            "feature": "demo",
            "tasks": [
                {"id": "T1", "title": "a", "level": 1, "estimate_minutes": 20,
                 "verification": {"command": "cargo test"}},
                {"id": "T2", "title": "b", "level": 1, "estimate_minutes": 10,
                 "verification": {"command": "cargo test"}},
                {"id": "T3", "title": "c", "level": 2, "dependencies": ["T1"],
                 "estimate_minutes": 30, "verification": {"command": "cargo test"}}
            ]
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn timeline_sums_level_walls() {
        let g = graph();
        let config = DroverConfig::default();
        let dir = TempDir::new().unwrap();
        let report = DryRunSimulator::new(&g, &config, dir.path(), 2, false)
            .run()
            .await;

        // Level 1 with 2 workers: wall = 20; level 2: wall = 30.
        assert_eq!(report.timeline.total_sequential_minutes, 60);
        assert_eq!(report.timeline.estimated_wall_minutes, 50);
        assert_eq!(report.timeline.per_level[&1].wall_minutes, 20);
        assert_eq!(report.timeline.per_level[&2].wall_minutes, 30);
        // 60 / (50 * 2)
        assert!((report.timeline.parallelization_efficiency - 0.6).abs() < 1e-9);
        assert_eq!(report.timeline.critical_path_minutes, 50);
    }

    #[tokio::test]
    async fn snapshots_cover_midpoint_and_end() {
        let g = graph();
        let config = DroverConfig::default();
        let dir = TempDir::new().unwrap();
        let report = DryRunSimulator::new(&g, &config, dir.path(), 2, false)
            .run()
            .await;

        assert_eq!(report.snapshots.len(), 4);
        let end_of_run = report.snapshots.last().unwrap();
        assert_eq!(end_of_run.point, SnapshotPoint::End);
        assert_eq!(end_of_run.minutes_elapsed, 50);
        assert_eq!(end_of_run.tasks_done, 3);
    }

    #[tokio::test]
    async fn gates_listed_not_run_by_default() {
        let g = graph();
        let mut config = DroverConfig::default();
        config.quality_gates.push(QualityGate {
            name: "lint".into(),
            command: "cargo clippy".into(),
            required: true,
            timeout: 60,
            coverage_threshold: None,
        });
        let dir = TempDir::new().unwrap();
        let report = DryRunSimulator::new(&g, &config, dir.path(), 2, false)
            .run()
            .await;
        assert_eq!(report.gate_results.len(), 1);
        assert_eq!(report.gate_results[0].status, "not_run");
    }

    #[tokio::test]
    async fn gate_prerun_executes() {
        let g = graph();
        let mut config = DroverConfig::default();
        config.quality_gates.push(QualityGate {
            name: "truthy".into(),
            command: "true".into(),
            required: true,
            timeout: 30,
            coverage_threshold: None,
        });
        let dir = TempDir::new().unwrap();
        let report = DryRunSimulator::new(&g, &config, dir.path(), 2, true)
            .run()
            .await;
        assert_eq!(report.gate_results[0].status, "passed");
    }

    #[tokio::test]
    async fn missing_git_repo_is_a_resource_issue() {
        let g = graph();
        let config = DroverConfig::default();
        let dir = TempDir::new().unwrap();
        let report = DryRunSimulator::new(&g, &config, dir.path(), 2, false)
            .run()
            .await;
        assert!(report
            .resource_issues
            .iter()
            .any(|i| i.contains("git repository")));
        assert!(report.has_errors());
    }

    #[tokio::test]
    async fn level_gap_is_reported() {
        let g = TaskGraph::from_json_value(json!({
            "feature": "demo",
            "tasks": [
                {"id": "T1", "title": "a", "level": 1,
                 "verification": {"command": "cargo test"}},
                {"id": "T2", "title": "b", "level": 3, "dependencies": ["T1"],
                 "verification": {"command": "cargo test"}}
            ]
        }))
        .unwrap();
        let config = DroverConfig::default();
        let dir = TempDir::new().unwrap();
        let report = DryRunSimulator::new(&g, &config, dir.path(), 2, false)
            .run()
            .await;
        assert!(report.level_issues[0].contains("missing levels"));
    }
}
