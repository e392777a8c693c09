//! Risk scoring for task graphs.
//!
//! Per-task scores from file counts, verification coverage, dependency
//! shape, and estimates; graph-level factors for cross-level file edits,
//! worker density, and unbalanced levels; an overall weighted score with
//! an A-D grade.

use std::collections::{BTreeMap, BTreeSet};

use drover_state::graph::{Task, TaskGraph};

/// Risk assessment for one task.
#[derive(Debug, Clone)]
pub struct TaskRisk {
    pub task_id: String,
    /// 0.0 (low) to 1.0 (high).
    pub score: f64,
    pub factors: Vec<String>,
    pub on_critical_path: bool,
}

/// Aggregate risk report for a graph.
#[derive(Debug, Clone)]
pub struct RiskReport {
    pub task_risks: Vec<TaskRisk>,
    pub critical_path: Vec<String>,
    pub overall_score: f64,
    pub grade: char,
    pub risk_factors: Vec<String>,
}

impl RiskReport {
    pub fn high_risk_tasks(&self) -> Vec<&TaskRisk> {
        self.task_risks.iter().filter(|t| t.score >= 0.7).collect()
    }
}

/// Computes risk for a task graph executed by `worker_count` workers.
pub struct RiskScorer<'a> {
    graph: &'a TaskGraph,
    worker_count: u32,
}

impl<'a> RiskScorer<'a> {
    pub fn new(graph: &'a TaskGraph, worker_count: u32) -> Self {
        Self {
            graph,
            worker_count,
        }
    }

    pub fn score(&self) -> RiskReport {
        let critical_path = self.graph.critical_path();
        let critical: BTreeSet<&str> = critical_path.iter().map(String::as_str).collect();

        let mut task_risks: Vec<TaskRisk> = self
            .graph
            .all_tasks()
            .map(|task| {
                let mut risk = self.score_task(task);
                risk.on_critical_path = critical.contains(task.id.as_str());
                risk
            })
            .collect();
        task_risks.sort_by(|a, b| a.task_id.cmp(&b.task_id));

        let risk_factors = self.graph_factors();

        // Weighted mean: critical-path tasks count double.
        let mut weighted_sum = 0.0;
        let mut total_weight = 0.0;
        for risk in &task_risks {
            let weight = if risk.on_critical_path { 2.0 } else { 1.0 };
            weighted_sum += risk.score * weight;
            total_weight += weight;
        }
        let mut overall = if total_weight > 0.0 {
            weighted_sum / total_weight
        } else {
            0.0
        };
        overall = (overall + risk_factors.len() as f64 * 0.05).clamp(0.0, 1.0);

        RiskReport {
            task_risks,
            critical_path,
            overall_score: overall,
            grade: grade(overall),
            risk_factors,
        }
    }

    fn score_task(&self, task: &Task) -> TaskRisk {
        let mut score: f64 = 0.0;
        let mut factors = Vec::new();

        let file_count = task.files.create.len() + task.files.modify.len();
        if file_count > 5 {
            score += 0.2;
            factors.push(format!("high file count ({file_count})"));
        } else if file_count > 3 {
            score += 0.1;
            factors.push(format!("moderate file count ({file_count})"));
        }

        if task
            .verification
            .as_ref()
            .map(|v| v.command.is_empty())
            .unwrap_or(true)
        {
            score += 0.25;
            factors.push("no verification command".to_string());
        }

        let depth = self.dependency_depth(&task.id, &mut BTreeSet::new());
        if depth > 3 {
            score += 0.15;
            factors.push(format!("deep dependency chain ({depth})"));
        } else if depth > 1 {
            score += 0.05;
        }

        if task.estimate_minutes > 30 {
            score += 0.15;
            factors.push(format!("long estimate ({}m)", task.estimate_minutes));
        } else if task.estimate_minutes > 20 {
            score += 0.05;
        }

        if task.dependencies.len() > 3 {
            score += 0.1;
            factors.push(format!("many dependencies ({})", task.dependencies.len()));
        }

        TaskRisk {
            task_id: task.id.clone(),
            score: score.min(1.0),
            factors,
            on_critical_path: false,
        }
    }

    fn dependency_depth(&self, task_id: &str, visited: &mut BTreeSet<String>) -> u32 {
        if !visited.insert(task_id.to_string()) {
            return 0;
        }
        let Some(task) = self.graph.get_task(task_id) else {
            return 0;
        };
        if task.dependencies.is_empty() {
            return 0;
        }
        1 + task
            .dependencies
            .iter()
            .map(|dep| self.dependency_depth(dep, &mut visited.clone()))
            .max()
            .unwrap_or(0)
    }

    fn graph_factors(&self) -> Vec<String> {
        let mut factors = Vec::new();

        // Files modified at more than one level.
        let mut level_files: BTreeMap<u32, BTreeSet<&str>> = BTreeMap::new();
        for task in self.graph.all_tasks() {
            level_files
                .entry(task.level)
                .or_default()
                .extend(task.files.modify.iter().map(String::as_str));
        }
        let levels: Vec<u32> = level_files.keys().copied().collect();
        for (i, &l1) in levels.iter().enumerate() {
            for &l2 in &levels[i + 1..] {
                let overlap: Vec<&str> = level_files[&l1]
                    .intersection(&level_files[&l2])
                    .copied()
                    .collect();
                if !overlap.is_empty() {
                    factors.push(format!(
                        "files modified in both L{l1} and L{l2}: {}",
                        overlap.join(", ")
                    ));
                }
            }
        }

        let no_verify = self
            .graph
            .all_tasks()
            .filter(|t| {
                t.verification
                    .as_ref()
                    .map(|v| v.command.is_empty())
                    .unwrap_or(true)
            })
            .count();
        if no_verify > 0 {
            factors.push(format!("{no_verify} task(s) missing verification commands"));
        }

        let density = self.graph.total_tasks() as f64 / f64::from(self.worker_count.max(1));
        if density > 5.0 {
            factors.push(format!("high task density: {density:.1} tasks/worker"));
        }

        let mut level_counts: BTreeMap<u32, usize> = BTreeMap::new();
        for task in self.graph.all_tasks() {
            *level_counts.entry(task.level).or_insert(0) += 1;
        }
        if let (Some(&max), Some(&min)) = (
            level_counts.values().max(),
            level_counts.values().min(),
        ) {
            if min > 0 && max > 3 * min {
                factors.push(format!("unbalanced levels: {min}-{max} tasks per level"));
            }
        }

        factors
    }
}

fn grade(score: f64) -> char {
    if score <= 0.25 {
        'A'
    } else if score <= 0.50 {
        'B'
    } else if score <= 0.75 {
        'C'
    } else {
        'D'
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn graph(value: serde_json::Value) -> TaskGraph {
        TaskGraph::from_json_value(value).unwrap()
    }

    #[test]
    fn verified_small_tasks_grade_a() {
        let g = graph(json!({
            "feature": "demo",
            "tasks": [
                {"id": "T1", "title": "a", "level": 1, "estimate_minutes": 10,
                 "verification": {"command": "cargo test"}},
                {"id": "T2", "title": "b", "level": 1, "estimate_minutes": 10,
                 "verification": {"command": "cargo test"}}
            ]
        }));
        let report = RiskScorer::new(&g, 2).score();
        assert_eq!(report.grade, 'A');
        assert!(report.high_risk_tasks().is_empty());
    }

    #[test]
    fn missing_verification_raises_score() {
        let g = graph(json!({
            "feature": "demo",
            "tasks": [
                {"id": "T1", "title": "a", "level": 1, "estimate_minutes": 10}
            ]
        }));
        let report = RiskScorer::new(&g, 2).score();
        let risk = &report.task_risks[0];
        assert!(risk.score >= 0.25);
        assert!(risk
            .factors
            .iter()
            .any(|f| f.contains("no verification command")));
        assert!(report
            .risk_factors
            .iter()
            .any(|f| f.contains("missing verification")));
    }

    #[test]
    fn long_estimate_and_many_files_add_factors() {
        let g = graph(json!({
            "feature": "demo",
            "tasks": [
                {"id": "T1", "title": "a", "level": 1, "estimate_minutes": 45,
                 "files": {"create": ["a","b","c","d"], "modify": ["e","f"], "read": []},
                 "verification": {"command": "make check"}}
            ]
        }));
        let report = RiskScorer::new(&g, 2).score();
        let risk = &report.task_risks[0];
        assert!(risk.factors.iter().any(|f| f.contains("file count")));
        assert!(risk.factors.iter().any(|f| f.contains("long estimate")));
    }

    #[test]
    fn cross_level_modification_is_a_graph_factor() {
        let g = graph(json!({
            "feature": "demo",
            "tasks": [
                {"id": "T1", "title": "a", "level": 1,
                 "files": {"create": [], "modify": ["src/app.rs"], "read": []},
                 "verification": {"command": "cargo test"}},
                {"id": "T2", "title": "b", "level": 2, "dependencies": ["T1"],
                 "files": {"create": [], "modify": ["src/app.rs"], "read": []},
                 "verification": {"command": "cargo test"}}
            ]
        }));
        let report = RiskScorer::new(&g, 2).score();
        assert!(report
            .risk_factors
            .iter()
            .any(|f| f.contains("L1") && f.contains("L2")));
    }

    #[test]
    fn critical_path_tasks_weigh_double() {
        let g = graph(json!({
            "feature": "demo",
            "tasks": [
                {"id": "RISKY", "title": "a", "level": 1, "estimate_minutes": 45},
                {"id": "SAFE", "title": "b", "level": 1, "estimate_minutes": 5,
                 "verification": {"command": "cargo test"}}
            ]
        }));
        let report = RiskScorer::new(&g, 2).score();
        let risky = report
            .task_risks
            .iter()
            .find(|t| t.task_id == "RISKY")
            .expect("present");
        assert!(risky.on_critical_path);
        assert_eq!(report.critical_path, vec!["RISKY"]);
    }

    #[test]
    fn grade_thresholds() {
        assert_eq!(grade(0.0), 'A');
        assert_eq!(grade(0.25), 'A');
        assert_eq!(grade(0.26), 'B');
        assert_eq!(grade(0.50), 'B');
        assert_eq!(grade(0.75), 'C');
        assert_eq!(grade(0.76), 'D');
    }
}
