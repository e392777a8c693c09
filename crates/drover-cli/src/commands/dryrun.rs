//! `drover dry-run`: simulate a run and print the report.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use drover_core::config::DroverConfig;
use drover_core::dryrun::DryRunSimulator;
use drover_state::graph::TaskGraph;

use super::default_graph_path;

pub async fn execute(
    repo: &Path,
    feature: &str,
    graph: Option<PathBuf>,
    workers: Option<u32>,
    run_gates: bool,
) -> Result<()> {
    let config = DroverConfig::load(repo)?;
    let workers = workers.unwrap_or(config.workers.max_concurrent);

    let graph_file = graph.unwrap_or_else(|| default_graph_path(repo, feature));
    let graph = TaskGraph::from_file(&graph_file)
        .with_context(|| format!("failed to load task graph {}", graph_file.display()))?;

    let report = DryRunSimulator::new(&graph, &config, repo, workers, run_gates)
        .run()
        .await;

    println!("dry run: {} with {} workers", report.feature, report.workers);
    print!("{}", report.preflight);

    for issue in &report.level_issues {
        println!("issue: {issue}");
    }
    for issue in &report.resource_issues {
        println!("issue: {issue}");
    }
    for warning in &report.missing_verifications {
        println!("warning: {warning}");
    }

    let timeline = &report.timeline;
    println!(
        "timeline: {}m sequential, {}m wall, critical path {}m, efficiency {:.0}%",
        timeline.total_sequential_minutes,
        timeline.estimated_wall_minutes,
        timeline.critical_path_minutes,
        timeline.parallelization_efficiency * 100.0
    );
    for level in timeline.per_level.values() {
        println!(
            "  level {}: {} tasks, {}m wall",
            level.level, level.task_count, level.wall_minutes
        );
    }
    for snapshot in &report.snapshots {
        println!(
            "  t+{}m: level {} {:?}, {} tasks done",
            snapshot.minutes_elapsed, snapshot.level, snapshot.point, snapshot.tasks_done
        );
    }

    println!(
        "risk: grade {} (score {:.2})",
        report.risk.grade, report.risk.overall_score
    );
    for factor in &report.risk.risk_factors {
        println!("  factor: {factor}");
    }

    for gate in &report.gate_results {
        println!("gate {}: {}", gate.name, gate.status);
    }

    if report.has_errors() {
        anyhow::bail!("dry run found blocking issues");
    }
    Ok(())
}
