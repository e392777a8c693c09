//! `drover debug`: diagnose an error or a failed feature.

use std::path::Path;

use anyhow::{bail, Result};

use drover_core::diagnostics::{
    DiagnosticResult, FeatureHealth, FingerprintEngine, HypothesisEngine, RecoveryPlanner,
};
use drover_state::graph::TaskGraph;
use drover_state::store::{default_state_dir, graph_path, StateStore};

pub async fn execute(
    repo: &Path,
    error: Option<String>,
    feature: Option<String>,
    auto_test: bool,
) -> Result<()> {
    // Health context from feature state, when a feature is named.
    let health = match &feature {
        Some(feature) => {
            let state_dir = default_state_dir(repo);
            let store = StateStore::new(feature.clone(), &state_dir);
            let state = store.load()?;
            let graph = TaskGraph::from_file(&graph_path(&state_dir, feature)).ok();
            Some(FeatureHealth::from_state(&state, graph.as_ref()))
        }
        None => None,
    };

    // The error text: given explicitly, or taken from the feature state.
    let error_text = match error {
        Some(text) => text,
        None => match health.as_ref().and_then(|h| h.global_error.clone()) {
            Some(text) => text,
            None => bail!("nothing to diagnose: pass --error or a --feature with a recorded error"),
        },
    };

    let fingerprints = FingerprintEngine::new();
    let fingerprint = fingerprints.analyze(&error_text, "");
    let mut evidence = fingerprints.evidence(&fingerprint);
    if let Some(health) = &health {
        for task in &health.failed_tasks {
            evidence.push(drover_core::diagnostics::Evidence::new(
                format!("task {} failed at level {}", task.task_id, task.level),
                "state",
                0.6,
            ));
        }
    }

    let engine = HypothesisEngine::new();
    let mut hypotheses = engine.analyze(&fingerprint, &evidence, &error_text);
    if auto_test {
        hypotheses = engine.auto_test(hypotheses, 3).await;
    }

    let root_cause = hypotheses
        .first()
        .map(|h| h.description.clone())
        .unwrap_or_else(|| "unknown".to_string());
    let recommendation = hypotheses
        .iter()
        .find(|h| !h.suggested_fix.is_empty())
        .map(|h| h.suggested_fix.clone())
        .unwrap_or_default();

    let mut result = DiagnosticResult {
        symptom: error_text.clone(),
        root_cause,
        recommendation,
        confidence: hypotheses
            .first()
            .map(|h| h.posterior_probability)
            .unwrap_or(0.0),
        fingerprint: Some(fingerprint.clone()),
        hypotheses: hypotheses.clone(),
        recovery_plan: None,
        design_escalation: false,
        design_escalation_reason: String::new(),
    };

    let planner = RecoveryPlanner::default();
    let plan = planner.plan(&result, health.as_ref());
    result.design_escalation = plan.needs_design;
    result.design_escalation_reason = plan.design_reason.clone();

    // Report.
    println!(
        "fingerprint: {} ({} {})",
        fingerprint.hash, fingerprint.language, fingerprint.error_type
    );
    if !fingerprint.file.is_empty() {
        println!("location: {}:{}", fingerprint.file, fingerprint.line);
    }
    println!("hypotheses:");
    for h in &hypotheses {
        let tested = h
            .test_result
            .as_deref()
            .map(|t| format!(" [{t}]"))
            .unwrap_or_default();
        println!(
            "  {:.2} {:?} {}{tested}",
            h.posterior_probability, h.category, h.description
        );
        if !h.suggested_fix.is_empty() {
            println!("       fix: {}", h.suggested_fix);
        }
    }
    println!("recovery plan ({}):", plan.problem);
    for step in &plan.steps {
        println!(
            "  [{:?}{}] {}: {}",
            step.risk,
            if step.reversible { "" } else { ", irreversible" },
            step.description,
            step.command
        );
    }
    println!("verify with: {}", plan.verification_command);
    println!("prevention: {}", plan.prevention);
    if result.design_escalation {
        println!("design escalation: {}", result.design_escalation_reason);
        println!("  this failure needs a graph redesign, not a patch");
    }
    Ok(())
}
