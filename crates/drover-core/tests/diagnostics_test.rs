//! End-to-end diagnostic pipeline: fingerprint -> pattern match ->
//! hypotheses -> recovery plan.

use drover_core::diagnostics::{
    recovery::{check_design_escalation, RecoveryCategory, DESIGN_ESCALATION_TASK_THRESHOLD},
    DiagnosticResult, ErrorCategory, FailedTask, FeatureHealth, FingerprintEngine,
    HypothesisEngine, PatternMatcher, RecoveryPlanner, Risk,
};

const ERROR_TEXT: &str = "ModuleNotFoundError: No module named 'foo'";

fn diagnose(error_text: &str, health: Option<&FeatureHealth>) -> DiagnosticResult {
    let fingerprints = FingerprintEngine::new();
    let fingerprint = fingerprints.analyze(error_text, "");
    let evidence = fingerprints.evidence(&fingerprint);
    let hypotheses = HypothesisEngine::new().analyze(&fingerprint, &evidence, error_text);

    let mut result = DiagnosticResult {
        symptom: error_text.to_string(),
        root_cause: hypotheses
            .first()
            .map(|h| h.description.clone())
            .unwrap_or_default(),
        recommendation: hypotheses
            .iter()
            .find(|h| !h.suggested_fix.is_empty())
            .map(|h| h.suggested_fix.clone())
            .unwrap_or_default(),
        confidence: hypotheses
            .first()
            .map(|h| h.posterior_probability)
            .unwrap_or(0.0),
        fingerprint: Some(fingerprint),
        hypotheses,
        recovery_plan: None,
        design_escalation: false,
        design_escalation_reason: String::new(),
    };
    let plan = RecoveryPlanner::default().plan(&result, health);
    result.design_escalation = plan.needs_design;
    result.design_escalation_reason = plan.design_reason.clone();
    result.recovery_plan = Some(plan);
    result
}

#[test]
fn module_not_found_full_pipeline() {
    // Fingerprint: language and error type recognized.
    let fingerprint_engine = FingerprintEngine::new();
    let fingerprint = fingerprint_engine.analyze(ERROR_TEXT, "");
    assert_eq!(fingerprint.error_type, "ModuleNotFoundError");
    assert_eq!(fingerprint.language, "python");

    // Pattern matcher: module_not_found with score >= 0.5.
    let matches = PatternMatcher::new().match_text(ERROR_TEXT);
    let (_, score) = matches
        .iter()
        .find(|(p, _)| p.name == "module_not_found")
        .expect("module_not_found matched");
    assert!(*score >= 0.5);

    // Hypotheses: at least one dependency-category hypothesis suggesting
    // an install.
    let result = diagnose(ERROR_TEXT, None);
    let dependency = result
        .hypotheses
        .iter()
        .find(|h| h.category == ErrorCategory::Dependency)
        .expect("dependency hypothesis");
    assert!(dependency.suggested_fix.to_lowercase().contains("install"));

    // Recovery: classified as import_error with an install step.
    let planner = RecoveryPlanner::default();
    assert_eq!(planner.classify(&result, None), RecoveryCategory::ImportError);
    let plan = result.recovery_plan.expect("plan");
    assert!(plan
        .steps
        .iter()
        .any(|s| s.command.contains("pip install")));
    assert!(plan.steps.iter().all(|s| s.risk == Risk::Safe));
    assert!(!result.design_escalation);
}

#[test]
fn repeated_failures_escalate_to_design() {
    let health = FeatureHealth {
        feature: "checkout".into(),
        failed_tasks: (0..3)
            .map(|i| FailedTask {
                task_id: format!("T{i}"),
                level: 2,
                worker_id: Some(i),
                owned_files: vec![format!("src/file{i}.rs")],
            })
            .collect(),
        global_error: Some("level 2 failed".into()),
    };

    let result = diagnose("worker 0 crashed while executing", Some(&health));
    assert!(result.design_escalation);
    assert!(result.design_escalation_reason.contains("level 2"));
}

#[test]
fn merge_conflict_classification_with_health() {
    let health = FeatureHealth {
        feature: "checkout".into(),
        failed_tasks: vec![],
        global_error: None,
    };
    let result = diagnose(
        "Automatic merge failed: CONFLICT (content): merge conflict in src/app.rs",
        Some(&health),
    );
    let planner = RecoveryPlanner::default();
    assert_eq!(
        planner.classify(&result, Some(&health)),
        RecoveryCategory::GitConflict
    );
    // Conflicts while health data is live always point at ownership
    // design.
    let (needs, _) = check_design_escalation(
        RecoveryCategory::GitConflict,
        &result,
        Some(&health),
        DESIGN_ESCALATION_TASK_THRESHOLD,
    );
    assert!(needs);
    assert!(result.design_escalation);
}

#[test]
fn fingerprints_deduplicate_recurring_errors() {
    let engine = FingerprintEngine::new();
    let first = engine.analyze("ModuleNotFoundError: No module named 'alpha'", "");
    let second = engine.analyze("ModuleNotFoundError: No module named 'beta'", "");
    assert_eq!(first.hash, second.hash);
}

#[tokio::test]
async fn auto_test_confirms_cheap_hypotheses() {
    let engine = HypothesisEngine::new();
    let fingerprint = FingerprintEngine::new().analyze(ERROR_TEXT, "");
    let mut hypotheses = engine.analyze(&fingerprint, &[], ERROR_TEXT);
    if let Some(first) = hypotheses.first_mut() {
        first.test_command = "true".into();
    }
    let tested = engine.auto_test(hypotheses, 1).await;
    assert!(tested
        .iter()
        .any(|h| h.test_result.as_deref() == Some("PASSED")));
}
