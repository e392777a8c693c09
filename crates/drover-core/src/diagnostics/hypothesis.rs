//! Bayesian hypothesis generation, scoring, testing, and chaining.

use std::collections::HashSet;
use std::time::Duration;

use super::fingerprint::ErrorFingerprint;
use super::knowledge::KnownPattern;
use super::{ErrorCategory, Evidence, ScoredHypothesis};
use crate::exec::CommandExecutor;

const MAX_HYPOTHESES: usize = 10;
const POSTERIOR_MIN: f64 = 0.01;
const POSTERIOR_MAX: f64 = 0.99;

fn clamp(p: f64) -> f64 {
    p.clamp(POSTERIOR_MIN, POSTERIOR_MAX)
}

/// Simplified Bayesian update over evidence.
#[derive(Debug, Default)]
pub struct BayesianScorer;

impl BayesianScorer {
    /// `posterior = prior * prod(1 + c*0.5 | for) * prod(1 - c*0.5 | against)`,
    /// clamped to [0.01, 0.99].
    pub fn posterior(
        &self,
        prior: f64,
        evidence_for: &[Evidence],
        evidence_against: &[Evidence],
    ) -> f64 {
        let mut posterior = prior;
        for ev in evidence_for {
            posterior *= 1.0 + ev.confidence * 0.5;
        }
        for ev in evidence_against {
            posterior *= 1.0 - ev.confidence * 0.5;
        }
        clamp(posterior)
    }

    /// Sort by posterior, highest first.
    pub fn rank(&self, mut hypotheses: Vec<ScoredHypothesis>) -> Vec<ScoredHypothesis> {
        hypotheses.sort_by(|a, b| {
            b.posterior_probability
                .partial_cmp(&a.posterior_probability)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hypotheses
    }
}

/// Generates hypotheses from a fingerprint, raw evidence, and KB matches.
#[derive(Debug, Default)]
pub struct HypothesisGenerator;

impl HypothesisGenerator {
    /// Up to [`MAX_HYPOTHESES`] hypotheses, deduplicated by description:
    /// the fingerprint location (prior 0.3), each knowledge-base match
    /// (prior = match score), and each raw evidence item (prior 0.1).
    pub fn generate(
        &self,
        fingerprint: &ErrorFingerprint,
        evidence: &[Evidence],
        kb_matches: &[(&'static KnownPattern, f64)],
    ) -> Vec<ScoredHypothesis> {
        let mut hypotheses = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();

        let supporting: Vec<Evidence> = evidence
            .iter()
            .filter(|e| e.confidence >= 0.5)
            .cloned()
            .collect();
        let contradicting: Vec<Evidence> = evidence
            .iter()
            .filter(|e| e.confidence < 0.3)
            .cloned()
            .collect();

        // a) Location hypothesis.
        if !fingerprint.file.is_empty() && fingerprint.line > 0 {
            let description = format!(
                "Error at {}:{} ({})",
                fingerprint.file, fingerprint.line, fingerprint.error_type
            );
            if seen.insert(description.clone()) {
                hypotheses.push(ScoredHypothesis {
                    description,
                    category: category_from_error_type(&fingerprint.error_type),
                    prior_probability: 0.3,
                    evidence_for: supporting.clone(),
                    evidence_against: contradicting.clone(),
                    posterior_probability: 0.5,
                    test_command: String::new(),
                    test_result: None,
                    suggested_fix: String::new(),
                });
            }
        }

        // b) Knowledge-base matches.
        for (pattern, score) in kb_matches {
            let cause = pattern.common_causes.first().copied().unwrap_or("unknown cause");
            let description = format!("Known pattern: {} - {cause}", pattern.name);
            if seen.insert(description.clone()) {
                hypotheses.push(ScoredHypothesis {
                    description,
                    category: category_from_pattern(pattern.category),
                    prior_probability: score.min(POSTERIOR_MAX),
                    evidence_for: supporting.clone(),
                    evidence_against: Vec::new(),
                    posterior_probability: 0.5,
                    test_command: String::new(),
                    test_result: None,
                    suggested_fix: pattern
                        .fix_templates
                        .first()
                        .copied()
                        .unwrap_or("")
                        .to_string(),
                });
            }
        }

        // c) Evidence-based hypotheses.
        for ev in evidence {
            let description = format!("Evidence-based: {}", ev.description);
            if seen.insert(description.clone()) {
                hypotheses.push(ScoredHypothesis {
                    description,
                    category: ErrorCategory::Unknown,
                    prior_probability: 0.1,
                    evidence_for: if ev.confidence >= 0.5 {
                        vec![ev.clone()]
                    } else {
                        Vec::new()
                    },
                    evidence_against: if ev.confidence < 0.3 {
                        vec![ev.clone()]
                    } else {
                        Vec::new()
                    },
                    posterior_probability: 0.5,
                    test_command: String::new(),
                    test_result: None,
                    suggested_fix: String::new(),
                });
            }
        }

        hypotheses.truncate(MAX_HYPOTHESES);
        hypotheses
    }
}

fn category_from_error_type(error_type: &str) -> ErrorCategory {
    match error_type {
        "ImportError" | "ModuleNotFoundError" => ErrorCategory::Dependency,
        "SyntaxError" | "TypeError" | "ValueError" | "KeyError" | "AttributeError"
        | "RustError" => ErrorCategory::CodeError,
        "FileNotFoundError" | "PermissionError" | "ConnectionError" | "TimeoutError"
        | "OSError" => ErrorCategory::Infrastructure,
        _ => ErrorCategory::Unknown,
    }
}

fn category_from_pattern(category: &str) -> ErrorCategory {
    match category {
        "code" => ErrorCategory::CodeError,
        "dependency" => ErrorCategory::Dependency,
        "infrastructure" => ErrorCategory::Infrastructure,
        "state_corruption" => ErrorCategory::StateCorruption,
        "merge_conflict" => ErrorCategory::MergeConflict,
        "worker" => ErrorCategory::WorkerFailure,
        "environment" => ErrorCategory::Environment,
        "configuration" => ErrorCategory::Configuration,
        _ => ErrorCategory::Unknown,
    }
}

/// Runs hypothesis test commands through the validated executor.
pub struct HypothesisTestRunner {
    executor: CommandExecutor,
}

impl Default for HypothesisTestRunner {
    fn default() -> Self {
        Self {
            executor: CommandExecutor::new(None, Duration::from_secs(30), false),
        }
    }
}

impl HypothesisTestRunner {
    /// Whether a hypothesis carries a runnable, allowlisted command.
    pub fn can_test(&self, hypothesis: &ScoredHypothesis) -> bool {
        let command = hypothesis.test_command.trim();
        !command.is_empty() && self.executor.validate(command).is_ok()
    }

    /// Run the test command and update the posterior: pass multiplies by
    /// 1.5, fail by 0.5, always clamped.
    pub async fn test(&self, hypothesis: &mut ScoredHypothesis) {
        if !self.can_test(hypothesis) {
            return;
        }
        match self
            .executor
            .execute(&hypothesis.test_command, None, &Default::default(), None)
            .await
        {
            Ok(result) if result.timed_out => {
                hypothesis.test_result = Some("ERROR: timeout".into());
            }
            Ok(result) if result.success => {
                hypothesis.test_result = Some("PASSED".into());
                hypothesis.posterior_probability = clamp(hypothesis.posterior_probability * 1.5);
            }
            Ok(_) => {
                hypothesis.test_result = Some("FAILED".into());
                hypothesis.posterior_probability = clamp(hypothesis.posterior_probability * 0.5);
            }
            Err(e) => {
                hypothesis.test_result = Some(format!("ERROR: {e}"));
            }
        }
    }
}

/// Propagates a confirmed hypothesis into its peers.
#[derive(Debug, Default)]
pub struct HypothesisChainer;

const CONTRADICTORY_PAIRS: &[(ErrorCategory, ErrorCategory)] = &[
    (ErrorCategory::CodeError, ErrorCategory::Infrastructure),
    (ErrorCategory::Dependency, ErrorCategory::Configuration),
];

impl HypothesisChainer {
    /// When `confirmed_index` passed its test, boost same-category peers
    /// by 1.2 and suppress contradictory categories by 0.7.
    pub fn chain(&self, hypotheses: &mut [ScoredHypothesis], confirmed_index: usize) {
        let confirmed_category = hypotheses[confirmed_index].category;
        if hypotheses[confirmed_index].test_result.as_deref() != Some("PASSED") {
            return;
        }
        let contradictory: HashSet<ErrorCategory> = CONTRADICTORY_PAIRS
            .iter()
            .filter_map(|(a, b)| {
                if *a == confirmed_category {
                    Some(*b)
                } else if *b == confirmed_category {
                    Some(*a)
                } else {
                    None
                }
            })
            .collect();

        for (index, hypothesis) in hypotheses.iter_mut().enumerate() {
            if index == confirmed_index {
                continue;
            }
            if hypothesis.category == confirmed_category {
                hypothesis.posterior_probability = clamp(hypothesis.posterior_probability * 1.2);
            } else if contradictory.contains(&hypothesis.category) {
                hypothesis.posterior_probability = clamp(hypothesis.posterior_probability * 0.7);
            }
        }
    }
}

/// Facade combining generation, scoring, testing, and chaining.
pub struct HypothesisEngine {
    scorer: BayesianScorer,
    generator: HypothesisGenerator,
    test_runner: HypothesisTestRunner,
    chainer: HypothesisChainer,
    matcher: super::knowledge::PatternMatcher,
}

impl Default for HypothesisEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl HypothesisEngine {
    pub fn new() -> Self {
        Self {
            scorer: BayesianScorer,
            generator: HypothesisGenerator,
            test_runner: HypothesisTestRunner::default(),
            chainer: HypothesisChainer,
            matcher: super::knowledge::PatternMatcher::new(),
        }
    }

    /// Generate, score, and rank hypotheses for an error.
    pub fn analyze(
        &self,
        fingerprint: &ErrorFingerprint,
        evidence: &[Evidence],
        error_text: &str,
    ) -> Vec<ScoredHypothesis> {
        let kb_matches = self.matcher.match_text(error_text);
        let mut hypotheses = self.generator.generate(fingerprint, evidence, &kb_matches);
        for h in &mut hypotheses {
            h.posterior_probability =
                self.scorer
                    .posterior(h.prior_probability, &h.evidence_for, &h.evidence_against);
        }
        self.scorer.rank(hypotheses)
    }

    /// Test the top `max_tests` testable hypotheses, chaining confirmed
    /// results into the rest, then re-rank.
    pub async fn auto_test(
        &self,
        mut hypotheses: Vec<ScoredHypothesis>,
        max_tests: usize,
    ) -> Vec<ScoredHypothesis> {
        let mut tested = 0;
        for index in 0..hypotheses.len() {
            if tested >= max_tests {
                break;
            }
            if !self.test_runner.can_test(&hypotheses[index]) {
                continue;
            }
            self.test_runner.test(&mut hypotheses[index]).await;
            if hypotheses[index].test_result.as_deref() == Some("PASSED") {
                self.chainer.chain(&mut hypotheses, index);
            }
            tested += 1;
        }
        self.scorer.rank(hypotheses)
    }

    pub fn top<'a>(&self, hypotheses: &'a [ScoredHypothesis]) -> Option<&'a ScoredHypothesis> {
        hypotheses.first()
    }
}
