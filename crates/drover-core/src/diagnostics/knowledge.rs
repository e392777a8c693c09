//! Known failure patterns and the symptom matcher.
//!
//! A static catalogue of failure patterns, each with symptom regexes, a
//! prior probability, common causes, and fix templates. The matcher scores
//! a pattern as matched-symptoms / total-symptoms over the input text.

use std::collections::HashMap;
use std::sync::Mutex;

use regex::Regex;

/// A known failure pattern with resolution guidance.
#[derive(Debug, Clone)]
pub struct KnownPattern {
    pub name: &'static str,
    /// Category key; mapped into `ErrorCategory` by the hypothesis engine.
    pub category: &'static str,
    pub symptoms: &'static [&'static str],
    pub prior_probability: f64,
    pub common_causes: &'static [&'static str],
    pub fix_templates: &'static [&'static str],
    pub related_patterns: &'static [&'static str],
}

/// The static catalogue.
pub static KNOWN_PATTERNS: &[KnownPattern] = &[
    // -- python ------------------------------------------------------------
    KnownPattern {
        name: "import_error",
        category: "dependency",
        symptoms: &[
            r"ImportError:\s+cannot import name",
            r"ImportError:\s+No module named",
        ],
        prior_probability: 0.15,
        common_causes: &[
            "Package not installed in current environment",
            "Circular import between modules",
        ],
        fix_templates: &["pip install the missing package", "Break the circular import"],
        related_patterns: &["module_not_found", "dependency_conflict"],
    },
    KnownPattern {
        name: "module_not_found",
        category: "dependency",
        symptoms: &[
            r"ModuleNotFoundError:\s+No module named",
            r"No module named\s+'\w+'",
        ],
        prior_probability: 0.14,
        common_causes: &[
            "Package not installed",
            "Virtual environment not activated",
        ],
        fix_templates: &[
            "pip install the missing package",
            "Activate the correct virtual environment",
        ],
        related_patterns: &["import_error", "dependency_conflict"],
    },
    KnownPattern {
        name: "type_error",
        category: "code",
        symptoms: &[
            r"TypeError:\s+.*takes \d+ positional argument",
            r"TypeError:\s+.*got an unexpected keyword argument",
            r"TypeError:\s+unsupported operand type",
            r"TypeError:\s+.*is not callable",
        ],
        prior_probability: 0.12,
        common_causes: &[
            "Wrong number of arguments passed to function",
            "API changed between versions",
        ],
        fix_templates: &["Check the function signature and adjust the call site"],
        related_patterns: &["attribute_error"],
    },
    KnownPattern {
        name: "key_error",
        category: "code",
        symptoms: &[r"KeyError:\s+'[\w\-.]+'", r"KeyError:\s+"],
        prior_probability: 0.10,
        common_causes: &[
            "Missing key in dictionary or config",
            "State file missing expected field",
        ],
        fix_templates: &["Verify the key exists in the data source before access"],
        related_patterns: &["attribute_error", "state_corruption"],
    },
    KnownPattern {
        name: "attribute_error",
        category: "code",
        symptoms: &[
            r"AttributeError:\s+'NoneType' object has no attribute",
            r"AttributeError:\s+'\w+' object has no attribute '\w+'",
        ],
        prior_probability: 0.10,
        common_causes: &["Value is None when an object was expected"],
        fix_templates: &["Add a None check before the attribute access"],
        related_patterns: &["type_error"],
    },
    KnownPattern {
        name: "file_not_found",
        category: "infrastructure",
        symptoms: &[
            r"FileNotFoundError:\s+\[Errno 2\]",
            r"No such file or directory",
        ],
        prior_probability: 0.08,
        common_causes: &[
            "Path relative to the wrong directory",
            "File deleted or moved",
        ],
        fix_templates: &["Verify the path exists and the working directory is correct"],
        related_patterns: &["permission_error"],
    },
    KnownPattern {
        name: "permission_error",
        category: "infrastructure",
        symptoms: &[r"PermissionError:\s+\[Errno 13\]", r"Permission denied"],
        prior_probability: 0.05,
        common_causes: &["File owned by a different user", "Read-only filesystem"],
        fix_templates: &["Check file permissions and ownership"],
        related_patterns: &["file_not_found", "docker_failure"],
    },
    KnownPattern {
        name: "syntax_error",
        category: "code",
        symptoms: &[
            r"SyntaxError:\s+invalid syntax",
            r"SyntaxError:\s+unexpected EOF",
            r"unexpected token",
        ],
        prior_probability: 0.06,
        common_causes: &["Incomplete edit left invalid source"],
        fix_templates: &["Re-run the language's syntax check on the named file"],
        related_patterns: &[],
    },
    // -- javascript ---------------------------------------------------------
    KnownPattern {
        name: "undefined_not_function",
        category: "code",
        symptoms: &[
            r"TypeError:\s+.*is not a function",
            r"Cannot read propert(y|ies) of undefined",
        ],
        prior_probability: 0.08,
        common_causes: &["Calling a method on an undefined import or value"],
        fix_templates: &["Check the import path and the object's shape at the call site"],
        related_patterns: &["module_not_found_js"],
    },
    KnownPattern {
        name: "module_not_found_js",
        category: "dependency",
        symptoms: &[r"Cannot find module", r"MODULE_NOT_FOUND"],
        prior_probability: 0.10,
        common_causes: &["npm package not installed", "Wrong relative import path"],
        fix_templates: &["npm install the missing package"],
        related_patterns: &["module_not_found"],
    },
    // -- rust / go ----------------------------------------------------------
    KnownPattern {
        name: "borrow_error",
        category: "code",
        symptoms: &[r"error\[E0382\]", r"borrow of moved value", r"cannot borrow"],
        prior_probability: 0.06,
        common_causes: &["Value moved and used again"],
        fix_templates: &["Clone the value or restructure ownership"],
        related_patterns: &[],
    },
    KnownPattern {
        name: "nil_pointer",
        category: "code",
        symptoms: &[
            r"invalid memory address or nil pointer dereference",
            r"runtime error: index out of range",
        ],
        prior_probability: 0.05,
        common_causes: &["Nil receiver or uninitialized pointer"],
        fix_templates: &["Guard the dereference with a nil check"],
        related_patterns: &[],
    },
    // -- infrastructure ------------------------------------------------------
    KnownPattern {
        name: "port_in_use",
        category: "infrastructure",
        symptoms: &[r"[Aa]ddress already in use", r"EADDRINUSE", r"port.*conflict"],
        prior_probability: 0.07,
        common_causes: &["A previous worker still holds the port"],
        fix_templates: &["Find and stop the process holding the port"],
        related_patterns: &["worker_crash"],
    },
    KnownPattern {
        name: "docker_failure",
        category: "infrastructure",
        symptoms: &[
            r"Cannot connect to the Docker daemon",
            r"docker:.*not found",
            r"no such image",
        ],
        prior_probability: 0.06,
        common_causes: &["Docker daemon not running", "Worker image not built"],
        fix_templates: &["Start the container runtime and rebuild the worker image"],
        related_patterns: &["permission_error"],
    },
    KnownPattern {
        name: "disk_space_low",
        category: "infrastructure",
        symptoms: &[r"[Nn]o space left on device", r"ENOSPC", r"disk.*full"],
        prior_probability: 0.04,
        common_causes: &["Worktrees and logs accumulated across runs"],
        fix_templates: &["Prune worktrees and clean old logs"],
        related_patterns: &[],
    },
    KnownPattern {
        name: "connection_refused",
        category: "infrastructure",
        symptoms: &[r"[Cc]onnection refused", r"ECONNREFUSED", r"ConnectionError"],
        prior_probability: 0.05,
        common_causes: &["Target service not running"],
        fix_templates: &["Verify the service is running and reachable"],
        related_patterns: &["port_in_use"],
    },
    // -- dependency / state / git -------------------------------------------
    KnownPattern {
        name: "dependency_conflict",
        category: "dependency",
        symptoms: &[
            r"version conflict",
            r"incompatible.*version",
            r"ResolutionImpossible",
        ],
        prior_probability: 0.05,
        common_causes: &["Two requirements pin incompatible versions"],
        fix_templates: &["Align the pinned versions"],
        related_patterns: &["import_error"],
    },
    KnownPattern {
        name: "state_corruption",
        category: "state_corruption",
        symptoms: &[
            r"[Ff]ailed to parse state file",
            r"invalid JSON",
            r"[Uu]nexpected end of (file|input)",
            r"corrupt",
        ],
        prior_probability: 0.05,
        common_causes: &["Interrupted write to a state file"],
        fix_templates: &["Restore the state file from backup or reinitialize the feature"],
        related_patterns: &["key_error"],
    },
    KnownPattern {
        name: "merge_conflict",
        category: "merge_conflict",
        symptoms: &[
            r"CONFLICT \(content\)",
            r"[Aa]utomatic merge failed",
            r"merge conflict",
        ],
        prior_probability: 0.08,
        common_causes: &["Two tasks modified the same file despite the ownership constraint"],
        fix_templates: &["Redesign the task graph's file ownership and rerun the level"],
        related_patterns: &["worker_crash"],
    },
    // -- drover-specific -----------------------------------------------------
    KnownPattern {
        name: "worker_crash",
        category: "worker",
        symptoms: &[
            r"worker \d+ crashed",
            r"worker.*exit(ed)? (code )?[15]",
            r"[Ww]orker.*non-zero",
        ],
        prior_probability: 0.08,
        common_causes: &["Agent process died mid-task", "Out-of-memory kill"],
        fix_templates: &["Inspect the worker log and respawn"],
        related_patterns: &["heartbeat_stale"],
    },
    KnownPattern {
        name: "heartbeat_stale",
        category: "worker",
        symptoms: &[r"heartbeat.*stale", r"worker.*stalled", r"no heartbeat"],
        prior_probability: 0.06,
        common_causes: &["Worker hung waiting on the agent"],
        fix_templates: &["Terminate the stalled worker; its task is reclaimed automatically"],
        related_patterns: &["worker_crash"],
    },
];

/// Matches error text against the catalogue.
///
/// Compiled regexes are cached behind a mutex so repeated matches don't
/// recompile.
pub struct PatternMatcher {
    cache: Mutex<HashMap<&'static str, Regex>>,
}

impl Default for PatternMatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl PatternMatcher {
    pub fn new() -> Self {
        Self {
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn is_match(&self, pattern: &'static str, text: &str) -> bool {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        let regex = cache.entry(pattern).or_insert_with(|| {
            Regex::new(pattern).unwrap_or_else(|_| Regex::new(regex::escape(pattern).as_str()).expect("escaped regex"))
        });
        regex.is_match(text)
    }

    /// Patterns matching `text`, scored by matched/total symptoms, sorted
    /// by score descending (name ascending on ties).
    pub fn match_text(&self, text: &str) -> Vec<(&'static KnownPattern, f64)> {
        let mut matches: Vec<(&'static KnownPattern, f64)> = KNOWN_PATTERNS
            .iter()
            .filter_map(|pattern| {
                let matched = pattern
                    .symptoms
                    .iter()
                    .filter(|symptom| self.is_match(symptom, text))
                    .count();
                if matched == 0 {
                    return None;
                }
                Some((pattern, matched as f64 / pattern.symptoms.len() as f64))
            })
            .collect();
        matches.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.name.cmp(b.0.name))
        });
        matches
    }

    /// Look up a pattern by name.
    pub fn get(&self, name: &str) -> Option<&'static KnownPattern> {
        KNOWN_PATTERNS.iter().find(|p| p.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn module_not_found_scores_at_least_half() {
        let matcher = PatternMatcher::new();
        let matches = matcher.match_text("ModuleNotFoundError: No module named 'foo'");
        let (pattern, score) = matches
            .iter()
            .find(|(p, _)| p.name == "module_not_found")
            .expect("module_not_found should match");
        assert!(*score >= 0.5, "score {score} below 0.5");
        assert_eq!(pattern.category, "dependency");
    }

    #[test]
    fn no_match_for_clean_text() {
        let matcher = PatternMatcher::new();
        assert!(matcher.match_text("everything is fine").is_empty());
    }

    #[test]
    fn merge_conflict_matches() {
        let matcher = PatternMatcher::new();
        let matches =
            matcher.match_text("CONFLICT (content): Merge conflict in src/app.rs\nAutomatic merge failed");
        assert_eq!(matches[0].0.name, "merge_conflict");
    }

    #[test]
    fn matches_sorted_by_score() {
        let matcher = PatternMatcher::new();
        let matches = matcher.match_text(
            "TypeError: foo() takes 2 positional arguments but 3 were given",
        );
        assert!(!matches.is_empty());
        for window in matches.windows(2) {
            assert!(window[0].1 >= window[1].1);
        }
    }

    #[test]
    fn catalogue_priors_are_probabilities() {
        for pattern in KNOWN_PATTERNS {
            assert!(
                (0.0..=1.0).contains(&pattern.prior_probability),
                "{} prior out of range",
                pattern.name
            );
            assert!(!pattern.symptoms.is_empty(), "{} has no symptoms", pattern.name);
        }
    }

    #[test]
    fn all_symptom_regexes_compile() {
        for pattern in KNOWN_PATTERNS {
            for symptom in pattern.symptoms {
                assert!(Regex::new(symptom).is_ok(), "bad regex in {}: {symptom}", pattern.name);
            }
        }
    }

    #[test]
    fn related_patterns_exist() {
        let matcher = PatternMatcher::new();
        for pattern in KNOWN_PATTERNS {
            for related in pattern.related_patterns {
                assert!(
                    matcher.get(related).is_some(),
                    "{} references unknown pattern {related}",
                    pattern.name
                );
            }
        }
    }
}
