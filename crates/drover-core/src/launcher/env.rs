//! Environment-variable validation for spawned workers.
//!
//! An explicit allowlist (plus the `DROVER_` prefix) controls what the
//! orchestrator forwards; a blocklist of loader/path/shell variables is
//! refused even when configured; and values carrying shell metacharacters
//! are dropped.

use std::collections::BTreeMap;

/// Variables that may be forwarded from config or caller to a worker.
const ALLOWED_ENV_VARS: &[&str] = &[
    // Scheduler-relevant
    "DROVER_WORKER_ID",
    "DROVER_FEATURE",
    "DROVER_WORKTREE",
    "DROVER_BRANCH",
    "DROVER_TASK_ID",
    "DROVER_STATE_DIR",
    "DROVER_REPO_PATH",
    "DROVER_LOG_DIR",
    "DROVER_LOG_LEVEL",
    // Cross-session task-list coordination
    "CLAUDE_CODE_TASK_LIST_ID",
    // Common development variables
    "CI",
    "DEBUG",
    "LOG_LEVEL",
    "VERBOSE",
    "TERM",
    "COLORTERM",
    "NO_COLOR",
    // Credentials the agent may need
    "ANTHROPIC_API_KEY",
    "OPENAI_API_KEY",
    // Build/test variables
    "NODE_ENV",
    "RUST_BACKTRACE",
    "RUST_LOG",
];

/// Variables that must never be overridden for a child process.
const DANGEROUS_ENV_VARS: &[&str] = &[
    "LD_PRELOAD",
    "LD_LIBRARY_PATH",
    "DYLD_INSERT_LIBRARIES",
    "DYLD_LIBRARY_PATH",
    "PATH",
    "PYTHONPATH",
    "NODE_PATH",
    "HOME",
    "USER",
    "SHELL",
    "TMPDIR",
    "TMP",
    "TEMP",
];

const SHELL_METACHARACTERS: &[char] = &[';', '|', '&', '`', '$', '(', ')', '<', '>'];

/// Filter an environment map down to the entries safe to forward.
pub fn validate_env_vars(env: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    let mut validated = BTreeMap::new();

    for (key, value) in env {
        let upper = key.to_uppercase();

        if DANGEROUS_ENV_VARS.contains(&upper.as_str()) {
            tracing::warn!(%key, "blocked dangerous environment variable");
            continue;
        }

        let allowed = ALLOWED_ENV_VARS.contains(&upper.as_str()) || upper.starts_with("DROVER_");
        if !allowed {
            tracing::debug!(%key, "skipping unlisted environment variable");
            continue;
        }

        if value.chars().any(|c| SHELL_METACHARACTERS.contains(&c)) {
            tracing::warn!(%key, "blocked env var value with shell metacharacters");
            continue;
        }

        validated.insert(key.clone(), value.clone());
    }

    validated
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn forwards_allowlisted_and_prefixed() {
        let validated = validate_env_vars(&env(&[
            ("DROVER_FEATURE", "auth"),
            ("DROVER_ANALYSIS_DEPTH", "deep"),
            ("CI", "true"),
        ]));
        assert_eq!(validated.len(), 3);
        assert_eq!(validated["DROVER_ANALYSIS_DEPTH"], "deep");
    }

    #[test]
    fn blocks_dangerous_variables() {
        let validated = validate_env_vars(&env(&[
            ("LD_PRELOAD", "/tmp/evil.so"),
            ("PATH", "/tmp"),
            ("HOME", "/tmp"),
        ]));
        assert!(validated.is_empty());
    }

    #[test]
    fn drops_unlisted_variables() {
        let validated = validate_env_vars(&env(&[("RANDOM_VAR", "x")]));
        assert!(validated.is_empty());
    }

    #[test]
    fn rejects_metacharacter_values() {
        let validated = validate_env_vars(&env(&[
            ("DROVER_FEATURE", "auth; rm -rf /"),
            ("DROVER_BRANCH", "drover/auth/worker-0"),
        ]));
        assert_eq!(validated.len(), 1);
        assert!(validated.contains_key("DROVER_BRANCH"));
    }
}
