//! Error fingerprinting across source languages.
//!
//! Parses an error string (and optional stack trace) into a canonical
//! [`ErrorFingerprint`]. The hash is derived from language, error type,
//! normalized message, and location, so recurring instances of the same
//! error collapse to one fingerprint.

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::OnceLock;

use super::Evidence;

/// Canonical representation of an error for matching and deduplication.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorFingerprint {
    pub hash: String,
    /// python / javascript / go / rust / unknown
    pub language: String,
    pub error_type: String,
    pub message_template: String,
    pub file: String,
    pub line: u32,
    pub column: u32,
    pub function: String,
    pub module: String,
    /// Chained causes, outermost first.
    #[serde(default)]
    pub chain: Vec<ErrorFingerprint>,
}

struct Parsers {
    python_error: Regex,
    python_file_line: Regex,
    js_error: Regex,
    js_file_line: Regex,
    go_file_line: Regex,
    rust_error: Regex,
    rust_file_line: Regex,
    digits: Regex,
    quoted: Regex,
    hex_addr: Regex,
}

fn parsers() -> &'static Parsers {
    static PARSERS: OnceLock<Parsers> = OnceLock::new();
    PARSERS.get_or_init(|| Parsers {
        python_error: Regex::new(r"(\w+Error|\w+Exception):\s*(.+)").expect("static regex"),
        python_file_line: Regex::new(r#"File "([^"]+)", line (\d+)"#).expect("static regex"),
        js_error: Regex::new(r"(TypeError|ReferenceError|SyntaxError|RangeError|Error):\s*(.+)")
            .expect("static regex"),
        js_file_line: Regex::new(r"at\s+.+\(([^:)]+):(\d+):(\d+)\)").expect("static regex"),
        go_file_line: Regex::new(r"([^\s]+\.go):(\d+)").expect("static regex"),
        rust_error: Regex::new(r"error\[E\d+\]:\s*(.+)").expect("static regex"),
        rust_file_line: Regex::new(r"-->\s*([^:]+):(\d+):(\d+)").expect("static regex"),
        digits: Regex::new(r"\b\d+\b").expect("static regex"),
        quoted: Regex::new(r#"'[^']*'|"[^"]*""#).expect("static regex"),
        hex_addr: Regex::new(r"0x[0-9a-fA-F]+").expect("static regex"),
    })
}

/// Parses errors into fingerprints and derives evidence from them.
#[derive(Debug, Default)]
pub struct FingerprintEngine;

impl FingerprintEngine {
    pub fn new() -> Self {
        Self
    }

    /// Analyze an error string plus optional stack trace.
    pub fn analyze(&self, error: &str, stack_trace: &str) -> ErrorFingerprint {
        let combined = if stack_trace.is_empty() {
            error.to_string()
        } else {
            format!("{error}\n{stack_trace}")
        };
        let p = parsers();

        let mut fp = ErrorFingerprint::default();

        // Python first: its error-type shape is the most specific.
        if let Some(captures) = p.python_error.captures(&combined) {
            fp.language = "python".into();
            fp.error_type = captures[1].to_string();
            fp.message_template = normalize_message(&captures[2]);
        }
        if let Some(captures) = p.python_file_line.captures(&combined) {
            if fp.language.is_empty() {
                fp.language = "python".into();
            }
            fp.file = captures[1].to_string();
            fp.line = captures[2].parse().unwrap_or(0);
        }

        if fp.error_type.is_empty() {
            if let Some(captures) = p.js_error.captures(&combined) {
                fp.language = "javascript".into();
                fp.error_type = captures[1].to_string();
                fp.message_template = normalize_message(&captures[2]);
            }
            if fp.file.is_empty() {
                if let Some(captures) = p.js_file_line.captures(&combined) {
                    fp.file = captures[1].to_string();
                    fp.line = captures[2].parse().unwrap_or(0);
                    fp.column = captures[3].parse().unwrap_or(0);
                }
            }
        }

        if fp.error_type.is_empty() {
            if let Some(captures) = p.rust_error.captures(&combined) {
                fp.language = "rust".into();
                fp.error_type = "RustError".into();
                fp.message_template = normalize_message(&captures[1]);
            }
            if let Some(captures) = p.rust_file_line.captures(&combined) {
                if fp.language.is_empty() {
                    fp.language = "rust".into();
                }
                fp.file = captures[1].trim().to_string();
                fp.line = captures[2].parse().unwrap_or(0);
                fp.column = captures[3].parse().unwrap_or(0);
            }
        }

        if fp.file.is_empty() {
            if let Some(captures) = p.go_file_line.captures(&combined) {
                fp.language = "go".into();
                fp.file = captures[1].to_string();
                fp.line = captures[2].parse().unwrap_or(0);
            }
        }

        if fp.language.is_empty() {
            fp.language = "unknown".into();
        }
        if fp.error_type.is_empty() {
            fp.error_type = "UnknownError".into();
            fp.message_template = normalize_message(combined.lines().next().unwrap_or(""));
        }

        fp.module = module_from_file(&fp.file);
        fp.hash = fingerprint_hash(&fp);
        fp
    }

    /// Evidence entries a fingerprint contributes to the hypothesis engine.
    pub fn evidence(&self, fp: &ErrorFingerprint) -> Vec<Evidence> {
        let mut evidence = Vec::new();
        if !fp.error_type.is_empty() && fp.error_type != "UnknownError" {
            evidence.push(Evidence::new(
                format!("{} error of type {}", fp.language, fp.error_type),
                "log",
                0.8,
            ));
        }
        if !fp.file.is_empty() && fp.line > 0 {
            evidence.push(Evidence::new(
                format!("error located at {}:{}", fp.file, fp.line),
                "log",
                0.7,
            ));
        }
        evidence
    }
}

/// Strip instance-specific noise so identical errors hash identically:
/// numbers become `N`, quoted strings become `'_'`, addresses become
/// `0xADDR`.
fn normalize_message(message: &str) -> String {
    let p = parsers();
    let out = p.hex_addr.replace_all(message.trim(), "0xADDR");
    let out = p.quoted.replace_all(&out, "'_'");
    let out = p.digits.replace_all(&out, "N");
    out.into_owned()
}

fn module_from_file(file: &str) -> String {
    if file.is_empty() {
        return String::new();
    }
    std::path::Path::new(file)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// First 16 hex chars of SHA-256 over the identity fields.
fn fingerprint_hash(fp: &ErrorFingerprint) -> String {
    let mut hasher = Sha256::new();
    hasher.update(fp.language.as_bytes());
    hasher.update(b"|");
    hasher.update(fp.error_type.as_bytes());
    hasher.update(b"|");
    hasher.update(fp.message_template.as_bytes());
    hasher.update(b"|");
    hasher.update(fp.file.as_bytes());
    hasher.update(b"|");
    hasher.update(fp.line.to_string().as_bytes());
    hex::encode(hasher.finalize())[..16].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn python_error_with_location() {
        let engine = FingerprintEngine::new();
        let fp = engine.analyze(
            "ModuleNotFoundError: No module named 'foo'",
            "File \"app/main.py\", line 12",
        );
        assert_eq!(fp.language, "python");
        assert_eq!(fp.error_type, "ModuleNotFoundError");
        assert_eq!(fp.file, "app/main.py");
        assert_eq!(fp.line, 12);
        assert_eq!(fp.module, "main");
        assert_eq!(fp.hash.len(), 16);
    }

    #[test]
    fn javascript_error() {
        let engine = FingerprintEngine::new();
        let fp = engine.analyze(
            "TypeError: Cannot read properties of undefined",
            "at handler (src/routes.js:42:13)",
        );
        assert_eq!(fp.language, "javascript");
        assert_eq!(fp.error_type, "TypeError");
        assert_eq!(fp.file, "src/routes.js");
        assert_eq!(fp.line, 42);
        assert_eq!(fp.column, 13);
    }

    #[test]
    fn rust_error() {
        let engine = FingerprintEngine::new();
        let fp = engine.analyze(
            "error[E0382]: borrow of moved value: `graph`",
            "  --> src/graph.rs:88:9",
        );
        assert_eq!(fp.language, "rust");
        assert_eq!(fp.error_type, "RustError");
        assert_eq!(fp.file, "src/graph.rs");
        assert_eq!(fp.line, 88);
    }

    #[test]
    fn go_location() {
        let engine = FingerprintEngine::new();
        let fp = engine.analyze("panic: runtime error", "main.go:17 +0x25");
        assert_eq!(fp.file, "main.go");
        assert_eq!(fp.line, 17);
    }

    #[test]
    fn recurring_errors_collapse_to_one_hash() {
        let engine = FingerprintEngine::new();
        let a = engine.analyze("ValueError: invalid literal for int() with base 10: '37'", "");
        let b = engine.analyze("ValueError: invalid literal for int() with base 10: '99'", "");
        assert_eq!(a.hash, b.hash);
    }

    #[test]
    fn different_errors_hash_differently() {
        let engine = FingerprintEngine::new();
        let a = engine.analyze("KeyError: 'alpha'", "");
        let b = engine.analyze("TypeError: 'NoneType' object is not callable", "");
        assert_ne!(a.hash, b.hash);
    }

    #[test]
    fn unknown_text_still_fingerprints() {
        let engine = FingerprintEngine::new();
        let fp = engine.analyze("something went wrong at 0xdeadbeef", "");
        assert_eq!(fp.language, "unknown");
        assert_eq!(fp.error_type, "UnknownError");
        assert!(fp.message_template.contains("0xADDR"));
    }

    #[test]
    fn evidence_reflects_fingerprint_contents() {
        let engine = FingerprintEngine::new();
        let fp = engine.analyze(
            "ModuleNotFoundError: No module named 'foo'",
            "File \"app/main.py\", line 12",
        );
        let evidence = engine.evidence(&fp);
        assert_eq!(evidence.len(), 2);
        assert!(evidence[0].description.contains("ModuleNotFoundError"));
    }
}
