//! Shared test fixtures: temporary git repositories and task-graph
//! builders.

use std::path::{Path, PathBuf};
use std::process::Command;

use tempfile::TempDir;

use drover_state::graph::TaskGraph;

/// Run a git command in `dir`, panicking on failure (fixtures only).
pub fn git(dir: &Path, args: &[&str]) {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .unwrap_or_else(|e| panic!("git {} failed to start: {e}", args.join(" ")));
    assert!(
        output.status.success(),
        "git {} failed: {}",
        args.join(" "),
        String::from_utf8_lossy(&output.stderr)
    );
}

/// Create a temporary git repository with an initial commit on `main`.
pub fn temp_repo() -> (TempDir, PathBuf) {
    let dir = TempDir::new().expect("failed to create temp dir");
    let repo = dir.path().to_path_buf();

    git(&repo, &["init", "--initial-branch=main"]);
    git(&repo, &["config", "user.email", "test@drover.dev"]);
    git(&repo, &["config", "user.name", "Drover Test"]);
    std::fs::write(repo.join("README.md"), "# Test repository\n").expect("write README");
    git(&repo, &["add", "."]);
    git(&repo, &["commit", "-m", "initial commit"]);

    (dir, repo)
}

/// Commit a file on a new branch cut from `base`, returning to `base`
/// afterwards.
pub fn commit_on_branch(repo: &Path, branch: &str, base: &str, file: &str, contents: &str) {
    git(repo, &["checkout", "-b", branch, base]);
    if let Some(parent) = Path::new(file).parent() {
        std::fs::create_dir_all(repo.join(parent)).expect("create parent dirs");
    }
    std::fs::write(repo.join(file), contents).expect("write file");
    git(repo, &["add", "."]);
    git(repo, &["commit", "-m", &format!("add {file}")]);
    git(repo, &["checkout", base]);
}

/// Builder for task-graph JSON used across tests.
pub struct GraphBuilder {
    feature: String,
    tasks: Vec<serde_json::Value>,
}

impl GraphBuilder {
    pub fn new(feature: &str) -> Self {
        Self {
            feature: feature.to_string(),
            tasks: Vec::new(),
        }
    }

    pub fn task(
        mut self,
        id: &str,
        level: u32,
        dependencies: &[&str],
        estimate_minutes: u32,
    ) -> Self {
        self.tasks.push(serde_json::json!({
            "id": id,
            "title": format!("task {id}"),
            "level": level,
            "dependencies": dependencies,
            "estimate_minutes": estimate_minutes,
            "verification": {"command": "true"},
        }));
        self
    }

    /// Add a task with explicit file ownership and no verification.
    pub fn raw_task(mut self, value: serde_json::Value) -> Self {
        self.tasks.push(value);
        self
    }

    pub fn json(&self) -> serde_json::Value {
        serde_json::json!({
            "feature": self.feature,
            "tasks": self.tasks,
        })
    }

    pub fn build(&self) -> TaskGraph {
        TaskGraph::from_json_value(self.json()).expect("valid test graph")
    }

    /// Write the graph JSON to a file and return its path.
    pub fn write_to(&self, dir: &Path) -> PathBuf {
        let path = dir.join(format!("{}.graph.json", self.feature));
        std::fs::write(&path, serde_json::to_string_pretty(&self.json()).expect("serialize"))
            .expect("write graph");
        path
    }
}
