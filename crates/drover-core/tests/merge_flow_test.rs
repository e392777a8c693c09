//! Merge coordinator integration tests: the full level-merge flow against
//! real repositories.

use drover_core::config::{MergeConfig, QualityGate};
use drover_core::git::GitOps;
use drover_core::merge::MergeCoordinator;
use drover_test_utils::{commit_on_branch, temp_repo};

fn gate(name: &str, command: &str, required: bool) -> QualityGate {
    QualityGate {
        name: name.into(),
        command: command.into(),
        required,
        timeout: 30,
        coverage_threshold: None,
    }
}

fn coordinator(repo: &std::path::Path, gates: Vec<QualityGate>) -> MergeCoordinator {
    coordinator_with(repo, gates, MergeConfig::default())
}

fn coordinator_with(
    repo: &std::path::Path,
    gates: Vec<QualityGate>,
    config: MergeConfig,
) -> MergeCoordinator {
    MergeCoordinator::new("payments", GitOps::new(repo), gates, config)
}

#[tokio::test]
async fn empty_branch_list_succeeds_without_commit() {
    let (_dir, repo) = temp_repo();
    let mc = coordinator(&repo, vec![]);

    let result = mc.full_merge_flow(1, &[], "main").await;
    assert!(result.success);
    assert!(result.merge_commit.is_none());
    assert!(result.error.is_none());
}

#[tokio::test]
async fn merges_worker_branches_into_target() {
    let (_dir, repo) = temp_repo();
    let git = GitOps::new(&repo);

    commit_on_branch(&repo, "drover/payments/worker-0", "main", "src/a.rs", "a");
    commit_on_branch(&repo, "drover/payments/worker-1", "main", "src/b.rs", "b");

    let mc = coordinator(&repo, vec![]);
    let branches = mc.mergeable_branches().unwrap();
    assert_eq!(branches.len(), 2);

    let result = mc.full_merge_flow(1, &branches, "main").await;
    assert!(result.success, "{:?}", result.error);

    // The target branch contains a commit whose ancestors include every
    // merged worker branch's last commit.
    let merge_commit = result.merge_commit.expect("merge commit");
    for branch in &branches {
        assert!(git.is_ancestor(branch, &merge_commit).unwrap());
    }
    git.checkout("main").unwrap();
    assert!(repo.join("src/a.rs").exists());
    assert!(repo.join("src/b.rs").exists());
}

#[tokio::test]
async fn conflict_aborts_and_reports_files() {
    let (_dir, repo) = temp_repo();
    let git = GitOps::new(&repo);
    let before = git.get_commit("main").unwrap();

    commit_on_branch(&repo, "drover/payments/worker-0", "main", "shared.rs", "left\n");
    commit_on_branch(&repo, "drover/payments/worker-1", "main", "shared.rs", "right\n");

    let mc = coordinator(&repo, vec![]);
    let branches = mc.mergeable_branches().unwrap();
    let result = mc.full_merge_flow(1, &branches, "main").await;

    assert!(!result.success);
    assert_eq!(result.conflicts, vec!["shared.rs"]);
    assert!(result.error.unwrap().contains("shared.rs"));

    // Target unchanged, staging branch cleaned up.
    assert_eq!(git.get_commit("main").unwrap(), before);
    assert!(!git.branch_exists("drover/payments/staging").unwrap());
}

#[tokio::test]
async fn pre_merge_gate_failure_stops_early() {
    let (_dir, repo) = temp_repo();
    let git = GitOps::new(&repo);
    let before = git.get_commit("main").unwrap();

    commit_on_branch(&repo, "drover/payments/worker-0", "main", "src/a.rs", "a");

    let mc = coordinator(&repo, vec![gate("broken", "false", true)]);
    let branches = mc.mergeable_branches().unwrap();
    let result = mc.full_merge_flow(1, &branches, "main").await;

    assert!(!result.success);
    assert!(result.error.unwrap().contains("pre-merge gates failed"));
    assert_eq!(git.get_commit("main").unwrap(), before);
    assert!(!git.branch_exists("drover/payments/staging").unwrap());
}

#[tokio::test]
async fn post_merge_gate_failure_leaves_target_untouched() {
    let (_dir, repo) = temp_repo();
    let git = GitOps::new(&repo);
    let before = git.get_commit("main").unwrap();

    commit_on_branch(&repo, "drover/payments/worker-0", "main", "src/a.rs", "a");

    // The gate passes on the pre-merge tree (no marker file on main) and
    // fails on the staging tree once worker-0's file arrives.
    let mc = coordinator(&repo, vec![gate("no-marker", "test ! -e src/a.rs", true)]);
    let branches = mc.mergeable_branches().unwrap();
    let result = mc.full_merge_flow(1, &branches, "main").await;

    assert!(!result.success);
    assert!(result.error.unwrap().contains("post-merge gates failed"));
    assert_eq!(git.get_commit("main").unwrap(), before);
    assert!(!git.branch_exists("drover/payments/staging").unwrap());
}

#[tokio::test]
async fn skip_gates_bypasses_failing_gates() {
    let (_dir, repo) = temp_repo();

    commit_on_branch(&repo, "drover/payments/worker-0", "main", "src/a.rs", "a");

    let config = MergeConfig {
        skip_gates: true,
        ..MergeConfig::default()
    };
    let mc = coordinator_with(&repo, vec![gate("broken", "false", true)], config);
    let branches = mc.mergeable_branches().unwrap();
    let result = mc.full_merge_flow(1, &branches, "main").await;
    assert!(result.success, "{:?}", result.error);
}

#[tokio::test]
async fn skip_tests_filters_test_gates_only() {
    let (_dir, repo) = temp_repo();

    commit_on_branch(&repo, "drover/payments/worker-0", "main", "src/a.rs", "a");

    let config = MergeConfig {
        skip_tests: true,
        ..MergeConfig::default()
    };
    let mc = coordinator_with(
        &repo,
        vec![gate("unit-tests", "false", true), gate("lint", "true", true)],
        config,
    );
    let branches = mc.mergeable_branches().unwrap();
    let result = mc.full_merge_flow(1, &branches, "main").await;
    // The failing test gate was skipped; the lint gate passed.
    assert!(result.success, "{:?}", result.error);
}

#[test]
fn abort_is_idempotent() {
    let (_dir, repo) = temp_repo();
    let git = GitOps::new(&repo);
    let mc = coordinator(&repo, vec![]);

    // No staging branch exists: abort is a no-op.
    mc.abort(None).unwrap();

    let staging = mc.prepare_merge(1, "main").unwrap();
    assert!(git.branch_exists(&staging).unwrap());
    mc.abort(Some(&staging)).unwrap();
    assert!(!git.branch_exists(&staging).unwrap());
    mc.abort(Some(&staging)).unwrap();
}
