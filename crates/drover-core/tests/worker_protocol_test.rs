//! Worker protocol integration tests with a stub agent command.

use std::collections::BTreeMap;

use drover_core::config::DroverConfig;
use drover_core::worker::{WorkerArgs, WorkerProtocol};
use drover_core::worktree::WorktreeManager;
use drover_state::heartbeat::HeartbeatMonitor;
use drover_state::models::{TaskRuntime, TaskStatus, WorkerExit, WorkerStatus};
use drover_state::store::{default_state_dir, graph_path, StateStore};
use drover_test_utils::{temp_repo, GraphBuilder};

struct WorkerFixture {
    _dir: tempfile::TempDir,
    repo: std::path::PathBuf,
    state_dir: std::path::PathBuf,
    store: StateStore,
    worktree: std::path::PathBuf,
}

/// Prepare a repo, a graph snapshot, seeded ready tasks at level 1, and a
/// worktree for worker 0.
fn worker_fixture(builder: &GraphBuilder) -> WorkerFixture {
    let (dir, repo) = temp_repo();
    let state_dir = default_state_dir(&repo);
    std::fs::create_dir_all(&state_dir).expect("state dir");

    let graph = builder.build();
    let snapshot = graph_path(&state_dir, graph.feature_name());
    std::fs::write(
        &snapshot,
        serde_json::to_string_pretty(&builder.json()).expect("serialize"),
    )
    .expect("write graph snapshot");

    let store = StateStore::new(graph.feature_name().to_string(), &state_dir);
    store
        .update(|state| {
            state.current_level = 1;
            for task in graph.all_tasks() {
                let status = if task.level == 1 {
                    TaskStatus::Ready
                } else {
                    TaskStatus::Pending
                };
                state.tasks.insert(task.id.clone(), TaskRuntime::new(status));
            }
        })
        .expect("seed state");

    let worktrees = WorktreeManager::new(&repo, None).expect("manager");
    let info = worktrees
        .create(graph.feature_name(), 0, "main")
        .expect("worktree");

    WorkerFixture {
        _dir: dir,
        repo,
        state_dir,
        store,
        worktree: info.path,
    }
}

fn worker_config(agent_command: &str, agent_args: &[&str]) -> DroverConfig {
    let mut config = DroverConfig::default();
    config.agent.command = agent_command.to_string();
    config.agent.args = agent_args.iter().map(|s| s.to_string()).collect();
    config
}

fn protocol(fixture: &WorkerFixture, feature: &str, config: DroverConfig) -> WorkerProtocol {
    WorkerProtocol::new(
        WorkerArgs {
            worker_id: 0,
            feature: feature.to_string(),
            worktree: fixture.worktree.clone(),
            branch: format!("drover/{feature}/worker-0"),
            state_dir: fixture.state_dir.clone(),
        },
        config,
    )
    .expect("protocol")
}

#[tokio::test]
async fn completes_ready_tasks_and_exits_clean() {
    let builder = GraphBuilder::new("checkout")
        .task("T1", 1, &[], 5)
        .task("T2", 1, &[], 5);
    let fixture = worker_fixture(&builder);

    // `cat` consumes the prompt from stdin and exits zero: a well-behaved
    // no-op agent.
    let worker = protocol(&fixture, "checkout", worker_config("cat", &[]));
    let exit = worker.run().await.expect("worker run");
    assert_eq!(exit, WorkerExit::Clean);

    fixture.store.invalidate_cache();
    let state = fixture.store.load().expect("state");
    assert_eq!(state.tasks["T1"].status, TaskStatus::Complete);
    assert_eq!(state.tasks["T2"].status, TaskStatus::Complete);
    assert!(state.tasks["T1"].duration_ms.is_some());

    let worker_state = &state.workers[&0];
    assert_eq!(worker_state.tasks_completed, 2);
    assert_eq!(worker_state.status, WorkerStatus::Stopped);
    assert_eq!(worker_state.exit_code, Some(0));
    assert!(worker_state.current_task.is_none());

    // Heartbeats were written along the way.
    let heartbeats = HeartbeatMonitor::new(fixture.store.heartbeat_dir());
    assert!(heartbeats.read(0).is_some());
}

#[tokio::test]
async fn higher_level_tasks_are_not_claimed() {
    let builder = GraphBuilder::new("checkout")
        .task("T1", 1, &[], 5)
        .task("T2", 2, &["T1"], 5);
    let fixture = worker_fixture(&builder);

    let worker = protocol(&fixture, "checkout", worker_config("cat", &[]));
    let exit = worker.run().await.expect("worker run");
    assert_eq!(exit, WorkerExit::Clean);

    fixture.store.invalidate_cache();
    let state = fixture.store.load().expect("state");
    assert_eq!(state.tasks["T1"].status, TaskStatus::Complete);
    // T2 belongs to level 2; this worker run never touches it.
    assert_eq!(state.tasks["T2"].status, TaskStatus::Pending);
}

#[tokio::test]
async fn failing_verification_reports_failed() {
    let builder = GraphBuilder::new("checkout").raw_task(serde_json::json!({
        "id": "T1",
        "title": "doomed task",
        "level": 1,
        "dependencies": [],
        "estimate_minutes": 5,
        "verification": {"command": "false"},
    }));
    let fixture = worker_fixture(&builder);

    let worker = protocol(&fixture, "checkout", worker_config("cat", &[]));
    let exit = worker.run().await.expect("worker run");
    assert_eq!(exit, WorkerExit::Clean);

    fixture.store.invalidate_cache();
    let state = fixture.store.load().expect("state");
    assert_eq!(state.tasks["T1"].status, TaskStatus::Failed);
    assert!(state.tasks["T1"]
        .error
        .as_deref()
        .unwrap_or("")
        .contains("verification failed"));
}

#[tokio::test]
async fn missing_agent_exits_blocked() {
    let builder = GraphBuilder::new("checkout").task("T1", 1, &[], 5);
    let fixture = worker_fixture(&builder);

    let worker = protocol(
        &fixture,
        "checkout",
        worker_config("definitely-not-a-real-agent-binary", &[]),
    );
    let exit = worker.run().await.expect("worker run");
    assert_eq!(exit, WorkerExit::Blocked);

    fixture.store.invalidate_cache();
    let state = fixture.store.load().expect("state");
    assert_eq!(state.tasks["T1"].status, TaskStatus::Failed);
    assert_eq!(state.workers[&0].status, WorkerStatus::Blocked);
    assert_eq!(state.workers[&0].exit_code, Some(3));
}

#[tokio::test]
async fn agent_changes_are_committed_to_the_worker_branch() {
    let builder = GraphBuilder::new("checkout").task("T1", 1, &[], 5);
    let fixture = worker_fixture(&builder);

    // An agent that actually produces a file in the worktree.
    let worker = protocol(
        &fixture,
        "checkout",
        worker_config("sh", &["-c", "cat > /dev/null; echo generated > agent_output.txt"]),
    );
    let exit = worker.run().await.expect("worker run");
    assert_eq!(exit, WorkerExit::Clean);

    fixture.store.invalidate_cache();
    let state = fixture.store.load().expect("state");
    assert_eq!(state.tasks["T1"].status, TaskStatus::Complete);

    // The agent's file exists in the worktree and was committed there.
    assert!(fixture.worktree.join("agent_output.txt").exists());
    let worktree_git = drover_core::git::GitOps::new(&fixture.worktree);
    assert!(!worktree_git.has_changes().expect("clean tree"));
    // The worker branch advanced past the base branch.
    let repo_git = drover_core::git::GitOps::new(&fixture.repo);
    assert_ne!(
        repo_git.get_commit("drover/checkout/worker-0").expect("sha"),
        repo_git.get_commit("main").expect("sha")
    );
}
