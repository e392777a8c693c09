//! WorktreeManager integration tests.

use drover_core::worktree::WorktreeManager;
use drover_test_utils::temp_repo;

#[test]
fn rejects_non_repo() {
    let dir = tempfile::TempDir::new().unwrap();
    assert!(WorktreeManager::new(dir.path(), None).is_err());
}

#[test]
fn create_places_worktree_on_worker_branch() {
    let (_dir, repo) = temp_repo();
    let manager = WorktreeManager::new(&repo, None).unwrap();

    let info = manager.create("payments", 0, "main").unwrap();
    assert_eq!(info.path, manager.worktree_path("payments", 0));
    assert_eq!(info.branch.as_deref(), Some("drover/payments/worker-0"));
    assert!(info.path.join("README.md").exists());
}

#[test]
fn create_replaces_stale_directory() {
    let (_dir, repo) = temp_repo();
    let manager = WorktreeManager::new(&repo, None).unwrap();

    // Something already squats on the path.
    let path = manager.worktree_path("payments", 0);
    std::fs::create_dir_all(&path).unwrap();
    std::fs::write(path.join("junk.txt"), "stale").unwrap();

    let info = manager.create("payments", 0, "main").unwrap();
    assert!(info.path.join("README.md").exists());
    assert!(!info.path.join("junk.txt").exists());
}

#[test]
fn delete_handles_dirty_worktrees() {
    let (_dir, repo) = temp_repo();
    let manager = WorktreeManager::new(&repo, None).unwrap();

    let info = manager.create("payments", 0, "main").unwrap();
    // A crashed worker leaves uncommitted changes behind.
    std::fs::write(info.path.join("dirty.txt"), "uncommitted").unwrap();

    manager.delete(&info.path, true).unwrap();
    assert!(!info.path.exists());
    assert!(manager.get(&info.path).unwrap().is_none());
}

#[test]
fn delete_missing_worktree_is_a_noop() {
    let (_dir, repo) = temp_repo();
    let manager = WorktreeManager::new(&repo, None).unwrap();
    manager
        .delete(&manager.worktree_path("payments", 9), true)
        .unwrap();
}

#[test]
fn delete_all_clears_the_feature() {
    let (_dir, repo) = temp_repo();
    let manager = WorktreeManager::new(&repo, None).unwrap();

    manager.create("payments", 0, "main").unwrap();
    manager.create("payments", 1, "main").unwrap();
    manager.create("other", 0, "main").unwrap();

    let removed = manager.delete_all("payments").unwrap();
    assert_eq!(removed, 2);
    assert!(!manager.worktree_path("payments", 0).exists());
    assert!(manager.worktree_path("other", 0).exists());
}

#[test]
fn list_includes_main_and_workers() {
    let (_dir, repo) = temp_repo();
    let manager = WorktreeManager::new(&repo, None).unwrap();

    manager.create("payments", 0, "main").unwrap();
    let list = manager.list().unwrap();
    // Main working tree plus the worker worktree.
    assert_eq!(list.len(), 2);
    assert!(manager.exists(&manager.worktree_path("payments", 0)).unwrap());
}

#[test]
fn prune_drops_orphaned_registrations() {
    let (_dir, repo) = temp_repo();
    let manager = WorktreeManager::new(&repo, None).unwrap();

    let info = manager.create("payments", 0, "main").unwrap();
    // The directory vanishes out from under git (external rm).
    std::fs::remove_dir_all(&info.path).unwrap();

    manager.prune().unwrap();
    assert!(manager.get(&info.path).unwrap().is_none());
}
