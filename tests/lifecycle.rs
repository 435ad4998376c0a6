//! End-to-end checks of the pieces that work without a tmux server: the
//! worktree lifecycle against a real repository, and instance persistence.

use claude_squad::domains::git::GitWorktree;
use claude_squad::domains::sessions::{Instance, InstanceOptions, Status, Storage};
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn setup_test_repo(root: &Path) -> PathBuf {
    let repo_path = root.join("repo");
    std::fs::create_dir_all(&repo_path).unwrap();
    for args in [
        vec!["init"],
        vec!["config", "user.email", "test@example.com"],
        vec!["config", "user.name", "Test User"],
    ] {
        Command::new("git")
            .args(&args)
            .current_dir(&repo_path)
            .output()
            .unwrap();
    }
    std::fs::write(repo_path.join("README.md"), "Initial").unwrap();
    Command::new("git")
        .args(["add", "."])
        .current_dir(&repo_path)
        .output()
        .unwrap();
    Command::new("git")
        .args(["commit", "-m", "init"])
        .current_dir(&repo_path)
        .output()
        .unwrap();
    repo_path
}

#[test]
fn worktree_survives_a_pause_resume_cycle() {
    let temp = TempDir::new().unwrap();
    let repo_path = setup_test_repo(temp.path());
    let worktrees_root = temp.path().join("worktrees");

    let mut worktree = GitWorktree::new(&repo_path, "claudesquad-cycle", &worktrees_root);
    worktree.setup().unwrap();

    std::fs::write(worktree.worktree_path().join("notes.txt"), "work in progress").unwrap();
    worktree.pause().unwrap();
    assert!(
        !worktree.worktree_path().exists(),
        "pause must remove the worktree files"
    );

    worktree.resume().unwrap();
    let restored = std::fs::read_to_string(worktree.worktree_path().join("notes.txt")).unwrap();
    assert_eq!(restored, "work in progress");

    let stats = worktree.diff().unwrap();
    assert_eq!(stats.added, 1);

    worktree.cleanup().unwrap();
    assert!(!worktree.worktree_path().exists());
}

#[test]
fn instances_round_trip_through_storage() {
    let temp = TempDir::new().unwrap();
    let storage = Storage::new(&temp.path().join("claude-squad")).unwrap();
    let worktrees_root = temp.path().join("worktrees");

    let mut alpha = Instance::new(InstanceOptions {
        title: "alpha",
        path: temp.path(),
        program: "claude",
    })
    .unwrap();
    alpha.set_auto_yes(true);
    let beta = Instance::new(InstanceOptions {
        title: "beta",
        path: temp.path(),
        program: "aider",
    })
    .unwrap();

    storage.save_instances(&[alpha, beta]).unwrap();
    let loaded = storage.load_instances(&worktrees_root).unwrap();

    assert_eq!(loaded.len(), 2);
    assert_eq!(loaded[0].title(), "alpha");
    assert!(loaded[0].auto_yes());
    assert_eq!(loaded[1].title(), "beta");
    assert_ne!(loaded[0].sanitized_name(), loaded[1].sanitized_name());

    storage.delete_instance("alpha").unwrap();
    let remaining = storage.load_instances(&worktrees_root).unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].title(), "beta");

    storage.delete_all_instances().unwrap();
    assert!(storage.load_instances(&worktrees_root).unwrap().is_empty());
}

#[test]
fn unstarted_instances_load_without_live_handles() {
    let temp = TempDir::new().unwrap();
    let storage = Storage::new(&temp.path().join("claude-squad")).unwrap();

    let instance = Instance::new(InstanceOptions {
        title: "idle",
        path: temp.path(),
        program: "claude",
    })
    .unwrap();
    storage.save_instances(&[instance]).unwrap();

    let loaded = storage.load_instances(&temp.path().join("worktrees")).unwrap();
    assert_eq!(loaded.len(), 1);
    assert!(!loaded[0].started());
    assert_ne!(loaded[0].status(), Status::Paused);
    assert!(loaded[0].preview().unwrap().is_empty());
}
