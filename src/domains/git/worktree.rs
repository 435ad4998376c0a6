//! Linked git worktrees on ephemeral claudesquad branches.
//!
//! Each instance gets an isolated working copy of the host repository,
//! created from the host's HEAD on a branch named after the instance. Pausing
//! commits outstanding changes and drops the working copy while keeping the
//! branch; resuming recreates the working copy from the branch head.

use anyhow::{Context, Result, anyhow, bail};
use chrono::Local;
use git2::build::CheckoutBuilder;
use git2::{
    BranchType, DiffFormat, DiffOptions, IndexAddOption, Oid, Repository, Signature,
    StatusOptions, WorktreeAddOptions, WorktreePruneOptions,
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Branch names and worktree directory names share this prefix so orphaned
/// resources can be swept without consulting persisted state. It matches the
/// tmux session prefix by construction: all three derive from the sanitized
/// instance name.
pub const BRANCH_PREFIX: &str = "claudesquad-";

/// Cumulative diff of the session branch against its base commit. Committed,
/// staged and unstaged changes are all reflected.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffStats {
    pub added: usize,
    pub removed: usize,
    pub content: String,
}

pub struct GitWorktree {
    repo_path: PathBuf,
    worktree_path: PathBuf,
    sanitized_name: String,
    branch_name: String,
    base_commit_sha: String,
}

impl GitWorktree {
    /// `sanitized_name` doubles as the branch name and the worktree directory
    /// name under `worktrees_root`.
    pub fn new(repo_path: &Path, sanitized_name: &str, worktrees_root: &Path) -> Self {
        Self {
            repo_path: repo_path.to_path_buf(),
            worktree_path: worktrees_root.join(sanitized_name),
            sanitized_name: sanitized_name.to_string(),
            branch_name: sanitized_name.to_string(),
            base_commit_sha: String::new(),
        }
    }

    /// Reconstructs a worktree handle from persisted state. No filesystem
    /// access happens here; `resume` revalidates against the repository.
    pub fn from_storage(
        repo_path: PathBuf,
        branch_name: String,
        base_commit_sha: String,
        worktrees_root: &Path,
    ) -> Self {
        Self {
            worktree_path: worktrees_root.join(&branch_name),
            sanitized_name: branch_name.clone(),
            repo_path,
            branch_name,
            base_commit_sha,
        }
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    pub fn worktree_path(&self) -> &Path {
        &self.worktree_path
    }

    pub fn branch_name(&self) -> &str {
        &self.branch_name
    }

    pub fn base_commit_sha(&self) -> &str {
        &self.base_commit_sha
    }

    /// Resolves the host repository, creates the session branch at the
    /// current HEAD and adds a linked working copy for it. On failure the
    /// partially created branch is removed again.
    pub fn setup(&mut self) -> Result<()> {
        let repo = Repository::discover(&self.repo_path)
            .with_context(|| format!("failed to open repository at {}", self.repo_path.display()))?;
        let workdir = repo
            .workdir()
            .ok_or_else(|| anyhow!("repository has no working directory (bare repository?)"))?;
        self.repo_path = workdir.to_path_buf();

        if repo.find_branch(&self.branch_name, BranchType::Local).is_ok() {
            bail!("branch already exists: {}", self.branch_name);
        }

        let head_commit = repo
            .head()
            .and_then(|head| head.peel_to_commit())
            .context("failed to resolve HEAD commit")?;
        self.base_commit_sha = head_commit.id().to_string();

        let branch = repo
            .branch(&self.branch_name, &head_commit, false)
            .with_context(|| format!("failed to create branch '{}'", self.branch_name))?;

        if let Some(parent) = self.worktree_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let branch_ref = branch.into_reference();
        let mut opts = WorktreeAddOptions::new();
        opts.reference(Some(&branch_ref));
        if let Err(e) = repo.worktree(&self.sanitized_name, &self.worktree_path, Some(&opts)) {
            // Roll the branch back so a retry starts clean.
            if let Ok(mut branch) = repo.find_branch(&self.branch_name, BranchType::Local) {
                if let Err(cleanup) = branch.delete() {
                    return Err(anyhow!(
                        "failed to create worktree: {e} (cleanup error: {cleanup})"
                    ));
                }
            }
            return Err(anyhow!("failed to create worktree: {e}"));
        }

        log::info!(
            "created worktree for '{}' at {}",
            self.branch_name,
            self.worktree_path.display()
        );
        Ok(())
    }

    /// Removes the worktree files and deletes the ephemeral branch. Errors
    /// from the two steps are collected so both causes get reported.
    pub fn cleanup(&mut self) -> Result<()> {
        let mut errs: Vec<String> = Vec::new();

        if let Err(e) = self.remove_worktree_files() {
            errs.push(format!("failed to remove worktree files: {e}"));
        }
        if let Err(e) = self.delete_branch() {
            errs.push(format!("failed to delete branch: {e}"));
        }

        match errs.len() {
            0 => Ok(()),
            1 => Err(anyhow!("{}", errs[0])),
            _ => Err(anyhow!("{}", errs.join("; "))),
        }
    }

    /// Commits outstanding changes to the branch, then removes the worktree
    /// files while keeping the branch for a later `resume`.
    pub fn pause(&mut self) -> Result<()> {
        let message = format!(
            "[claudesquad] pause snapshot on {}",
            Local::now().to_rfc2822()
        );
        self.commit_working_changes(&message)
            .context("failed to commit changes before pause")?;
        self.remove_worktree_files()
            .context("failed to remove worktree files")?;
        log::info!("paused worktree for '{}'", self.branch_name);
        Ok(())
    }

    /// Recreates the working copy at the stored path from the branch head.
    pub fn resume(&mut self) -> Result<()> {
        let repo = Repository::open(&self.repo_path)
            .with_context(|| format!("failed to open repository at {}", self.repo_path.display()))?;
        let branch = repo
            .find_branch(&self.branch_name, BranchType::Local)
            .map_err(|e| anyhow!("branch '{}' no longer exists: {e}", self.branch_name))?;

        if let Some(parent) = self.worktree_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let branch_ref = branch.into_reference();
        let mut opts = WorktreeAddOptions::new();
        opts.reference(Some(&branch_ref));
        repo.worktree(&self.sanitized_name, &self.worktree_path, Some(&opts))
            .with_context(|| {
                format!(
                    "failed to recreate worktree at {}",
                    self.worktree_path.display()
                )
            })?;

        log::info!("resumed worktree for '{}'", self.branch_name);
        Ok(())
    }

    /// Computes the cumulative diff of the branch against the base commit,
    /// including untracked files.
    pub fn diff(&self) -> Result<DiffStats> {
        let repo = Repository::open(&self.worktree_path).with_context(|| {
            format!("failed to open worktree at {}", self.worktree_path.display())
        })?;
        let base_oid = Oid::from_str(&self.base_commit_sha)
            .with_context(|| format!("invalid base commit '{}'", self.base_commit_sha))?;
        let base_tree = repo
            .find_commit(base_oid)
            .and_then(|commit| commit.tree())
            .context("failed to resolve base commit tree")?;

        let mut opts = DiffOptions::new();
        opts.include_untracked(true)
            .recurse_untracked_dirs(true)
            .show_untracked_content(true);
        let diff = repo
            .diff_tree_to_workdir_with_index(Some(&base_tree), Some(&mut opts))
            .context("failed to compute diff")?;

        let stats = diff.stats().context("failed to compute diff stats")?;
        let mut content = String::new();
        diff.print(DiffFormat::Patch, |_delta, _hunk, line| {
            match line.origin() {
                '+' | '-' | ' ' => content.push(line.origin()),
                _ => {}
            }
            content.push_str(std::str::from_utf8(line.content()).unwrap_or_default());
            true
        })
        .context("failed to render diff")?;

        Ok(DiffStats {
            added: stats.insertions(),
            removed: stats.deletions(),
            content,
        })
    }

    /// Stages and commits outstanding changes (if any), then fast-forwards
    /// the host repository's current branch to the session branch head. A
    /// diverged host branch is refused; merging is left to the operator.
    pub fn push_changes(&self, commit_message: &str) -> Result<()> {
        self.commit_working_changes(commit_message)
            .context("failed to commit changes")?;

        let repo = Repository::open(&self.repo_path)
            .with_context(|| format!("failed to open repository at {}", self.repo_path.display()))?;

        let head = repo.head().context("failed to resolve host HEAD")?;
        if !head.is_branch() {
            bail!("host repository is not on a branch; cannot propagate changes");
        }
        let head_name = head
            .name()
            .ok_or_else(|| anyhow!("host HEAD has no reference name"))?
            .to_string();
        let host_oid = head
            .target()
            .ok_or_else(|| anyhow!("host HEAD has no target commit"))?;

        let session_oid = repo
            .find_branch(&self.branch_name, BranchType::Local)
            .with_context(|| format!("failed to find branch '{}'", self.branch_name))?
            .get()
            .target()
            .ok_or_else(|| anyhow!("branch '{}' has no target commit", self.branch_name))?;

        if session_oid == host_oid {
            return Ok(());
        }
        if !repo
            .graph_descendant_of(session_oid, host_oid)
            .context("failed to compare branch histories")?
        {
            bail!(
                "branch '{}' has diverged from the host branch; merge it manually",
                self.branch_name
            );
        }

        repo.find_reference(&head_name)?
            .set_target(
                session_oid,
                &format!("claude-squad: fast-forward to {}", self.branch_name),
            )
            .context("failed to fast-forward host branch")?;
        repo.checkout_head(Some(CheckoutBuilder::new().safe()))
            .context("failed to update host working tree")?;

        log::info!(
            "fast-forwarded host branch to '{}' ({})",
            self.branch_name,
            session_oid
        );
        Ok(())
    }

    /// Commits everything outstanding in the working copy to the branch.
    /// Returns whether a commit was created.
    fn commit_working_changes(&self, message: &str) -> Result<bool> {
        let repo = Repository::open(&self.worktree_path).with_context(|| {
            format!("failed to open worktree at {}", self.worktree_path.display())
        })?;

        let mut status_opts = StatusOptions::new();
        status_opts
            .include_untracked(true)
            .recurse_untracked_dirs(true);
        let statuses = repo
            .statuses(Some(&mut status_opts))
            .context("failed to read worktree status")?;
        if statuses.is_empty() {
            return Ok(false);
        }

        let mut index = repo.index().context("failed to open worktree index")?;
        index
            .add_all(["*"].iter(), IndexAddOption::DEFAULT, None)
            .context("failed to stage changes")?;
        index.write().context("failed to write index")?;
        let tree_id = index.write_tree().context("failed to write tree")?;
        let tree = repo.find_tree(tree_id)?;

        let sig = repo
            .signature()
            .or_else(|_| Signature::now("claude-squad", "claude-squad@localhost"))
            .context("failed to build commit signature")?;
        let parent = repo
            .head()
            .and_then(|head| head.peel_to_commit())
            .context("failed to resolve worktree HEAD")?;
        repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &[&parent])
            .context("failed to commit changes")?;
        Ok(true)
    }

    /// Removes the working copy from disk and prunes its registration from
    /// the host repository. The branch is untouched.
    fn remove_worktree_files(&self) -> Result<()> {
        if self.worktree_path.exists() {
            fs::remove_dir_all(&self.worktree_path).with_context(|| {
                format!(
                    "failed to remove worktree directory {}",
                    self.worktree_path.display()
                )
            })?;
        }

        let repo = Repository::open(&self.repo_path)
            .with_context(|| format!("failed to open repository at {}", self.repo_path.display()))?;
        if let Ok(worktree) = repo.find_worktree(&self.sanitized_name) {
            if let Err(e) = worktree.prune(Some(&mut WorktreePruneOptions::new())) {
                log::warn!("failed to prune worktree from git registry: {e}");
            }
        }
        Ok(())
    }

    fn delete_branch(&self) -> Result<()> {
        let repo = Repository::open(&self.repo_path)
            .with_context(|| format!("failed to open repository at {}", self.repo_path.display()))?;
        match repo.find_branch(&self.branch_name, BranchType::Local) {
            Ok(mut branch) => branch
                .delete()
                .map_err(|e| anyhow!("failed to delete branch '{}': {e}", self.branch_name)),
            Err(e) if e.code() == git2::ErrorCode::NotFound => Ok(()),
            Err(e) => Err(anyhow!("error looking up branch '{}': {e}", self.branch_name)),
        }
    }
}

/// Removes every worktree directory bearing the claudesquad prefix under
/// `worktrees_root`. Used by `--reset`; works without persisted state.
pub fn cleanup_worktrees(worktrees_root: &Path) -> Result<()> {
    if !worktrees_root.exists() {
        return Ok(());
    }
    for entry in fs::read_dir(worktrees_root)
        .with_context(|| format!("failed to read {}", worktrees_root.display()))?
    {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with(BRANCH_PREFIX) && entry.path().is_dir() {
            fs::remove_dir_all(entry.path())
                .with_context(|| format!("failed to remove worktree {name}"))?;
            log::info!("removed orphaned worktree {name}");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;
    use tempfile::TempDir;

    fn setup_test_repo() -> (TempDir, PathBuf) {
        let temp_dir = TempDir::new().unwrap();
        let repo_path = temp_dir.path().join("repo");
        std::fs::create_dir_all(&repo_path).unwrap();

        Command::new("git")
            .args(["init"])
            .current_dir(&repo_path)
            .output()
            .unwrap();
        Command::new("git")
            .args(["config", "user.email", "test@example.com"])
            .current_dir(&repo_path)
            .output()
            .unwrap();
        Command::new("git")
            .args(["config", "user.name", "Test User"])
            .current_dir(&repo_path)
            .output()
            .unwrap();

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

        (temp_dir, repo_path)
    }

    fn make_worktree(temp_dir: &TempDir, repo_path: &Path, name: &str) -> GitWorktree {
        let root = temp_dir.path().join("worktrees");
        GitWorktree::new(repo_path, name, &root)
    }

    #[test]
    fn setup_creates_branch_and_worktree() {
        let (temp_dir, repo_path) = setup_test_repo();
        let mut worktree = make_worktree(&temp_dir, &repo_path, "claudesquad-alpha");
        worktree.setup().unwrap();

        assert!(worktree.worktree_path().join("README.md").exists());
        assert!(!worktree.base_commit_sha().is_empty());

        let repo = Repository::open(&repo_path).unwrap();
        assert!(repo.find_branch("claudesquad-alpha", BranchType::Local).is_ok());
    }

    #[test]
    fn setup_rejects_existing_branch() {
        let (temp_dir, repo_path) = setup_test_repo();
        let mut first = make_worktree(&temp_dir, &repo_path, "claudesquad-dup");
        first.setup().unwrap();

        let mut second = GitWorktree::new(
            &repo_path,
            "claudesquad-dup",
            &temp_dir.path().join("other-root"),
        );
        let err = second.setup().unwrap_err();
        assert!(err.to_string().contains("branch already exists"));
    }

    #[test]
    fn pause_commits_changes_and_removes_files() {
        let (temp_dir, repo_path) = setup_test_repo();
        let mut worktree = make_worktree(&temp_dir, &repo_path, "claudesquad-pause");
        worktree.setup().unwrap();

        std::fs::write(worktree.worktree_path().join("work.txt"), "in progress").unwrap();
        worktree.pause().unwrap();

        assert!(!worktree.worktree_path().exists());
        let repo = Repository::open(&repo_path).unwrap();
        let branch = repo
            .find_branch("claudesquad-pause", BranchType::Local)
            .unwrap();
        let tree = branch.get().peel_to_commit().unwrap().tree().unwrap();
        assert!(tree.get_path(Path::new("work.txt")).is_ok());
    }

    #[test]
    fn pause_then_resume_round_trips_changes() {
        let (temp_dir, repo_path) = setup_test_repo();
        let mut worktree = make_worktree(&temp_dir, &repo_path, "claudesquad-rt");
        worktree.setup().unwrap();

        std::fs::write(worktree.worktree_path().join("work.txt"), "keep me").unwrap();
        worktree.pause().unwrap();
        worktree.resume().unwrap();

        let content =
            std::fs::read_to_string(worktree.worktree_path().join("work.txt")).unwrap();
        assert_eq!(content, "keep me");
    }

    #[test]
    fn diff_reflects_committed_staged_and_untracked_changes() {
        let (temp_dir, repo_path) = setup_test_repo();
        let mut worktree = make_worktree(&temp_dir, &repo_path, "claudesquad-diff");
        worktree.setup().unwrap();

        // One committed change, one untracked file.
        std::fs::write(worktree.worktree_path().join("committed.txt"), "a\nb\n").unwrap();
        worktree
            .commit_working_changes("[claudesquad] test commit")
            .unwrap();
        std::fs::write(worktree.worktree_path().join("untracked.txt"), "c\n").unwrap();

        let stats = worktree.diff().unwrap();
        assert_eq!(stats.added, 3);
        assert_eq!(stats.removed, 0);
        assert!(stats.content.contains("committed.txt"));
        assert!(stats.content.contains("untracked.txt"));
    }

    #[test]
    fn push_changes_fast_forwards_host_branch() {
        let (temp_dir, repo_path) = setup_test_repo();
        let mut worktree = make_worktree(&temp_dir, &repo_path, "claudesquad-push");
        worktree.setup().unwrap();

        std::fs::write(worktree.worktree_path().join("feature.txt"), "done").unwrap();
        worktree.push_changes("[claudesquad] update").unwrap();

        assert!(repo_path.join("feature.txt").exists());

        // The host branch now points at the session branch head.
        let repo = Repository::open(&repo_path).unwrap();
        let host_oid = repo.head().unwrap().target().unwrap();
        let session_oid = repo
            .find_branch("claudesquad-push", BranchType::Local)
            .unwrap()
            .get()
            .target()
            .unwrap();
        assert_eq!(host_oid, session_oid);
    }

    #[test]
    fn push_changes_refuses_diverged_host() {
        let (temp_dir, repo_path) = setup_test_repo();
        let mut worktree = make_worktree(&temp_dir, &repo_path, "claudesquad-div");
        worktree.setup().unwrap();

        // Advance the host branch independently of the session branch.
        std::fs::write(repo_path.join("host.txt"), "host change").unwrap();
        Command::new("git")
            .args(["add", "."])
            .current_dir(&repo_path)
            .output()
            .unwrap();
        Command::new("git")
            .args(["commit", "-m", "host moves on"])
            .current_dir(&repo_path)
            .output()
            .unwrap();

        std::fs::write(worktree.worktree_path().join("session.txt"), "session").unwrap();
        let err = worktree.push_changes("[claudesquad] update").unwrap_err();
        assert!(err.to_string().contains("diverged"));
    }

    #[test]
    fn cleanup_removes_branch_and_files() {
        let (temp_dir, repo_path) = setup_test_repo();
        let mut worktree = make_worktree(&temp_dir, &repo_path, "claudesquad-gone");
        worktree.setup().unwrap();
        worktree.cleanup().unwrap();

        assert!(!worktree.worktree_path().exists());
        let repo = Repository::open(&repo_path).unwrap();
        assert!(
            repo.find_branch("claudesquad-gone", BranchType::Local)
                .is_err()
        );
    }

    #[test]
    fn cleanup_after_pause_is_idempotent_on_files() {
        let (temp_dir, repo_path) = setup_test_repo();
        let mut worktree = make_worktree(&temp_dir, &repo_path, "claudesquad-idem");
        worktree.setup().unwrap();
        worktree.pause().unwrap();

        // Files are already gone; cleanup still deletes the branch.
        worktree.cleanup().unwrap();
        let repo = Repository::open(&repo_path).unwrap();
        assert!(
            repo.find_branch("claudesquad-idem", BranchType::Local)
                .is_err()
        );
    }

    #[test]
    fn cleanup_worktrees_sweeps_only_prefixed_dirs() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("worktrees");
        std::fs::create_dir_all(root.join("claudesquad-old")).unwrap();
        std::fs::create_dir_all(root.join("unrelated")).unwrap();

        cleanup_worktrees(&root).unwrap();
        assert!(!root.join("claudesquad-old").exists());
        assert!(root.join("unrelated").exists());
    }
}
