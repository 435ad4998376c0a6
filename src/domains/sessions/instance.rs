//! The unit of session state: one assistant process, one tmux session, one
//! git worktree, bound by a single lifecycle.

use crate::domains::git::{DiffStats, GitWorktree};
use crate::domains::tmux::{self, TmuxSession};
use anyhow::{Result, anyhow, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Hard cap on concurrently managed instances per process.
pub const MAX_INSTANCES: usize = 10;

pub const MAX_TITLE_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    /// Output has been observed since the last tick.
    Running,
    /// No output since the last tick and no outstanding prompt.
    Ready,
    /// Transient, while an instance is being created or started.
    Loading,
    /// No tmux session and no worktree files; the branch is retained.
    Paused,
}

pub struct Instance {
    pub(crate) title: String,
    pub(crate) path: PathBuf,
    pub(crate) program: String,
    pub(crate) status: Status,
    pub(crate) started: bool,
    pub(crate) auto_yes: bool,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) updated_at: DateTime<Utc>,
    pub(crate) prompt: Option<String>,
    pub(crate) diff_stats: Option<DiffStats>,
    pub(crate) worktree: Option<GitWorktree>,
    pub(crate) tmux: Option<TmuxSession>,
}

pub struct InstanceOptions<'a> {
    pub title: &'a str,
    pub path: &'a Path,
    pub program: &'a str,
}

impl Instance {
    pub fn new(opts: InstanceOptions) -> Result<Self> {
        let path = opts
            .path
            .canonicalize()
            .map_err(|e| anyhow!("invalid repository path {}: {e}", opts.path.display()))?;

        let now = Utc::now();
        let mut instance = Self {
            title: String::new(),
            path,
            program: opts.program.to_string(),
            status: Status::Loading,
            started: false,
            auto_yes: false,
            created_at: now,
            updated_at: now,
            prompt: None,
            diff_stats: None,
            worktree: None,
            tmux: None,
        };
        if !opts.title.is_empty() {
            instance.set_title(opts.title)?;
        }
        Ok(instance)
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub(crate) fn set_status(&mut self, status: Status) {
        if self.status != status {
            self.status = status;
            self.updated_at = Utc::now();
        }
    }

    pub fn started(&self) -> bool {
        self.started
    }

    pub fn paused(&self) -> bool {
        self.status == Status::Paused
    }

    pub fn auto_yes(&self) -> bool {
        self.auto_yes
    }

    pub fn set_auto_yes(&mut self, auto_yes: bool) {
        self.auto_yes = auto_yes;
    }

    /// The tmux/branch/worktree identifier derived from the title.
    pub fn sanitized_name(&self) -> String {
        tmux::sanitized_session_name(&self.title)
    }

    /// Validates and sets the display title. The title also names the tmux
    /// session, branch and worktree directory, so it is frozen once the
    /// instance has started.
    pub fn set_title(&mut self, title: &str) -> Result<()> {
        if self.started {
            bail!("cannot change the title of a started instance");
        }
        if title.chars().count() > MAX_TITLE_LEN {
            bail!("title cannot be longer than {MAX_TITLE_LEN} characters");
        }
        if title.chars().any(|c| c.is_control()) {
            bail!("title contains non-printable characters");
        }
        self.title = title.to_string();
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Starts the instance. On first start this creates the branch and
    /// worktree and launches the tmux session; otherwise it reattaches to
    /// the still-running session (relaunching the program if the session
    /// died while unmanaged).
    pub fn start(&mut self, first_time: bool, worktrees_root: &Path) -> Result<()> {
        if self.title.is_empty() {
            bail!("title cannot be empty");
        }
        self.status = Status::Loading;

        if first_time {
            let sanitized = self.sanitized_name();
            let mut worktree = GitWorktree::new(&self.path, &sanitized, worktrees_root);
            worktree.setup()?;

            let mut tmux = TmuxSession::new(&self.title);
            if let Err(e) = tmux.start(&self.program, worktree.worktree_path()) {
                // Roll the worktree back so nothing half-created lingers.
                let err = match worktree.cleanup() {
                    Ok(()) => e,
                    Err(cleanup) => anyhow!("{e} (cleanup error: {cleanup})"),
                };
                return Err(err);
            }
            self.worktree = Some(worktree);
            self.tmux = Some(tmux);
        } else {
            let worktree = self
                .worktree
                .as_ref()
                .ok_or_else(|| anyhow!("instance '{}' has no worktree to reattach", self.title))?;
            let mut tmux = TmuxSession::new(&self.title);
            if tmux::session_exists(tmux.sanitized_name()) {
                tmux.restore()?;
            } else {
                // The session died while the manager was closed; the worktree
                // is still intact, so relaunch the program in place.
                tmux.start(&self.program, worktree.worktree_path())?;
            }
            self.tmux = Some(tmux);
        }

        self.started = true;
        self.set_status(Status::Ready);
        Ok(())
    }

    /// Reopens a capture pty against the still-running tmux session without
    /// creating anything: no session, no process, no worktree. Fails when
    /// the session is gone. This is the only way the daemon acquires a live
    /// view; unlike `start(false)` it never relaunches the program.
    pub fn reattach(&mut self) -> Result<()> {
        if !self.started || self.paused() {
            bail!("instance '{}' is not running", self.title);
        }
        let mut tmux = TmuxSession::new(&self.title);
        if !tmux::session_exists(tmux.sanitized_name()) {
            bail!("tmux session no longer exists: {}", tmux.sanitized_name());
        }
        tmux.restore()?;
        self.tmux = Some(tmux);
        Ok(())
    }

    /// Commits worktree changes to the branch, closes the tmux session and
    /// removes the worktree files. If the commit fails nothing is touched;
    /// a failing session close still leaves the instance Paused, and the
    /// follow-up Pause/Kill is idempotent.
    pub fn pause(&mut self) -> Result<()> {
        if !self.started {
            bail!("instance '{}' is not started", self.title);
        }
        if self.paused() {
            bail!("instance '{}' is already paused", self.title);
        }

        let worktree = self
            .worktree
            .as_mut()
            .ok_or_else(|| anyhow!("instance '{}' has no worktree", self.title))?;
        worktree.pause()?;

        let mut result = Ok(());
        if let Some(mut tmux) = self.tmux.take() {
            if let Err(e) = tmux.close() {
                result = Err(anyhow!("failed to close tmux session: {e}"));
            }
        }
        self.set_status(Status::Paused);
        result
    }

    /// Recreates the worktree from the retained branch and relaunches the
    /// program in a fresh tmux session.
    pub fn resume(&mut self) -> Result<()> {
        if !self.paused() {
            bail!("instance '{}' is not paused", self.title);
        }
        let worktree = self
            .worktree
            .as_mut()
            .ok_or_else(|| anyhow!("instance '{}' has no worktree", self.title))?;
        worktree.resume()?;

        let mut tmux = TmuxSession::new(&self.title);
        if let Err(e) = tmux.start(&self.program, worktree.worktree_path()) {
            // Drop the fresh worktree files again so the instance stays
            // cleanly paused.
            if let Err(cleanup) = worktree.pause() {
                return Err(anyhow!("{e} (cleanup error: {cleanup})"));
            }
            return Err(e);
        }
        self.tmux = Some(tmux);
        self.set_status(Status::Ready);
        Ok(())
    }

    /// Closes the tmux session, removes the worktree and deletes the branch.
    /// Errors are collected so a partial failure still tears down the rest.
    pub fn kill(&mut self) -> Result<()> {
        let mut errs: Vec<String> = Vec::new();

        if let Some(mut tmux) = self.tmux.take() {
            if let Err(e) = tmux.close() {
                errs.push(format!("failed to close tmux session: {e}"));
            }
        }
        if let Some(mut worktree) = self.worktree.take() {
            if let Err(e) = worktree.cleanup() {
                errs.push(format!("failed to clean up worktree: {e}"));
            }
        }

        match errs.len() {
            0 => Ok(()),
            1 => Err(anyhow!("{}", errs[0])),
            _ => Err(anyhow!("{}", errs.join("; "))),
        }
    }

    /// Current pane content; empty while paused.
    pub fn preview(&self) -> Result<String> {
        if self.paused() {
            return Ok(String::new());
        }
        match &self.tmux {
            Some(tmux) => tmux.capture_content(),
            None => Ok(String::new()),
        }
    }

    /// Forwards to the tmux content monitor; a paused or unstarted instance
    /// never reports updates.
    pub fn has_updated(&mut self) -> (bool, bool) {
        if !self.started || self.paused() {
            return (false, false);
        }
        match &mut self.tmux {
            Some(tmux) => tmux.has_updated(),
            None => (false, false),
        }
    }

    /// Types `text` into the session followed by Enter.
    pub fn send_prompt(&mut self, text: &str) -> Result<()> {
        let tmux = self
            .tmux
            .as_mut()
            .ok_or_else(|| anyhow!("instance '{}' has no tmux session", self.title))?;
        tmux.send_keys(text.as_bytes())?;
        tmux.tap_enter()
    }

    /// Accepts whatever confirmation dialog the assistant is showing.
    pub fn tap_enter(&mut self) -> Result<()> {
        let tmux = self
            .tmux
            .as_mut()
            .ok_or_else(|| anyhow!("instance '{}' has no tmux session", self.title))?;
        tmux.tap_enter()
    }

    pub fn diff_stats(&self) -> Option<&DiffStats> {
        self.diff_stats.as_ref()
    }

    /// Refreshes the cached diff against the base commit. Called from the
    /// metadata ticker; failures are the caller's to log.
    pub fn update_diff_stats(&mut self) -> Result<()> {
        let Some(worktree) = &self.worktree else {
            return Ok(());
        };
        if self.paused() {
            return Ok(());
        }
        self.diff_stats = Some(worktree.diff()?);
        Ok(())
    }

    pub fn git_worktree(&self) -> Result<&GitWorktree> {
        self.worktree
            .as_ref()
            .ok_or_else(|| anyhow!("instance '{}' has no worktree", self.title))
    }

    /// Sizes the detached pty so previews render at the consumer's
    /// dimensions.
    pub fn set_preview_size(&self, cols: u16, rows: u16) -> Result<()> {
        match &self.tmux {
            Some(tmux) => tmux.set_detached_size(cols, rows),
            None => Ok(()),
        }
    }
}
