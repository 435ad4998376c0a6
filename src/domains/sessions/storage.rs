//! Crash-safe persistence of the instance list.
//!
//! A single JSON document under the user config directory holds the
//! persistable projection of every instance. Writes go to a temp file in the
//! same directory and are renamed into place. Unknown fields are ignored on
//! read; missing optional fields default.

use super::instance::{Instance, Status};
use crate::domains::git::{DiffStats, GitWorktree};
use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const INSTANCES_FILE: &str = "instances.json";

/// The persistable subset of an instance. No pty handle, no terminal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub title: String,
    pub path: PathBuf,
    pub branch: String,
    pub program: String,
    pub status: Status,
    pub started: bool,
    pub auto_yes: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub diff_stats: Option<DiffStats>,
    #[serde(default)]
    pub base_commit: String,
}

impl InstanceRecord {
    pub fn from_instance(instance: &Instance) -> Self {
        Self {
            title: instance.title.clone(),
            path: instance.path.clone(),
            branch: instance.sanitized_name(),
            program: instance.program.clone(),
            // A running session is persisted as Ready: liveness is
            // re-established by the ticker after reload.
            status: if instance.status == Status::Paused {
                Status::Paused
            } else {
                Status::Ready
            },
            started: instance.started,
            auto_yes: instance.auto_yes,
            created_at: instance.created_at,
            updated_at: instance.updated_at,
            prompt: instance.prompt.clone(),
            diff_stats: instance.diff_stats.clone(),
            base_commit: instance
                .worktree
                .as_ref()
                .map(|w| w.base_commit_sha().to_string())
                .unwrap_or_default(),
        }
    }

    /// Rebuilds an instance without live pty or terminal handles. Callers
    /// wanting a live view must `start(false)` (running) or `resume`
    /// (paused) the result.
    pub fn into_instance(self, worktrees_root: &Path) -> Instance {
        let worktree = if self.started {
            Some(GitWorktree::from_storage(
                self.path.clone(),
                self.branch.clone(),
                self.base_commit.clone(),
                worktrees_root,
            ))
        } else {
            None
        };
        Instance {
            title: self.title,
            path: self.path,
            program: self.program,
            status: if self.status == Status::Paused {
                Status::Paused
            } else {
                Status::Ready
            },
            started: self.started,
            auto_yes: self.auto_yes,
            created_at: self.created_at,
            updated_at: self.updated_at,
            prompt: self.prompt,
            diff_stats: self.diff_stats,
            worktree,
            tmux: None,
        }
    }
}

pub struct Storage {
    instances_path: PathBuf,
}

impl Storage {
    /// `dir` is the claude-squad config directory; it is created if missing.
    pub fn new(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create storage directory {}", dir.display()))?;
        Ok(Self {
            instances_path: dir.join(INSTANCES_FILE),
        })
    }

    pub fn load_instances(&self, worktrees_root: &Path) -> Result<Vec<Instance>> {
        Ok(self
            .load_records()?
            .into_iter()
            .map(|record| record.into_instance(worktrees_root))
            .collect())
    }

    pub fn save_instances(&self, instances: &[Instance]) -> Result<()> {
        // An instance whose title is still being entered is never persisted.
        let records: Vec<InstanceRecord> = instances
            .iter()
            .filter(|instance| !instance.title().is_empty())
            .map(InstanceRecord::from_instance)
            .collect();
        self.save_records(&records)
    }

    pub fn delete_instance(&self, title: &str) -> Result<()> {
        let mut records = self.load_records()?;
        let before = records.len();
        records.retain(|record| record.title != title);
        if records.len() == before {
            return Err(anyhow!("no stored instance titled '{title}'"));
        }
        self.save_records(&records)
    }

    pub fn delete_all_instances(&self) -> Result<()> {
        self.save_records(&[])
    }

    fn load_records(&self) -> Result<Vec<InstanceRecord>> {
        if !self.instances_path.exists() {
            return Ok(Vec::new());
        }
        let raw = fs::read_to_string(&self.instances_path).with_context(|| {
            format!("failed to read {}", self.instances_path.display())
        })?;
        serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse {}", self.instances_path.display()))
    }

    fn save_records(&self, records: &[InstanceRecord]) -> Result<()> {
        let raw = serde_json::to_vec_pretty(records).context("failed to serialize instances")?;
        let dir = self
            .instances_path
            .parent()
            .ok_or_else(|| anyhow!("instances path has no parent directory"))?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .context("failed to create temporary instances file")?;
        std::io::Write::write_all(&mut tmp, &raw)
            .context("failed to write temporary instances file")?;
        tmp.persist(&self.instances_path)
            .with_context(|| format!("failed to replace {}", self.instances_path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::sessions::instance::InstanceOptions;
    use tempfile::TempDir;

    fn storage_in(dir: &TempDir) -> Storage {
        Storage::new(&dir.path().join("claude-squad")).unwrap()
    }

    fn titled_instance(dir: &TempDir, title: &str) -> Instance {
        Instance::new(InstanceOptions {
            title,
            path: dir.path(),
            program: "claude",
        })
        .unwrap()
    }

    #[test]
    fn save_then_load_round_trips_records() {
        let dir = TempDir::new().unwrap();
        let storage = storage_in(&dir);

        let mut alpha = titled_instance(&dir, "alpha");
        alpha.started = true;
        alpha.auto_yes = true;
        alpha.prompt = Some("hello world".to_string());
        alpha.diff_stats = Some(DiffStats {
            added: 3,
            removed: 1,
            content: "+x\n".to_string(),
        });
        let beta = titled_instance(&dir, "beta");

        storage.save_instances(&[alpha, beta]).unwrap();
        let loaded = storage.load_instances(dir.path()).unwrap();

        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].title(), "alpha");
        assert!(loaded[0].started());
        assert!(loaded[0].auto_yes());
        assert_eq!(loaded[0].prompt.as_deref(), Some("hello world"));
        assert_eq!(loaded[0].diff_stats().unwrap().added, 3);
        assert_eq!(loaded[1].title(), "beta");
        // Reconstructed instances carry no live handles.
        assert!(loaded[0].tmux.is_none());
    }

    #[test]
    fn persisted_records_satisfy_title_and_branch_invariants() {
        let dir = TempDir::new().unwrap();
        let storage = storage_in(&dir);
        let instance = titled_instance(&dir, "inv check");
        storage.save_instances(&[instance]).unwrap();

        let raw = std::fs::read_to_string(dir.path().join("claude-squad/instances.json")).unwrap();
        let records: Vec<InstanceRecord> = serde_json::from_str(&raw).unwrap();
        for record in &records {
            assert!(!record.title.is_empty());
            assert!(record.title.chars().count() <= 32);
            assert!(record.branch.starts_with("claudesquad-"));
        }
    }

    #[test]
    fn untitled_instances_are_never_written() {
        let dir = TempDir::new().unwrap();
        let storage = storage_in(&dir);
        let untitled = titled_instance(&dir, "");
        let named = titled_instance(&dir, "kept");

        storage.save_instances(&[untitled, named]).unwrap();
        let loaded = storage.load_instances(dir.path()).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].title(), "kept");
    }

    #[test]
    fn paused_instances_stay_paused_after_load() {
        let dir = TempDir::new().unwrap();
        let storage = storage_in(&dir);
        let mut instance = titled_instance(&dir, "sleepy");
        instance.started = true;
        instance.status = Status::Paused;

        storage.save_instances(&[instance]).unwrap();
        let loaded = storage.load_instances(dir.path()).unwrap();
        assert_eq!(loaded[0].status(), Status::Paused);
    }

    #[test]
    fn running_instances_load_as_ready() {
        let dir = TempDir::new().unwrap();
        let storage = storage_in(&dir);
        let mut instance = titled_instance(&dir, "busy");
        instance.started = true;
        instance.status = Status::Running;

        storage.save_instances(&[instance]).unwrap();
        let loaded = storage.load_instances(dir.path()).unwrap();
        assert_eq!(loaded[0].status(), Status::Ready);
    }

    #[test]
    fn delete_instance_removes_only_the_named_record() {
        let dir = TempDir::new().unwrap();
        let storage = storage_in(&dir);
        storage
            .save_instances(&[titled_instance(&dir, "one"), titled_instance(&dir, "two")])
            .unwrap();

        storage.delete_instance("one").unwrap();
        let loaded = storage.load_instances(dir.path()).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].title(), "two");

        assert!(storage.delete_instance("one").is_err());
    }

    #[test]
    fn delete_all_leaves_an_empty_list() {
        let dir = TempDir::new().unwrap();
        let storage = storage_in(&dir);
        storage
            .save_instances(&[titled_instance(&dir, "gone")])
            .unwrap();
        storage.delete_all_instances().unwrap();
        assert!(storage.load_instances(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn unknown_fields_are_ignored_on_read() {
        let dir = TempDir::new().unwrap();
        let storage = storage_in(&dir);
        let json = format!(
            r#"[{{
                "title": "future",
                "path": "{}",
                "branch": "claudesquad-future",
                "program": "claude",
                "status": "Ready",
                "started": true,
                "auto_yes": false,
                "created_at": "2025-01-01T00:00:00Z",
                "updated_at": "2025-01-01T00:00:00Z",
                "some_field_from_a_newer_version": 42
            }}]"#,
            dir.path().display()
        );
        std::fs::write(dir.path().join("claude-squad/instances.json"), json).unwrap();

        let loaded = storage.load_instances(dir.path()).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].title(), "future");
        assert!(loaded[0].prompt.is_none());
    }

    #[test]
    fn loading_without_a_file_yields_an_empty_list() {
        let dir = TempDir::new().unwrap();
        let storage = storage_in(&dir);
        assert!(storage.load_instances(dir.path()).unwrap().is_empty());
    }
}
