//! User configuration and the on-disk layout of everything claude-squad
//! persists.

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

const APP_DIR: &str = "claude-squad";
const CONFIG_FILE: &str = "config.json";
const PID_FILE: &str = "daemon.pid";
const LOG_FILE: &str = "claudesquad.log";

fn default_program() -> String {
    "claude".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Program launched in new instances; overridable with `--program`.
    #[serde(default = "default_program")]
    pub default_program: String,
    /// Accept assistant confirmation prompts automatically.
    #[serde(default)]
    pub auto_yes: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_program: default_program(),
            auto_yes: false,
        }
    }
}

/// `<user-config-dir>/claude-squad`, created on demand.
pub fn config_dir() -> Result<PathBuf> {
    let dir = dirs::config_dir()
        .ok_or_else(|| anyhow!("could not determine the user config directory"))?
        .join(APP_DIR);
    fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;
    Ok(dir)
}

/// `<user-state-dir>/claude-squad` (data dir where the platform has no state
/// dir), created on demand. Holds the daemon PID file and the worktrees.
pub fn state_dir() -> Result<PathBuf> {
    let dir = dirs::state_dir()
        .or_else(dirs::data_local_dir)
        .ok_or_else(|| anyhow!("could not determine the user state directory"))?
        .join(APP_DIR);
    fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create state directory {}", dir.display()))?;
    Ok(dir)
}

pub fn config_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE))
}

pub fn worktrees_dir() -> Result<PathBuf> {
    let dir = state_dir()?.join("worktrees");
    fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create worktrees directory {}", dir.display()))?;
    Ok(dir)
}

pub fn daemon_pid_path() -> Result<PathBuf> {
    Ok(state_dir()?.join(PID_FILE))
}

pub fn log_path() -> PathBuf {
    std::env::temp_dir().join(LOG_FILE)
}

/// Loads the config, writing defaults on first run. A malformed file is
/// reported as an error rather than silently replaced.
pub fn load_config() -> Result<Config> {
    let path = config_path()?;
    if !path.exists() {
        let config = Config::default();
        save_config(&config)?;
        return Ok(config);
    }
    let raw = fs::read_to_string(&path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))
}

pub fn save_config(config: &Config) -> Result<()> {
    let path = config_path()?;
    let raw = serde_json::to_vec_pretty(config).context("failed to serialize config")?;
    fs::write(&path, raw).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_runs_claude_without_auto_yes() {
        let config = Config::default();
        assert_eq!(config.default_program, "claude");
        assert!(!config.auto_yes);
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.default_program, "claude");
        assert!(!config.auto_yes);
    }

    #[test]
    fn unknown_fields_are_tolerated() {
        let config: Config =
            serde_json::from_str(r#"{"auto_yes": true, "future_option": "x"}"#).unwrap();
        assert!(config.auto_yes);
    }

    #[test]
    fn log_path_lives_in_the_temp_dir() {
        assert!(log_path().ends_with("claudesquad.log"));
    }
}
