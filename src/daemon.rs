//! Headless auto-accept daemon.
//!
//! When the TUI exits with auto-yes enabled, a detached copy of the binary
//! keeps running the metadata loop over the persisted instances so assistant
//! confirmation prompts are still accepted. The daemon is a read-only
//! consumer of instances.json; only the TUI writes it. A PID file enforces a
//! single daemon per user, and the TUI stops any running daemon before
//! touching instance state so two auto-accepters never race.

use crate::config;
use crate::domains::sessions::{METADATA_TICK, Storage, tick_instances};
use anyhow::{Context, Result, anyhow, bail};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use std::fs;
use std::path::Path;
use std::process::{Command, Stdio};

/// Runs the metadata loop until SIGTERM/SIGINT. Invoked via the hidden
/// `--daemon` flag; not meant for direct use.
pub fn run_daemon() -> Result<()> {
    let pid_path = config::daemon_pid_path()?;
    acquire_pid_file(&pid_path)?;
    log::info!("daemon started (pid {})", std::process::id());

    let result = run_loop();

    if let Err(e) = fs::remove_file(&pid_path) {
        log::warn!("failed to remove daemon pid file: {e}");
    }
    log::info!("daemon stopped");
    result
}

fn run_loop() -> Result<()> {
    let storage = Storage::new(&config::config_dir()?)?;
    let worktrees_root = config::worktrees_dir()?;
    let mut instances: Vec<_> = storage
        .load_instances(&worktrees_root)?
        .into_iter()
        .filter(|instance| instance.started() && !instance.paused() && instance.auto_yes())
        .collect();

    // Reattach a capture pty to each still-running session. `reattach` only
    // ever restores an existing session, so instances whose session is gone
    // fail here and are dropped; the TUI reconciles them on next start.
    instances.retain_mut(|instance| match instance.reattach() {
        Ok(()) => true,
        Err(e) => {
            log::warn!("daemon could not reattach '{}': {e}", instance.title());
            false
        }
    });
    log::info!("daemon watching {} instance(s)", instances.len());

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build daemon runtime")?;
    runtime.block_on(async {
        let mut interval = tokio::time::interval(METADATA_TICK);
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .context("failed to install SIGTERM handler")?;
        loop {
            tokio::select! {
                _ = interval.tick() => tick_instances(&mut instances),
                _ = sigterm.recv() => break,
                _ = tokio::signal::ctrl_c() => break,
            }
        }
        Ok::<(), anyhow::Error>(())
    })
}

/// Relaunches the current binary with `--daemon`, detached from the
/// terminal. Called after the final instances.json flush: the daemon reads
/// it only at its own start.
pub fn launch_daemon() -> Result<()> {
    let exe = std::env::current_exe().context("failed to resolve current executable")?;
    let child = Command::new(exe)
        .arg("--daemon")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .context("failed to spawn daemon")?;
    log::info!("launched daemon (pid {})", child.id());
    Ok(())
}

/// Reads the PID file and signals the daemon to stop. A stale PID file is
/// cleaned up silently.
pub fn stop_daemon() -> Result<()> {
    stop_daemon_at(&config::daemon_pid_path()?)
}

fn stop_daemon_at(pid_path: &Path) -> Result<()> {
    let pid = match read_pid_file(pid_path)? {
        Some(pid) => pid,
        None => return Ok(()),
    };
    match kill(Pid::from_raw(pid), Signal::SIGTERM) {
        Ok(()) => log::info!("stopped daemon (pid {pid})"),
        Err(nix::errno::Errno::ESRCH) => log::info!("removing stale daemon pid file (pid {pid})"),
        Err(e) => return Err(anyhow!("failed to signal daemon (pid {pid}): {e}")),
    }
    fs::remove_file(pid_path)
        .with_context(|| format!("failed to remove {}", pid_path.display()))?;
    Ok(())
}

fn acquire_pid_file(pid_path: &Path) -> Result<()> {
    if let Some(pid) = read_pid_file(pid_path)? {
        if kill(Pid::from_raw(pid), None).is_ok() {
            bail!("daemon already running (pid {pid})");
        }
        log::info!("replacing stale daemon pid file (pid {pid})");
    }
    fs::write(pid_path, std::process::id().to_string())
        .with_context(|| format!("failed to write {}", pid_path.display()))?;
    Ok(())
}

fn read_pid_file(pid_path: &Path) -> Result<Option<i32>> {
    if !pid_path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(pid_path)
        .with_context(|| format!("failed to read {}", pid_path.display()))?;
    match raw.trim().parse::<i32>() {
        Ok(pid) => Ok(Some(pid)),
        Err(_) => {
            // Unparseable contents count as stale.
            log::warn!("discarding malformed daemon pid file: {raw:?}");
            fs::remove_file(pid_path)
                .with_context(|| format!("failed to remove {}", pid_path.display()))?;
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_pid_file_reads_as_none() {
        let dir = TempDir::new().unwrap();
        assert_eq!(read_pid_file(&dir.path().join("daemon.pid")).unwrap(), None);
    }

    #[test]
    fn malformed_pid_file_is_discarded() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("daemon.pid");
        fs::write(&path, "not a pid").unwrap();
        assert_eq!(read_pid_file(&path).unwrap(), None);
        assert!(!path.exists());
    }

    #[test]
    fn stop_without_pid_file_is_a_no_op() {
        let dir = TempDir::new().unwrap();
        stop_daemon_at(&dir.path().join("daemon.pid")).unwrap();
    }

    #[test]
    fn stop_cleans_stale_pid_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("daemon.pid");
        // A PID from the far end of the range is almost certainly dead.
        fs::write(&path, "99999999").unwrap();
        stop_daemon_at(&path).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn acquire_rejects_a_live_daemon() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("daemon.pid");
        // Our own PID is definitely alive.
        fs::write(&path, std::process::id().to_string()).unwrap();
        let err = acquire_pid_file(&path).unwrap_err();
        assert!(err.to_string().contains("already running"));
    }

    #[test]
    fn acquire_replaces_a_stale_pid_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("daemon.pid");
        fs::write(&path, "99999999").unwrap();
        acquire_pid_file(&path).unwrap();
        let stored: u32 = fs::read_to_string(&path).unwrap().trim().parse().unwrap();
        assert_eq!(stored, std::process::id());
    }
}
