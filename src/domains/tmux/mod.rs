//! Detached tmux sessions hosting a single assistant program.
//!
//! Each session is keyed by a sanitized name derived from the instance title.
//! The session itself is always detached; we keep a pty running a `tmux
//! attach-session` client against it so the pane can be captured, resized and
//! written to without ever giving tmux the controlling terminal. `attach`
//! hands the real terminal over to that client until the user detaches with
//! Ctrl-Q.

use anyhow::{Context, Result, anyhow, bail};
use portable_pty::{Child, CommandBuilder, MasterPty, PtySize, native_pty_system};
use sha2::{Digest, Sha256};
use std::io::{Read, Write};
use std::path::Path;
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex, mpsc};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Every tmux session managed by claude-squad carries this prefix so orphaned
/// sessions can be identified without consulting persisted state.
pub const SESSION_PREFIX: &str = "claudesquad-";

/// Substring tmux pane content is scanned for to detect a pending assistant
/// confirmation dialog ("Do you want to make this edit?", "Do you want to
/// proceed?", ...).
const CONFIRMATION_MARKER: &str = "Do you want";

const CLAUDE_TRUST_PROMPT: &str = "Do you trust the files in this folder?";
const AIDER_STARTUP_PROMPT: &str = "Open documentation url for more info";

/// How long to wait for tmux to report a freshly created session.
const SESSION_CREATE_TIMEOUT: Duration = Duration::from_secs(2);
const SESSION_CREATE_POLL: Duration = Duration::from_millis(10);

/// Bytes arriving on stdin within this window after attach are assumed to be
/// terminal-emitted control sequences (device attribute replies and the like)
/// and are swallowed so they don't end up inside the assistant's input.
const ATTACH_DISCARD_WINDOW: Duration = Duration::from_millis(50);

/// Ctrl-Q. The single byte that detaches an attached session.
const DETACH_BYTE: u8 = 0x11;

/// Maps an instance title to the tmux session name: whitespace is stripped
/// and the claudesquad prefix applied. The same function names branches and
/// worktree directories so all three stay in sync.
pub fn sanitized_session_name(name: &str) -> String {
    let stripped: String = name.chars().filter(|c| !c.is_whitespace()).collect();
    format!("{SESSION_PREFIX}{stripped}")
}

/// The pty running a `tmux attach-session` client against the detached
/// session. Recreated on every attach/detach cycle.
struct AttachPty {
    master: Arc<Mutex<Box<dyn MasterPty + Send>>>,
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
    child: Box<dyn Child + Send + Sync>,
}

/// Transient state held only between `attach` and `detach`.
struct AttachedState {
    stop: Arc<AtomicBool>,
    reader_task: JoinHandle<()>,
    winch_task: JoinHandle<()>,
}

pub struct TmuxSession {
    name: String,
    sanitized_name: String,
    pty: Option<AttachPty>,
    prev_content_hash: Option<[u8; 32]>,
    attached: Option<AttachedState>,
}

impl TmuxSession {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            sanitized_name: sanitized_session_name(name),
            pty: None,
            prev_content_hash: None,
            attached: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sanitized_name(&self) -> &str {
        &self.sanitized_name
    }

    /// Creates the detached session running `program` in `work_dir`, waits
    /// for tmux to report it, then opens the capture pty via `restore`. For
    /// known assistant programs the first-run trust prompt is answered
    /// automatically.
    pub fn start(&mut self, program: &str, work_dir: &Path) -> Result<()> {
        if session_exists(&self.sanitized_name) {
            bail!("tmux session already exists: {}", self.sanitized_name);
        }

        let work_dir = work_dir.to_string_lossy().into_owned();
        let session_name = self.sanitized_name.clone();
        let spawned = spawn_tmux_in_pty(&[
            "new-session",
            "-d",
            "-s",
            &session_name,
            "-c",
            &work_dir,
            program,
        ]);
        let launch = match spawned {
            Ok(launch) => launch,
            Err(e) => {
                return Err(
                    self.cleanup_failed_start(anyhow!("error starting tmux session: {e}"))
                );
            }
        };

        let deadline = Instant::now() + SESSION_CREATE_TIMEOUT;
        while !session_exists(&self.sanitized_name) {
            if Instant::now() >= deadline {
                return Err(self
                    .cleanup_failed_start(anyhow!(
                        "timed out waiting for tmux session: {}",
                        self.sanitized_name
                    )));
            }
            std::thread::sleep(SESSION_CREATE_POLL);
        }
        drop(launch);

        if let Err(e) = self.restore() {
            return Err(self.cleanup_failed_start(anyhow!("error restoring tmux session: {e}")));
        }

        self.first_run_prompt_sweep(program);
        Ok(())
    }

    /// Best-effort teardown of a half-created session, appending any cleanup
    /// failure to the original error.
    fn cleanup_failed_start(&mut self, err: anyhow::Error) -> anyhow::Error {
        if session_exists(&self.sanitized_name) {
            if let Err(cleanup) = self.close() {
                return anyhow!("{err} (cleanup error: {cleanup})");
            }
        }
        err
    }

    /// Some assistants open a confirmation screen on first launch in a new
    /// directory. The search strings, keystrokes and iteration counts are
    /// part of the compatibility surface with those programs.
    fn first_run_prompt_sweep(&mut self, program: &str) {
        type TapFn = fn(&mut TmuxSession) -> Result<()>;
        let (needle, iterations, tap): (&str, usize, TapFn) = if program == "claude" {
            (CLAUDE_TRUST_PROMPT, 5, TmuxSession::tap_enter)
        } else if program.contains("aider") {
            // Aider takes longer to start.
            (AIDER_STARTUP_PROMPT, 10, TmuxSession::tap_d_and_enter)
        } else {
            return;
        };

        for _ in 0..iterations {
            std::thread::sleep(Duration::from_millis(200));
            let content = match self.capture_content() {
                Ok(content) => content,
                Err(e) => {
                    log::error!("could not check first-run prompt screen: {e}");
                    continue;
                }
            };
            if content.contains(needle) {
                if let Err(e) = tap(self) {
                    log::error!("could not answer first-run prompt: {e}");
                }
                break;
            }
        }
    }

    /// Opens a fresh pty running a `tmux attach-session` client against the
    /// existing session. Called after `start` and after every detach.
    pub fn restore(&mut self) -> Result<()> {
        let pty = spawn_tmux_in_pty(&["attach-session", "-t", &self.sanitized_name])
            .map_err(|e| anyhow!("error opening attach pty: {e}"))?;
        self.pty = Some(pty);
        self.prev_content_hash = None;
        Ok(())
    }

    /// Hands the controlling terminal over to the session. Puts the terminal
    /// into raw mode and spawns the copy loops; the returned receiver fires
    /// once when the user requests detach (Ctrl-Q) or the pty reaches EOF.
    /// The caller must then call `detach` to complete the teardown.
    pub fn attach(&mut self) -> Result<Receiver<()>> {
        if self.attached.is_some() {
            bail!("already attached to session: {}", self.sanitized_name);
        }
        let pty = self
            .pty
            .as_ref()
            .ok_or_else(|| anyhow!("session has no pty: {}", self.sanitized_name))?;

        crossterm::terminal::enable_raw_mode().context("error making terminal raw")?;

        let (detach_tx, detach_rx) = mpsc::sync_channel::<()>(1);
        let stop = Arc::new(AtomicBool::new(false));

        // Copies session output to the real terminal. Terminates on pty EOF,
        // which `detach` forces by killing the attach client.
        let mut reader = pty
            .master
            .lock()
            .expect("pty master lock poisoned")
            .try_clone_reader()
            .map_err(|e| anyhow!("error cloning pty reader: {e}"))?;
        let reader_tx = detach_tx.clone();
        let reader_task = std::thread::spawn(move || {
            let mut stdout = std::io::stdout();
            let mut buf = [0u8; 4096];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if stdout.write_all(&buf[..n]).and_then(|_| stdout.flush()).is_err() {
                            break;
                        }
                    }
                }
            }
            let _ = reader_tx.try_send(());
        });

        // Forwards keystrokes into the session. Exits on Ctrl-Q after
        // signalling the caller, so it never outlives the attachment.
        let writer = Arc::clone(&pty.writer);
        let attached_at = Instant::now();
        std::thread::spawn(move || {
            let mut stdin = std::io::stdin();
            let mut buf = [0u8; 32];
            loop {
                let n = match stdin.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                if attached_at.elapsed() < ATTACH_DISCARD_WINDOW {
                    log::info!("discarded stdin bytes after attach: {:?}", &buf[..n]);
                    continue;
                }
                if n == 1 && buf[0] == DETACH_BYTE {
                    break;
                }
                let mut writer = writer.lock().expect("pty writer lock poisoned");
                if writer.write_all(&buf[..n]).and_then(|_| writer.flush()).is_err() {
                    break;
                }
            }
            let _ = detach_tx.try_send(());
        });

        // Keeps the pty dimensions in sync with the host terminal.
        let master = Arc::clone(&pty.master);
        let winch_stop = Arc::clone(&stop);
        let winch_task = std::thread::spawn(move || {
            let mut last = crossterm::terminal::size().ok();
            while !winch_stop.load(Ordering::Relaxed) {
                std::thread::sleep(Duration::from_millis(250));
                let Ok((cols, rows)) = crossterm::terminal::size() else {
                    continue;
                };
                if last != Some((cols, rows)) {
                    last = Some((cols, rows));
                    let master = master.lock().expect("pty master lock poisoned");
                    if let Err(e) = master.resize(PtySize {
                        rows,
                        cols,
                        pixel_width: 0,
                        pixel_height: 0,
                    }) {
                        log::warn!("error resizing attached pty: {e}");
                    }
                }
            }
        });

        self.attached = Some(AttachedState {
            stop,
            reader_task,
            winch_task,
        });
        Ok(detach_rx)
    }

    /// Completes a detach: closes the attach pty (terminating the copy loop
    /// on EOF), opens a fresh pty for future captures, restores the terminal
    /// mode and reaps the attach-time tasks.
    pub fn detach(&mut self) -> Result<()> {
        let state = self
            .attached
            .take()
            .ok_or_else(|| anyhow!("not attached to session: {}", self.sanitized_name))?;

        let mut result = Ok(());
        if let Some(pty) = self.pty.take() {
            if let Err(e) = close_attach_pty(pty) {
                result = merge_error(result, anyhow!("error closing attach pty: {e}"));
            }
        }
        if let Err(e) = self.restore() {
            result = merge_error(result, e);
        }
        if let Err(e) = crossterm::terminal::disable_raw_mode() {
            result = merge_error(result, anyhow!("error restoring terminal state: {e}"));
        }

        state.stop.store(true, Ordering::Relaxed);
        let _ = state.reader_task.join();
        let _ = state.winch_task.join();
        result
    }

    /// Terminates the tmux session and releases the pty. Errors from the
    /// individual steps are collected and merged.
    pub fn close(&mut self) -> Result<()> {
        let mut errs: Vec<String> = Vec::new();

        if let Some(pty) = self.pty.take() {
            if let Err(e) = close_attach_pty(pty) {
                errs.push(format!("error closing pty: {e}"));
            }
        }

        let output = Command::new("tmux")
            .args(["kill-session", "-t", &self.sanitized_name])
            .output()
            .context("error running tmux kill-session")?;
        if !output.status.success() {
            errs.push(format!(
                "error killing tmux session: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }

        match errs.len() {
            0 => Ok(()),
            1 => Err(anyhow!("{}", errs[0])),
            _ => {
                let mut msg = String::from("multiple errors occurred during cleanup:");
                for err in &errs {
                    msg.push_str("\n  - ");
                    msg.push_str(err);
                }
                Err(anyhow!("{msg}"))
            }
        }
    }

    /// Writes raw bytes to the session's pty.
    pub fn send_keys(&mut self, keys: &[u8]) -> Result<()> {
        let pty = self
            .pty
            .as_ref()
            .ok_or_else(|| anyhow!("session has no pty: {}", self.sanitized_name))?;
        let mut writer = pty.writer.lock().expect("pty writer lock poisoned");
        writer
            .write_all(keys)
            .and_then(|_| writer.flush())
            .context("error sending keystrokes to pty")?;
        Ok(())
    }

    /// Sends an Enter keystroke, accepting whatever dialog is on screen.
    pub fn tap_enter(&mut self) -> Result<()> {
        self.send_keys(&[0x0D])
    }

    /// Sends 'D' followed by Enter; aider's startup screen wants both.
    pub fn tap_d_and_enter(&mut self) -> Result<()> {
        self.send_keys(&[0x44, 0x0D])
    }

    /// Captures the visible pane content, preserving escape sequences and
    /// joining wrapped lines.
    pub fn capture_content(&self) -> Result<String> {
        self.run_capture(&["capture-pane", "-p", "-e", "-J", "-t", &self.sanitized_name])
    }

    /// Like `capture_content` but bounded by history line numbers; `-` means
    /// the start/end of history.
    pub fn capture_content_with_range(&self, start: &str, end: &str) -> Result<String> {
        self.run_capture(&[
            "capture-pane",
            "-p",
            "-e",
            "-J",
            "-S",
            start,
            "-E",
            end,
            "-t",
            &self.sanitized_name,
        ])
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("tmux")
            .args(args)
            .output()
            .context("error running tmux capture-pane")?;
        if !output.status.success() {
            bail!(
                "error capturing pane content: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Reports whether the pane content changed since the last call and,
    /// independently, whether it currently shows a confirmation prompt.
    pub fn has_updated(&mut self) -> (bool, bool) {
        let content = match self.capture_content() {
            Ok(content) => content,
            Err(e) => {
                log::error!("error capturing pane content for {}: {e}", self.sanitized_name);
                return (false, false);
            }
        };
        let has_prompt = content.contains(CONFIRMATION_MARKER);
        (self.note_content(&content), has_prompt)
    }

    /// Hashes `content` and compares against the previous capture, updating
    /// the stored hash. The first capture after (re)opening the pty always
    /// counts as updated.
    fn note_content(&mut self, content: &str) -> bool {
        let hash: [u8; 32] = Sha256::digest(content.as_bytes()).into();
        if self.prev_content_hash != Some(hash) {
            self.prev_content_hash = Some(hash);
            true
        } else {
            false
        }
    }

    /// Resizes the pty while detached so captures render at the consumer's
    /// dimensions.
    pub fn set_detached_size(&self, cols: u16, rows: u16) -> Result<()> {
        let pty = self
            .pty
            .as_ref()
            .ok_or_else(|| anyhow!("session has no pty: {}", self.sanitized_name))?;
        let master = pty.master.lock().expect("pty master lock poisoned");
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| anyhow!("error resizing detached pty: {e}"))
    }
}

fn spawn_tmux_in_pty(args: &[&str]) -> Result<AttachPty> {
    let pty_system = native_pty_system();
    let pair = pty_system
        .openpty(PtySize {
            rows: 24,
            cols: 80,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|e| anyhow!("error opening pty: {e}"))?;

    let mut cmd = CommandBuilder::new("tmux");
    cmd.args(args);
    let child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| anyhow!("error spawning tmux: {e}"))?;
    drop(pair.slave);

    let writer = pair
        .master
        .take_writer()
        .map_err(|e| anyhow!("error taking pty writer: {e}"))?;

    Ok(AttachPty {
        master: Arc::new(Mutex::new(pair.master)),
        writer: Arc::new(Mutex::new(writer)),
        child,
    })
}

fn close_attach_pty(mut pty: AttachPty) -> Result<()> {
    // Killing the attach client detaches it server-side; the session itself
    // keeps running. The master drops with `pty`, producing EOF for readers.
    if let Err(e) = pty.child.kill() {
        if pty.child.try_wait().ok().flatten().is_none() {
            return Err(anyhow!("error killing attach client: {e}"));
        }
    }
    let _ = pty.child.wait();
    Ok(())
}

fn merge_error(result: Result<()>, err: anyhow::Error) -> Result<()> {
    match result {
        Ok(()) => Err(err),
        Err(prev) => Err(anyhow!("{prev} (additional error: {err})")),
    }
}

/// Checks whether a tmux session exists. `-t=` forces an exact match; plain
/// `-t` would prefix-match.
pub fn session_exists(name: &str) -> bool {
    Command::new("tmux")
        .args(["has-session", &format!("-t={name}")])
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

/// Kills every tmux session bearing the claudesquad prefix. Used by
/// `--reset`; a missing tmux server counts as success.
pub fn cleanup_sessions() -> Result<()> {
    let output = Command::new("tmux")
        .args(["ls", "-F", "#{session_name}"])
        .output()
        .context("error running tmux ls")?;

    if !output.status.success() {
        // Exit code 1 means no server / no sessions.
        if output.status.code() == Some(1) {
            return Ok(());
        }
        bail!(
            "failed to list tmux sessions: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    for name in stdout.lines().filter(|l| l.starts_with(SESSION_PREFIX)) {
        let status = Command::new("tmux")
            .args(["kill-session", "-t", name])
            .status()
            .context("error running tmux kill-session")?;
        if !status.success() {
            bail!("failed to kill tmux session {name}");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitized_name_strips_whitespace_and_prefixes() {
        assert_eq!(sanitized_session_name("alpha"), "claudesquad-alpha");
        assert_eq!(sanitized_session_name("my session"), "claudesquad-mysession");
        assert_eq!(
            sanitized_session_name("  tabs\tand newlines\n"),
            "claudesquad-tabsandnewlines"
        );
    }

    #[test]
    fn note_content_is_monotone_under_change() {
        let mut session = TmuxSession::new("hash-test");
        assert!(session.note_content("first screen"));
        assert!(!session.note_content("first screen"));
        assert!(session.note_content("second screen"));
        assert!(!session.note_content("second screen"));
    }

    #[test]
    fn restore_would_reset_update_tracking() {
        let mut session = TmuxSession::new("reset-test");
        assert!(session.note_content("screen"));
        session.prev_content_hash = None;
        assert!(session.note_content("screen"));
    }

    #[test]
    fn confirmation_marker_matches_assistant_prompts() {
        assert!("Do you want to make this edit?".contains(CONFIRMATION_MARKER));
        assert!("╭─ Do you want to proceed? ─╮".contains(CONFIRMATION_MARKER));
        assert!(!"All done. Anything else?".contains(CONFIRMATION_MARKER));
    }

    #[test]
    fn merge_error_keeps_both_causes() {
        let merged = merge_error(Err(anyhow!("first")), anyhow!("second"));
        let msg = merged.unwrap_err().to_string();
        assert!(msg.contains("first"));
        assert!(msg.contains("second"));
    }
}
