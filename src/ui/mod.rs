//! The interactive TUI: a list of instances, a tabbed preview/diff pane, a
//! menu bar and an ephemeral error line.
//!
//! The loop is strictly single-threaded: every state mutation happens here,
//! in response to a key event or an expired timer. Background work (the
//! metadata tick, the preview tick, the error/keydown timers) is driven by
//! deadlines checked between polls, so no instance ever sees two concurrent
//! mutators. `attach` blocks the loop by design: while the operator is
//! inside tmux, the multiplexer owns the terminal.

mod view;

use crate::config;
use crate::daemon;
use crate::domains::sessions::{
    Instance, InstanceOptions, MAX_INSTANCES, METADATA_TICK, PREVIEW_TICK, Storage,
    tick_instances,
};
use anyhow::{Context, Result, anyhow};
use chrono::Local;
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::execute;
use crossterm::terminal::{
    EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode,
};
use ratatui::Terminal;
use ratatui::backend::CrosstermBackend;
use std::io::Stdout;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

const ERROR_BANNER_TTL: Duration = Duration::from_secs(3);
const KEYDOWN_TTL: Duration = Duration::from_millis(500);
const POLL_TIMEOUT: Duration = Duration::from_millis(50);

type Tui = Terminal<CrosstermBackend<Stdout>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UiState {
    Default,
    /// The newest instance's title is being entered inline in the list.
    New,
    /// The prompt overlay is open for the selected instance.
    Prompt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Tab {
    Preview,
    Diff,
}

pub(crate) struct App {
    program: String,
    auto_yes: bool,
    storage: Storage,
    worktrees_root: PathBuf,

    pub(crate) instances: Vec<Instance>,
    pub(crate) selected: usize,
    pub(crate) state: UiState,
    pub(crate) tab: Tab,
    pub(crate) input: String,
    pub(crate) diff_scroll: u16,
    pub(crate) preview_text: String,
    pub(crate) error: Option<(String, Instant)>,
    pub(crate) keydown: Option<(&'static str, Instant)>,

    prompt_after_name: bool,
    last_metadata_tick: Instant,
    last_preview_tick: Instant,
    last_preview_dims: Option<(u16, u16, usize)>,
    quit: bool,
}

/// Runs the TUI until the operator quits. The daemon has already been
/// stopped by the caller; the caller relaunches it afterwards if needed.
pub fn run(program: String, auto_yes: bool) -> Result<()> {
    let mut app = App::new(program, auto_yes)?;

    enable_raw_mode().context("failed to enable raw mode")?;
    let mut stdout = std::io::stdout();
    execute!(stdout, EnterAlternateScreen).context("failed to enter alternate screen")?;
    let mut terminal = Terminal::new(CrosstermBackend::new(stdout))
        .context("failed to initialize terminal")?;

    let result = app.event_loop(&mut terminal);

    let _ = disable_raw_mode();
    let _ = execute!(terminal.backend_mut(), LeaveAlternateScreen);
    let _ = terminal.show_cursor();
    result
}

impl App {
    fn new(program: String, auto_yes: bool) -> Result<Self> {
        let storage = Storage::new(&config::config_dir()?)?;
        let worktrees_root = config::worktrees_dir()?;
        let mut instances = storage.load_instances(&worktrees_root)?;

        for instance in &mut instances {
            if auto_yes {
                instance.set_auto_yes(true);
            }
            if instance.started() && !instance.paused() {
                if let Err(e) = instance.start(false, &worktrees_root) {
                    log::warn!("could not reattach '{}': {e}", instance.title());
                }
            }
        }

        let now = Instant::now();
        Ok(Self {
            program,
            auto_yes,
            storage,
            worktrees_root,
            instances,
            selected: 0,
            state: UiState::Default,
            tab: Tab::Preview,
            input: String::new(),
            diff_scroll: 0,
            preview_text: String::new(),
            error: None,
            keydown: None,
            prompt_after_name: false,
            last_metadata_tick: now,
            last_preview_tick: now,
            last_preview_dims: None,
            quit: false,
        })
    }

    fn event_loop(&mut self, terminal: &mut Tui) -> Result<()> {
        while !self.quit {
            self.expire_timers();

            if self.last_metadata_tick.elapsed() >= METADATA_TICK {
                self.last_metadata_tick = Instant::now();
                tick_instances(&mut self.instances);
            }
            if self.last_preview_tick.elapsed() >= PREVIEW_TICK {
                self.last_preview_tick = Instant::now();
                self.refresh_preview(terminal);
            }

            let app = &*self;
            terminal.draw(|frame| view::draw(frame, app))?;

            if event::poll(POLL_TIMEOUT)? {
                match event::read()? {
                    Event::Key(key) if key.kind == KeyEventKind::Press => {
                        self.handle_key(key, terminal)?;
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }

    fn expire_timers(&mut self) {
        if matches!(&self.error, Some((_, at)) if at.elapsed() >= ERROR_BANNER_TTL) {
            self.error = None;
        }
        if matches!(&self.keydown, Some((_, at)) if at.elapsed() >= KEYDOWN_TTL) {
            self.keydown = None;
        }
    }

    /// Refreshes the preview/diff caches for the selected instance and keeps
    /// its detached pty sized to the preview pane.
    fn refresh_preview(&mut self, terminal: &Tui) {
        let Some(instance) = self.instances.get(self.selected) else {
            self.preview_text.clear();
            return;
        };

        if let Ok(area) = terminal.size() {
            let (cols, rows) = view::preview_dims(area.width, area.height);
            let dims = (cols, rows, self.selected);
            if self.last_preview_dims != Some(dims) {
                self.last_preview_dims = Some(dims);
                if let Err(e) = instance.set_preview_size(cols, rows) {
                    log::debug!("could not size preview pty: {e}");
                }
            }
        }

        match instance.preview() {
            Ok(content) => self.preview_text = content,
            Err(e) => log::warn!("could not capture preview: {e}"),
        }
    }

    fn show_error(&mut self, err: impl std::fmt::Display) {
        log::error!("{err:#}");
        self.error = Some((format!("{err:#}"), Instant::now()));
    }

    fn note_keydown(&mut self, hint: &'static str) {
        self.keydown = Some((hint, Instant::now()));
    }

    pub(crate) fn selected_instance(&self) -> Option<&Instance> {
        self.instances.get(self.selected)
    }

    fn handle_key(&mut self, key: KeyEvent, terminal: &mut Tui) -> Result<()> {
        match self.state {
            UiState::New => self.handle_key_new(key),
            UiState::Prompt => self.handle_key_prompt(key),
            UiState::Default => self.handle_key_default(key, terminal),
        }
    }

    fn handle_key_default(&mut self, key: KeyEvent, terminal: &mut Tui) -> Result<()> {
        if key.code == KeyCode::Char('c') && key.modifiers.contains(KeyModifiers::CONTROL) {
            return self.quit_and_save();
        }
        match key.code {
            KeyCode::Char('q') => return self.quit_and_save(),
            KeyCode::Char('n') => {
                self.note_keydown("new");
                self.begin_create(false);
            }
            KeyCode::Char('p') => {
                self.note_keydown("prompt");
                self.begin_create(true);
            }
            KeyCode::Up | KeyCode::Char('k') => {
                if key.modifiers.contains(KeyModifiers::SHIFT) {
                    self.diff_scroll = self.diff_scroll.saturating_sub(1);
                } else if self.selected > 0 {
                    self.selected -= 1;
                    self.diff_scroll = 0;
                }
            }
            KeyCode::Down | KeyCode::Char('j') => {
                if key.modifiers.contains(KeyModifiers::SHIFT) {
                    self.diff_scroll = self.diff_scroll.saturating_add(1);
                } else if self.selected + 1 < self.instances.len() {
                    self.selected += 1;
                    self.diff_scroll = 0;
                }
            }
            KeyCode::Tab => {
                self.note_keydown("tab");
                self.tab = match self.tab {
                    Tab::Preview => Tab::Diff,
                    Tab::Diff => Tab::Preview,
                };
            }
            KeyCode::Char('D') => {
                self.note_keydown("kill");
                self.kill_selected();
            }
            KeyCode::Char('s') => {
                self.note_keydown("submit");
                self.submit_selected();
            }
            KeyCode::Char('P') => {
                self.note_keydown("pause");
                self.pause_selected();
            }
            KeyCode::Char('r') => {
                self.note_keydown("resume");
                self.resume_selected();
            }
            KeyCode::Enter => {
                self.note_keydown("attach");
                self.attach_selected(terminal)?;
            }
            _ => {}
        }
        Ok(())
    }

    fn handle_key_new(&mut self, key: KeyEvent) -> Result<()> {
        if key.code == KeyCode::Char('c') && key.modifiers.contains(KeyModifiers::CONTROL) {
            self.cancel_create();
            return Ok(());
        }
        match key.code {
            KeyCode::Esc => self.cancel_create(),
            KeyCode::Enter => self.finish_create(),
            KeyCode::Backspace => {
                let Some(instance) = self.instances.last_mut() else {
                    return Ok(());
                };
                let mut title = instance.title().to_string();
                title.pop();
                if let Err(e) = instance.set_title(&title) {
                    self.show_error(e);
                }
            }
            KeyCode::Char(c) => {
                let Some(instance) = self.instances.last_mut() else {
                    return Ok(());
                };
                let title = format!("{}{c}", instance.title());
                if let Err(e) = instance.set_title(&title) {
                    self.show_error(e);
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn handle_key_prompt(&mut self, key: KeyEvent) -> Result<()> {
        match key.code {
            KeyCode::Esc => {
                self.input.clear();
                self.state = UiState::Default;
            }
            KeyCode::Enter => {
                let prompt = std::mem::take(&mut self.input);
                self.state = UiState::Default;
                if let Some(instance) = self.instances.get_mut(self.selected) {
                    instance.prompt = Some(prompt.clone());
                    if let Err(e) = instance.send_prompt(&prompt) {
                        self.show_error(e);
                    }
                }
                self.save_instances();
            }
            KeyCode::Backspace => {
                self.input.pop();
            }
            KeyCode::Char(c) => self.input.push(c),
            _ => {}
        }
        Ok(())
    }

    fn begin_create(&mut self, with_prompt: bool) {
        if self.instances.len() >= MAX_INSTANCES {
            self.show_error(anyhow!(
                "you can't create more than {MAX_INSTANCES} instances"
            ));
            return;
        }
        match Instance::new(InstanceOptions {
            title: "",
            path: Path::new("."),
            program: &self.program,
        }) {
            Ok(instance) => {
                self.instances.push(instance);
                self.selected = self.instances.len() - 1;
                self.state = UiState::New;
                self.prompt_after_name = with_prompt;
            }
            Err(e) => self.show_error(e),
        }
    }

    fn cancel_create(&mut self) {
        self.instances.pop();
        self.selected = self.selected.min(self.instances.len().saturating_sub(1));
        self.state = UiState::Default;
        self.prompt_after_name = false;
    }

    fn finish_create(&mut self) {
        let title = match self.instances.last() {
            Some(instance) => instance.title().to_string(),
            None => return,
        };
        if title.is_empty() {
            self.show_error(anyhow!("title cannot be empty"));
            return;
        }
        let duplicate = self.instances[..self.instances.len() - 1]
            .iter()
            .any(|other| other.title() == title);
        if duplicate {
            self.show_error(anyhow!("an instance titled '{title}' already exists"));
            return;
        }

        let worktrees_root = self.worktrees_root.clone();
        let auto_yes = self.auto_yes;
        let instance = self.instances.last_mut().expect("instance just checked");
        match instance.start(true, &worktrees_root) {
            Ok(()) => {
                if auto_yes {
                    instance.set_auto_yes(true);
                }
                self.save_instances();
                if self.prompt_after_name {
                    self.state = UiState::Prompt;
                    self.input.clear();
                } else {
                    self.state = UiState::Default;
                }
                self.prompt_after_name = false;
            }
            Err(e) => {
                self.instances.pop();
                self.selected = self.selected.min(self.instances.len().saturating_sub(1));
                self.state = UiState::Default;
                self.prompt_after_name = false;
                self.show_error(e);
            }
        }
    }

    fn kill_selected(&mut self) {
        if self.instances.is_empty() {
            return;
        }
        let title = self.instances[self.selected].title().to_string();
        if let Err(e) = self.storage.delete_instance(&title) {
            self.show_error(e);
            return;
        }
        let mut instance = self.instances.remove(self.selected);
        self.selected = self.selected.min(self.instances.len().saturating_sub(1));
        if let Err(e) = instance.kill() {
            self.show_error(e);
        }
    }

    fn submit_selected(&mut self) {
        let Some(instance) = self.instances.get(self.selected) else {
            return;
        };
        let message = format!(
            "[claudesquad] update from '{}' on {}",
            instance.title(),
            Local::now().to_rfc2822()
        );
        let result = instance
            .git_worktree()
            .and_then(|worktree| worktree.push_changes(&message));
        if let Err(e) = result {
            self.show_error(e);
        }
    }

    fn pause_selected(&mut self) {
        let Some(instance) = self.instances.get_mut(self.selected) else {
            return;
        };
        if let Err(e) = instance.pause() {
            self.show_error(e);
        }
        self.save_instances();
    }

    fn resume_selected(&mut self) {
        let Some(instance) = self.instances.get_mut(self.selected) else {
            return;
        };
        if let Err(e) = instance.resume() {
            self.show_error(e);
        }
        self.save_instances();
    }

    /// Hands the terminal to tmux until the operator detaches with Ctrl-Q.
    /// The UI is effectively suspended for the duration.
    fn attach_selected(&mut self, terminal: &mut Tui) -> Result<()> {
        let Some(instance) = self.instances.get_mut(self.selected) else {
            return Ok(());
        };
        if !instance.started() || instance.paused() {
            self.show_error(anyhow!("instance is not running"));
            return Ok(());
        }
        let Some(tmux) = instance.tmux.as_mut() else {
            self.show_error(anyhow!("instance has no tmux session"));
            return Ok(());
        };

        execute!(std::io::stdout(), LeaveAlternateScreen)
            .context("failed to leave alternate screen")?;

        let detach_signal = match tmux.attach() {
            Ok(rx) => rx,
            Err(e) => {
                let _ = execute!(std::io::stdout(), EnterAlternateScreen);
                self.show_error(e);
                return Ok(());
            }
        };
        let _ = detach_signal.recv();
        let detach_result = tmux.detach();

        // detach() restored the cooked terminal; take it back for the TUI.
        enable_raw_mode().context("failed to re-enable raw mode")?;
        execute!(std::io::stdout(), EnterAlternateScreen)
            .context("failed to re-enter alternate screen")?;
        terminal.clear().context("failed to redraw after detach")?;

        if let Err(e) = detach_result {
            self.show_error(e);
        }
        Ok(())
    }

    fn save_instances(&mut self) {
        if let Err(e) = self.storage.save_instances(&self.instances) {
            self.show_error(anyhow!("failed to save instances: {e}"));
        }
    }

    fn quit_and_save(&mut self) -> Result<()> {
        self.save_instances();
        if self.auto_yes {
            if let Err(e) = daemon::launch_daemon() {
                log::error!("failed to launch daemon: {e}");
            }
        }
        self.quit = true;
        Ok(())
    }
}
