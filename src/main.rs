use anyhow::{Context, Result};
use clap::Parser;
use claude_squad::cli::{Cli, Command};
use claude_squad::domains::{git, sessions::Storage, tmux};
use claude_squad::{config, daemon, logging, ui};

fn main() {
    if let Err(err) = run() {
        eprintln!("{err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let log_path = logging::init()?;

    if cli.daemon {
        return daemon::run_daemon();
    }

    let config = config::load_config().context("failed to load config")?;

    if let Some(Command::Debug) = cli.command {
        let config_json =
            serde_json::to_string_pretty(&config).context("failed to render config")?;
        println!("Config: {}\n{config_json}", config::config_path()?.display());
        return Ok(());
    }

    if cli.reset {
        return reset();
    }

    let program = cli.program.unwrap_or_else(|| config.default_program.clone());
    let auto_yes = cli.auto_yes || config.auto_yes;

    // The daemon reads instance state only at its own start; stop any
    // running one before the TUI touches instances. The TUI relaunches it
    // on quit when auto-yes is enabled.
    if let Err(e) = daemon::stop_daemon() {
        log::error!("failed to stop daemon: {e}");
    }

    ui::run(program, auto_yes)?;
    println!("wrote logs to {}", log_path.display());
    Ok(())
}

/// Wipes everything claude-squad manages: stored instances, prefixed tmux
/// sessions, managed worktrees, and any running daemon.
fn reset() -> Result<()> {
    let storage = Storage::new(&config::config_dir()?)
        .context("failed to initialize storage")?;
    storage
        .delete_all_instances()
        .context("failed to reset storage")?;
    println!("Storage has been reset successfully");

    tmux::cleanup_sessions().context("failed to clean up tmux sessions")?;
    println!("Tmux sessions have been cleaned up");

    git::cleanup_worktrees(&config::worktrees_dir()?)
        .context("failed to clean up worktrees")?;
    println!("Worktrees have been cleaned up");

    if let Err(e) = daemon::stop_daemon() {
        log::error!("failed to stop daemon: {e}");
    }
    println!("Daemon has been stopped");

    Ok(())
}
