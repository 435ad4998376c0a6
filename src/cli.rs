use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "claude-squad",
    about = "Claude Squad - A terminal-based session manager for AI coding assistants",
    version
)]
pub struct Cli {
    /// Program to run in new instances (e.g. 'aider --model ollama_chat/gemma3:1b')
    #[arg(short, long)]
    pub program: Option<String>,

    /// [experimental] Automatically accept assistant confirmation prompts
    #[arg(short = 'y', long = "autoyes")]
    pub auto_yes: bool,

    /// Reset all stored instances, kill managed tmux sessions and remove
    /// managed worktrees
    #[arg(long)]
    pub reset: bool,

    /// Run the headless auto-accept loop over persisted instances
    #[arg(long, hide = true)]
    pub daemon: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Print debug information like config paths
    Debug,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_program_and_autoyes_flags() {
        let cli = Cli::parse_from(["claude-squad", "-p", "aider --yes", "-y"]);
        assert_eq!(cli.program.as_deref(), Some("aider --yes"));
        assert!(cli.auto_yes);
        assert!(!cli.reset);
    }

    #[test]
    fn parses_debug_subcommand() {
        let cli = Cli::parse_from(["claude-squad", "debug"]);
        assert!(matches!(cli.command, Some(Command::Debug)));
    }

    #[test]
    fn hidden_daemon_flag_still_parses() {
        let cli = Cli::parse_from(["claude-squad", "--daemon"]);
        assert!(cli.daemon);
    }
}
