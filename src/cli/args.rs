//! `clap`-derived command definitions for the `forge` binary.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "forge", about = "Runs a pool of AI coding-agent loops against a repo", version)]
pub struct Cli {
    /// Path to forge.yaml
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(short = 'l', long = "log-level", global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Bring at least N loops up (foreground daemon; serves the IPC socket until interrupted)
    Up {
        #[arg(long, default_value_t = 1)]
        count: usize,
    },

    /// Request a loop stop gracefully after its current iteration
    Down { name: String },

    /// Kill a loop's in-flight iteration immediately
    Kill { name: String },

    /// Append a message to a loop's next prompt
    Msg { name: String, text: String },

    /// Replace a loop's next prompt outright
    #[command(name = "override")]
    OverridePrompt { name: String, text: String },

    /// Pause a loop after draining its current queue
    Pause { name: String },

    /// Show a loop's recent harness output
    Logs {
        name: String,
        #[arg(short, long)]
        follow: bool,
    },

    /// Print a loop's ledger file
    Ledger { name: String },

    /// Manage loops
    Loop {
        #[command(subcommand)]
        command: LoopCommand,
    },

    /// Manage harness profiles
    Profile {
        #[command(subcommand)]
        command: ProfileCommand,
    },

    /// Manage profile pools
    Pool {
        #[command(subcommand)]
        command: PoolCommand,
    },
}

#[derive(Subcommand, Debug)]
pub enum LoopCommand {
    Create {
        name: String,
        repo_path: String,
        #[arg(long)]
        prompt: Option<String>,
        #[arg(long)]
        prompt_path: Option<String>,
        #[arg(long)]
        profile: Option<String>,
        #[arg(long)]
        pool: Option<String>,
        /// Defaults to the config's `poll_fallback_interval_secs` when omitted
        #[arg(long)]
        interval_seconds: Option<u64>,
    },
    List,
    Rm {
        name: String,
    },
}

#[derive(Subcommand, Debug)]
pub enum ProfileCommand {
    /// Scaffold `.forge/` and a starter `forge.yaml`
    Init,
    Add {
        name: String,
        harness: String,
        command_template: String,
        #[arg(long)]
        model: Option<String>,
        #[arg(long, default_value_t = 1)]
        max_concurrency: u32,
    },
    List,
    Rm {
        name: String,
    },
}

#[derive(Subcommand, Debug)]
pub enum PoolCommand {
    Create {
        name: String,
    },
    Add {
        pool: String,
        profile: String,
        #[arg(long, default_value_t = 1)]
        weight: u32,
    },
    #[command(name = "set-default")]
    SetDefault {
        name: String,
    },
    List,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_up_with_default_count() {
        let cli = Cli::parse_from(["forge", "up"]);
        assert!(matches!(cli.command, Command::Up { count: 1 }));
    }

    #[test]
    fn parses_up_with_explicit_count() {
        let cli = Cli::parse_from(["forge", "up", "--count", "3"]);
        assert!(matches!(cli.command, Command::Up { count: 3 }));
    }

    #[test]
    fn parses_override_under_its_renamed_subcommand() {
        let cli = Cli::parse_from(["forge", "override", "demo", "do this instead"]);
        match cli.command {
            Command::OverridePrompt { name, text } => {
                assert_eq!(name, "demo");
                assert_eq!(text, "do this instead");
            }
            other => panic!("expected OverridePrompt, got {other:?}"),
        }
    }

    #[test]
    fn parses_loop_create_with_flags() {
        let cli = Cli::parse_from(["forge", "loop", "create", "demo", "/repo", "--prompt", "hello", "--profile", "p1"]);
        match cli.command {
            Command::Loop { command: LoopCommand::Create { name, repo_path, prompt, profile, interval_seconds, .. } } => {
                assert_eq!(interval_seconds, None);
                assert_eq!(name, "demo");
                assert_eq!(repo_path, "/repo");
                assert_eq!(prompt.as_deref(), Some("hello"));
                assert_eq!(profile.as_deref(), Some("p1"));
            }
            other => panic!("expected Loop::Create, got {other:?}"),
        }
    }

    #[test]
    fn parses_pool_set_default() {
        let cli = Cli::parse_from(["forge", "pool", "set-default", "main"]);
        assert!(matches!(cli.command, Command::Pool { command: PoolCommand::SetDefault { name } } if name == "main"));
    }
}
