//! Command-line surface of the `infrabot` binary (clap derive)

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Infrabot local automation assistant
///
/// Turns a free-text operations request into an Ansible playbook, runs it,
/// reviews the outcome and remembers it for next time.
#[derive(Parser, Debug)]
#[command(name = "infrabot")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Print machine-readable JSON instead of text
    #[arg(long, global = true)]
    pub json: bool,

    /// Override the configured log level
    #[arg(long, global = true, value_name = "LEVEL")]
    pub log: Option<String>,

    /// Read configuration from this file instead of ~/.infrabot/config.toml
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Options shared by `run` and `shell`
#[derive(clap::Args, Debug, Clone, Default)]
pub struct RunOptions {
    /// Inventory file (default: local machine only)
    #[arg(short, long, value_name = "PATH")]
    pub inventory: Option<String>,

    /// Model to use instead of the configured default
    #[arg(short, long)]
    pub model: Option<String>,

    /// Show the generated playbook and full output
    #[arg(short, long)]
    pub verbose: bool,

    /// Dry run: pass --check to ansible-playbook
    #[arg(long)]
    pub check: bool,
}

/// Subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Plan, generate, execute and review one task
    Run {
        /// Free-text request, e.g. "check disk usage on web1"
        task: String,

        #[command(flatten)]
        options: RunOptions,
    },

    /// Interactive mode: one task per line
    Shell {
        #[command(flatten)]
        options: RunOptions,
    },

    /// Show recent runs
    History {
        /// Number of runs to show (default: 10)
        #[arg(short, long, default_value = "10")]
        limit: u32,
    },

    /// Show one recorded run in full
    Show {
        /// Record ID
        record_id: String,
    },

    /// Find past runs similar to a text
    Search {
        /// Text to compare against past requests
        text: String,

        /// Number of results
        #[arg(short, default_value = "5")]
        k: usize,

        /// Only runs that reached execution
        #[arg(long)]
        executed: bool,
    },

    /// Show memory statistics
    Stats,

    /// Apply the configured retention policy
    Prune,

    /// Delete all recorded runs
    Clear {
        /// Confirm deletion
        #[arg(long)]
        yes: bool,
    },

    /// Check the language model and executor
    Doctor,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_subcommand_has_no_globals() {
        let cli = Cli::parse_from(["infrabot", "stats"]);
        assert!(matches!(cli.command, Command::Stats));
        assert!(!cli.json);
        assert!(cli.log.is_none());
        assert!(cli.config.is_none());
    }

    #[test]
    fn test_globals_accepted_before_subcommand() {
        let cli = Cli::parse_from(["infrabot", "--json", "--log", "debug", "doctor"]);
        assert!(cli.json);
        assert_eq!(cli.log, Some("debug".to_string()));
        assert!(matches!(cli.command, Command::Doctor));
    }

    #[test]
    fn test_run_takes_task_text() {
        let cli = Cli::parse_from(["infrabot", "run", "check disk usage on web1"]);
        if let Command::Run { task, options } = cli.command {
            assert_eq!(task, "check disk usage on web1");
            assert!(options.inventory.is_none());
            assert!(!options.verbose);
            assert!(!options.check);
        } else {
            panic!("not a run command");
        }
    }

    #[test]
    fn test_run_command_options() {
        let cli = Cli::parse_from([
            "infrabot",
            "run",
            "patch all servers",
            "-i",
            "hosts.ini",
            "-m",
            "llama3",
            "-v",
            "--check",
            "--json",
        ]);
        assert!(cli.json);
        if let Command::Run { options, .. } = cli.command {
            assert_eq!(options.inventory.as_deref(), Some("hosts.ini"));
            assert_eq!(options.model.as_deref(), Some("llama3"));
            assert!(options.verbose);
            assert!(options.check);
        } else {
            panic!("not a run command");
        }
    }

    #[test]
    fn test_history_limit() {
        let cli = Cli::parse_from(["infrabot", "history", "--limit", "20"]);
        if let Command::History { limit } = cli.command {
            assert_eq!(limit, 20);
        } else {
            panic!("not a history command");
        }
    }

    #[test]
    fn test_search_command() {
        let cli = Cli::parse_from(["infrabot", "search", "disk usage", "-k", "3", "--executed"]);
        if let Command::Search { text, k, executed } = cli.command {
            assert_eq!(text, "disk usage");
            assert_eq!(k, 3);
            assert!(executed);
        } else {
            panic!("not a search command");
        }
    }

    #[test]
    fn test_clear_requires_flag_value() {
        let cli = Cli::parse_from(["infrabot", "clear"]);
        assert!(matches!(cli.command, Command::Clear { yes: false }));
    }

    #[test]
    fn test_missing_task_is_an_error() {
        assert!(Cli::try_parse_from(["infrabot", "run"]).is_err());
    }
}
