//! CLI module for converge
//!
//! Argument parsing with `clap` derive. Global options apply to every
//! subcommand and override the configuration file.

pub mod commands;
pub mod output;

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// converge - converge hosts to the state declared in a playbook
#[derive(Parser, Debug, Clone)]
#[command(name = "converge")]
#[command(version)]
#[command(about = "Converge hosts to the state declared in a playbook", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Path to inventory file (INI, YAML or JSON)
    #[arg(short = 'i', long, global = true, env = "CONVERGE_INVENTORY")]
    pub inventory: Option<PathBuf>,

    /// Extra variables (key=value, JSON object or @file)
    #[arg(short = 'e', long = "extra-vars", global = true, action = clap::ArgAction::Append)]
    pub extra_vars: Vec<String>,

    /// Limit execution to hosts matching this pattern
    #[arg(short = 'l', long, global = true)]
    pub limit: Option<String>,

    /// Number of hosts converged in parallel
    #[arg(short = 'f', long, global = true)]
    pub forks: Option<usize>,

    /// Report what would change without changing it
    #[arg(short = 'C', long = "check", global = true)]
    pub check_mode: bool,

    /// Show differences for changed files
    #[arg(short = 'D', long = "diff", global = true)]
    pub diff_mode: bool,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short = 'v', long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Path to configuration file
    #[arg(short = 'c', long, global = true, env = "CONVERGE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,

    /// Per-command timeout in seconds
    #[arg(long, global = true)]
    pub timeout: Option<u64>,

    /// Log format on stderr
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines
    Text,
    /// One JSON object per event
    Json,
}

/// Available subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run a playbook
    Run(commands::run::RunArgs),

    /// Parse and validate a playbook without running it
    Check(commands::check::CheckArgs),

    /// List hosts matching a pattern, or targeted by a playbook
    #[command(name = "list-hosts")]
    ListHosts(commands::inventory::ListHostsArgs),
}

impl Cli {
    /// Parse command-line arguments
    pub fn parse_args() -> Self {
        Cli::parse()
    }

    /// Get the effective verbosity level (0-3)
    pub fn verbosity(&self) -> u8 {
        self.verbose.min(3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run_with_globals() {
        let cli = Cli::try_parse_from([
            "converge",
            "-i",
            "hosts.ini",
            "run",
            "site.yml",
            "-e",
            "elk_host=192.168.0.103",
            "-l",
            "ubu1",
            "-f",
            "2",
            "--run-timeout",
            "600",
            "-vv",
        ])
        .unwrap();

        assert_eq!(cli.inventory, Some(PathBuf::from("hosts.ini")));
        assert_eq!(cli.extra_vars, vec!["elk_host=192.168.0.103"]);
        assert_eq!(cli.limit.as_deref(), Some("ubu1"));
        assert_eq!(cli.forks, Some(2));
        assert_eq!(cli.verbosity(), 2);
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.playbook, PathBuf::from("site.yml"));
                assert_eq!(args.run_timeout, Some(600));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_log_format_json() {
        let cli = Cli::try_parse_from(["converge", "--log-format", "json", "check", "site.yml"])
            .unwrap();
        assert_eq!(cli.log_format, LogFormat::Json);
    }
}
