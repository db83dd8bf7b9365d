//! Command-line interface definitions.
//!
//! Uses clap's derive API. The surface is deliberately small: devsandbox
//! wraps whatever command follows it, and everything else lives in the
//! config file.

use clap::Parser;
use std::path::PathBuf;

/// Per-project development sandbox.
///
/// Runs a shell or command inside a Bubblewrap sandbox with a private
/// HOME, hidden credentials (SSH: BLOCKED, .env files: BLOCKED), and an
/// optional TLS-intercepting filtering proxy for all network traffic.
#[derive(Parser, Debug)]
#[command(name = "devsandbox")]
#[command(author, version, about)]
pub struct Cli {
    /// Enable proxy mode: all traffic through the filtering proxy.
    #[arg(long)]
    pub proxy: bool,

    /// Print the resolved sandbox configuration and exit.
    #[arg(long)]
    pub info: bool,

    /// Path to an additional config file (highest priority).
    #[arg(short = 'c', long = "config", value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Command to run inside the sandbox; an interactive shell if empty.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bare_invocation() {
        let cli = Cli::parse_from(["devsandbox"]);
        assert!(!cli.proxy);
        assert!(!cli.info);
        assert!(cli.command.is_empty());
        assert_eq!(cli.verbose, 0);
    }

    #[test]
    fn parse_command_with_flags() {
        let cli = Cli::parse_from(["devsandbox", "--proxy", "-vv", "npm", "test"]);
        assert!(cli.proxy);
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.command, vec!["npm", "test"]);
    }

    #[test]
    fn command_flags_pass_through() {
        let cli = Cli::parse_from(["devsandbox", "cargo", "build", "--release"]);
        assert_eq!(cli.command, vec!["cargo", "build", "--release"]);
    }

    #[test]
    fn config_path() {
        let cli = Cli::parse_from(["devsandbox", "-c", "/tmp/extra.toml"]);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/extra.toml")));
    }
}
