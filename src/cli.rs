use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "ralph",
    about = "Multi-worker orchestrator for autonomous coding agents",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Agent adapter to drive (claude, codex).
    #[arg(long, global = true, value_name = "ID")]
    pub agent: Option<String>,

    /// Emit machine-readable JSON instead of human-readable text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Keep waiting for new tasks instead of exiting when the queue drains.
    #[arg(long, global = true)]
    pub watch: bool,

    /// Maximum number of concurrent workers.
    #[arg(long, global = true, value_name = "N")]
    pub max_workers: Option<usize>,

    /// Websocket hub port.
    #[arg(long, global = true)]
    pub port: Option<u16>,

    /// Websocket hub host.
    #[arg(long, global = true)]
    pub host: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the websocket hub and the worker orchestrator.
    Serve,

    /// Drive a fixed number of worker iterations without the server.
    Run {
        /// Number of iterations (0 = until the queue drains, or forever
        /// with --watch).
        #[arg(value_name = "ITERATIONS")]
        iterations: u32,
    },

    /// Deterministically replay a persisted event log for debugging.
    Replay {
        /// Path to an events .jsonl file from the session store.
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn parses_serve_with_flags() {
        let cli = Cli::try_parse_from([
            "ralph",
            "serve",
            "--agent",
            "codex",
            "--max-workers",
            "5",
            "--port",
            "9000",
            "--host",
            "0.0.0.0",
        ])
        .unwrap();
        assert!(matches!(cli.command, Command::Serve));
        assert_eq!(cli.agent.as_deref(), Some("codex"));
        assert_eq!(cli.max_workers, Some(5));
        assert_eq!(cli.port, Some(9000));
        assert_eq!(cli.host.as_deref(), Some("0.0.0.0"));
    }

    #[test]
    fn parses_run_with_iterations() {
        let cli = Cli::try_parse_from(["ralph", "run", "3", "--json", "--watch"]).unwrap();
        let Command::Run { iterations } = cli.command else {
            unreachable!()
        };
        assert_eq!(iterations, 3);
        assert!(cli.json);
        assert!(cli.watch);
    }

    #[test]
    fn parses_replay_with_file() {
        let cli = Cli::try_parse_from(["ralph", "replay", "events.jsonl"]).unwrap();
        let Command::Replay { file } = cli.command else {
            unreachable!()
        };
        assert_eq!(file, PathBuf::from("events.jsonl"));
    }

    #[test]
    fn run_requires_iterations() {
        assert!(Cli::try_parse_from(["ralph", "run"]).is_err());
        assert!(Cli::try_parse_from(["ralph", "run", "not-a-number"]).is_err());
    }
}
