//! redock: keep a docker compose stack in step with a git branch.
//!
//! # Usage
//!
//! ```text
//! redock init --worktree <path> [--branch main] [--remote origin] [--strategy discard|preserve]
//! redock reconcile [--strategy discard|preserve] [--source <who>] [--json]
//! redock status [--json]
//! redock daemon start|stop|status
//! redock trigger [--source <who>] [--json]
//! ```
//!
//! `reconcile` and `trigger` exit with the reconciliation's status code
//! (0 success, 10–13 sync, 20–21 build, 30–31 lock/cancel); configuration
//! and usage errors exit with 2.

mod commands;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::Colorize;

use commands::{
    daemon::DaemonCommand, init::InitArgs, reconcile::ReconcileArgs, status::StatusArgs,
    trigger::TriggerArgs,
};
use redock_core::types::Strategy;

/// Exit status for configuration and usage errors.
const EXIT_USAGE: i32 = 2;

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "redock",
    version,
    about = "Reconcile a running container stack with a remote git branch",
    long_about = None,
)]
struct Cli {
    /// Config file to use instead of ~/.redock/config.yaml.
    #[arg(long, global = true, env = "REDOCK_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,

    /// Log at debug level (RUST_LOG takes precedence).
    #[arg(long, short = 'v', global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write the deployment config.
    Init(InitArgs),

    /// Run one reconciliation in this process.
    Reconcile(ReconcileArgs),

    /// Show the last reconciliation.
    Status(StatusArgs),

    /// Manage the background daemon.
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },

    /// Ask the running daemon to reconcile and wait for the result.
    Trigger(TriggerArgs),
}

// ---------------------------------------------------------------------------
// Shared Strategy argument, parsed from CLI strings and converted to the core type
// ---------------------------------------------------------------------------

/// Thin wrapper so clap can parse `Strategy` from CLI args.
#[derive(Debug, Clone, Copy, Default)]
pub struct StrategyArg(pub Strategy);

impl FromStr for StrategyArg {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "discard" => Ok(Self(Strategy::Discard)),
            "preserve" => Ok(Self(Strategy::Preserve)),
            other => Err(format!(
                "unknown strategy '{other}'; expected: discard, preserve"
            )),
        }
    }
}

impl fmt::Display for StrategyArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<StrategyArg> for Strategy {
    fn from(s: StrategyArg) -> Self {
        s.0
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = cli.config;
    let result: Result<i32> = match cli.command {
        Commands::Init(args) => args.run(config.as_deref()).map(|()| 0),
        Commands::Reconcile(args) => args.run(config.as_deref()),
        Commands::Status(args) => args.run().map(|()| 0),
        Commands::Daemon { command } => commands::daemon::run(command, config.as_deref()).map(|()| 0),
        Commands::Trigger(args) => args.run(),
    };

    let code = match result {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{} {err:#}", "error:".red().bold());
            EXIT_USAGE
        }
    };
    std::process::exit(code);
}

/// Logs go to stderr so `--json` output on stdout stays parseable.
fn init_tracing(verbose: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
