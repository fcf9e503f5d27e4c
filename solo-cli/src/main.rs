//! Solo: single-instance launcher.
//!
//! # Usage
//!
//! ```text
//! solo launch [--id ID | --user U --config-hash H] [ARGS...]
//! solo status [--id ID | --user U --config-hash H]
//! solo stop   [--id ID | --user U --config-hash H]
//! ```
//!
//! `launch` hands its arguments to the running instance for the same
//! identity, or becomes that instance and prints every activation it absorbs.

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{launch::LaunchArgs, status::StatusArgs, stop::StopArgs};

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "solo",
    version,
    about = "Keep one running instance per user and configuration",
    long_about = None,
)]
struct Cli {
    /// Directory under $HOME holding markers and singleton.yaml.
    #[arg(long, global = true, env = "SOLO_APP_DIR", default_value = solo_core::config::DEFAULT_APP_DIR)]
    app_dir: String,

    /// Log as JSON lines on stderr.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Delegate to the running instance, or become it.
    Launch(LaunchArgs),

    /// Show whether an instance is advertised for an identity.
    Status(StatusArgs),

    /// Ask the running instance for an identity to stop.
    Stop(StopArgs),
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    let cli = Cli::parse();
    solo_ipc::init_tracing(cli.json_logs);

    match cli.command {
        Commands::Launch(args) => args.run(&cli.app_dir),
        Commands::Status(args) => args.run(&cli.app_dir),
        Commands::Stop(args) => args.run(&cli.app_dir),
    }
}
