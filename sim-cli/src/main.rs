//! # simulator
//!
//! Command line front end for distributed simulator runs.
//!
//! ## Commands
//!
//! - `run`: Run a test suite on the agent machines
//! - `clean`: Remove worker homes of previous runs from the agents
//!
//! ## Example
//!
//! ```bash
//! # Two tests in parallel for 5 minutes, 4 clients next to the members
//! simulator run suite.properties --agents-file agents.txt \
//!     --duration 5m --parallel --clients 4
//!
//! # Remove old worker directories
//! simulator clean --agents-file agents.txt
//! ```
//!
//! ## Exit codes
//!
//! - 0: the run completed (tolerable failures allowed)
//! - 1: setup failed, or a critical failure occurred with fail-fast on
//! - 2: invalid arguments, input files or configuration

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

mod commands;

use commands::{clean, run, EXIT_FAILURE, EXIT_USAGE};

/// Distributed load test orchestrator.
#[derive(Parser, Debug)]
#[command(name = "simulator")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Simulator properties file (optional; defaults apply when missing)
    #[arg(long, global = true, default_value = "simulator.toml")]
    properties: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a test suite
    Run(run::RunArgs),

    /// Remove worker homes of previous runs from every agent
    Clean {
        /// Agents file with one `publicAddress[,privateAddress]` per line
        #[arg(long, default_value = "agents.txt")]
        agents_file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => {
            let params = match run::prepare(&cli.properties, &args) {
                Ok(params) => params,
                Err(e) => {
                    tracing::error!("{:#}", e);
                    return ExitCode::from(EXIT_USAGE);
                }
            };
            match run::run(params).await {
                Ok(outcome) if outcome.is_failure() => {
                    tracing::error!("Critical failure with fail-fast enabled");
                    ExitCode::from(EXIT_FAILURE)
                }
                Ok(_) => ExitCode::SUCCESS,
                Err(e) => {
                    tracing::error!("{:#}", e);
                    ExitCode::from(EXIT_FAILURE)
                }
            }
        }
        Commands::Clean { agents_file } => match clean::run(&cli.properties, &agents_file).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                tracing::error!("{:#}", e);
                ExitCode::from(EXIT_FAILURE)
            }
        },
    }
}
