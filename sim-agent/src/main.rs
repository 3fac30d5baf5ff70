//! sim-agent binary entry point.
//!
//! Started on every agent machine by the coordinator:
//! ```bash
//! sim-agent --address-index 1 --port 9000 --public-address 10.0.0.1 \
//!     --workers-home ~/simulator/workers --suite-id 2026-10-16__12_00_00 \
//!     --worker-script ~/simulator/worker.sh
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use sim_agent::{AgentConfig, AgentConnector, ProcessLauncher};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

/// Simulator agent: spawns and supervises worker processes.
#[derive(Parser, Debug)]
#[command(name = "sim-agent")]
#[command(version, about, long_about = None)]
struct Cli {
    /// 1-based index of this agent
    #[arg(long)]
    address_index: u32,

    /// Port to accept the coordinator on
    #[arg(long, default_value_t = sim_agent::config::DEFAULT_PORT)]
    port: u16,

    /// Address the coordinator reaches this machine at
    #[arg(long, default_value = "127.0.0.1")]
    public_address: String,

    /// Root directory for worker homes
    #[arg(long, default_value = "workers")]
    workers_home: PathBuf,

    /// Id of the suite being run
    #[arg(long, default_value = "default")]
    suite_id: String,

    /// Script that starts one worker process
    #[arg(long, default_value = "worker.sh")]
    worker_script: PathBuf,

    /// Seconds member workers get to shut down before they are killed
    #[arg(long, default_value_t = 5)]
    member_shutdown_delay_secs: u64,

    /// Seconds a worker gets to answer a command
    #[arg(long, default_value_t = 60)]
    command_timeout_secs: u64,
}

impl Cli {
    fn into_config(self) -> AgentConfig {
        AgentConfig {
            address_index: self.address_index,
            port: self.port,
            public_address: self.public_address,
            workers_home: self.workers_home,
            suite_id: self.suite_id,
            worker_script: self.worker_script,
            member_shutdown_delay: Duration::from_secs(self.member_shutdown_delay_secs),
            command_timeout: Duration::from_secs(self.command_timeout_secs),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Cli::parse().into_config();
    let grace = config.member_shutdown_delay;
    let listener = TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("failed to bind agent port {}", config.port))?;

    let launcher = Arc::new(ProcessLauncher::new(Arc::new(config.clone())));
    let agent = AgentConnector::new(config, launcher);

    tokio::select! {
        result = agent.serve(listener) => {
            result.context("agent connector failed")?;
        }
        signal = shutdown_signal() => {
            signal.context("failed to install signal handler")?;
            tracing::info!("Shutdown requested");
        }
    }

    agent.shutdown(grace).await;
    tracing::info!("Agent {} stopped", agent.address());
    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() -> std::io::Result<()> {
    let mut terminate =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}
