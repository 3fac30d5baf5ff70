//! Agent settings, assembled from the command line.

use sim_types::Address;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default TCP port the agent listens on.
pub const DEFAULT_PORT: u16 = 9000;

/// Default time a worker gets to answer a command.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// Runtime settings of one agent process.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// 1-based index of this agent.
    pub address_index: u32,
    /// Port to accept the coordinator connection on.
    pub port: u16,
    /// Address the coordinator reaches this agent at.
    pub public_address: String,
    /// Root of the worker home directories.
    pub workers_home: PathBuf,
    /// Id of the suite being run; worker homes live under it.
    pub suite_id: String,
    /// Script that starts one worker process.
    pub worker_script: PathBuf,
    /// Time member workers get to shut down before they are killed.
    pub member_shutdown_delay: Duration,
    /// Time a worker gets to answer a command before it counts as timed out.
    pub command_timeout: Duration,
}

impl AgentConfig {
    /// Settings with defaults for everything but the index.
    pub fn new(address_index: u32) -> Self {
        Self {
            address_index,
            port: DEFAULT_PORT,
            public_address: "127.0.0.1".to_string(),
            workers_home: PathBuf::from("workers"),
            suite_id: "default".to_string(),
            worker_script: PathBuf::from("worker.sh"),
            member_shutdown_delay: Duration::from_secs(5),
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    /// Routing address of this agent.
    pub fn address(&self) -> Address {
        Address::agent(self.address_index)
    }

    /// Directory holding the homes of this suite's workers.
    pub fn suite_dir(&self) -> PathBuf {
        self.workers_home.join(&self.suite_id)
    }

    /// Home directory of one worker.
    pub fn worker_home(&self, worker_id: &str) -> PathBuf {
        self.suite_dir().join(worker_id)
    }

    /// Script that starts workers.
    pub fn worker_script(&self) -> &Path {
        &self.worker_script
    }
}
