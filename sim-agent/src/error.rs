//! Error types for sim-agent.

use sim_types::{Address, SimError};

/// Main error type for agent operations.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// I/O error on the listening socket or coordinator connection.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Wire protocol error.
    #[error("protocol error: {0}")]
    Protocol(#[from] SimError),

    /// Worker supervision error.
    #[error("supervisor error: {0}")]
    Supervisor(#[from] SupervisorError),
}

/// Errors from spawning and addressing worker processes.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    /// No live worker has this address.
    #[error("worker not found: {0}")]
    WorkerNotFound(Address),

    /// The worker process could not be started.
    #[error("failed to launch worker {address}: {source}")]
    Launch {
        /// Address the worker would have had.
        address: Address,
        /// Underlying spawn error.
        #[source]
        source: std::io::Error,
    },

    /// A worker with this address is already running.
    #[error("worker already exists: {0}")]
    AlreadyExists(Address),

    /// A command could not be encoded for the worker pipe.
    #[error("protocol error: {0}")]
    Protocol(#[from] SimError),
}

/// Result type alias for agent operations.
pub type Result<T> = std::result::Result<T, AgentError>;
