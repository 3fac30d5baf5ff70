//! Error types for the coordinator.

use sim_types::{Address, ResponseType, SimError};

/// Main error type for coordinator operations.
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Cluster layout could not be computed.
    #[error("cluster layout error: {0}")]
    Layout(#[from] sim_core::LayoutError),

    /// Connection to an agent failed.
    #[error("connector error: {0}")]
    Connector(#[from] ConnectorError),

    /// A dispatch call failed as a whole.
    #[error("dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    /// Remote command execution failed.
    #[error("ssh error: {0}")]
    Ssh(#[from] crate::ssh::SshError),

    /// Setup did not complete, so no test was run.
    #[error("setup failed: {0}")]
    Setup(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coordinator-to-agent connection errors.
#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    /// Could not connect to an agent.
    #[error("could not connect to agent {agent} at {address}: {source}")]
    Connect {
        /// Agent index.
        agent: u32,
        /// Socket address.
        address: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// No connection exists for the agent.
    #[error("no connection to agent {0}")]
    UnknownAgent(u32),

    /// The target address has no concrete agent component.
    #[error("target {0} does not name a single agent")]
    NotConcrete(Address),

    /// No response arrived in time.
    #[error("no response from {target} for request {correlation_id}")]
    Timeout {
        /// Request target.
        target: Address,
        /// Correlation id of the request.
        correlation_id: u64,
    },

    /// The connection closed while the request was pending.
    #[error("connection to agent {0} closed")]
    ConnectionClosed(u32),

    /// Encoding or framing failed.
    #[error("protocol error: {0}")]
    Protocol(#[from] SimError),
}

/// Errors returned by [`RemoteDispatch`](crate::RemoteDispatch) calls.
///
/// Failures of individual fan-out branches are reported to the failure
/// container instead.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The test id is not registered.
    #[error("unknown test: {0}")]
    UnknownTest(String),

    /// There are no workers to send to.
    #[error("no workers registered")]
    NoWorkers,

    /// A single-target send failed.
    #[error(transparent)]
    Connector(#[from] ConnectorError),

    /// The receiver processed the request but reported an error.
    #[error("{address} answered {response_type}: {message}")]
    Rejected {
        /// Responding address.
        address: Address,
        /// Response type returned.
        response_type: ResponseType,
        /// Error text, if any.
        message: String,
    },

    /// Encoding failed.
    #[error("protocol error: {0}")]
    Protocol(#[from] SimError),
}

/// Result type for coordinator operations.
pub type Result<T> = std::result::Result<T, CoordinatorError>;

/// Result type for dispatch calls.
pub type DispatchResult<T> = std::result::Result<T, DispatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejected_display() {
        let err = DispatchError::Rejected {
            address: Address::worker(1, 2),
            response_type: ResponseType::FailureWorkerNotFound,
            message: "gone".into(),
        };
        assert_eq!(err.to_string(), "C_A1_W2 answered FAILURE_WORKER_NOT_FOUND: gone");
    }

    #[test]
    fn connector_error_converts() {
        let err: CoordinatorError = ConnectorError::UnknownAgent(3).into();
        assert!(err.to_string().contains("no connection to agent 3"));
    }
}
