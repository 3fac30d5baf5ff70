//! Messages on the agent/worker pipe.
//!
//! The agent writes one JSON [`WorkerCommand`] per line to the worker's
//! stdin and reads one JSON [`WorkerReply`] per line from its stdout.

use serde::{Deserialize, Serialize};

use crate::{Address, Operation, ResponseType, SimError};

/// A command delivered to a worker process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerCommand {
    /// Agent-local id used to match the reply
    pub correlation_id: u64,
    /// Worker or test address the command targets
    pub target: Address,
    /// The operation to execute
    pub operation: Operation,
}

/// A line emitted by a worker process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerReply {
    /// Reply to a [`WorkerCommand`].
    Response {
        /// Correlation id of the command
        correlation_id: u64,
        /// Outcome
        response_type: ResponseType,
        /// Optional error text
        payload: Option<String>,
    },
    /// Unsolicited operation sent upstream (phase completion, failure).
    Notify {
        /// Address the notification originates from
        source: Address,
        /// The operation
        operation: Operation,
    },
}

impl WorkerCommand {
    /// Encode as a single JSON line (newline included).
    pub fn to_line(&self) -> Result<String, SimError> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    /// Decode from a JSON line.
    pub fn from_line(line: &str) -> Result<Self, SimError> {
        Ok(serde_json::from_str(line.trim_end())?)
    }
}

impl WorkerReply {
    /// Encode as a single JSON line (newline included).
    pub fn to_line(&self) -> Result<String, SimError> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    /// Decode from a JSON line.
    pub fn from_line(line: &str) -> Result<Self, SimError> {
        Ok(serde_json::from_str(line.trim_end())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TestPhase;

    #[test]
    fn command_is_one_line() {
        let command = WorkerCommand {
            correlation_id: 3,
            target: Address::test(1, 1, 2),
            operation: Operation::StartTestPhase {
                phase: TestPhase::Setup,
            },
        };
        let line = command.to_line().unwrap();
        assert_eq!(line.matches('\n').count(), 1);
        assert_eq!(WorkerCommand::from_line(&line).unwrap(), command);
    }

    #[test]
    fn reply_parses_from_worker_output() {
        let reply = WorkerReply::Notify {
            source: Address::test(1, 1, 2),
            operation: Operation::PhaseCompleted {
                test_index: 2,
                phase: TestPhase::Run,
            },
        };
        let line = reply.to_line().unwrap();
        assert!(line.contains("\"kind\":\"notify\""));
        assert_eq!(WorkerReply::from_line(&line).unwrap(), reply);
    }
}
