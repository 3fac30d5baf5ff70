//! Operations exchanged between coordinator, agents and workers.
//!
//! An [`Operation`] carries no routing information; the enclosing
//! [`Envelope`](crate::Envelope) supplies source and target addresses.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{Address, FailureRecord, SimError, TestCase, TestPhase, WorkerProcessSpec};

/// Operation type discriminator carried on the envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum OperationType {
    /// Log a line on the receiving process
    Log = 1,
    /// Spawn worker processes on an agent
    CreateWorker = 2,
    /// Terminate all workers of an agent
    TerminateWorkers = 3,
    /// Create a test instance inside a worker
    CreateTest = 4,
    /// Start one phase of a test
    StartTestPhase = 5,
    /// Start the timed run (or warmup) of a test
    StartTest = 6,
    /// Stop the timed run of a test
    StopTest = 7,
    /// A worker finished a phase
    PhaseCompleted = 8,
    /// Failure report
    Failure = 9,
    /// Liveness ping
    Ping = 10,
    /// Exercises the unsupported-operation path
    IntegrationTest = 11,
}

impl OperationType {
    /// All operation types in discriminator order.
    pub const ALL: [OperationType; 11] = [
        OperationType::Log,
        OperationType::CreateWorker,
        OperationType::TerminateWorkers,
        OperationType::CreateTest,
        OperationType::StartTestPhase,
        OperationType::StartTest,
        OperationType::StopTest,
        OperationType::PhaseCompleted,
        OperationType::Failure,
        OperationType::Ping,
        OperationType::IntegrationTest,
    ];

    /// Position in [`OperationType::ALL`], usable as a counter index.
    pub fn index(self) -> usize {
        self as usize - 1
    }
}

impl TryFrom<u8> for OperationType {
    type Error = SimError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(OperationType::Log),
            2 => Ok(OperationType::CreateWorker),
            3 => Ok(OperationType::TerminateWorkers),
            4 => Ok(OperationType::CreateTest),
            5 => Ok(OperationType::StartTestPhase),
            6 => Ok(OperationType::StartTest),
            7 => Ok(OperationType::StopTest),
            8 => Ok(OperationType::PhaseCompleted),
            9 => Ok(OperationType::Failure),
            10 => Ok(OperationType::Ping),
            11 => Ok(OperationType::IntegrationTest),
            _ => Err(SimError::InvalidOperationType(value)),
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// All protocol operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Operation {
    /// Log a message on the receiver.
    Log {
        /// Message text
        message: String,
    },
    /// Spawn the given workers on the receiving agent.
    CreateWorker {
        /// One spec per worker
        specs: Vec<WorkerProcessSpec>,
        /// Delay between consecutive spawns, in milliseconds
        startup_delay_ms: u64,
    },
    /// Terminate every worker of the receiving agent.
    TerminateWorkers {
        /// True if member workers should be given time to shut down
        member_shutdown_delay: bool,
    },
    /// Create a test instance in a worker.
    CreateTest {
        /// 1-based index of the test in the suite
        test_index: u32,
        /// Test definition
        test_case: TestCase,
    },
    /// Start a (non-run) phase of a test.
    StartTestPhase {
        /// Phase to start
        phase: TestPhase,
    },
    /// Start the run (or timed warmup) of a test.
    StartTest {
        /// True if this is a timed warmup rather than the measured run
        warmup: bool,
        /// Workers that should generate load; empty means all
        targets: Vec<Address>,
    },
    /// Stop the running test.
    StopTest,
    /// Notification that a worker finished a phase.
    PhaseCompleted {
        /// Test index the phase belongs to
        test_index: u32,
        /// Phase that completed
        phase: TestPhase,
    },
    /// Failure report.
    Failure(FailureRecord),
    /// Liveness ping.
    Ping {
        /// Sender timestamp in milliseconds
        timestamp: u64,
    },
    /// Operation no processor handles.
    IntegrationTest {
        /// Arbitrary payload
        data: String,
    },
}

impl Operation {
    /// The type tag of this operation.
    pub fn op_type(&self) -> OperationType {
        match self {
            Operation::Log { .. } => OperationType::Log,
            Operation::CreateWorker { .. } => OperationType::CreateWorker,
            Operation::TerminateWorkers { .. } => OperationType::TerminateWorkers,
            Operation::CreateTest { .. } => OperationType::CreateTest,
            Operation::StartTestPhase { .. } => OperationType::StartTestPhase,
            Operation::StartTest { .. } => OperationType::StartTest,
            Operation::StopTest => OperationType::StopTest,
            Operation::PhaseCompleted { .. } => OperationType::PhaseCompleted,
            Operation::Failure(_) => OperationType::Failure,
            Operation::Ping { .. } => OperationType::Ping,
            Operation::IntegrationTest { .. } => OperationType::IntegrationTest,
        }
    }

    /// Serialize to MessagePack bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, SimError> {
        rmp_serde::to_vec_named(self).map_err(SimError::Serialization)
    }

    /// Deserialize from MessagePack bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SimError> {
        rmp_serde::from_slice(bytes).map_err(SimError::Deserialization)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FailureType, WorkerRole};

    #[test]
    fn operation_type_roundtrip() {
        for op_type in OperationType::ALL {
            assert_eq!(OperationType::try_from(op_type as u8).unwrap(), op_type);
        }
        assert_eq!(OperationType::Log.index(), 0);
        assert_eq!(OperationType::IntegrationTest.index(), 10);
    }

    #[test]
    fn invalid_operation_type_fails() {
        assert!(OperationType::try_from(0).is_err());
        assert!(OperationType::try_from(12).is_err());
    }

    #[test]
    fn op_type_matches_variant() {
        let op = Operation::CreateWorker {
            specs: vec![WorkerProcessSpec::new(1, WorkerRole::Member)],
            startup_delay_ms: 0,
        };
        assert_eq!(op.op_type(), OperationType::CreateWorker);
        assert_eq!(Operation::StopTest.op_type(), OperationType::StopTest);
    }

    #[test]
    fn failure_operation_survives_msgpack() {
        let record = FailureRecord::new(
            FailureType::WorkerOom,
            Address::worker(2, 1),
            "C_A2_W1-member",
            "out of memory",
        )
        .with_test_id("MapTest");
        let op = Operation::Failure(record);
        let restored = Operation::from_bytes(&op.to_bytes().unwrap()).unwrap();
        assert_eq!(restored, op);
    }
}
