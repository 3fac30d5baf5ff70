//! Failure reports sent by agents and workers.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::{Address, SimError};

/// Closed set of failure kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FailureType {
    /// A test threw inside a worker.
    WorkerException,
    /// A worker stopped answering liveness pings.
    WorkerTimeout,
    /// A worker ran out of memory.
    WorkerOom,
    /// A worker process exited unexpectedly.
    WorkerExit,
    /// A worker finished its work and exited.
    WorkerFinished,
    /// A worker process exited with status 0 after being asked to stop.
    WorkerNormalExit,
}

impl FailureType {
    /// All failure types.
    pub const ALL: [FailureType; 6] = [
        FailureType::WorkerException,
        FailureType::WorkerTimeout,
        FailureType::WorkerOom,
        FailureType::WorkerExit,
        FailureType::WorkerFinished,
        FailureType::WorkerNormalExit,
    ];

    /// Identifier used on the command line and in failure files.
    pub fn id(self) -> &'static str {
        match self {
            FailureType::WorkerException => "workerException",
            FailureType::WorkerTimeout => "workerTimeout",
            FailureType::WorkerOom => "workerOom",
            FailureType::WorkerExit => "workerExit",
            FailureType::WorkerFinished => "workerFinished",
            FailureType::WorkerNormalExit => "workerNormalExit",
        }
    }

    /// True for reports that announce a normal end of a worker.
    ///
    /// These are recorded but can never be critical.
    pub fn is_informational(self) -> bool {
        matches!(self, FailureType::WorkerFinished | FailureType::WorkerNormalExit)
    }

    /// True if the failure implies the worker process is gone.
    pub fn is_worker_gone(self) -> bool {
        matches!(
            self,
            FailureType::WorkerExit
                | FailureType::WorkerOom
                | FailureType::WorkerFinished
                | FailureType::WorkerNormalExit
        )
    }

    /// Parse a comma-separated list of failure ids.
    ///
    /// Empty input yields an empty set.
    pub fn parse_set(value: &str) -> Result<BTreeSet<FailureType>, SimError> {
        value
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(FailureType::from_str)
            .collect()
    }
}

impl fmt::Display for FailureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for FailureType {
    type Err = SimError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FailureType::ALL
            .into_iter()
            .find(|t| t.id().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| SimError::UnknownFailureType(s.to_string()))
    }
}

/// A single failure report. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    /// Failure kind.
    pub failure_type: FailureType,
    /// Address of the reporting worker (or agent).
    pub address: Address,
    /// Stable worker identifier (e.g. "C_A1_W2-member").
    pub worker_id: String,
    /// Id of the test the failure belongs to, if any.
    pub test_id: Option<String>,
    /// Failure description.
    pub message: String,
    /// Stack trace or process output, if any.
    pub stacktrace: Option<String>,
    /// Unix timestamp in milliseconds.
    pub timestamp: u64,
}

impl FailureRecord {
    /// Create a record stamped with the current time.
    pub fn new(
        failure_type: FailureType,
        address: Address,
        worker_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            failure_type,
            address,
            worker_id: worker_id.into(),
            test_id: None,
            message: message.into(),
            stacktrace: None,
            timestamp: now_millis(),
        }
    }

    /// Attach the id of the affected test.
    pub fn with_test_id(mut self, test_id: impl Into<String>) -> Self {
        self.test_id = Some(test_id.into());
        self
    }

    /// Attach a stack trace.
    pub fn with_stacktrace(mut self, stacktrace: impl Into<String>) -> Self {
        self.stacktrace = Some(stacktrace.into());
        self
    }
}

impl fmt::Display for FailureRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Failure[")?;
        writeln!(f, "   message='{}'", self.message)?;
        writeln!(f, "   type={}", self.failure_type)?;
        writeln!(f, "   timestamp={}", self.timestamp)?;
        writeln!(f, "   workerAddress={}", self.address)?;
        writeln!(f, "   workerId={}", self.worker_id)?;
        writeln!(f, "   test={}", self.test_id.as_deref().unwrap_or("unknown"))?;
        match &self.stacktrace {
            Some(trace) => writeln!(f, "   cause={trace}")?,
            None => writeln!(f, "   cause=null")?,
        }
        write!(f, "]")
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_failure_set() {
        let set = FailureType::parse_set("workerTimeout, workerOom").unwrap();
        assert_eq!(set.len(), 2);
        assert!(set.contains(&FailureType::WorkerTimeout));
        assert!(set.contains(&FailureType::WorkerOom));
        assert!(FailureType::parse_set("").unwrap().is_empty());
        assert!(FailureType::parse_set("workerTimeout,bogus").is_err());
    }

    #[test]
    fn id_roundtrip() {
        for t in FailureType::ALL {
            assert_eq!(t.id().parse::<FailureType>().unwrap(), t);
        }
    }

    #[test]
    fn display_contains_fields() {
        let record = FailureRecord::new(
            FailureType::WorkerException,
            Address::worker(1, 1),
            "C_A1_W1-member",
            "boom",
        )
        .with_test_id("MapTest");
        let text = record.to_string();
        assert!(text.contains("message='boom'"));
        assert!(text.contains("workerAddress=C_A1_W1"));
        assert!(text.contains("test=MapTest"));
    }
}
