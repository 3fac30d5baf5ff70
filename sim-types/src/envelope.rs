//! Envelope and response - the routed wire format.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{Address, Operation, OperationType, SimError};

/// Wraps an encoded [`Operation`] with routing metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Sender address
    pub source: Address,
    /// Destination address (may contain wildcards)
    pub target: Address,
    /// Pairs the eventual [`Response`] with this request
    pub correlation_id: u64,
    /// Operation type discriminator
    pub op_type: u8,
    /// MessagePack-encoded operation
    pub payload: Vec<u8>,
}

impl Envelope {
    /// Encode `operation` into a new envelope.
    pub fn new(
        source: Address,
        target: Address,
        correlation_id: u64,
        operation: &Operation,
    ) -> Result<Self, SimError> {
        Ok(Self {
            source,
            target,
            correlation_id,
            op_type: operation.op_type() as u8,
            payload: operation.to_bytes()?,
        })
    }

    /// Get the operation type as an enum.
    pub fn operation_type(&self) -> Result<OperationType, SimError> {
        OperationType::try_from(self.op_type)
    }

    /// Decode the payload, checking it against the type tag.
    pub fn operation(&self) -> Result<Operation, SimError> {
        let expected = self.operation_type()?;
        let operation = Operation::from_bytes(&self.payload)?;
        if operation.op_type() != expected {
            return Err(SimError::OperationTypeMismatch {
                expected: expected.to_string(),
                actual: operation.op_type().to_string(),
            });
        }
        Ok(operation)
    }

    /// Serialize to MessagePack bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, SimError> {
        rmp_serde::to_vec(self).map_err(SimError::Serialization)
    }

    /// Deserialize from MessagePack bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SimError> {
        rmp_serde::from_slice(bytes).map_err(SimError::Deserialization)
    }
}

/// Outcome of processing one operation. Every operation yields exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResponseType {
    /// The operation was executed
    Success,
    /// The coordinator could not be reached
    FailureCoordinatorNotFound,
    /// No agent matched the target address
    FailureAgentNotFound,
    /// No worker matched the target address
    FailureWorkerNotFound,
    /// The worker did not answer in time
    FailureWorkerTimeout,
    /// The receiving processor has no handler for the operation type
    UnsupportedOperationOnThisProcessor,
    /// The handler raised an error
    ExceptionDuringOperationExecution,
}

impl ResponseType {
    /// True for [`ResponseType::Success`].
    pub fn is_success(self) -> bool {
        self == ResponseType::Success
    }
}

impl fmt::Display for ResponseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResponseType::Success => "SUCCESS",
            ResponseType::FailureCoordinatorNotFound => "FAILURE_COORDINATOR_NOT_FOUND",
            ResponseType::FailureAgentNotFound => "FAILURE_AGENT_NOT_FOUND",
            ResponseType::FailureWorkerNotFound => "FAILURE_WORKER_NOT_FOUND",
            ResponseType::FailureWorkerTimeout => "FAILURE_WORKER_TIMEOUT",
            ResponseType::UnsupportedOperationOnThisProcessor => {
                "UNSUPPORTED_OPERATION_ON_THIS_PROCESSOR"
            }
            ResponseType::ExceptionDuringOperationExecution => {
                "EXCEPTION_DURING_OPERATION_EXECUTION"
            }
        };
        f.write_str(name)
    }
}

/// Reply to an [`Envelope`], matched by correlation id.
///
/// A response to a wildcard envelope carries one entry per concrete
/// recipient that processed it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    /// Correlation id of the request
    pub correlation_id: u64,
    /// Per-recipient results
    pub parts: Vec<ResponsePart>,
}

/// Result of one recipient processing an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponsePart {
    /// Address that produced this result
    pub address: Address,
    /// Outcome
    pub response_type: ResponseType,
    /// Optional payload (error text or result data)
    pub payload: Option<String>,
}

impl Response {
    /// Single-part response.
    pub fn single(correlation_id: u64, address: Address, response_type: ResponseType) -> Self {
        Self {
            correlation_id,
            parts: vec![ResponsePart {
                address,
                response_type,
                payload: None,
            }],
        }
    }

    /// Single-part response with a payload.
    pub fn with_payload(
        correlation_id: u64,
        address: Address,
        response_type: ResponseType,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            correlation_id,
            parts: vec![ResponsePart {
                address,
                response_type,
                payload: Some(payload.into()),
            }],
        }
    }

    /// The first non-success part, if any.
    pub fn first_error(&self) -> Option<&ResponsePart> {
        self.parts.iter().find(|p| !p.response_type.is_success())
    }

    /// True if every part succeeded.
    pub fn is_success(&self) -> bool {
        self.first_error().is_none()
    }
}

/// Top-level unit on a coordinator/agent connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    /// A routed request
    Request(Envelope),
    /// A reply to an earlier request
    Response(Response),
}

impl Frame {
    /// Serialize to MessagePack bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, SimError> {
        rmp_serde::to_vec(self).map_err(SimError::Serialization)
    }

    /// Deserialize from MessagePack bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SimError> {
        rmp_serde::from_slice(bytes).map_err(SimError::Deserialization)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TestPhase;

    #[test]
    fn envelope_serialize_roundtrip() {
        let op = Operation::StartTestPhase {
            phase: TestPhase::GlobalVerify,
        };
        let envelope =
            Envelope::new(Address::COORDINATOR, Address::test(1, 2, 3), 42, &op).unwrap();

        let bytes = envelope.to_bytes().unwrap();
        let restored = Envelope::from_bytes(&bytes).unwrap();

        assert_eq!(restored.source, Address::COORDINATOR);
        assert_eq!(restored.target, Address::test(1, 2, 3));
        assert_eq!(restored.op_type, OperationType::StartTestPhase as u8);
        assert_eq!(restored.payload, envelope.payload);
        assert_eq!(restored.operation().unwrap(), op);
    }

    #[test]
    fn mismatched_tag_is_rejected() {
        let mut envelope =
            Envelope::new(Address::COORDINATOR, Address::agent(1), 1, &Operation::StopTest)
                .unwrap();
        envelope.op_type = OperationType::Log as u8;
        assert!(matches!(
            envelope.operation(),
            Err(SimError::OperationTypeMismatch { .. })
        ));
    }

    #[test]
    fn first_error_finds_the_failed_recipient() {
        let mut response = Response::single(5, Address::worker(1, 1), ResponseType::Success);
        assert!(response.is_success());
        response.parts.push(ResponsePart {
            address: Address::worker(1, 2),
            response_type: ResponseType::FailureWorkerTimeout,
            payload: Some("silent".into()),
        });
        let error = response.first_error().unwrap();
        assert_eq!(error.address, Address::worker(1, 2));
        assert_eq!(error.response_type.to_string(), "FAILURE_WORKER_TIMEOUT");
        assert!(!response.is_success());
    }

    #[test]
    fn frame_roundtrip() {
        let frame = Frame::Response(Response::with_payload(
            9,
            Address::agent(1),
            ResponseType::ExceptionDuringOperationExecution,
            "boom",
        ));
        let restored = Frame::from_bytes(&frame.to_bytes().unwrap()).unwrap();
        assert_eq!(restored, frame);
    }
}
