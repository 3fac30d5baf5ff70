//! Error types for the simulator wire protocol.

use thiserror::Error;

/// Errors that can occur while encoding, decoding or framing protocol data.
#[derive(Debug, Error)]
pub enum SimError {
    /// MessagePack serialization failed
    #[error("serialization failed: {0}")]
    Serialization(#[source] rmp_serde::encode::Error),

    /// MessagePack deserialization failed
    #[error("deserialization failed: {0}")]
    Deserialization(#[source] rmp_serde::decode::Error),

    /// JSON line encoding/decoding failed (worker pipe)
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid operation type discriminator
    #[error("invalid operation type: {0}")]
    InvalidOperationType(u8),

    /// Operation payload does not match the envelope's type tag
    #[error("operation type mismatch: envelope says {expected}, payload is {actual}")]
    OperationTypeMismatch {
        /// Tag carried by the envelope.
        expected: String,
        /// Type of the decoded payload.
        actual: String,
    },

    /// Address string could not be parsed
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// Unknown test phase name
    #[error("unknown test phase: {0}")]
    UnknownPhase(String),

    /// Unknown failure type id
    #[error("unknown failure type: {0}")]
    UnknownFailureType(String),

    /// Frame exceeds the protocol maximum
    #[error("frame too large: {size} bytes (limit: {limit} bytes)")]
    FrameTooLarge {
        /// Announced frame size.
        size: usize,
        /// Maximum allowed size.
        limit: usize,
    },

    /// Underlying stream I/O failed
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = SimError::InvalidOperationType(99);
        assert_eq!(err.to_string(), "invalid operation type: 99");
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<SimError>();
    }
}
