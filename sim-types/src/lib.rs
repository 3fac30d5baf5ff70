//! # sim-types
//!
//! Wire format types for the simulator coordinator/agent/worker protocol.
//!
//! This crate provides the foundational types used across all simulator crates:
//! - [`Address`] - Hierarchical routing keys
//! - [`Operation`], [`OperationType`] - Protocol commands and notifications
//! - [`Envelope`], [`Response`], [`Frame`] - Routed wire wrappers
//! - [`TestPhase`], [`FailureRecord`] - Test lifecycle and failure reports
//! - [`read_frame`], [`write_frame`] - Length-prefixed stream framing
//! - [`SimError`] - Error types

#![warn(missing_docs)]
#![warn(clippy::all)]

mod address;
mod envelope;
mod error;
mod failure;
mod frame;
mod model;
mod operations;
mod phase;
mod worker;

pub use address::{Address, AddressLevel};
pub use envelope::{Envelope, Frame, Response, ResponsePart, ResponseType};
pub use error::SimError;
pub use failure::{FailureRecord, FailureType};
pub use frame::{read_frame, write_frame, MAX_FRAME_SIZE};
pub use model::{AgentData, TestCase, WorkerProcessSpec, WorkerRole};
pub use operations::{Operation, OperationType};
pub use phase::TestPhase;
pub use worker::{WorkerCommand, WorkerReply};
