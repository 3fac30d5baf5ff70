//! # sim-coordinator
//!
//! Coordinator for distributed simulator runs.
//!
//! The coordinator:
//! - Computes the cluster layout and starts workers on every agent
//! - Drives each test of the suite through its phases, sequentially or in
//!   parallel with cross-test barriers
//! - Collects failure reports and aborts the run on critical failures
//! - Pings workers and reports the ones that stop answering
//!
//! ## Architecture
//!
//! ```text
//!            ┌───────────────────────────────┐
//!            │        sim-coordinator        │
//!            │  RunSuiteTask ─► RemoteClient │
//!            │        ▲              │       │
//!            │ FailureContainer  Connector   │
//!            └────────┬──────────────┬───────┘
//!                     │   TCP        │
//!              ┌──────┴─────┐ ┌──────┴─────┐
//!              │  agent A1  │ │  agent A2  │
//!              └──┬──────┬──┘ └──┬──────┬──┘
//!               W1      W2      W1      W2
//! ```
//!
//! ## Protocol
//!
//! Frames are a 4-byte big-endian length followed by a MessagePack
//! [`sim_types::Frame`]. Requests carry an [`sim_types::Envelope`] with
//! source/target addresses and a correlation id; every request gets exactly
//! one [`sim_types::Response`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod connector;
pub mod coordinator;
pub mod counters;
pub mod engine;
pub mod error;
pub mod failure;
pub mod listeners;
pub mod registry;
pub mod remote_client;
pub mod ssh;
pub mod tasks;

pub use config::{ConfigError, SimulatorProperties};
pub use connector::CoordinatorConnector;
pub use coordinator::{Coordinator, CoordinatorParameters, RunOutcome};
pub use engine::RunSuiteTask;
pub use error::{ConnectorError, CoordinatorError, DispatchError, Result};
pub use failure::{FailureContainer, FailureListener};
pub use registry::ComponentRegistry;
pub use remote_client::{RemoteClient, RemoteClientSettings, RemoteDispatch};
