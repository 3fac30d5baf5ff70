//! # sim-agent
//!
//! Agent process for distributed simulator runs. One agent runs on every
//! load-generating machine.
//!
//! The agent:
//! - Accepts the coordinator's connection and answers every request
//! - Spawns worker processes on `CreateWorker` and keeps them supervised
//! - Relays worker- and test-addressed operations into the workers
//! - Forwards worker notifications and process exits to the coordinator
//!
//! ## Architecture
//!
//! ```text
//!         coordinator
//!              │ TCP (length-prefixed MessagePack frames)
//!     ┌────────┴─────────────────────────┐
//!     │          AgentConnector          │
//!     │   agent ops ─► OperationProcessor│
//!     │  worker ops ─► WorkerSupervisor  │
//!     └──────┬──────────────┬────────────┘
//!            │ stdin/stdout │ (JSON lines)
//!        worker W1      worker W2
//! ```
//!
//! ## Worker pipe
//!
//! Commands go to the worker as one [`sim_types::WorkerCommand`] per line;
//! the worker answers with [`sim_types::WorkerReply`] lines, either a
//! response to a command or an unsolicited notification.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod connector;
pub mod error;
pub mod launcher;
pub mod processor;
pub mod supervisor;

pub use config::AgentConfig;
pub use connector::AgentConnector;
pub use error::{AgentError, Result, SupervisorError};
pub use launcher::{LaunchedWorker, ProcessLauncher, WorkerLauncher, WorkerProcess};
pub use processor::AgentOperationProcessor;
pub use supervisor::{CommandOutcome, WorkerSupervisor};
