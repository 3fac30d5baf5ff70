//! # sim-core
//!
//! Pure logic for the simulator (no I/O, instant tests).
//!
//! Everything the coordinator decides before it touches the network lives
//! here: where workers go, how command-line values and input files are
//! parsed, and the immutable settings of a run. Nothing in this crate
//! blocks, spawns or opens a socket.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod agents_file;
pub mod duration;
pub mod layout;
pub mod run_config;
pub mod suite;

pub use agents_file::parse_agents_file;
pub use duration::{parse_duration, DurationError};
pub use layout::{AgentWorkerLayout, ClusterLayout, ClusterLayoutParameters, LayoutError};
pub use run_config::{RunConfiguration, TargetSelection, TargetType};
pub use suite::{parse_overrides, ParseError, TestSuite};
