//! CLI command implementations.

pub mod clean;
pub mod run;

/// Exit code of a run that failed to set up or hit a critical failure
/// under fail-fast.
pub const EXIT_FAILURE: u8 = 1;

/// Exit code for bad arguments, input files or configuration.
pub const EXIT_USAGE: u8 = 2;
