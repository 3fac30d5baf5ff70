//! Run configuration and target-worker selection.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sim_types::{Address, FailureType, TestPhase, WorkerRole};

/// Which workers execute the run phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TargetType {
    /// Every worker.
    All,
    /// Member workers only.
    Member,
    /// Client workers only.
    Client,
    /// Client workers if there are any, member workers otherwise.
    PreferClient,
}

impl TargetType {
    /// Identifier accepted on the command line.
    pub fn id(self) -> &'static str {
        match self {
            TargetType::All => "all",
            TargetType::Member => "member",
            TargetType::Client => "client",
            TargetType::PreferClient => "prefer_client",
        }
    }
}

impl fmt::Display for TargetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for TargetType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        [
            TargetType::All,
            TargetType::Member,
            TargetType::Client,
            TargetType::PreferClient,
        ]
        .into_iter()
        .find(|t| t.id() == normalized)
        .ok_or_else(|| format!("unknown target type '{s}'"))
    }
}

/// Target type plus how many workers to pick (0 = all of that type).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetSelection {
    /// Which roles qualify.
    pub target_type: TargetType,
    /// Maximum number of targets; 0 selects every qualifying worker.
    pub count: usize,
}

impl Default for TargetSelection {
    fn default() -> Self {
        Self {
            target_type: TargetType::PreferClient,
            count: 0,
        }
    }
}

impl TargetSelection {
    /// Pick target workers from `workers`, in address order.
    ///
    /// Returns an empty list when no worker qualifies.
    pub fn select(&self, workers: &[(Address, WorkerRole)]) -> Vec<Address> {
        let has_clients = workers.iter().any(|(_, role)| *role == WorkerRole::Client);
        let qualifies = |role: WorkerRole| match self.target_type {
            TargetType::All => true,
            TargetType::Member => role.is_member(),
            TargetType::Client => role == WorkerRole::Client,
            TargetType::PreferClient if has_clients => role == WorkerRole::Client,
            TargetType::PreferClient => role.is_member(),
        };

        let mut selected: Vec<Address> = workers
            .iter()
            .filter(|(_, role)| qualifies(*role))
            .map(|(address, _)| *address)
            .collect();
        selected.sort();
        if self.count > 0 {
            selected.truncate(self.count);
        }
        selected
    }
}

/// Immutable settings for one run, built once before execution begins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunConfiguration {
    /// Length of the run phase; zero means no timed stop.
    pub duration: Duration,
    /// Length of the timed warmup; zero means a plain warmup phase.
    pub warmup: Duration,
    /// Wait for the test to finish its run phase by itself.
    pub wait_for_test_case: bool,
    /// Run all tests concurrently instead of one after another.
    pub parallel: bool,
    /// Abort the run on the first critical failure.
    pub fail_fast: bool,
    /// Execute verification phases.
    pub verify_enabled: bool,
    /// Last phase that is barrier-synchronized across parallel tests.
    pub last_phase_to_sync: TestPhase,
    /// Which workers execute the run phase.
    pub target: TargetSelection,
    /// Failure types that never force an abort.
    pub tolerable_failures: BTreeSet<FailureType>,
    /// Delay between spawning consecutive workers on one agent.
    pub worker_startup_delay: Duration,
}

impl Default for RunConfiguration {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(60),
            warmup: Duration::ZERO,
            wait_for_test_case: false,
            parallel: false,
            fail_fast: true,
            verify_enabled: true,
            last_phase_to_sync: TestPhase::last(),
            target: TargetSelection::default(),
            tolerable_failures: BTreeSet::from([FailureType::WorkerTimeout]),
            worker_startup_delay: Duration::ZERO,
        }
    }
}

impl RunConfiguration {
    /// True if `phase` is followed by a barrier across parallel tests.
    pub fn is_synced(&self, phase: TestPhase) -> bool {
        self.parallel && phase <= self.last_phase_to_sync
    }
}
