//! Component registry: agents, workers and tests of one run.
//!
//! The registry is the source of truth for placement and routing. It is
//! shared by the connector, the dispatch client and the phase engine, so
//! every collection is a concurrent map and each entry is mutated through
//! its own shard lock.

use dashmap::DashMap;
use sim_types::{Address, AgentData, TestCase, TestPhase, WorkerProcessSpec, WorkerRole};
use std::collections::BTreeSet;
use std::time::Instant;

/// A worker known to the coordinator.
#[derive(Debug, Clone)]
pub struct WorkerData {
    /// Worker address.
    pub address: Address,
    /// Spec the worker was spawned from.
    pub spec: WorkerProcessSpec,
    /// Stable worker id.
    pub worker_id: String,
    /// Last time the worker answered a ping.
    pub last_seen: Instant,
    /// True once a timeout has been reported for this worker.
    pub timeout_reported: bool,
    /// True once the worker announced it is gone.
    pub finished: bool,
}

/// A test of the suite and its phase progress.
#[derive(Debug, Clone)]
pub struct TestData {
    /// 1-based test index.
    pub test_index: u32,
    /// Test definition.
    pub test_case: TestCase,
    /// Latest phase reported complete; only advances.
    pub current_phase: Option<TestPhase>,
    /// Every phase at least one worker reported complete.
    pub completed_phases: BTreeSet<TestPhase>,
}

impl TestData {
    /// Address matching this test on every worker.
    pub fn address(&self) -> Address {
        Address::test(0, 0, self.test_index)
    }
}

/// In-memory inventory of agents, workers and tests.
#[derive(Debug, Default)]
pub struct ComponentRegistry {
    agents: DashMap<u32, AgentData>,
    workers: DashMap<Address, WorkerData>,
    tests: DashMap<u32, TestData>,
}

impl ComponentRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent, assigning the next index.
    pub fn add_agent(&self, public_address: &str, private_address: &str) -> AgentData {
        let agent = AgentData::new(self.agents.len() as u32 + 1, public_address, private_address);
        self.agents.insert(agent.address_index, agent.clone());
        agent
    }

    /// Register agents loaded from an agents file.
    pub fn add_agents(&self, agents: impl IntoIterator<Item = AgentData>) {
        for agent in agents {
            self.agents.insert(agent.address_index, agent);
        }
    }

    /// Number of agents.
    pub fn agent_count(&self) -> usize {
        self.agents.len()
    }

    /// All agents in index order.
    pub fn agents(&self) -> Vec<AgentData> {
        let mut agents: Vec<AgentData> = self.agents.iter().map(|e| e.value().clone()).collect();
        agents.sort_by_key(|a| a.address_index);
        agents
    }

    /// Look up an agent by index.
    pub fn agent(&self, agent_index: u32) -> Option<AgentData> {
        self.agents.get(&agent_index).map(|e| e.value().clone())
    }

    /// Register workers spawned on an agent.
    pub fn add_workers(&self, agent_index: u32, specs: &[WorkerProcessSpec]) {
        let now = Instant::now();
        for spec in specs {
            let address = Address::worker(agent_index, spec.worker_index);
            self.workers.insert(
                address,
                WorkerData {
                    address,
                    spec: spec.clone(),
                    worker_id: spec.worker_id(agent_index),
                    last_seen: now,
                    timeout_reported: false,
                    finished: false,
                },
            );
        }
    }

    /// Number of registered workers.
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// All workers in address order.
    pub fn workers(&self) -> Vec<WorkerData> {
        let mut workers: Vec<WorkerData> =
            self.workers.iter().map(|e| e.value().clone()).collect();
        workers.sort_by_key(|w| w.address);
        workers
    }

    /// Addresses of all workers in address order.
    pub fn worker_addresses(&self) -> Vec<Address> {
        self.workers().into_iter().map(|w| w.address).collect()
    }

    /// Addresses and roles of all workers.
    pub fn worker_roles(&self) -> Vec<(Address, WorkerRole)> {
        self.workers()
            .into_iter()
            .map(|w| (w.address, w.spec.role))
            .collect()
    }

    /// Look up a worker.
    pub fn worker(&self, address: Address) -> Option<WorkerData> {
        self.workers.get(&address).map(|e| e.value().clone())
    }

    /// The representative worker for global phases: the lowest address.
    pub fn first_worker(&self) -> Option<Address> {
        self.workers.iter().map(|e| *e.key()).min()
    }

    /// Record a ping answer. `last_seen` never moves backwards.
    pub fn record_pong(&self, address: Address, at: Instant) {
        if let Some(mut worker) = self.workers.get_mut(&address) {
            if at > worker.last_seen {
                worker.last_seen = at;
            }
        }
    }

    /// Mark that a timeout was reported. Returns false if it already was.
    pub fn mark_timeout_reported(&self, address: Address) -> bool {
        match self.workers.get_mut(&address) {
            Some(mut worker) if !worker.timeout_reported => {
                worker.timeout_reported = true;
                true
            }
            _ => false,
        }
    }

    /// Mark a worker as gone; it is no longer pinged.
    pub fn mark_finished(&self, address: Address) {
        if let Some(mut worker) = self.workers.get_mut(&address) {
            worker.finished = true;
        }
    }

    /// Register the tests of a suite, indexed from 1 in order.
    pub fn add_tests(&self, tests: &[TestCase]) {
        for test_case in tests {
            let test_index = self.tests.len() as u32 + 1;
            self.tests.insert(
                test_index,
                TestData {
                    test_index,
                    test_case: test_case.clone(),
                    current_phase: None,
                    completed_phases: BTreeSet::new(),
                },
            );
        }
    }

    /// All tests in index order.
    pub fn tests(&self) -> Vec<TestData> {
        let mut tests: Vec<TestData> = self.tests.iter().map(|e| e.value().clone()).collect();
        tests.sort_by_key(|t| t.test_index);
        tests
    }

    /// Look up a test by index.
    pub fn test(&self, test_index: u32) -> Option<TestData> {
        self.tests.get(&test_index).map(|e| e.value().clone())
    }

    /// Look up a test by id.
    pub fn test_by_id(&self, test_id: &str) -> Option<TestData> {
        self.tests
            .iter()
            .find(|e| e.value().test_case.id == test_id)
            .map(|e| e.value().clone())
    }

    /// Record a phase completion. `current_phase` only advances.
    pub fn record_phase_completed(&self, test_index: u32, phase: TestPhase) {
        if let Some(mut test) = self.tests.get_mut(&test_index) {
            test.completed_phases.insert(phase);
            if test.current_phase.map_or(true, |current| phase > current) {
                test.current_phase = Some(phase);
            }
        }
    }
}
