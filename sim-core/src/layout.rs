//! Cluster layout: which worker processes go on which agent machine.
//!
//! The layout is computed once per run, before any remote call is made.

use std::collections::BTreeMap;
use std::fmt;

use sim_types::{WorkerProcessSpec, WorkerRole};

/// Error type for layout computation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LayoutError {
    /// There are no agents to place workers on.
    #[error("no agents available")]
    NoAgents,

    /// Dedicated member machine count is negative.
    #[error("dedicated member machines can't be negative: {0}")]
    NegativeDedicatedMachines(i32),

    /// More dedicated member machines than agents.
    #[error("dedicated member machines ({dedicated}) can't be larger than the agent count ({agents})")]
    TooManyDedicatedMachines {
        /// Requested dedicated machines.
        dedicated: i32,
        /// Available agents.
        agents: usize,
    },

    /// Client workers were requested but every agent is dedicated to members.
    #[error("{clients} client workers requested but all {agents} agents are dedicated member machines")]
    NoClientMachines {
        /// Requested client workers.
        clients: u32,
        /// Available agents.
        agents: usize,
    },
}

/// Inputs to the layout algorithm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterLayoutParameters {
    /// Number of agent machines.
    pub agent_count: usize,
    /// Member workers to start; `None` means one per member machine.
    pub member_worker_count: Option<u32>,
    /// Lite member workers to start (placed like members).
    pub lite_member_worker_count: u32,
    /// Client workers to start.
    pub client_worker_count: u32,
    /// Agents reserved for member workers.
    pub dedicated_member_machines: i32,
    /// Options passed to member workers.
    pub member_jvm_options: String,
    /// Options passed to client workers.
    pub client_jvm_options: String,
    /// Overrides applied to every worker's cluster configuration.
    pub config_overrides: BTreeMap<String, String>,
}

impl ClusterLayoutParameters {
    /// Parameters with default worker counts for `agent_count` agents.
    pub fn new(agent_count: usize) -> Self {
        Self {
            agent_count,
            member_worker_count: None,
            lite_member_worker_count: 0,
            client_worker_count: 0,
            dedicated_member_machines: 0,
            member_jvm_options: String::new(),
            client_jvm_options: String::new(),
            config_overrides: BTreeMap::new(),
        }
    }
}

/// Workers placed on one agent.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AgentWorkerLayout {
    /// 0-based position of the agent in the agents list.
    pub agent_position: usize,
    /// Workers in spawn order; `worker_index` is 1-based per agent.
    pub workers: Vec<WorkerProcessSpec>,
}

impl AgentWorkerLayout {
    /// Number of workers with the given role.
    pub fn count(&self, role: WorkerRole) -> usize {
        self.workers.iter().filter(|w| w.role == role).count()
    }

    fn push(&mut self, role: WorkerRole, params: &ClusterLayoutParameters) {
        let mut spec = WorkerProcessSpec::new(self.workers.len() as u32 + 1, role);
        spec.jvm_options = match role {
            WorkerRole::Client => params.client_jvm_options.clone(),
            WorkerRole::Member | WorkerRole::LiteMember => params.member_jvm_options.clone(),
        };
        spec.config_overrides = params.config_overrides.clone();
        self.workers.push(spec);
    }
}

/// The computed placement of every worker process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterLayout {
    agents: Vec<AgentWorkerLayout>,
}

impl ClusterLayout {
    /// Compute the layout, validating the parameters first.
    pub fn compute(params: &ClusterLayoutParameters) -> Result<Self, LayoutError> {
        let agent_count = params.agent_count;
        if agent_count == 0 {
            return Err(LayoutError::NoAgents);
        }
        let dedicated = params.dedicated_member_machines;
        if dedicated < 0 {
            return Err(LayoutError::NegativeDedicatedMachines(dedicated));
        }
        if dedicated as usize > agent_count {
            return Err(LayoutError::TooManyDedicatedMachines {
                dedicated,
                agents: agent_count,
            });
        }
        let dedicated = dedicated as usize;

        let mut agents: Vec<AgentWorkerLayout> = (0..agent_count)
            .map(|agent_position| AgentWorkerLayout {
                agent_position,
                workers: Vec::new(),
            })
            .collect();

        if dedicated > 0 {
            if params.client_worker_count > 0 && dedicated == agent_count {
                return Err(LayoutError::NoClientMachines {
                    clients: params.client_worker_count,
                    agents: agent_count,
                });
            }
            let members = params.member_worker_count.unwrap_or(dedicated as u32);
            let (member_agents, client_agents) = agents.split_at_mut(dedicated);
            distribute_evenly(member_agents, members, WorkerRole::Member, params);
            distribute_evenly(
                member_agents,
                params.lite_member_worker_count,
                WorkerRole::LiteMember,
                params,
            );
            distribute_evenly(
                client_agents,
                params.client_worker_count,
                WorkerRole::Client,
                params,
            );
        } else {
            let members = params.member_worker_count.unwrap_or(agent_count as u32);
            let mut cursor = 0;
            for (count, role) in [
                (members, WorkerRole::Member),
                (params.lite_member_worker_count, WorkerRole::LiteMember),
                (params.client_worker_count, WorkerRole::Client),
            ] {
                for _ in 0..count {
                    agents[cursor % agent_count].push(role, params);
                    cursor += 1;
                }
            }
        }

        Ok(Self { agents })
    }

    /// Per-agent placements, indexed by agent position.
    pub fn agents(&self) -> &[AgentWorkerLayout] {
        &self.agents
    }

    /// Total number of workers with the given role.
    pub fn count(&self, role: WorkerRole) -> usize {
        self.agents.iter().map(|a| a.count(role)).sum()
    }

    /// Total number of workers.
    pub fn total_workers(&self) -> usize {
        self.agents.iter().map(|a| a.workers.len()).sum()
    }
}

impl fmt::Display for ClusterLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for agent in &self.agents {
            writeln!(
                f,
                "    Agent {} members: {}, lite members: {}, clients: {}",
                agent.agent_position + 1,
                agent.count(WorkerRole::Member),
                agent.count(WorkerRole::LiteMember),
                agent.count(WorkerRole::Client),
            )?;
        }
        Ok(())
    }
}

/// Spread `count` workers over `agents`, remainder to the earliest agents.
fn distribute_evenly(
    agents: &mut [AgentWorkerLayout],
    count: u32,
    role: WorkerRole,
    params: &ClusterLayoutParameters,
) {
    if agents.is_empty() {
        return;
    }
    let n = agents.len() as u32;
    let base = count / n;
    let remainder = count % n;
    for (i, agent) in agents.iter_mut().enumerate() {
        let share = base + u32::from((i as u32) < remainder);
        for _ in 0..share {
            agent.push(role, params);
        }
    }
}
