//! Hierarchical addressing for coordinator, agents, workers and tests.
//!
//! Every routed message carries a source and a target [`Address`]. An address
//! names one node in the tree
//!
//! ```text
//! C ─┬─ C_A1 ─┬─ C_A1_W1 ─┬─ C_A1_W1_T1
//!    │        │           └─ C_A1_W1_T2
//!    │        └─ C_A1_W2
//!    └─ C_A2
//! ```
//!
//! The coordinator is the single root, so its component is implied. Index `0`
//! in any component below the address level is a wildcard ("all children").

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::SimError;

/// Depth of an address in the routing tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AddressLevel {
    /// The coordinator (root).
    Coordinator,
    /// An agent process on a remote machine.
    Agent,
    /// A worker process spawned by an agent.
    Worker,
    /// A test instance running inside a worker.
    Test,
}

impl fmt::Display for AddressLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Coordinator => "COORDINATOR",
            Self::Agent => "AGENT",
            Self::Worker => "WORKER",
            Self::Test => "TEST",
        };
        f.write_str(name)
    }
}

/// Immutable routing key: `(level, agent, worker, test)`.
///
/// Components below `level` are always zero. Equality and ordering are
/// structural, so addresses can be used directly as map keys.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address {
    level: AddressLevel,
    agent_index: u32,
    worker_index: u32,
    test_index: u32,
}

impl Address {
    /// The coordinator address.
    pub const COORDINATOR: Address = Address {
        level: AddressLevel::Coordinator,
        agent_index: 0,
        worker_index: 0,
        test_index: 0,
    };

    /// Wildcard address matching every worker on every agent.
    pub const ALL_WORKERS: Address = Address {
        level: AddressLevel::Worker,
        agent_index: 0,
        worker_index: 0,
        test_index: 0,
    };

    /// Address of an agent.
    pub const fn agent(agent_index: u32) -> Self {
        Self {
            level: AddressLevel::Agent,
            agent_index,
            worker_index: 0,
            test_index: 0,
        }
    }

    /// Address of a worker on an agent.
    pub const fn worker(agent_index: u32, worker_index: u32) -> Self {
        Self {
            level: AddressLevel::Worker,
            agent_index,
            worker_index,
            test_index: 0,
        }
    }

    /// Address of a test instance inside a worker.
    pub const fn test(agent_index: u32, worker_index: u32, test_index: u32) -> Self {
        Self {
            level: AddressLevel::Test,
            agent_index,
            worker_index,
            test_index,
        }
    }

    /// The level of this address.
    pub fn level(&self) -> AddressLevel {
        self.level
    }

    /// Agent component (0 for the coordinator or the agent wildcard).
    pub fn agent_index(&self) -> u32 {
        self.agent_index
    }

    /// Worker component.
    pub fn worker_index(&self) -> u32 {
        self.worker_index
    }

    /// Test component.
    pub fn test_index(&self) -> u32 {
        self.test_index
    }

    /// The component used to route at `level`.
    ///
    /// The coordinator level has no component and always yields 0.
    pub fn index_for(&self, level: AddressLevel) -> u32 {
        match level {
            AddressLevel::Coordinator => 0,
            AddressLevel::Agent => self.agent_index,
            AddressLevel::Worker => self.worker_index,
            AddressLevel::Test => self.test_index,
        }
    }

    /// The enclosing address one level up. The coordinator is its own parent.
    pub fn parent(&self) -> Self {
        match self.level {
            AddressLevel::Coordinator | AddressLevel::Agent => Self::COORDINATOR,
            AddressLevel::Worker => Self::agent(self.agent_index),
            AddressLevel::Test => Self::worker(self.agent_index, self.worker_index),
        }
    }

    /// The address of child `index` one level down, or `None` at test level.
    pub fn child(&self, index: u32) -> Option<Self> {
        match self.level {
            AddressLevel::Coordinator => Some(Self::agent(index)),
            AddressLevel::Agent => Some(Self::worker(self.agent_index, index)),
            AddressLevel::Worker => Some(Self::test(self.agent_index, self.worker_index, index)),
            AddressLevel::Test => None,
        }
    }

    /// The ancestor (or self) of this address at `level`.
    ///
    /// Returns `None` if `level` is deeper than this address.
    pub fn ancestor_at(&self, level: AddressLevel) -> Option<Self> {
        if level > self.level {
            return None;
        }
        let mut current = *self;
        while current.level > level {
            current = current.parent();
        }
        Some(current)
    }

    /// True if `concrete` is covered by this (possibly wildcard) address.
    pub fn matches(&self, concrete: &Address) -> bool {
        if self.level != concrete.level {
            return false;
        }
        let component = |mine: u32, theirs: u32| mine == 0 || mine == theirs;
        component(self.agent_index, concrete.agent_index)
            && component(self.worker_index, concrete.worker_index)
            && component(self.test_index, concrete.test_index)
    }
}

fn write_component(f: &mut fmt::Formatter<'_>, prefix: char, index: u32) -> fmt::Result {
    if index == 0 {
        write!(f, "_{prefix}*")
    } else {
        write!(f, "_{prefix}{index}")
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("C")?;
        if self.level >= AddressLevel::Agent {
            write_component(f, 'A', self.agent_index)?;
        }
        if self.level >= AddressLevel::Worker {
            write_component(f, 'W', self.worker_index)?;
        }
        if self.level >= AddressLevel::Test {
            write_component(f, 'T', self.test_index)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({self})")
    }
}

impl FromStr for Address {
    type Err = SimError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || SimError::InvalidAddress(s.to_string());
        let mut parts = s.split('_');
        if parts.next() != Some("C") {
            return Err(invalid());
        }

        let mut address = Address::COORDINATOR;
        for (part, expected) in parts.zip(['A', 'W', 'T']) {
            let mut chars = part.chars();
            if chars.next() != Some(expected) {
                return Err(invalid());
            }
            let rest = chars.as_str();
            let index = if rest == "*" {
                0
            } else {
                rest.parse::<u32>().map_err(|_| invalid())?
            };
            address = address.child(index).ok_or_else(invalid)?;
        }

        if address.to_string().split('_').count() != s.split('_').count() {
            return Err(invalid());
        }
        Ok(address)
    }
}
