//! Shared data model: agent machines, worker specs and test cases.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::Address;

/// One provisioned agent machine. Immutable after the registry is loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentData {
    /// 1-based agent index used in [`Address::agent`].
    pub address_index: u32,
    /// Address the coordinator uses to reach the machine.
    pub public_address: String,
    /// Address workers use to reach each other (equals public if not given).
    pub private_address: String,
}

impl AgentData {
    /// Create agent data for the given index.
    pub fn new(
        address_index: u32,
        public_address: impl Into<String>,
        private_address: impl Into<String>,
    ) -> Self {
        Self {
            address_index,
            public_address: public_address.into(),
            private_address: private_address.into(),
        }
    }

    /// Routing address of this agent.
    pub fn address(&self) -> Address {
        Address::agent(self.address_index)
    }
}

/// Role a worker process plays in the cluster under test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum WorkerRole {
    /// Full cluster member holding data.
    Member,
    /// Client connecting to the cluster.
    Client,
    /// Member that holds no data.
    LiteMember,
}

impl WorkerRole {
    /// True for roles that join the cluster as members.
    pub fn is_member(self) -> bool {
        matches!(self, WorkerRole::Member | WorkerRole::LiteMember)
    }

    /// Lowercase role name.
    pub fn as_str(self) -> &'static str {
        match self {
            WorkerRole::Member => "member",
            WorkerRole::Client => "client",
            WorkerRole::LiteMember => "litemember",
        }
    }
}

impl fmt::Display for WorkerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything an agent needs to spawn one worker process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerProcessSpec {
    /// 1-based worker index on its agent.
    pub worker_index: u32,
    /// Worker role.
    pub role: WorkerRole,
    /// Options passed to the worker's runtime.
    pub jvm_options: String,
    /// Configuration overrides for the cluster software.
    pub config_overrides: BTreeMap<String, String>,
}

impl WorkerProcessSpec {
    /// Create a spec with no options or overrides.
    pub fn new(worker_index: u32, role: WorkerRole) -> Self {
        Self {
            worker_index,
            role,
            jvm_options: String::new(),
            config_overrides: BTreeMap::new(),
        }
    }

    /// Stable identifier of the worker spawned from this spec on `agent`.
    pub fn worker_id(&self, agent_index: u32) -> String {
        format!("{}-{}", Address::worker(agent_index, self.worker_index), self.role)
    }
}

/// A test case: an id plus its free-form properties.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCase {
    /// Unique id within the suite.
    pub id: String,
    /// Properties such as `class`, `threadCount`.
    pub properties: BTreeMap<String, String>,
}

impl TestCase {
    /// Create an empty test case.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            properties: BTreeMap::new(),
        }
    }

    /// Set a property, replacing any existing value.
    pub fn set_property(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.properties.insert(key.into(), value.into());
    }

    /// Look up a property.
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// The test's implementation class, if set.
    pub fn class_name(&self) -> Option<&str> {
        self.property("class")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_id_contains_address_and_role() {
        let spec = WorkerProcessSpec::new(2, WorkerRole::Client);
        assert_eq!(spec.worker_id(3), "C_A3_W2-client");
    }

    #[test]
    fn member_roles() {
        assert!(WorkerRole::Member.is_member());
        assert!(WorkerRole::LiteMember.is_member());
        assert!(!WorkerRole::Client.is_member());
    }

    #[test]
    fn test_case_properties() {
        let mut test = TestCase::new("map");
        test.set_property("class", "MapTest");
        test.set_property("threadCount", "4");
        assert_eq!(test.class_name(), Some("MapTest"));
        assert_eq!(test.property("threadCount"), Some("4"));
        assert_eq!(test.property("missing"), None);
    }
}
