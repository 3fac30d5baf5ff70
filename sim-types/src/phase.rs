//! Test phases.
//!
//! Every test case moves through the same fixed sequence of phases. Global
//! phases execute once on a single representative worker; all other phases
//! execute on every worker of the test.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::SimError;

/// One ordered stage of a test case's lifecycle.
///
/// The derived `Ord` follows declaration order, which is execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TestPhase {
    /// Per-worker setup.
    Setup,
    /// Per-worker warmup.
    LocalWarmup,
    /// Warmup executed once per test.
    GlobalWarmup,
    /// The measured run.
    Run,
    /// Verification executed once per test.
    GlobalVerify,
    /// Per-worker verification.
    LocalVerify,
    /// Teardown executed once per test.
    GlobalTeardown,
    /// Per-worker teardown.
    LocalTeardown,
}

impl TestPhase {
    /// All phases in execution order.
    pub const ALL: [TestPhase; 8] = [
        TestPhase::Setup,
        TestPhase::LocalWarmup,
        TestPhase::GlobalWarmup,
        TestPhase::Run,
        TestPhase::GlobalVerify,
        TestPhase::LocalVerify,
        TestPhase::GlobalTeardown,
        TestPhase::LocalTeardown,
    ];

    /// The final phase of every test.
    pub fn last() -> Self {
        TestPhase::LocalTeardown
    }

    /// True if the phase runs once on a representative worker.
    pub fn is_global(self) -> bool {
        matches!(
            self,
            TestPhase::GlobalWarmup | TestPhase::GlobalVerify | TestPhase::GlobalTeardown
        )
    }

    /// True for the two verification phases.
    pub fn is_verify(self) -> bool {
        matches!(self, TestPhase::GlobalVerify | TestPhase::LocalVerify)
    }

    /// True for the two teardown phases, which run even after an abort.
    pub fn is_teardown(self) -> bool {
        matches!(self, TestPhase::GlobalTeardown | TestPhase::LocalTeardown)
    }

    /// Human-readable phase name, as accepted by [`FromStr`].
    pub fn desc(self) -> &'static str {
        match self {
            TestPhase::Setup => "setup",
            TestPhase::LocalWarmup => "local warmup",
            TestPhase::GlobalWarmup => "global warmup",
            TestPhase::Run => "run",
            TestPhase::GlobalVerify => "global verify",
            TestPhase::LocalVerify => "local verify",
            TestPhase::GlobalTeardown => "global tear down",
            TestPhase::LocalTeardown => "local tear down",
        }
    }
}

impl fmt::Display for TestPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.desc())
    }
}

impl FromStr for TestPhase {
    type Err = SimError;

    /// Accepts the description ("global verify"), or the identifier in
    /// snake/kebab/upper case ("GLOBAL_VERIFY", "global-verify").
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .trim()
            .chars()
            .filter(|c| !matches!(c, '_' | '-' | ' '))
            .flat_map(char::to_lowercase)
            .collect();
        TestPhase::ALL
            .into_iter()
            .find(|phase| phase.desc().replace(' ', "") == normalized)
            .ok_or_else(|| SimError::UnknownPhase(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phases_are_totally_ordered() {
        for pair in TestPhase::ALL.windows(2) {
            assert!(pair[0] < pair[1]);
        }
        assert_eq!(TestPhase::last(), *TestPhase::ALL.last().unwrap());
    }

    #[test]
    fn global_phases() {
        let globals: Vec<_> = TestPhase::ALL.into_iter().filter(|p| p.is_global()).collect();
        assert_eq!(
            globals,
            vec![
                TestPhase::GlobalWarmup,
                TestPhase::GlobalVerify,
                TestPhase::GlobalTeardown
            ]
        );
    }

    #[test]
    fn parse_accepts_common_spellings() {
        assert_eq!("GLOBAL_VERIFY".parse::<TestPhase>().unwrap(), TestPhase::GlobalVerify);
        assert_eq!("local-warmup".parse::<TestPhase>().unwrap(), TestPhase::LocalWarmup);
        assert_eq!("local tear down".parse::<TestPhase>().unwrap(), TestPhase::LocalTeardown);
        assert_eq!("RUN".parse::<TestPhase>().unwrap(), TestPhase::Run);
        assert!("verify-all".parse::<TestPhase>().is_err());
    }
}
