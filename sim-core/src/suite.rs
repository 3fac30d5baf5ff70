//! Test suite files and property overrides.
//!
//! A suite file holds `testId.property=value` lines. A line without a dot
//! (`class=MapTest`) belongs to the test with an empty id, which is only
//! valid when the suite contains a single test.

use std::collections::BTreeMap;

use sim_types::TestCase;

/// Error type for suite, overrides and agents file parsing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    /// A line could not be parsed.
    #[error("line {line}: {reason}")]
    InvalidLine {
        /// 1-based line number.
        line: usize,
        /// What is wrong with it.
        reason: String,
    },

    /// An overrides entry is not `key=value`.
    #[error("invalid override '{0}', expected key=value")]
    InvalidOverride(String),

    /// A test has no `class` property.
    #[error("test '{0}' has no class property")]
    MissingClass(String),

    /// The file defines nothing.
    #[error("{0} is empty")]
    Empty(&'static str),
}

/// Ordered list of test cases plus run-wide identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestSuite {
    /// Suite id, used for the output directory and failure file names.
    pub id: String,
    /// Tests in file order.
    pub tests: Vec<TestCase>,
}

impl TestSuite {
    /// Parse a suite from properties text.
    pub fn parse(id: impl Into<String>, text: &str) -> Result<Self, ParseError> {
        let mut tests: Vec<TestCase> = Vec::new();

        for (number, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
                continue;
            }
            let (key, value) = line.split_once('=').ok_or_else(|| ParseError::InvalidLine {
                line: number + 1,
                reason: format!("expected testId.property=value, got '{line}'"),
            })?;
            let key = key.trim();
            let (test_id, property) = match key.split_once('.') {
                Some((test_id, property)) => (test_id, property),
                None => ("", key),
            };
            if property.is_empty() {
                return Err(ParseError::InvalidLine {
                    line: number + 1,
                    reason: format!("empty property name in '{line}'"),
                });
            }

            let index = match tests.iter().position(|t| t.id == test_id) {
                Some(index) => index,
                None => {
                    tests.push(TestCase::new(test_id));
                    tests.len() - 1
                }
            };
            tests[index].set_property(property, value.trim());
        }

        if tests.is_empty() {
            return Err(ParseError::Empty("test suite"));
        }
        if let Some(test) = tests.iter().find(|t| t.class_name().is_none()) {
            return Err(ParseError::MissingClass(test.id.clone()));
        }
        Ok(Self { id: id.into(), tests })
    }

    /// Apply overrides to every test case.
    pub fn apply_overrides(&mut self, overrides: &BTreeMap<String, String>) {
        for test in &mut self.tests {
            for (key, value) in overrides {
                test.set_property(key.clone(), value.clone());
            }
        }
    }

    /// Number of tests.
    pub fn len(&self) -> usize {
        self.tests.len()
    }

    /// True if the suite has no tests.
    pub fn is_empty(&self) -> bool {
        self.tests.is_empty()
    }
}

/// Parse `key=value,key=value` overrides. Empty input yields no overrides.
pub fn parse_overrides(value: &str) -> Result<BTreeMap<String, String>, ParseError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| match entry.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() => {
                Ok((key.trim().to_string(), value.trim().to_string()))
            }
            _ => Err(ParseError::InvalidOverride(entry.to_string())),
        })
        .collect()
}
