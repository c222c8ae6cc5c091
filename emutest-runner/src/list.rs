// Copyright (c) The emutest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The ordered list of tests to run.

use crate::errors::{TestListError, TestNameParseError, UnknownTestsError};
use serde::{Deserialize, Deserializer};
use std::{collections::HashSet, fmt};

/// The name of a single test.
///
/// A test name selects both a build target (it is passed to the build tool as `TEST_NAME`) and an
/// emulator image (`<artifact-dir>/<name>.<ext>`), so it is restricted to characters that are safe
/// in both positions.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TestName(String);

impl TestName {
    /// Parses a new test name.
    pub fn new(name: impl Into<String>) -> Result<Self, TestNameParseError> {
        let name = name.into();
        if name.is_empty() {
            return Err(TestNameParseError::new(name, "test names must not be empty"));
        }
        if name.starts_with('.') || name.starts_with('-') {
            return Err(TestNameParseError::new(
                name,
                "test names must not start with `.` or `-`",
            ));
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        {
            return Err(TestNameParseError::new(
                name,
                "test names may only contain ASCII letters, digits, `_`, `-` and `.`",
            ));
        }
        Ok(Self(name))
    }

    /// Returns the name as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TestName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for TestName {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        TestName::new(s).map_err(serde::de::Error::custom)
    }
}

/// An ordered, immutable list of tests.
///
/// The order is execution and reporting order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TestList {
    tests: Vec<TestName>,
}

impl TestList {
    /// Creates a new test list from names, rejecting duplicates.
    pub fn new(tests: impl IntoIterator<Item = TestName>) -> Result<Self, TestListError> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for test in tests {
            if !seen.insert(test.clone()) {
                return Err(TestListError::Duplicate {
                    name: test.0.clone(),
                });
            }
            out.push(test);
        }
        Ok(Self { tests: out })
    }

    /// Parses a test list from strings.
    pub fn from_names(
        names: impl IntoIterator<Item = impl Into<String>>,
    ) -> Result<Self, TestListError> {
        let tests = names
            .into_iter()
            .map(TestName::new)
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(tests)
    }

    /// Returns a new list with only the requested tests, keeping the configured order.
    ///
    /// An empty request selects every test.
    pub fn select(&self, requested: &[String]) -> Result<Self, UnknownTestsError> {
        if requested.is_empty() {
            return Ok(self.clone());
        }

        let unknown: Vec<_> = requested
            .iter()
            .filter(|name| !self.tests.iter().any(|t| t.as_str() == name.as_str()))
            .cloned()
            .collect();
        if !unknown.is_empty() {
            return Err(UnknownTestsError::new(
                unknown,
                self.tests.iter().map(|t| t.as_str()),
            ));
        }

        let tests = self
            .tests
            .iter()
            .filter(|t| requested.iter().any(|name| name == t.as_str()))
            .cloned()
            .collect();
        Ok(Self { tests })
    }

    /// Returns the number of tests in this list.
    pub fn len(&self) -> usize {
        self.tests.len()
    }

    /// Returns true if this list is empty.
    pub fn is_empty(&self) -> bool {
        self.tests.is_empty()
    }

    /// Iterates over the tests in order.
    pub fn iter(&self) -> impl ExactSizeIterator<Item = &TestName> + '_ {
        self.tests.iter()
    }
}

impl<'a> IntoIterator for &'a TestList {
    type Item = &'a TestName;
    type IntoIter = std::slice::Iter<'a, TestName>;

    fn into_iter(self) -> Self::IntoIter {
        self.tests.iter()
    }
}
