// Copyright (c) The emutest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Terminal outcomes of a single test.

use crate::{helpers::display_exited_with, protocol::PASS_PAYLOAD};
use std::{fmt, process::ExitStatus};

/// The terminal result of one test. Once produced, an outcome is never changed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TestOutcome {
    /// The test image ran and printed exactly the pass payload.
    Passed,

    /// The test failed.
    Failed(FailureReason),

    /// The test didn't print the sentinel line within the timeout.
    TimedOut,
}

impl TestOutcome {
    /// Classifies the output captured before the sentinel line.
    ///
    /// Byte-exact: `"Pass"` without a newline, `"Pass\r\n"` or `"pass\n"` are all failures.
    pub fn from_payload(payload: String) -> Self {
        if payload == PASS_PAYLOAD {
            Self::Passed
        } else {
            Self::Failed(FailureReason::PayloadMismatch { payload })
        }
    }

    /// Returns true if this outcome is [`TestOutcome::Passed`].
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Passed)
    }
}

/// Why a test failed.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum FailureReason {
    /// The build tool failed, or couldn't be run. The emulator was never started.
    Build {
        /// The build tool's captured output, or the reason it couldn't be run.
        diagnostic: String,
    },

    /// The test image printed something other than the pass payload.
    PayloadMismatch {
        /// Everything printed before the sentinel line.
        payload: String,
    },

    /// The worker exited within the timeout without reporting any output.
    ///
    /// This happens if the emulator couldn't be started, or if it closed its standard output
    /// before printing the sentinel line.
    WorkerExited {
        /// The worker's exit status.
        status: ExitStatus,
    },

    /// The worker process couldn't be started.
    WorkerSpawn {
        /// A description of the error.
        error: String,
    },

    /// Waiting for the worker process failed. The worker was killed.
    WorkerWait {
        /// A description of the error.
        error: String,
    },
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Build { .. } => write!(f, "build failed"),
            Self::PayloadMismatch { .. } => write!(f, "test did not report a pass"),
            Self::WorkerExited { status } => write!(
                f,
                "worker {} before the test finished",
                display_exited_with(*status),
            ),
            Self::WorkerSpawn { error } => write!(f, "failed to start worker: {error}"),
            Self::WorkerWait { error } => write!(f, "failed to wait for worker: {error}"),
        }
    }
}
