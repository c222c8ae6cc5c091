// Copyright (c) The emutest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Documented exit codes for `emutest`.

/// Documented exit codes for `emutest` failures.
///
/// Unknown or unexpected failures always result in exit code 1, the same as a failed test run.
pub enum EmutestExitCode {}

impl EmutestExitCode {
    /// Every configured test passed.
    pub const OK: i32 = 0;

    /// One or more tests failed, timed out, or the run was interrupted.
    pub const TEST_RUN_FAILED: i32 = 1;

    /// An error was encountered inside an emulation worker process.
    ///
    /// The supervisor observes this as a test failure, not as a run failure.
    pub const WORKER_ERROR: i32 = 70;

    /// An error occurred before any test could run: a bad config, an unknown test name, or a
    /// pre-run clean that could not be executed.
    pub const SETUP_ERROR: i32 = 96;
}
