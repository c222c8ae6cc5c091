// Copyright (c) The emutest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

#![warn(missing_docs)]

//! Core functionality for emutest.
//!
//! emutest builds one firmware image per test, runs it inside an emulator, and reads the
//! emulator's standard output until a sentinel line. The basic flow for a single test is:
//!
//! 1. The [build tool](build_tool) is invoked for the test target.
//! 2. The [supervisor](supervisor) spawns an isolated worker process (a re-execution of the
//!    `emutest` binary, see [`worker::WorkerSpawnInfo`]).
//! 3. The [worker](worker) spawns the emulator in its own process group, reports its pid, and
//!    reads its output through the [sentinel protocol](protocol).
//! 4. The supervisor enforces the timeout, reaps the worker and kills the emulator.
//!
//! The [runner](runner) sequences all configured tests and aggregates the results.

cfg_if::cfg_if! {
    if #[cfg(not(unix))] {
        compile_error!("emutest relies on Unix process groups and signals");
    }
}

pub mod build_tool;
pub mod config;
pub mod errors;
pub mod exit_codes;
mod helpers;
pub mod list;
pub mod outcome;
pub mod protocol;
pub mod reporter;
pub mod runner;
pub mod signal;
pub mod supervisor;
mod time;
pub mod worker;
