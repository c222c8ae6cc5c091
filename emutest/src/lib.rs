// Copyright (c) The emutest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

#![warn(missing_docs)]

//! The emutest command-line interface.
//!
//! For documentation and usage, see the README. The library functionality lives in
//! `emutest-runner`; this crate only parses arguments, sets up output and dispatches.

mod dispatch;
mod errors;
mod output;
mod worker;

#[doc(hidden)]
pub use dispatch::*;
#[doc(hidden)]
pub use errors::*;
#[doc(hidden)]
pub use output::OutputWriter;
