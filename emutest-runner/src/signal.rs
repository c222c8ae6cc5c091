// Copyright (c) The emutest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Support for handling signals in emutest.
//!
//! A shutdown signal received while a test is running tears the test down exactly as a timeout
//! would, then stops the run.

use crate::errors::SignalHandlerSetupError;
use std::fmt;
use tokio::signal::unix::{Signal, SignalKind, signal};

/// The kind of signal handling to set up for a test run.
///
/// A `SignalHandlerKind` can be passed into
/// [`TestRunnerBuilder::build`](crate::runner::TestRunnerBuilder::build).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum SignalHandlerKind {
    /// The standard signal handler: captures SIGINT, SIGTERM and SIGHUP.
    Standard,

    /// A no-op signal handler. Useful for tests.
    Noop,
}

impl SignalHandlerKind {
    pub(crate) fn build(self) -> Result<SignalHandler, SignalHandlerSetupError> {
        match self {
            Self::Standard => SignalHandler::new(),
            Self::Noop => Ok(SignalHandler::noop()),
        }
    }
}

/// The signal handler implementation.
#[derive(Debug)]
pub(crate) struct SignalHandler {
    signals: Option<Signals>,
}

impl SignalHandler {
    /// Creates a new `SignalHandler` that handles Ctrl-C and other shutdown signals.
    ///
    /// Must be called from within a Tokio runtime.
    fn new() -> Result<Self, SignalHandlerSetupError> {
        Ok(Self {
            signals: Some(Signals::new()?),
        })
    }

    fn noop() -> Self {
        Self { signals: None }
    }

    /// Waits for the next shutdown signal.
    ///
    /// Returns `None` once no more signals can arrive; a no-op handler returns `None` immediately.
    pub(crate) async fn recv(&mut self) -> Option<ShutdownEvent> {
        match &mut self.signals {
            Some(signals) => signals.recv().await,
            None => None,
        }
    }
}

/// Signals for SIGINT, SIGTERM and SIGHUP.
#[derive(Debug)]
struct Signals {
    sigint: SignalWithDone,
    sighup: SignalWithDone,
    sigterm: SignalWithDone,
}

impl Signals {
    fn new() -> std::io::Result<Self> {
        Ok(Self {
            sigint: SignalWithDone::new(SignalKind::interrupt())?,
            sighup: SignalWithDone::new(SignalKind::hangup())?,
            sigterm: SignalWithDone::new(SignalKind::terminate())?,
        })
    }

    async fn recv(&mut self) -> Option<ShutdownEvent> {
        loop {
            tokio::select! {
                recv = self.sigint.signal.recv(), if !self.sigint.done => {
                    match recv {
                        Some(()) => break Some(ShutdownEvent::Interrupt),
                        None => self.sigint.done = true,
                    }
                }
                recv = self.sighup.signal.recv(), if !self.sighup.done => {
                    match recv {
                        Some(()) => break Some(ShutdownEvent::Hangup),
                        None => self.sighup.done = true,
                    }
                }
                recv = self.sigterm.signal.recv(), if !self.sigterm.done => {
                    match recv {
                        Some(()) => break Some(ShutdownEvent::Term),
                        None => self.sigterm.done = true,
                    }
                }
                else => {
                    break None
                }
            }
        }
    }
}

#[derive(Debug)]
struct SignalWithDone {
    signal: Signal,
    done: bool,
}

impl SignalWithDone {
    fn new(kind: SignalKind) -> std::io::Result<Self> {
        let signal = signal(kind)?;
        Ok(Self {
            signal,
            done: false,
        })
    }
}

/// A shutdown signal.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ShutdownEvent {
    /// SIGHUP.
    Hangup,

    /// SIGTERM.
    Term,

    /// SIGINT, usually from Ctrl-C.
    Interrupt,
}

impl fmt::Display for ShutdownEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hangup => write!(f, "SIGHUP"),
            Self::Term => write!(f, "SIGTERM"),
            Self::Interrupt => write!(f, "SIGINT"),
        }
    }
}
