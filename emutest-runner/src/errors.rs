// Copyright (c) The emutest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Errors produced by emutest.

use camino::Utf8PathBuf;
use config::ConfigError;
use itertools::Itertools;
use std::{fmt, sync::Arc};
use thiserror::Error;

/// An error that occurred while parsing the config.
#[derive(Debug, Error)]
#[error("failed to parse emutest config at `{config_file}`")]
#[non_exhaustive]
pub struct ConfigParseError {
    config_file: Utf8PathBuf,
    #[source]
    kind: ConfigParseErrorKind,
}

impl ConfigParseError {
    pub(crate) fn new(config_file: impl Into<Utf8PathBuf>, kind: ConfigParseErrorKind) -> Self {
        Self {
            config_file: config_file.into(),
            kind,
        }
    }

    /// Returns the config file for this error.
    pub fn config_file(&self) -> &Utf8PathBuf {
        &self.config_file
    }

    /// Returns the kind of error this is.
    pub fn kind(&self) -> &ConfigParseErrorKind {
        &self.kind
    }
}

/// The kind of error that occurred while parsing the config.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigParseErrorKind {
    /// An error occurred while building the config.
    #[error(transparent)]
    BuildError(Box<ConfigError>),

    /// An error occurred while deserializing the config.
    #[error(transparent)]
    DeserializeError(Box<serde_path_to_error::Error<ConfigError>>),

    /// The configured test list is invalid.
    #[error(transparent)]
    TestList(#[from] TestListError),
}

/// An error returned while parsing a test name.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("invalid test name `{input}`: {reason}")]
pub struct TestNameParseError {
    input: String,
    reason: &'static str,
}

impl TestNameParseError {
    pub(crate) fn new(input: impl Into<String>, reason: &'static str) -> Self {
        Self {
            input: input.into(),
            reason,
        }
    }
}

/// An error returned while constructing a [`TestList`](crate::list::TestList).
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum TestListError {
    /// A test name was invalid.
    #[error(transparent)]
    InvalidName(#[from] TestNameParseError),

    /// A test name appeared more than once.
    #[error("test `{name}` is listed more than once")]
    Duplicate {
        /// The duplicated name.
        name: String,
    },
}

/// Tests were requested on the command line that aren't in the configured list.
#[derive(Clone, Debug, Error)]
#[error(
    "unknown {} requested: {}\n(known tests: {})",
    if .unknown.len() == 1 { "test" } else { "tests" },
    .unknown.iter().join(", "),
    .known.iter().join(", "),
)]
pub struct UnknownTestsError {
    unknown: Vec<String>,
    known: Vec<String>,
}

impl UnknownTestsError {
    pub(crate) fn new(
        unknown: impl IntoIterator<Item = impl Into<String>>,
        known: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            unknown: unknown.into_iter().map(Into::into).collect(),
            known: known.into_iter().map(Into::into).collect(),
        }
    }

    /// Returns the names that weren't found.
    pub fn unknown(&self) -> &[String] {
        &self.unknown
    }
}

/// An error that occurred while executing the external build tool.
///
/// This is only produced if the build tool could not be run at all: a build tool that runs and
/// fails produces a [`BuildOutcome::Failed`](crate::build_tool::BuildOutcome::Failed) instead.
#[derive(Clone, Debug, Error)]
#[error("failed to execute `{command}`")]
pub struct BuildExecError {
    command: String,
    #[source]
    err: Arc<std::io::Error>,
}

impl BuildExecError {
    pub(crate) fn new(command: impl Into<String>, err: std::io::Error) -> Self {
        Self {
            command: command.into(),
            err: Arc::new(err),
        }
    }

    /// Returns the command line that failed to run.
    pub fn command(&self) -> &str {
        &self.command
    }
}

/// An error that occurred while reading the sentinel protocol.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProtocolError {
    /// The stream ended before the sentinel line was seen.
    #[error("output stream closed before the sentinel line")]
    UnexpectedEof {
        /// Everything read before the stream closed.
        partial: String,
    },

    /// Reading from the stream failed.
    #[error("error reading from output stream")]
    Read(#[source] std::io::Error),
}

/// An error that occurred inside the emulation worker process.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WorkerError {
    /// The argument string passed to the worker could not be split.
    #[error("failed to parse emulator arguments `{args}`")]
    ArgsParse {
        /// The argument string.
        args: String,

        /// The underlying error.
        #[source]
        err: shell_words::ParseError,
    },

    /// The emulator could not be spawned.
    #[error("failed to spawn emulator `{program}`")]
    EmulatorSpawn {
        /// The emulator program.
        program: String,

        /// The underlying error.
        #[source]
        err: std::io::Error,
    },

    /// The emulator exited before its pid could be read.
    #[error("emulator exited before its pid could be read")]
    EmulatorPidMissing,

    /// A message could not be written to the supervisor.
    #[error("failed to publish {message} to the supervisor")]
    Publish {
        /// The kind of message that failed.
        message: &'static str,

        /// The underlying error.
        #[source]
        err: std::io::Error,
    },

    /// The emulator's output did not follow the sentinel protocol.
    #[error("error reading emulator output")]
    Protocol(#[from] ProtocolError),
}

/// An error that occurred while starting a worker process.
#[derive(Clone, Debug, Error)]
#[error("failed to start worker `{program}`")]
pub struct ChildStartError {
    program: String,
    #[source]
    err: Arc<std::io::Error>,
}

impl ChildStartError {
    pub(crate) fn new(program: impl Into<String>, err: std::io::Error) -> Self {
        Self {
            program: program.into(),
            err: Arc::new(err),
        }
    }
}

/// An error that occurred while setting up the signal handler.
#[derive(Debug, Error)]
#[error("error setting up signal handler")]
pub struct SignalHandlerSetupError(#[from] std::io::Error);

/// An error that occurred while building the test runner.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TestRunnerBuildError {
    /// An error occurred while creating the Tokio runtime.
    #[error("error creating Tokio runtime")]
    TokioRuntimeCreate(#[source] std::io::Error),

    /// An error occurred while setting up signals.
    #[error("error setting up signals")]
    SignalHandlerSetupError(#[from] SignalHandlerSetupError),
}

/// An error that aborted a test run before any test could run.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TestRunnerExecuteError {
    /// The pre-run clean step could not be executed.
    #[error("pre-run clean failed")]
    Clean(#[source] BuildExecError),
}

/// Displays an error along with its chain of sources, one per line.
pub struct DisplayErrorChain<E>(E);

impl<E: std::error::Error> DisplayErrorChain<E> {
    /// Creates a new `DisplayErrorChain`.
    pub fn new(error: E) -> Self {
        Self(error)
    }
}

impl<E: std::error::Error> fmt::Display for DisplayErrorChain<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)?;
        let mut source = self.0.source();
        while let Some(err) = source {
            write!(f, "\n  caused by: {err}")?;
            source = err.source();
        }
        Ok(())
    }
}
