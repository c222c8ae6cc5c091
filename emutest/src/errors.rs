// Copyright (c) The emutest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::output::{NO_HEADING_TARGET, StderrStyles};
use camino::Utf8PathBuf;
use emutest_runner::{errors::*, exit_codes::EmutestExitCode};
use owo_colors::OwoColorize;
use std::error::Error;
use thiserror::Error;
use tracing::error;

pub(crate) type Result<T, E = ExpectedError> = std::result::Result<T, E>;

// The #[error()] strings are placeholders: errors are meant to be printed with
// display_to_stderr, which colorizes them.

/// An error that emutest expects to be able to produce.
#[derive(Debug, Error)]
#[doc(hidden)]
pub enum ExpectedError {
    #[error("could not determine the current directory")]
    CurrentDirFailed {
        #[source]
        err: std::io::Error,
    },
    #[error("workspace root is invalid")]
    WorkspaceRootInvalid {
        workspace_root: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("config parse error")]
    ConfigParseError {
        #[from]
        err: ConfigParseError,
    },
    #[error("no tests configured")]
    NoTestsConfigured { config_file: Utf8PathBuf },
    #[error("unknown tests requested")]
    UnknownTests {
        #[from]
        err: UnknownTestsError,
    },
    #[error("could not determine the current executable")]
    CurrentExeFailed {
        #[source]
        err: std::io::Error,
    },
    #[error("test runner build error")]
    TestRunnerBuildError {
        #[from]
        err: TestRunnerBuildError,
    },
    #[error("test runner execute error")]
    TestRunnerExecuteError {
        #[from]
        err: TestRunnerExecuteError,
    },
    #[error("failed to create the worker runtime")]
    WorkerRuntimeCreate {
        #[source]
        err: std::io::Error,
    },
    #[error("emulation worker failed")]
    WorkerError {
        #[from]
        err: WorkerError,
    },
    #[error("test run failed")]
    TestRunFailed,
    #[error("error writing output")]
    WriteError {
        #[source]
        err: std::io::Error,
    },
}

impl ExpectedError {
    pub(crate) fn write_error(err: std::io::Error) -> Self {
        Self::WriteError { err }
    }

    /// Returns the exit code for the process.
    pub fn process_exit_code(&self) -> i32 {
        match self {
            Self::CurrentDirFailed { .. }
            | Self::WorkspaceRootInvalid { .. }
            | Self::ConfigParseError { .. }
            | Self::NoTestsConfigured { .. }
            | Self::UnknownTests { .. }
            | Self::CurrentExeFailed { .. }
            | Self::TestRunnerBuildError { .. }
            | Self::TestRunnerExecuteError { .. }
            | Self::WriteError { .. } => EmutestExitCode::SETUP_ERROR,
            Self::WorkerRuntimeCreate { .. } | Self::WorkerError { .. } => {
                EmutestExitCode::WORKER_ERROR
            }
            Self::TestRunFailed => EmutestExitCode::TEST_RUN_FAILED,
        }
    }

    /// Displays this error to stderr.
    pub fn display_to_stderr(&self, styles: &StderrStyles) {
        let mut next_error = match self {
            Self::CurrentDirFailed { err } => {
                error!("could not determine the current directory");
                Some(err as &dyn Error)
            }
            Self::WorkspaceRootInvalid {
                workspace_root,
                err,
            } => {
                error!(
                    "workspace root `{}` is invalid",
                    workspace_root.style(styles.bold)
                );
                Some(err as &dyn Error)
            }
            Self::ConfigParseError { err } => {
                error!(
                    "failed to parse emutest config at `{}`",
                    err.config_file().style(styles.bold)
                );
                Some(err.kind() as &dyn Error)
            }
            Self::NoTestsConfigured { config_file } => {
                error!(
                    "no tests configured: add a `tests` list to `{}`",
                    config_file.style(styles.bold)
                );
                None
            }
            Self::UnknownTests { err } => {
                error!("{err}");
                None
            }
            Self::CurrentExeFailed { err } => {
                error!("could not determine the current executable, needed to start workers");
                Some(err as &dyn Error)
            }
            Self::TestRunnerBuildError { err } => {
                error!("failed to build test runner");
                Some(err as &dyn Error)
            }
            Self::TestRunnerExecuteError { err } => {
                error!("{err}");
                err.source()
            }
            Self::WorkerRuntimeCreate { err } => {
                error!("failed to create the worker's Tokio runtime");
                Some(err as &dyn Error)
            }
            Self::WorkerError { err } => {
                error!("{err}");
                err.source()
            }
            Self::TestRunFailed => {
                error!("test run failed");
                None
            }
            Self::WriteError { err } => {
                error!("failed to write output");
                Some(err as &dyn Error)
            }
        };

        while let Some(err) = next_error {
            error!(target: NO_HEADING_TARGET, "\nCaused by:\n  {}", err);
            next_error = err.source();
        }
    }
}

