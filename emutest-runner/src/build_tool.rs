// Copyright (c) The emutest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Running the external build tool.
//!
//! Each test is built by invoking the build tool from the workspace root as:
//!
//! ```text
//! <program> -j<jobs> TEST_NAME=<test> [TARGET_BOARD=<board>] OPTIMIZE_FLAGS=<flags> [extra-args...]
//! ```
//!
//! Builds are not bounded by a timeout.

use crate::{config::BuildConfig, errors::BuildExecError, helpers::join_output, list::TestName};
use camino::{Utf8Path, Utf8PathBuf};
use std::{fmt, num::NonZeroUsize, process::Stdio};
use tracing::debug;

/// The optimization configuration a test image is built with.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum OptLevel {
    /// Unoptimized builds.
    #[default]
    Debug,

    /// Optimized builds.
    Release,
}

impl fmt::Display for OptLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Debug => write!(f, "debug"),
            Self::Release => write!(f, "release"),
        }
    }
}

/// The result of running the build tool.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BuildOutcome {
    /// The build tool exited successfully.
    Success,

    /// The build tool exited with a failure.
    Failed {
        /// The build tool's standard output followed by its standard error.
        diagnostic: String,
    },
}

/// Invokes the build tool for individual tests.
#[derive(Clone, Debug)]
pub struct BuildTool {
    workspace_root: Utf8PathBuf,
    config: BuildConfig,
    jobs: NonZeroUsize,
}

impl BuildTool {
    /// Creates a new `BuildTool` that runs from `workspace_root`.
    ///
    /// If the config doesn't set a job count, the number of available CPUs is used.
    pub fn new(workspace_root: impl Into<Utf8PathBuf>, config: BuildConfig) -> Self {
        let jobs = config.jobs.unwrap_or_else(|| {
            std::thread::available_parallelism().unwrap_or(NonZeroUsize::MIN)
        });
        Self {
            workspace_root: workspace_root.into(),
            config,
            jobs,
        }
    }

    /// Returns the workspace root.
    pub fn workspace_root(&self) -> &Utf8Path {
        &self.workspace_root
    }

    /// Returns the arguments passed to the build tool to build `test`.
    pub fn build_args(&self, test: &TestName, opt_level: OptLevel) -> Vec<String> {
        let mut args = vec![
            format!("-j{}", self.jobs),
            format!("TEST_NAME={test}"),
        ];
        if let Some(board) = &self.config.board {
            args.push(format!("TARGET_BOARD={board}"));
        }
        args.push(format!(
            "OPTIMIZE_FLAGS={}",
            self.config.optimize_flags.for_level(opt_level)
        ));
        args.extend(self.config.extra_args.iter().cloned());
        args
    }

    /// Builds the image for `test`.
    ///
    /// A build tool that runs and fails produces [`BuildOutcome::Failed`]. An error is returned
    /// only if the build tool couldn't be run at all.
    pub async fn build(
        &self,
        test: &TestName,
        opt_level: OptLevel,
    ) -> Result<BuildOutcome, BuildExecError> {
        self.run(self.build_args(test, opt_level)).await
    }

    /// Runs the clean step.
    pub async fn clean(&self) -> Result<BuildOutcome, BuildExecError> {
        self.run(self.config.clean_args.clone()).await
    }

    async fn run(&self, args: Vec<String>) -> Result<BuildOutcome, BuildExecError> {
        let command_str = self.command_str(&args);
        debug!(command = %command_str, cwd = %self.workspace_root, "running build tool");

        let output = tokio::process::Command::new(&self.config.program)
            .args(&args)
            .current_dir(&self.workspace_root)
            .stdin(Stdio::null())
            // A build abandoned on shutdown must not keep running.
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|err| BuildExecError::new(command_str.clone(), err))?;

        if output.status.success() {
            Ok(BuildOutcome::Success)
        } else {
            debug!(command = %command_str, status = %output.status, "build tool failed");
            Ok(BuildOutcome::Failed {
                diagnostic: join_output(&output.stdout, &output.stderr),
            })
        }
    }

    fn command_str(&self, args: &[String]) -> String {
        shell_words::join(std::iter::once(&self.config.program).chain(args))
    }
}
