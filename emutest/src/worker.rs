// Copyright (c) The emutest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{ExpectedError, Result};
use camino::Utf8PathBuf;
use clap::Args;
use emutest_runner::{exit_codes::EmutestExitCode, worker::EmulationWorker};

#[derive(Debug, Args)]
pub(crate) struct WorkerOpts {
    /// The directory to run the emulator in.
    #[arg(long)]
    cwd: Option<Utf8PathBuf>,

    /// The emulator program.
    program: String,

    /// The args to run the emulator with, provided as a single string.
    args: String,
}

impl WorkerOpts {
    pub(crate) fn exec(self) -> Result<i32> {
        let worker = EmulationWorker::new(self.cwd, self.program, &self.args)?;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|err| ExpectedError::WorkerRuntimeCreate { err })?;
        runtime.block_on(worker.run(tokio::io::stdout()))?;

        Ok(EmutestExitCode::OK)
    }
}
