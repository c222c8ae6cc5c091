// Copyright (c) The emutest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The emulation worker.
//!
//! Each test's emulator is driven by a separate worker process, so that a fault or a blocked read
//! in the emulator's pipes can never affect the supervisor. The worker is a re-execution of the
//! current binary with a hidden subcommand ([`WorkerSpawnInfo::SUBCOMMAND_NAME`]).
//!
//! The worker talks to the supervisor through its standard output, using newline-delimited JSON
//! [`WorkerMessage`]s. Exactly two messages are written, in order:
//!
//! 1. [`WorkerMessage::EmulatorStarted`], immediately after the emulator is spawned and before any
//!    of its output is read.
//! 2. [`WorkerMessage::OutputCaptured`], once the sentinel line has been read.
//!
//! The emulator is deliberately left running when the worker exits: killing it is the
//! supervisor's job.

use crate::{errors::WorkerError, protocol::read_until_sentinel};
use camino::{Utf8Path, Utf8PathBuf};
use nix::{
    sys::signal::{Signal, killpg},
    unistd::Pid,
};
use serde::{Deserialize, Serialize};
use std::{os::unix::process::CommandExt, process::Stdio};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, trace};

/// Information about how to start worker processes.
///
/// This is used by the supervisor.
#[derive(Clone, Debug)]
pub struct WorkerSpawnInfo {
    program: Utf8PathBuf,
}

impl WorkerSpawnInfo {
    /// The name of the hidden worker subcommand.
    pub const SUBCOMMAND_NAME: &'static str = "__emulation-worker";

    /// Creates a new `WorkerSpawnInfo` that starts workers by running `program` with the worker
    /// subcommand.
    pub fn new(program: impl Into<Utf8PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Creates a new `WorkerSpawnInfo` for the currently running executable.
    pub fn current_exe() -> std::io::Result<Self> {
        let exe = std::env::current_exe()?;
        let exe = Utf8PathBuf::try_from(exe).map_err(|err| err.into_io_error())?;
        Ok(Self::new(exe))
    }

    /// Returns the program used to start workers.
    pub fn program(&self) -> &Utf8Path {
        &self.program
    }

    /// Returns a command that starts a worker for the given emulator invocation.
    pub(crate) fn command(
        &self,
        cwd: &Utf8Path,
        emulator: &EmulatorCommand,
    ) -> std::process::Command {
        let mut cmd = std::process::Command::new(&self.program);
        cmd.arg(Self::SUBCOMMAND_NAME)
            .arg("--cwd")
            .arg(cwd)
            .arg("--")
            .arg(&emulator.program)
            .arg(shell_words::join(&emulator.args));
        cmd
    }
}

/// A fully resolved emulator command line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EmulatorCommand {
    /// The emulator program.
    pub program: String,

    /// Arguments passed to the emulator.
    pub args: Vec<String>,
}

/// A message sent from the worker to the supervisor.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum WorkerMessage {
    /// The emulator has been spawned.
    EmulatorStarted {
        /// The emulator's process id. This is also its process group id.
        pid: u32,
    },

    /// The sentinel line was read.
    OutputCaptured {
        /// Everything the emulator printed before the sentinel line.
        output: String,
    },
}

impl WorkerMessage {
    fn kind_str(&self) -> &'static str {
        match self {
            Self::EmulatorStarted { .. } => "emulator pid",
            Self::OutputCaptured { .. } => "captured output",
        }
    }
}

/// The worker side of a single test run.
#[derive(Clone, Debug)]
pub struct EmulationWorker {
    cwd: Option<Utf8PathBuf>,
    program: String,
    args: Vec<String>,
}

impl EmulationWorker {
    /// Creates a new worker for the given program and argument string.
    ///
    /// `args` is a single string split with shell-words rules, as produced by the supervisor.
    pub fn new(
        cwd: Option<Utf8PathBuf>,
        program: impl Into<String>,
        args: &str,
    ) -> Result<Self, WorkerError> {
        let args = shell_words::split(args).map_err(|err| WorkerError::ArgsParse {
            args: args.to_owned(),
            err,
        })?;
        Ok(Self {
            cwd,
            program: program.into(),
            args,
        })
    }

    /// Runs the worker protocol, writing messages to `out`.
    pub async fn run<W>(self, mut out: W) -> Result<(), WorkerError>
    where
        W: AsyncWrite + Unpin,
    {
        let mut cmd = std::process::Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // A new process group, so signals sent to the group never reach the worker or the
            // supervisor.
            .process_group(0);
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }

        let mut cmd = tokio::process::Command::from(cmd);
        let mut child = cmd.spawn().map_err(|err| WorkerError::EmulatorSpawn {
            program: self.program.clone(),
            err,
        })?;
        let pid = child.id().ok_or(WorkerError::EmulatorPidMissing)?;
        let mut guard = ProcessGroupGuard::new(pid);
        debug!(pid, program = %self.program, "spawned emulator");

        publish(&mut out, &WorkerMessage::EmulatorStarted { pid }).await?;

        // Hold on to stdin so the emulator doesn't see EOF on its console.
        let _stdin = child.stdin.take();
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    trace!(target: "emutest_runner::worker::emulator_stderr", "{line}");
                }
            });
        }

        let stdout = child.stdout.take().expect("stdout was set");
        let output = read_until_sentinel(BufReader::new(stdout)).await?;
        debug!(pid, len = output.len(), "read emulator output");

        publish(&mut out, &WorkerMessage::OutputCaptured { output }).await?;

        // The supervisor owns the emulator from here on.
        guard.disarm();
        Ok(())
    }
}

async fn publish<W>(out: &mut W, message: &WorkerMessage) -> Result<(), WorkerError>
where
    W: AsyncWrite + Unpin,
{
    let mut line = serde_json::to_vec(message).map_err(|err| WorkerError::Publish {
        message: message.kind_str(),
        err: err.into(),
    })?;
    line.push(b'\n');

    let res = async {
        out.write_all(&line).await?;
        out.flush().await
    }
    .await;
    res.map_err(|err| WorkerError::Publish {
        message: message.kind_str(),
        err,
    })
}

/// Kills the emulator's process group on drop unless disarmed.
///
/// This is advisory: the supervisor independently kills the emulator by pid.
#[derive(Debug)]
struct ProcessGroupGuard {
    pgid: Option<Pid>,
}

impl ProcessGroupGuard {
    fn new(pid: u32) -> Self {
        Self {
            pgid: i32::try_from(pid).ok().map(Pid::from_raw),
        }
    }

    fn disarm(&mut self) {
        self.pgid = None;
    }
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            debug!(%pgid, "worker exiting early, killing emulator process group");
            // The group may already be gone.
            let _ = killpg(pgid, Signal::SIGKILL);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn parse_messages(out: &[u8]) -> Vec<WorkerMessage> {
        out.split(|&b| b == b'\n')
            .filter(|line| !line.is_empty())
            .map(|line| serde_json::from_slice(line).unwrap())
            .collect()
    }

    #[test]
    fn message_wire_format() {
        let message = WorkerMessage::EmulatorStarted { pid: 1234 };
        assert_eq!(
            serde_json::to_string(&message).unwrap(),
            r#"{"kind":"emulator-started","pid":1234}"#,
        );
        let message = WorkerMessage::OutputCaptured {
            output: "Pass\n".to_owned(),
        };
        assert_eq!(
            serde_json::to_string(&message).unwrap(),
            r#"{"kind":"output-captured","output":"Pass\n"}"#,
        );
    }

    #[test]
    fn worker_command_line() {
        let info = WorkerSpawnInfo::new("/usr/bin/emutest");
        let emulator = EmulatorCommand {
            program: "qemu-system-arm".to_owned(),
            args: vec![
                "-M".to_owned(),
                "olimex-stm32-h405".to_owned(),
                "-kernel".to_owned(),
                "build/my test.elf".to_owned(),
            ],
        };
        let cmd = info.command(Utf8Path::new("/work"), &emulator);
        let args: Vec<_> = cmd.get_args().map(|a| a.to_str().unwrap()).collect();
        assert_eq!(
            args,
            [
                "__emulation-worker",
                "--cwd",
                "/work",
                "--",
                "qemu-system-arm",
                "-M olimex-stm32-h405 -kernel 'build/my test.elf'",
            ]
        );

        let worker = EmulationWorker::new(None, "qemu-system-arm", args[5]).unwrap();
        assert_eq!(worker.args, emulator.args);
    }

    #[tokio::test]
    async fn publishes_pid_then_output() {
        let worker =
            EmulationWorker::new(None, "sh", "-c 'printf \"Pass\\n<Test finished>\\n\"'").unwrap();
        let mut out = Vec::new();
        worker.run(&mut out).await.unwrap();

        let messages = parse_messages(&out);
        assert_eq!(messages.len(), 2);
        assert!(
            matches!(messages[0], WorkerMessage::EmulatorStarted { pid } if pid > 0),
            "first message is the pid: {messages:?}"
        );
        assert_eq!(
            messages[1],
            WorkerMessage::OutputCaptured {
                output: "Pass\n".to_owned()
            }
        );
    }

    #[tokio::test]
    async fn eof_publishes_only_pid() {
        let worker = EmulationWorker::new(None, "sh", "-c 'echo partial'").unwrap();
        let mut out = Vec::new();
        let err = worker.run(&mut out).await.expect_err("no sentinel");
        assert!(
            matches!(err, WorkerError::Protocol(_)),
            "unexpected error: {err:?}"
        );

        let messages = parse_messages(&out);
        assert_eq!(messages.len(), 1);
        assert!(matches!(messages[0], WorkerMessage::EmulatorStarted { .. }));
    }

    #[tokio::test]
    async fn spawn_failure() {
        let worker = EmulationWorker::new(None, "/nonexistent/emulator", "").unwrap();
        let mut out = Vec::new();
        let err = worker.run(&mut out).await.expect_err("spawn fails");
        assert!(matches!(err, WorkerError::EmulatorSpawn { .. }));
        assert!(out.is_empty(), "nothing is published");
    }
}
