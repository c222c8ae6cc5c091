// Copyright (c) The emutest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The test run supervisor.
//!
//! For each test, the supervisor moves through these states:
//!
//! * **Building**: the build tool is run. A build failure completes the test without ever starting
//!   a worker.
//! * **Running**: a worker process is started, and the supervisor waits for it to exit, bounded by
//!   the test timeout.
//! * **Timed out**: the bound elapsed. The worker is killed and reaped.
//! * **Completed**: an outcome has been produced.
//!
//! Whichever way the Running state is left, the worker is reaped and the emulator pid it published
//! (if any) is sent SIGKILL before the supervisor returns.

mod channels;

use self::channels::{ChannelRead, WorkerChannels};
use crate::{
    build_tool::{BuildOutcome, BuildTool, OptLevel},
    config::EmulatorConfig,
    errors::{ChildStartError, DisplayErrorChain},
    list::TestName,
    outcome::{FailureReason, TestOutcome},
    signal::ShutdownEvent,
    time::stopwatch,
    worker::WorkerSpawnInfo,
};
use nix::{
    errno::Errno,
    sys::signal::{Signal, kill},
    unistd::Pid,
};
use std::{
    fmt,
    os::unix::process::ExitStatusExt,
    process::{ExitStatus, Stdio},
    time::Duration,
};
use tokio::{process::Child, sync::watch};
use tracing::{debug, warn};

/// The process id of a running emulator.
///
/// The emulator is started as the leader of a new process group, so this is also its process
/// group id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct EmulatorPid(u32);

impl EmulatorPid {
    pub(crate) fn new(pid: u32) -> Self {
        Self(pid)
    }

    /// Returns the raw process id.
    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for EmulatorPid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Receives the first shutdown signal of a run.
pub(crate) type ShutdownReceiver = watch::Receiver<Option<ShutdownEvent>>;

/// How a single test ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UnitResult {
    /// The test reached an outcome.
    Finished(TestOutcome),

    /// A shutdown signal was received before the test reached an outcome.
    ///
    /// Any worker and emulator were torn down as if the test had timed out.
    Interrupted(ShutdownEvent),
}

/// The result of supervising a single test.
#[derive(Clone, Debug)]
pub struct SupervisedTest {
    /// How the test ended.
    pub result: UnitResult,

    /// How long the build step took.
    pub build_time: Duration,

    /// How long the emulator ran, if it was started.
    pub run_time: Option<Duration>,

    /// The emulator pid published by the worker, if one was published.
    pub emulator_pid: Option<EmulatorPid>,
}

/// Runs individual tests: builds them, runs them in a worker and tears everything down.
#[derive(Clone, Debug)]
pub(crate) struct TestSupervisor {
    pub(crate) worker: WorkerSpawnInfo,
    pub(crate) build_tool: BuildTool,
    pub(crate) emulator: EmulatorConfig,
    pub(crate) opt_level: OptLevel,
    pub(crate) timeout: Duration,
    pub(crate) pid_read_timeout: Duration,
}

#[derive(Debug)]
enum WaitResult {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    Interrupted(ShutdownEvent),
}

impl WaitResult {
    /// A terminal Ctrl-C reaches the worker as well as emutest. If the worker was killed by a
    /// signal and a shutdown has been recorded in the meantime, the test was interrupted.
    fn settle(self, shutdown: &ShutdownReceiver) -> Self {
        match self {
            Self::Exited(Ok(status)) if status.signal().is_some() => match *shutdown.borrow() {
                Some(event) => Self::Interrupted(event),
                None => Self::Exited(Ok(status)),
            },
            other => other,
        }
    }
}

impl TestSupervisor {
    pub(crate) async fn run_test(
        &self,
        test: &TestName,
        shutdown: &mut ShutdownReceiver,
    ) -> SupervisedTest {
        let build_watch = stopwatch();
        let build = tokio::select! {
            biased;

            event = shutdown_received(shutdown) => {
                debug!(%test, %event, "interrupted while building");
                return SupervisedTest {
                    result: UnitResult::Interrupted(event),
                    build_time: build_watch.snapshot().duration,
                    run_time: None,
                    emulator_pid: None,
                };
            }
            res = self.build_tool.build(test, self.opt_level) => res,
        };
        let build_time = build_watch.snapshot().duration;

        let diagnostic = match build {
            Ok(BuildOutcome::Success) => None,
            Ok(BuildOutcome::Failed { diagnostic }) => Some(diagnostic),
            Err(err) => Some(DisplayErrorChain::new(&err).to_string()),
        };
        if let Some(diagnostic) = diagnostic {
            debug!(%test, "build failed, not starting emulator");
            return SupervisedTest {
                result: UnitResult::Finished(TestOutcome::Failed(FailureReason::Build {
                    diagnostic,
                })),
                build_time,
                run_time: None,
                emulator_pid: None,
            };
        }

        let run_watch = stopwatch();
        let (result, emulator_pid) = self.run_emulation(test, shutdown).await;
        SupervisedTest {
            result,
            build_time,
            run_time: Some(run_watch.snapshot().duration),
            emulator_pid,
        }
    }

    async fn run_emulation(
        &self,
        test: &TestName,
        shutdown: &mut ShutdownReceiver,
    ) -> (UnitResult, Option<EmulatorPid>) {
        let emulator = self.emulator.command(test);
        let mut cmd = tokio::process::Command::from(
            self.worker
                .command(self.build_tool.workspace_root(), &emulator),
        );
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            // Only a backstop: every path below reaps the worker explicitly.
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => {
                let err = ChildStartError::new(self.worker.program().as_str(), err);
                let error = DisplayErrorChain::new(&err).to_string();
                return (
                    UnitResult::Finished(TestOutcome::Failed(FailureReason::WorkerSpawn {
                        error,
                    })),
                    None,
                );
            }
        };
        debug!(%test, worker_pid = ?child.id(), "started worker");

        let stdout = child.stdout.take().expect("stdout was set");
        let mut channels = WorkerChannels::spawn(stdout);

        let wait = tokio::select! {
            biased;

            event = shutdown_received(shutdown) => WaitResult::Interrupted(event),
            res = tokio::time::timeout(self.timeout, child.wait()) => match res {
                Ok(res) => WaitResult::Exited(res),
                Err(_) => WaitResult::TimedOut,
            },
        };
        let wait = wait.settle(shutdown);

        let result = match wait {
            WaitResult::Exited(Ok(status)) => {
                debug!(%test, %status, "worker exited");
                match channels.recv_output(self.pid_read_timeout).await {
                    ChannelRead::Received(payload) => {
                        UnitResult::Finished(TestOutcome::from_payload(payload))
                    }
                    ChannelRead::Closed | ChannelRead::TimedOut => UnitResult::Finished(
                        TestOutcome::Failed(FailureReason::WorkerExited { status }),
                    ),
                }
            }
            WaitResult::Exited(Err(err)) => {
                warn!(%test, "error waiting for worker: {err}");
                reap_worker(&mut child).await;
                UnitResult::Finished(TestOutcome::Failed(FailureReason::WorkerWait {
                    error: err.to_string(),
                }))
            }
            WaitResult::TimedOut => {
                debug!(%test, timeout = ?self.timeout, "test timed out, killing worker");
                reap_worker(&mut child).await;
                UnitResult::Finished(TestOutcome::TimedOut)
            }
            WaitResult::Interrupted(event) => {
                debug!(%test, %event, "interrupted, killing worker");
                reap_worker(&mut child).await;
                UnitResult::Interrupted(event)
            }
        };

        // The worker has been reaped on every path. The emulator is an orphan now, and must not
        // outlive the test.
        let emulator_pid = match channels.recv_pid(self.pid_read_timeout).await {
            ChannelRead::Received(pid) => {
                kill_emulator(pid);
                Some(pid)
            }
            ChannelRead::Closed => {
                debug!(%test, "worker never published an emulator pid, nothing to kill");
                None
            }
            ChannelRead::TimedOut => {
                warn!(
                    %test,
                    "timed out after {:?} reading the emulator pid, the emulator may still be running",
                    self.pid_read_timeout,
                );
                None
            }
        };
        channels.join(self.pid_read_timeout).await;

        (result, emulator_pid)
    }
}

/// Waits for the first shutdown signal.
///
/// Never returns if the signal handler stops without having received a signal.
async fn shutdown_received(shutdown: &mut ShutdownReceiver) -> ShutdownEvent {
    let event = match shutdown.wait_for(Option::is_some).await {
        Ok(event) => *event,
        Err(_) => None,
    };
    match event {
        Some(event) => event,
        None => std::future::pending().await,
    }
}

async fn reap_worker(child: &mut Child) {
    if let Err(err) = child.start_kill() {
        // The worker may have exited already.
        debug!("error sending SIGKILL to worker: {err}");
    }
    match child.wait().await {
        Ok(status) => debug!(%status, "reaped worker"),
        Err(err) => warn!("error reaping worker: {err}"),
    }
}

/// Sends SIGKILL to the emulator. An emulator that has already exited is not an error.
pub(crate) fn kill_emulator(pid: EmulatorPid) {
    let Ok(raw) = i32::try_from(pid.get()) else {
        warn!(%pid, "emulator pid out of range, not killing it");
        return;
    };
    match kill(Pid::from_raw(raw), Signal::SIGKILL) {
        Ok(()) => debug!(%pid, "sent SIGKILL to emulator"),
        Err(Errno::ESRCH) => debug!(%pid, "emulator already exited"),
        Err(err) => warn!(%pid, "failed to kill emulator: {err}"),
    }
}
