// Copyright (c) The emutest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The test runner.
//!
//! The main structure in this module is [`TestRunner`]. It runs the pre-run clean step, then runs
//! every test in order through the supervisor, one at a time.

use crate::{
    build_tool::{BuildOutcome, BuildTool, OptLevel},
    config::EmutestConfig,
    errors::{TestRunnerBuildError, TestRunnerExecuteError},
    list::{TestList, TestName},
    outcome::{FailureReason, TestOutcome},
    signal::{ShutdownEvent, SignalHandler, SignalHandlerKind},
    supervisor::{SupervisedTest, TestSupervisor, UnitResult},
    time::stopwatch,
    worker::WorkerSpawnInfo,
};
use chrono::{DateTime, Local};
use std::time::Duration;
use tokio::{runtime::Runtime, sync::watch};
use tracing::{debug, warn};

/// Test runner options.
#[derive(Debug, Default)]
pub struct TestRunnerBuilder {
    opt_level: OptLevel,
    timeout: Option<Duration>,
    no_clean: bool,
}

impl TestRunnerBuilder {
    /// Sets the optimization level test images are built with.
    pub fn set_opt_level(&mut self, opt_level: OptLevel) -> &mut Self {
        self.opt_level = opt_level;
        self
    }

    /// Overrides the configured per-test timeout.
    pub fn set_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.timeout = Some(timeout);
        self
    }

    /// Skips the pre-run clean step.
    pub fn set_no_clean(&mut self, no_clean: bool) -> &mut Self {
        self.no_clean = no_clean;
        self
    }

    /// Creates a new test runner.
    pub fn build<'a>(
        self,
        config: &'a EmutestConfig,
        test_list: &'a TestList,
        signal_handler: SignalHandlerKind,
        worker: WorkerSpawnInfo,
    ) -> Result<TestRunner<'a>, TestRunnerBuildError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("emutest-runner-worker")
            .build()
            .map_err(TestRunnerBuildError::TokioRuntimeCreate)?;
        let _guard = runtime.enter();

        // signal_handler.build() must be called from within the guard.
        let signal_handler = signal_handler.build()?;

        let supervisor = TestSupervisor {
            worker,
            build_tool: BuildTool::new(config.workspace_root(), config.build().clone()),
            emulator: config.emulator().clone(),
            opt_level: self.opt_level,
            timeout: self.timeout.unwrap_or(config.run().timeout),
            pid_read_timeout: config.run().pid_read_timeout,
        };

        Ok(TestRunner {
            inner: TestRunnerInner {
                supervisor,
                test_list,
                no_clean: self.no_clean,
                runtime,
            },
            signal_handler,
        })
    }
}

/// Context for running tests.
///
/// Created using [`TestRunnerBuilder::build`].
#[derive(Debug)]
pub struct TestRunner<'a> {
    inner: TestRunnerInner<'a>,
    signal_handler: SignalHandler,
}

impl<'a> TestRunner<'a> {
    /// Executes the listed tests in order, each one in its own worker process.
    ///
    /// The callback is called with each event as it happens. A failing test never stops the run;
    /// only a shutdown signal does.
    pub fn execute<F>(self, callback: F) -> Result<RunStats, TestRunnerExecuteError>
    where
        F: FnMut(TestEvent<'a>),
    {
        let Self {
            inner,
            signal_handler,
        } = self;
        let res = inner.runtime.block_on(inner.execute(signal_handler, callback));

        // Nothing the runtime could still be doing is worth waiting for.
        inner.runtime.shutdown_background();
        res
    }
}

#[derive(Debug)]
struct TestRunnerInner<'a> {
    supervisor: TestSupervisor,
    test_list: &'a TestList,
    no_clean: bool,
    runtime: Runtime,
}

impl<'a> TestRunnerInner<'a> {
    async fn execute<F>(
        &self,
        mut signal_handler: SignalHandler,
        mut callback: F,
    ) -> Result<RunStats, TestRunnerExecuteError>
    where
        F: FnMut(TestEvent<'a>),
    {
        if !self.no_clean {
            self.clean().await?;
        }

        let (shutdown_tx, mut shutdown_rx) = watch::channel(None);
        let forwarder = tokio::spawn(async move {
            if let Some(event) = signal_handler.recv().await {
                debug!(%event, "received shutdown signal");
                shutdown_tx.send_replace(Some(event));
            }
        });

        let run_watch = stopwatch();
        let mut run_stats = RunStats {
            initial_run_count: self.test_list.len(),
            ..RunStats::default()
        };
        callback(TestEvent::RunStarted {
            test_list: self.test_list,
            opt_level: self.supervisor.opt_level,
        });

        let mut interrupted = None;
        for (index, test) in self.test_list.iter().enumerate() {
            if let Some(event) = *shutdown_rx.borrow() {
                interrupted = Some(event);
                break;
            }

            callback(TestEvent::TestStarted {
                test,
                index,
                current_stats: run_stats,
            });

            let supervised = self.supervisor.run_test(test, &mut shutdown_rx).await;
            match &supervised.result {
                UnitResult::Finished(outcome) => run_stats.on_test_finished(outcome),
                UnitResult::Interrupted(event) => interrupted = Some(*event),
            }

            callback(TestEvent::TestFinished {
                test,
                supervised,
                current_stats: run_stats,
            });
            if interrupted.is_some() {
                break;
            }
        }

        forwarder.abort();

        if let Some(event) = interrupted {
            callback(TestEvent::RunInterrupted {
                event,
                not_run: run_stats.initial_run_count - run_stats.finished_count,
            });
        }

        let snapshot = run_watch.snapshot();
        callback(TestEvent::RunFinished {
            start_time: snapshot.start_time,
            elapsed: snapshot.duration,
            run_stats,
        });

        Ok(run_stats)
    }

    async fn clean(&self) -> Result<(), TestRunnerExecuteError> {
        let outcome = self
            .supervisor
            .build_tool
            .clean()
            .await
            .map_err(TestRunnerExecuteError::Clean)?;
        match outcome {
            BuildOutcome::Success => debug!("pre-run clean succeeded"),
            BuildOutcome::Failed { diagnostic } => {
                warn!("pre-run clean failed, continuing anyway");
                debug!("clean output:\n{diagnostic}");
            }
        }
        Ok(())
    }
}

/// An event that occurred during a test run.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum TestEvent<'a> {
    /// The run started, after the clean step.
    RunStarted {
        /// The tests that will be run, in order.
        test_list: &'a TestList,

        /// The optimization level tests are built with.
        opt_level: OptLevel,
    },

    /// A test is about to be built and run.
    TestStarted {
        /// The test.
        test: &'a TestName,

        /// The zero-based index of the test in the run.
        index: usize,

        /// Statistics for the run so far.
        current_stats: RunStats,
    },

    /// A test finished, or was interrupted.
    TestFinished {
        /// The test.
        test: &'a TestName,

        /// How the test ended, and how long it took.
        supervised: SupervisedTest,

        /// Statistics for the run so far, including this test.
        current_stats: RunStats,
    },

    /// A shutdown signal stopped the run early.
    RunInterrupted {
        /// The signal.
        event: ShutdownEvent,

        /// The number of tests that didn't finish.
        not_run: usize,
    },

    /// The run finished.
    RunFinished {
        /// When the run started.
        start_time: DateTime<Local>,

        /// How long the run took, not including the clean step.
        elapsed: Duration,

        /// Final statistics for the run.
        run_stats: RunStats,
    },
}

/// Statistics for a test run.
#[derive(Copy, Clone, Default, Debug, Eq, PartialEq)]
pub struct RunStats {
    /// The total number of tests that were expected to be run at the beginning.
    ///
    /// If the run is interrupted, this will be more than `finished_count` at the end.
    pub initial_run_count: usize,

    /// The total number of tests that finished running.
    pub finished_count: usize,

    /// The number of tests that passed.
    pub passed: usize,

    /// The number of tests that failed, including tests that failed to build.
    pub failed: usize,

    /// The number of tests that failed to build. Also counted in `failed`.
    pub build_failed: usize,

    /// The number of tests that timed out.
    pub timed_out: usize,
}

impl RunStats {
    /// Returns true if this run is considered a success: every test that was expected to run
    /// finished and passed.
    pub fn is_success(&self) -> bool {
        self.initial_run_count == self.finished_count && self.passed == self.finished_count
    }

    fn on_test_finished(&mut self, outcome: &TestOutcome) {
        self.finished_count += 1;
        match outcome {
            TestOutcome::Passed => self.passed += 1,
            TestOutcome::Failed(reason) => {
                self.failed += 1;
                if matches!(reason, FailureReason::Build { .. }) {
                    self.build_failed += 1;
                }
            }
            TestOutcome::TimedOut => self.timed_out += 1,
        }
    }
}
