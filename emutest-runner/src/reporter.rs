// Copyright (c) The emutest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Prints out results of test runs.
//!
//! The main structure in this module is [`Reporter`].

use crate::{
    helpers::plural,
    outcome::{FailureReason, TestOutcome},
    runner::{RunStats, TestEvent},
    supervisor::{SupervisedTest, UnitResult},
};
use owo_colors::{OwoColorize, Style};
use std::{
    fmt,
    io::{self, Write},
    time::Duration,
};

/// Standard error destination for the reporter.
///
/// This is usually a terminal, but can be an in-memory buffer for tests.
pub enum ReporterStderr<'a> {
    /// Produce output on the (possibly piped) terminal.
    Terminal,

    /// Write output to a buffer.
    Buffer(&'a mut Vec<u8>),
}

/// Test reporter builder.
#[derive(Debug, Default)]
pub struct ReporterBuilder {
    colorize: bool,
}

impl ReporterBuilder {
    /// Set to true if the reporter should colorize output.
    pub fn set_colorize(&mut self, colorize: bool) -> &mut Self {
        self.colorize = colorize;
        self
    }

    /// Creates a new test reporter.
    pub fn build<'a>(&self, output: ReporterStderr<'a>) -> Reporter<'a> {
        let mut styles = Styles::default();
        if self.colorize {
            styles.colorize();
        }
        Reporter {
            inner: ReporterImpl { styles },
            stderr: output,
        }
    }
}

/// Functionality to report test results to stderr.
pub struct Reporter<'a> {
    inner: ReporterImpl,
    stderr: ReporterStderr<'a>,
}

impl Reporter<'_> {
    /// Report a test event.
    pub fn report_event(&mut self, event: &TestEvent<'_>) -> io::Result<()> {
        match &mut self.stderr {
            ReporterStderr::Terminal => {
                let mut writer = io::stderr().lock();
                self.inner.write_event(event, &mut writer)?;
                writer.flush()
            }
            ReporterStderr::Buffer(buf) => self.inner.write_event(event, buf),
        }
    }
}

struct ReporterImpl {
    styles: Styles,
}

impl ReporterImpl {
    fn write_event(&self, event: &TestEvent<'_>, writer: &mut impl Write) -> io::Result<()> {
        match event {
            TestEvent::RunStarted {
                test_list,
                opt_level,
            } => {
                writeln!(writer, "{}", hbar(12))?;
                write!(writer, "{:>12} ", "Starting".style(self.styles.pass))?;
                writeln!(
                    writer,
                    "{} {} ({} build)",
                    test_list.len().style(self.styles.count),
                    plural::tests_str(test_list.len()),
                    opt_level.style(self.styles.count),
                )?;
            }
            TestEvent::TestStarted {
                test,
                index,
                current_stats,
            } => {
                writeln!(
                    writer,
                    "{:>12} [{}/{}] {test}",
                    "BUILDING".style(self.styles.pass),
                    (index + 1).style(self.styles.count),
                    current_stats.initial_run_count.style(self.styles.count),
                )?;
            }
            TestEvent::TestFinished {
                test, supervised, ..
            } => {
                self.write_finished(test, supervised, writer)?;
            }
            TestEvent::RunInterrupted { event, not_run } => {
                writeln!(
                    writer,
                    "{:>12} due to {}: {} {} not run",
                    "Cancelling".style(self.styles.fail),
                    event.style(self.styles.count),
                    not_run.style(self.styles.count),
                    plural::tests_str(*not_run),
                )?;
            }
            TestEvent::RunFinished {
                elapsed, run_stats, ..
            } => {
                let summary_style = if run_stats.is_success() {
                    self.styles.pass
                } else {
                    self.styles.fail
                };
                write!(
                    writer,
                    "{}\n{:>12} ",
                    hbar(12),
                    "Summary".style(summary_style)
                )?;
                write!(writer, "{}", DisplayBracketedDuration(*elapsed))?;
                self.write_summary(run_stats, writer)?;
                writeln!(writer)?;
            }
        }
        Ok(())
    }

    fn write_finished(
        &self,
        test: &impl fmt::Display,
        supervised: &SupervisedTest,
        writer: &mut impl Write,
    ) -> io::Result<()> {
        let duration = DisplayBracketedDuration(
            supervised.run_time.unwrap_or(supervised.build_time),
        );

        match &supervised.result {
            UnitResult::Finished(TestOutcome::Passed) => {
                writeln!(
                    writer,
                    "{:>12} {duration}{test}",
                    "PASS".style(self.styles.pass)
                )?;
            }
            UnitResult::Finished(TestOutcome::TimedOut) => {
                writeln!(
                    writer,
                    "{:>12} {duration}{test}",
                    "TIMEOUT".style(self.styles.timeout)
                )?;
            }
            UnitResult::Finished(TestOutcome::Failed(FailureReason::Build { diagnostic })) => {
                writeln!(
                    writer,
                    "{:>12} {duration}{test}",
                    "BUILD FAIL".style(self.styles.fail)
                )?;
                self.write_output("BUILD OUTPUT", test, diagnostic, writer)?;
            }
            UnitResult::Finished(TestOutcome::Failed(FailureReason::PayloadMismatch {
                payload,
            })) => {
                writeln!(
                    writer,
                    "{:>12} {duration}{test}",
                    "FAIL".style(self.styles.fail)
                )?;
                self.write_output("OUTPUT", test, payload, writer)?;
            }
            UnitResult::Finished(TestOutcome::Failed(reason)) => {
                writeln!(
                    writer,
                    "{:>12} {duration}{test}: {reason}",
                    "FAIL".style(self.styles.fail)
                )?;
            }
            UnitResult::Interrupted(event) => {
                writeln!(
                    writer,
                    "{:>12} {duration}{test} (received {event})",
                    "INTERRUPTED".style(self.styles.fail)
                )?;
            }
        }
        Ok(())
    }

    fn write_output(
        &self,
        header: &str,
        test: &impl fmt::Display,
        output: &str,
        writer: &mut impl Write,
    ) -> io::Result<()> {
        writeln!(
            writer,
            "{}",
            format!("--- {header}: {test} ---").style(self.styles.fail_output)
        )?;
        if output.is_empty() {
            writeln!(writer, "(no output)")?;
        } else {
            write!(writer, "{output}")?;
            if !output.ends_with('\n') {
                writeln!(writer)?;
            }
        }
        Ok(())
    }

    fn write_summary(&self, stats: &RunStats, writer: &mut impl Write) -> io::Result<()> {
        write!(
            writer,
            "{}/{} {} passed, {} failed, {} timed out",
            stats.passed.style(self.styles.count),
            stats.initial_run_count.style(self.styles.count),
            plural::tests_str(stats.initial_run_count),
            stats.failed.style(self.styles.fail),
            stats.timed_out.style(self.styles.timeout),
        )?;
        let not_run = stats.initial_run_count - stats.finished_count;
        if not_run > 0 {
            write!(writer, ", {} not run", not_run.style(self.styles.skip))?;
        }
        Ok(())
    }
}

fn hbar(width: usize) -> String {
    "-".repeat(width)
}

struct DisplayBracketedDuration(Duration);

impl fmt::Display for DisplayBracketedDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // * > means right-align.
        // * 8 is the number of characters to pad to.
        // * .3 means print three digits after the decimal point.
        write!(f, "[{:>8.3?}s] ", self.0.as_secs_f64())
    }
}

#[derive(Debug, Default)]
struct Styles {
    count: Style,
    pass: Style,
    fail: Style,
    timeout: Style,
    skip: Style,
    fail_output: Style,
}

impl Styles {
    fn colorize(&mut self) {
        self.count = Style::new().bold();
        self.pass = Style::new().green().bold();
        self.fail = Style::new().red().bold();
        self.timeout = Style::new().purple().bold();
        self.skip = Style::new().yellow().bold();
        self.fail_output = Style::new().magenta();
    }
}
