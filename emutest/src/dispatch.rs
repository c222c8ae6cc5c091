// Copyright (c) The emutest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Top-level application and command routing.

use crate::{
    ExpectedError, Result,
    output::{OutputContext, OutputOpts, OutputWriter},
    worker::WorkerOpts,
};
use camino::{Utf8Path, Utf8PathBuf};
use clap::{Args, Parser, Subcommand};
use emutest_runner::{
    build_tool::OptLevel,
    config::{DefaultConfigWarnings, EmutestConfig},
    exit_codes::EmutestExitCode,
    list::TestList,
    reporter::ReporterBuilder,
    runner::TestRunnerBuilder,
    signal::SignalHandlerKind,
    worker::WorkerSpawnInfo,
};
use std::{io::Write, time::Duration};
use tracing::debug;

/// Build firmware tests, run each one in an emulator and report the results.
#[derive(Debug, Parser)]
#[command(
    version,
    styles = crate::output::clap_styles::style(),
    max_term_width = 100,
)]
pub struct EmutestApp {
    #[command(flatten)]
    common: CommonOpts,

    #[command(subcommand)]
    command: Command,
}

impl EmutestApp {
    /// Initializes the output context.
    pub fn init_output(&self) -> OutputContext {
        match &self.command {
            Command::Worker(_) => OutputContext::color_never_init(),
            _ => self.common.output.init(),
        }
    }

    /// Executes the app.
    ///
    /// Returns the exit code.
    pub fn exec(self, output: OutputContext, output_writer: &mut OutputWriter) -> Result<i32> {
        match self.command {
            Command::Run(opts) => {
                let config = self.common.load_config()?;
                opts.exec(&config, output, output_writer)
            }
            Command::List => {
                let config = self.common.load_config()?;
                exec_list(&config, output, output_writer)
            }
            Command::ShowConfig => {
                let config = self.common.load_config()?;
                exec_show_config(&config, output_writer)
            }
            Command::Worker(opts) => opts.exec(),
        }
    }
}

#[derive(Debug, Args)]
struct CommonOpts {
    /// Directory the build tool and emulator are run from [default: current directory]
    #[arg(long, global = true, value_name = "DIR", env = "EMUTEST_WORKSPACE_ROOT")]
    workspace_root: Option<Utf8PathBuf>,

    /// Config file [default: <workspace-root>/.config/emutest.toml]
    #[arg(long, global = true, value_name = "PATH")]
    config_file: Option<Utf8PathBuf>,

    #[command(flatten)]
    output: OutputOpts,
}

impl CommonOpts {
    fn load_config(&self) -> Result<EmutestConfig> {
        let workspace_root = match &self.workspace_root {
            Some(root) => root.clone(),
            None => {
                let cwd = std::env::current_dir()
                    .map_err(|err| ExpectedError::CurrentDirFailed { err })?;
                Utf8PathBuf::try_from(cwd).map_err(|err| ExpectedError::CurrentDirFailed {
                    err: err.into_io_error(),
                })?
            }
        };
        let workspace_root = workspace_root.canonicalize_utf8().map_err(|err| {
            ExpectedError::WorkspaceRootInvalid {
                workspace_root: workspace_root.clone(),
                err,
            }
        })?;
        debug!(%workspace_root, "loading config");

        let config = EmutestConfig::from_sources(
            workspace_root,
            self.config_file.as_deref(),
            &mut DefaultConfigWarnings,
        )?;
        if config.tests().is_empty() {
            return Err(ExpectedError::NoTestsConfigured {
                config_file: self.config_file_path(config.workspace_root()),
            });
        }
        Ok(config)
    }

    fn config_file_path(&self, workspace_root: &Utf8Path) -> Utf8PathBuf {
        match &self.config_file {
            Some(file) => file.clone(),
            None => workspace_root.join(EmutestConfig::CONFIG_PATH),
        }
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Build and run tests
    Run(RunOpts),

    /// List configured tests
    List,

    /// Show the resolved configuration
    ShowConfig,

    /// Private command, used to run an emulator in an isolated worker process.
    #[command(name = WorkerSpawnInfo::SUBCOMMAND_NAME, hide = true)]
    Worker(WorkerOpts),
}

/// The bare word accepted in place of `--release`.
const OPTIMIZE_WORD: &str = "optimize";

#[derive(Debug, Args)]
struct RunOpts {
    /// Build test images with optimizations
    #[arg(long, visible_alias = OPTIMIZE_WORD)]
    release: bool,

    /// Skip the clean step before the first test
    #[arg(long)]
    no_clean: bool,

    /// Per-test timeout, overriding the config (e.g. "10s", "1m 30s")
    #[arg(long, value_name = "DURATION", value_parser = parse_duration)]
    timeout: Option<Duration>,

    /// Tests to run, in configured order [default: all configured tests]
    #[arg(value_name = "TESTS")]
    tests: Vec<String>,
}

impl RunOpts {
    fn exec(
        self,
        config: &EmutestConfig,
        output: OutputContext,
        output_writer: &mut OutputWriter,
    ) -> Result<i32> {
        let (opt_level, requested) = self.resolve_tests(config.tests());
        let test_list = config.tests().select(&requested)?;

        let mut builder = TestRunnerBuilder::default();
        builder
            .set_opt_level(opt_level)
            .set_no_clean(self.no_clean);
        if let Some(timeout) = self.timeout {
            builder.set_timeout(timeout);
        }

        let worker = WorkerSpawnInfo::current_exe()
            .map_err(|err| ExpectedError::CurrentExeFailed { err })?;
        let runner = builder.build(config, &test_list, SignalHandlerKind::Standard, worker)?;

        let mut reporter = ReporterBuilder::default()
            .set_colorize(output.color.should_colorize(supports_color::Stream::Stderr))
            .build(output_writer.reporter_output());

        let mut write_error = None;
        let run_stats = runner.execute(|event| {
            if write_error.is_some() {
                return;
            }
            if let Err(err) = reporter.report_event(&event) {
                write_error = Some(err);
            }
        })?;
        if let Some(err) = write_error {
            return Err(ExpectedError::write_error(err));
        }

        if run_stats.is_success() {
            Ok(EmutestExitCode::OK)
        } else {
            Err(ExpectedError::TestRunFailed)
        }
    }

    /// Splits the bare `optimize` word out of the test arguments, unless a test has that name.
    fn resolve_tests(&self, configured: &TestList) -> (OptLevel, Vec<String>) {
        let mut release = self.release;
        let is_test = configured.iter().any(|t| t.as_str() == OPTIMIZE_WORD);
        let requested = self
            .tests
            .iter()
            .filter(|name| {
                if !is_test && name.as_str() == OPTIMIZE_WORD {
                    release = true;
                    false
                } else {
                    true
                }
            })
            .cloned()
            .collect();

        let opt_level = if release {
            OptLevel::Release
        } else {
            OptLevel::Debug
        };
        (opt_level, requested)
    }
}

fn parse_duration(s: &str) -> std::result::Result<Duration, humantime::DurationError> {
    humantime::parse_duration(s)
}

fn exec_list(
    config: &EmutestConfig,
    output: OutputContext,
    output_writer: &mut OutputWriter,
) -> Result<i32> {
    let mut writer = output_writer.stdout_writer();
    for test in config.tests() {
        let res = if output.verbose {
            writeln!(
                writer,
                "{test}  {}",
                config.emulator().artifact_path(test)
            )
        } else {
            writeln!(writer, "{test}")
        };
        res.map_err(ExpectedError::write_error)?;
    }
    writer.flush().map_err(ExpectedError::write_error)?;
    Ok(EmutestExitCode::OK)
}

fn exec_show_config(config: &EmutestConfig, output_writer: &mut OutputWriter) -> Result<i32> {
    let mut writer = output_writer.stdout_writer();
    write_config(config, &mut writer).map_err(ExpectedError::write_error)?;
    writer.flush().map_err(ExpectedError::write_error)?;
    Ok(EmutestExitCode::OK)
}

fn write_config(config: &EmutestConfig, writer: &mut impl Write) -> std::io::Result<()> {
    let build = config.build();
    let emulator = config.emulator();
    let run = config.run();

    writeln!(writer, "workspace root: {}", config.workspace_root())?;
    writeln!(writer, "tests ({}):", config.tests().len())?;
    for test in config.tests() {
        writeln!(writer, "  {test}")?;
    }

    writeln!(writer, "build:")?;
    writeln!(writer, "  program: {}", build.program)?;
    writeln!(
        writer,
        "  clean: {}",
        shell_words::join(std::iter::once(&build.program).chain(&build.clean_args))
    )?;
    writeln!(
        writer,
        "  board: {}",
        build.board.as_deref().unwrap_or("(none)")
    )?;
    match build.jobs {
        Some(jobs) => writeln!(writer, "  jobs: {jobs}")?,
        None => writeln!(writer, "  jobs: (available CPUs)")?,
    }
    writeln!(writer, "  debug flags: {}", build.optimize_flags.debug)?;
    writeln!(writer, "  release flags: {}", build.optimize_flags.release)?;
    if !build.extra_args.is_empty() {
        writeln!(
            writer,
            "  extra args: {}",
            shell_words::join(&build.extra_args)
        )?;
    }

    writeln!(writer, "emulator:")?;
    writeln!(writer, "  program: {}", emulator.program)?;
    writeln!(writer, "  machine: {}", emulator.machine)?;
    if !emulator.extra_args.is_empty() {
        writeln!(
            writer,
            "  extra args: {}",
            shell_words::join(&emulator.extra_args)
        )?;
    }
    writeln!(
        writer,
        "  images: {}/<test>.{}",
        emulator.artifact_dir, emulator.artifact_extension
    )?;

    writeln!(writer, "run:")?;
    writeln!(
        writer,
        "  timeout: {}",
        humantime::format_duration(run.timeout)
    )?;
    writeln!(
        writer,
        "  pid read timeout: {}",
        humantime::format_duration(run.pid_read_timeout)
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::Utf8TempDir;
    use indoc::{formatdoc, indoc};
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    fn write_config_file(dir: &Utf8TempDir, contents: &str) {
        let config_dir = dir.path().join(".config");
        std::fs::create_dir_all(&config_dir).unwrap();
        std::fs::write(config_dir.join("emutest.toml"), contents).unwrap();
    }

    fn parse(args: &[&str]) -> EmutestApp {
        EmutestApp::try_parse_from(std::iter::once("emutest").chain(args.iter().copied()))
            .unwrap()
    }

    fn exec_captured(app: EmutestApp) -> (Result<i32>, String) {
        let mut writer = OutputWriter::Test {
            stdout: Vec::new(),
            stderr: Vec::new(),
        };
        let output = OutputContext {
            verbose: app.common.output.verbose,
            color: crate::output::Color::Never,
        };
        let res = app.exec(output, &mut writer);
        let OutputWriter::Test { stdout, .. } = writer else {
            unreachable!("writer is always the test variant")
        };
        (res, String::from_utf8(stdout).unwrap())
    }

    #[test]
    fn verify_app() {
        use clap::CommandFactory;
        EmutestApp::command().debug_assert();
    }

    #[test_case(&["run"], OptLevel::Debug, &[] ; "no args")]
    #[test_case(&["run", "--release"], OptLevel::Release, &[] ; "release flag")]
    #[test_case(&["run", "--optimize"], OptLevel::Release, &[] ; "optimize flag")]
    #[test_case(&["run", "optimize"], OptLevel::Release, &[] ; "optimize word")]
    #[test_case(
        &["run", "test_b", "optimize"],
        OptLevel::Release,
        &["test_b"]
        ; "optimize word with tests"
    )]
    fn resolve_tests(args: &[&str], opt_level: OptLevel, requested: &[&str]) {
        let app = parse(args);
        let Command::Run(opts) = app.command else {
            panic!("expected run command");
        };
        let configured = TestList::from_names(["test_a", "test_b"]).unwrap();
        let (actual_level, actual_requested) = opts.resolve_tests(&configured);
        assert_eq!(actual_level, opt_level);
        assert_eq!(actual_requested, requested);
    }

    #[test]
    fn optimize_word_is_a_test_when_configured() {
        let app = parse(&["run", "optimize"]);
        let Command::Run(opts) = app.command else {
            panic!("expected run command");
        };
        let configured = TestList::from_names(["optimize", "test_b"]).unwrap();
        let (opt_level, requested) = opts.resolve_tests(&configured);
        assert_eq!(opt_level, OptLevel::Debug);
        assert_eq!(requested, ["optimize"]);
    }

    #[test]
    fn parse_timeout() {
        let app = parse(&["run", "--timeout", "1m 30s", "test_a"]);
        let Command::Run(opts) = app.command else {
            panic!("expected run command");
        };
        assert_eq!(opts.timeout, Some(Duration::from_secs(90)));
        assert_eq!(opts.tests, ["test_a"]);

        EmutestApp::try_parse_from(["emutest", "run", "--timeout", "soon"])
            .expect_err("invalid duration is rejected");
    }

    #[test]
    fn worker_subcommand_is_hidden() {
        use clap::CommandFactory;
        let command = EmutestApp::command();
        let worker = command
            .find_subcommand(WorkerSpawnInfo::SUBCOMMAND_NAME)
            .expect("worker subcommand exists");
        assert!(worker.is_hide_set());
    }

    #[test]
    fn list_tests() {
        let dir = Utf8TempDir::new().unwrap();
        write_config_file(
            &dir,
            indoc! {r#"
                tests = ["test_sanity", "test_task_self"]
            "#},
        );

        let app = parse(&["--workspace-root", dir.path().as_str(), "list"]);
        let (res, stdout) = exec_captured(app);
        assert_eq!(res.unwrap(), EmutestExitCode::OK);
        assert_eq!(stdout, "test_sanity\ntest_task_self\n");

        let app = parse(&["--workspace-root", dir.path().as_str(), "list", "-v"]);
        let (res, stdout) = exec_captured(app);
        assert_eq!(res.unwrap(), EmutestExitCode::OK);
        assert_eq!(
            stdout,
            "test_sanity  build/test_sanity.elf\ntest_task_self  build/test_task_self.elf\n"
        );
    }

    #[test]
    fn show_config() {
        let dir = Utf8TempDir::new().unwrap();
        write_config_file(
            &dir,
            indoc! {r#"
                tests = ["test_sanity"]

                [build]
                board = "F405"
                jobs = 2

                [run]
                timeout = "10s"
            "#},
        );

        let app = parse(&["--workspace-root", dir.path().as_str(), "show-config"]);
        let (res, stdout) = exec_captured(app);
        assert_eq!(res.unwrap(), EmutestExitCode::OK);

        let root = dir.path().canonicalize_utf8().unwrap();
        let expected = formatdoc! {"
                workspace root: {}
                tests (1):
                  test_sanity
                build:
                  program: make
                  clean: make clean
                  board: F405
                  jobs: 2
                  debug flags: -O0
                  release flags: -O2 -flto
                emulator:
                  program: qemu-system-arm
                  machine: olimex-stm32-h405
                  extra args: -nographic
                  images: build/<test>.elf
                run:
                  timeout: 10s
                  pid read timeout: 1s
            ",
            root
        };
        assert_eq!(stdout, expected);
    }

    #[test]
    fn no_tests_configured() {
        let dir = Utf8TempDir::new().unwrap();
        let app = parse(&["--workspace-root", dir.path().as_str(), "list"]);
        let (res, _) = exec_captured(app);
        let err = res.expect_err("no tests are configured");
        assert!(
            matches!(err, ExpectedError::NoTestsConfigured { .. }),
            "unexpected error: {err:?}"
        );
        assert_eq!(err.process_exit_code(), EmutestExitCode::SETUP_ERROR);
    }

    #[test]
    fn unknown_test_requested() {
        let dir = Utf8TempDir::new().unwrap();
        write_config_file(&dir, "tests = [\"test_sanity\"]\n");

        // Selection happens before anything is built or run.
        let app = parse(&[
            "--workspace-root",
            dir.path().as_str(),
            "run",
            "test_missing",
        ]);
        let (res, _) = exec_captured(app);
        let err = res.expect_err("test isn't configured");
        assert!(
            matches!(err, ExpectedError::UnknownTests { .. }),
            "unexpected error: {err:?}"
        );
        assert_eq!(err.process_exit_code(), EmutestExitCode::SETUP_ERROR);
    }

    #[test]
    fn invalid_workspace_root() {
        let app = parse(&["--workspace-root", "/nonexistent/emutest/root", "list"]);
        let (res, _) = exec_captured(app);
        let err = res.expect_err("workspace root doesn't exist");
        assert!(
            matches!(err, ExpectedError::WorkspaceRootInvalid { .. }),
            "unexpected error: {err:?}"
        );
    }
}
