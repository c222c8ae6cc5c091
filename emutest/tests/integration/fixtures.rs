// Copyright (c) The emutest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use camino::{Utf8Path, Utf8PathBuf};
use camino_tempfile::Utf8TempDir;
use std::{
    fmt,
    os::unix::fs::PermissionsExt,
    process::{Child, Command, ExitStatus, Stdio},
    sync::{Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

/// Serializes tests in this binary.
///
/// Each test writes shell scripts and then executes them. If another thread forks while a script
/// is still open for writing, the exec fails with ETXTBSY, so scripts are only ever written and run
/// while holding this lock.
static LOCK: Mutex<()> = Mutex::new(());

/// A fake build tool.
///
/// Records its arguments to `build.log`. `clean` removes the build directory; otherwise the test
/// named by `TEST_NAME` is "built" by writing its name into `build/<test>.elf`. Tests whose names
/// contain `build_fail` fail to build.
const FAKE_MAKE: &str = r#"#!/bin/sh
echo "$@" >> build.log
if [ "$1" = clean ]; then
    rm -rf build
    exit 0
fi
for arg in "$@"; do
    case "$arg" in
        TEST_NAME=*) test="${arg#TEST_NAME=}" ;;
    esac
done
case "$test" in
    *build_fail*)
        echo "building $test"
        echo "$test.c:12: error: expected ';' before '}' token" >&2
        exit 2
        ;;
esac
mkdir -p build
echo "$test" > "build/$test.elf"
"#;

/// A fake emulator.
///
/// Reads the test name back from the `-kernel` image and behaves accordingly. Emulators that are
/// meant to be killed record their pid in `<test>.pid` first.
const FAKE_EMULATOR: &str = r#"#!/bin/sh
while [ $# -gt 0 ]; do
    case "$1" in
        -kernel) kernel="$2"; shift ;;
    esac
    shift
done
test=$(cat "$kernel") || exit 1
case "$test" in
    *mismatch*)
        printf 'Fail: task starved\n<Test finished>\n'
        ;;
    *crash*)
        printf 'hard fault\n'
        exit 3
        ;;
    *hang*)
        echo $$ > "$test.pid"
        printf 'booting\n'
        exec sleep 60
        ;;
    *linger*)
        printf 'Pass\n<Test finished>\n'
        echo $$ > "$test.pid"
        exec sleep 60
        ;;
    *near_miss*)
        printf 'Pass\n <Test finished>\nPass \n<Test finished>\n'
        ;;
    *)
        printf 'Pass\n<Test finished>\n'
        ;;
esac
"#;

pub(crate) struct TempWorkspace {
    // Held for the lifetime of the workspace.
    _guard: MutexGuard<'static, ()>,
    dir: Utf8TempDir,
}

impl TempWorkspace {
    pub(crate) fn new(tests: &[&str], timeout: &str) -> Self {
        let guard = LOCK.lock().unwrap_or_else(PoisonError::into_inner);
        let dir = camino_tempfile::Builder::new()
            .prefix("emutest-fixture-")
            .tempdir()
            .expect("created temp dir");
        let ws = Self { _guard: guard, dir };

        let make = ws.write_script("fake-make", FAKE_MAKE);
        let emulator = ws.write_script("fake-emulator", FAKE_EMULATOR);

        let tests = tests
            .iter()
            .map(|t| format!("{t:?}"))
            .collect::<Vec<_>>()
            .join(", ");
        let config = format!(
            r#"tests = [{tests}]

[build]
program = "{make}"
jobs = 2

[emulator]
program = "{emulator}"
extra-args = []

[run]
timeout = "{timeout}"
"#
        );
        std::fs::create_dir_all(ws.root().join(".config")).expect("created .config");
        std::fs::write(ws.root().join(".config/emutest.toml"), config).expect("wrote config");
        ws
    }

    pub(crate) fn root(&self) -> &Utf8Path {
        self.dir.path()
    }

    fn write_script(&self, name: &str, contents: &str) -> Utf8PathBuf {
        let path = self.root().join(name);
        std::fs::write(&path, contents).expect("wrote script");
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .expect("made script executable");
        path
    }

    pub(crate) fn build_log(&self) -> String {
        std::fs::read_to_string(self.root().join("build.log")).unwrap_or_default()
    }

    /// Returns the pid the fake emulator recorded for `test`.
    pub(crate) fn emulator_pid(&self, test: &str) -> Option<i32> {
        let contents = std::fs::read_to_string(self.root().join(format!("{test}.pid"))).ok()?;
        contents.trim().parse().ok()
    }

    /// Waits for the fake emulator to record its pid.
    pub(crate) fn wait_for_emulator_pid(&self, test: &str) -> i32 {
        let start = Instant::now();
        loop {
            if let Some(pid) = self.emulator_pid(test) {
                return pid;
            }
            assert!(
                start.elapsed() < Duration::from_secs(30),
                "emulator for {test} never started"
            );
            std::thread::sleep(Duration::from_millis(50));
        }
    }

    pub(crate) fn cli(&self) -> EmutestCli {
        let mut cli = EmutestCli::new();
        cli.args(["--workspace-root", self.root().as_str(), "--color", "never"]);
        cli
    }
}

pub(crate) struct EmutestCli {
    args: Vec<String>,
}

impl EmutestCli {
    fn new() -> Self {
        Self { args: Vec::new() }
    }

    pub(crate) fn args(&mut self, args: impl IntoIterator<Item = impl Into<String>>) -> &mut Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    fn command(&self) -> Command {
        let mut command = Command::new(env!("CARGO_BIN_EXE_emutest"));
        command
            .args(&self.args)
            .env_remove("EMUTEST_LOG")
            .env_remove("EMUTEST_VERBOSE")
            .env_remove("EMUTEST_WORKSPACE_ROOT")
            .stdin(Stdio::null());
        command
    }

    pub(crate) fn output(&self) -> EmutestOutput {
        let output = self.command().output().expect("emutest ran");
        EmutestOutput {
            args: self.args.clone(),
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }
    }

    pub(crate) fn spawn(&self) -> Child {
        self.command()
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .expect("emutest spawned")
    }
}

pub(crate) struct EmutestOutput {
    pub(crate) args: Vec<String>,
    pub(crate) status: ExitStatus,
    pub(crate) stdout: String,
    pub(crate) stderr: String,
}

impl EmutestOutput {
    pub(crate) fn from_child(child: Child) -> Self {
        let output = child.wait_with_output().expect("waited for emutest");
        Self {
            args: Vec::new(),
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }
    }

    pub(crate) fn exit_code(&self) -> Option<i32> {
        self.status.code()
    }

    /// Returns the status lines printed for each test, with durations removed.
    pub(crate) fn status_lines(&self) -> Vec<String> {
        self.stderr
            .lines()
            .filter_map(|line| {
                let (status, rest) = line.split_once(" [")?;
                let (_duration, test) = rest.split_once("s] ")?;
                Some(format!("{} {test}", status.trim()))
            })
            .collect()
    }
}

impl fmt::Debug for EmutestOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "emutest {}", self.args.join(" "))?;
        writeln!(f, "status: {}", self.status)?;
        writeln!(f, "--- stdout ---\n{}", self.stdout)?;
        writeln!(f, "--- stderr ---\n{}", self.stderr)
    }
}

/// Returns true once the process is gone.
///
/// An orphan that has been killed may linger as a zombie until its new parent reaps it; that counts
/// as gone.
pub(crate) fn process_is_gone(pid: i32) -> bool {
    let start = Instant::now();
    loop {
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Err(_) => return true,
            Ok(stat) => {
                // The state follows the parenthesized command name.
                let state = stat
                    .rsplit_once(')')
                    .and_then(|(_, rest)| rest.split_whitespace().next());
                if matches!(state, Some("Z" | "X")) {
                    return true;
                }
            }
        }
        if start.elapsed() > Duration::from_secs(5) {
            return false;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}
