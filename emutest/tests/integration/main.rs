// Copyright (c) The emutest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Integration tests.
//!
//! These run the real `emutest` binary against a fake build tool and a fake emulator, both shell
//! scripts written into a temporary workspace. See `fixtures.rs` for what each fake does for a
//! given test name.

use emutest_runner::exit_codes::EmutestExitCode;
use nix::{
    sys::signal::{Signal, kill},
    unistd::Pid,
};
use pretty_assertions::assert_eq;

mod fixtures;

use fixtures::*;

#[test]
fn all_tests_pass() {
    let ws = TempWorkspace::new(&["test_sanity", "test_task_self"], "4s");

    let output = ws.cli().args(["run"]).output();
    assert_eq!(output.exit_code(), Some(EmutestExitCode::OK), "{output:?}");
    assert_eq!(
        output.status_lines(),
        [
            "PASS test_sanity",
            "PASS test_task_self",
            "Summary 2/2 tests passed, 0 failed, 0 timed out",
        ],
        "{output:?}"
    );
    assert!(
        output.stderr.contains("Starting 2 tests (debug build)"),
        "{output:?}"
    );

    assert_eq!(
        ws.build_log(),
        "clean\n\
         -j2 TEST_NAME=test_sanity OPTIMIZE_FLAGS=-O0\n\
         -j2 TEST_NAME=test_task_self OPTIMIZE_FLAGS=-O0\n",
    );
}

#[test]
fn mixed_outcomes() {
    let ws = TempWorkspace::new(
        &[
            "test_sanity",
            "test_mismatch",
            "test_build_fail",
            "test_crash",
            "test_near_miss",
        ],
        "4s",
    );

    let output = ws.cli().args(["run"]).output();
    assert_eq!(
        output.exit_code(),
        Some(EmutestExitCode::TEST_RUN_FAILED),
        "{output:?}"
    );
    assert_eq!(
        output.status_lines(),
        [
            "PASS test_sanity",
            "FAIL test_mismatch",
            "BUILD FAIL test_build_fail",
            "FAIL test_crash: worker exited with exit code 70 before the test finished",
            "FAIL test_near_miss",
            "Summary 1/5 tests passed, 4 failed, 0 timed out",
        ],
        "{output:?}"
    );

    assert!(
        output
            .stderr
            .contains("--- OUTPUT: test_mismatch ---\nFail: task starved\n"),
        "{output:?}"
    );
    assert!(
        output.stderr.contains(
            "--- BUILD OUTPUT: test_build_fail ---\n\
             building test_build_fail\n\
             test_build_fail.c:12: error: expected ';' before '}' token\n"
        ),
        "{output:?}"
    );
    // Sentinel matching is exact: a near miss is accumulated into the payload.
    assert!(
        output.stderr.contains(
            "--- OUTPUT: test_near_miss ---\nPass\n <Test finished>\nPass \n"
        ),
        "{output:?}"
    );
    assert!(
        output.stderr.contains("error: test run failed"),
        "{output:?}"
    );

    // A failed build never reaches the emulator.
    assert!(!ws.root().join("build/test_build_fail.elf").exists());
}

#[test]
fn results_are_deterministic() {
    let ws = TempWorkspace::new(
        &["test_mismatch", "test_sanity", "test_build_fail"],
        "4s",
    );

    let first = ws.cli().args(["run"]).output();
    let second = ws.cli().args(["run"]).output();
    assert_eq!(first.exit_code(), second.exit_code());
    assert_eq!(first.status_lines(), second.status_lines());
}

#[test]
fn release_build_without_clean() {
    let ws = TempWorkspace::new(&["test_sanity", "test_task_self"], "4s");

    let output = ws
        .cli()
        .args(["run", "--no-clean", "optimize", "test_task_self"])
        .output();
    assert_eq!(output.exit_code(), Some(EmutestExitCode::OK), "{output:?}");
    assert_eq!(
        output.status_lines(),
        [
            "PASS test_task_self",
            "Summary 1/1 test passed, 0 failed, 0 timed out",
        ],
        "{output:?}"
    );
    assert_eq!(
        ws.build_log(),
        "-j2 TEST_NAME=test_task_self OPTIMIZE_FLAGS=-O2 -flto\n"
    );
}

#[test]
fn hung_test_times_out_and_emulator_is_killed() {
    let ws = TempWorkspace::new(&["test_hang", "test_sanity"], "1s");

    let output = ws.cli().args(["run"]).output();
    assert_eq!(
        output.exit_code(),
        Some(EmutestExitCode::TEST_RUN_FAILED),
        "{output:?}"
    );
    assert_eq!(
        output.status_lines(),
        [
            "TIMEOUT test_hang",
            "PASS test_sanity",
            "Summary 1/2 tests passed, 0 failed, 1 timed out",
        ],
        "{output:?}"
    );

    let pid = ws.emulator_pid("test_hang").expect("hung emulator started");
    assert!(process_is_gone(pid), "emulator {pid} outlived its test");
}

#[test]
fn emulator_killed_after_pass() {
    let ws = TempWorkspace::new(&["test_linger"], "4s");

    let output = ws.cli().args(["run"]).output();
    assert_eq!(output.exit_code(), Some(EmutestExitCode::OK), "{output:?}");
    assert_eq!(
        output.status_lines(),
        [
            "PASS test_linger",
            "Summary 1/1 test passed, 0 failed, 0 timed out",
        ],
        "{output:?}"
    );

    let pid = ws.emulator_pid("test_linger").expect("emulator started");
    assert!(process_is_gone(pid), "emulator {pid} outlived its test");
}

#[test]
fn interrupt_tears_down_running_test() {
    let ws = TempWorkspace::new(&["test_hang", "test_sanity"], "60s");

    let child = ws.cli().args(["run"]).spawn();
    let emulator_pid = ws.wait_for_emulator_pid("test_hang");
    let emutest_pid = i32::try_from(child.id()).expect("pid fits in i32");
    kill(Pid::from_raw(emutest_pid), Signal::SIGINT).expect("sent SIGINT to emutest");

    let output = EmutestOutput::from_child(child);
    assert_eq!(
        output.exit_code(),
        Some(EmutestExitCode::TEST_RUN_FAILED),
        "{output:?}"
    );
    assert_eq!(
        output.status_lines(),
        [
            "INTERRUPTED test_hang (received SIGINT)",
            "Summary 0/2 tests passed, 0 failed, 0 timed out, 2 not run",
        ],
        "{output:?}"
    );
    assert!(
        output
            .stderr
            .contains("Cancelling due to SIGINT: 2 tests not run"),
        "{output:?}"
    );
    assert!(
        process_is_gone(emulator_pid),
        "emulator {emulator_pid} outlived the run"
    );
}

#[test]
fn unknown_test_is_a_setup_error() {
    let ws = TempWorkspace::new(&["test_sanity"], "4s");

    let output = ws.cli().args(["run", "test_missing"]).output();
    assert_eq!(
        output.exit_code(),
        Some(EmutestExitCode::SETUP_ERROR),
        "{output:?}"
    );
    assert!(
        output
            .stderr
            .contains("unknown test requested: test_missing"),
        "{output:?}"
    );
    assert_eq!(ws.build_log(), "", "nothing is built");
}

#[test]
fn list_configured_tests() {
    let ws = TempWorkspace::new(&["test_sanity", "test_starved_task"], "4s");

    let output = ws.cli().args(["list"]).output();
    assert_eq!(output.exit_code(), Some(EmutestExitCode::OK), "{output:?}");
    assert_eq!(output.stdout, "test_sanity\ntest_starved_task\n");
}
