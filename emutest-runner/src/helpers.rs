// Copyright (c) The emutest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::{os::unix::process::ExitStatusExt, process::ExitStatus};

/// Utilities for pluralizing various words based on count.
pub(crate) mod plural {
    /// Returns "test" if `count` is 1, otherwise "tests".
    pub(crate) fn tests_str(count: usize) -> &'static str {
        if count == 1 { "test" } else { "tests" }
    }
}

/// Displays an exit status as a short phrase, e.g. "exited with exit code 2".
pub(crate) fn display_exited_with(exit_status: ExitStatus) -> String {
    if let Some(sig) = exit_status.signal() {
        return match signal_str(sig) {
            Some(s) => format!("aborted with signal {sig} (SIG{s})"),
            None => format!("aborted with signal {sig}"),
        };
    }
    match exit_status.code() {
        Some(code) => format!("exited with exit code {code}"),
        None => "exited with an unknown error".to_owned(),
    }
}

pub(crate) fn signal_str(signal: i32) -> Option<&'static str> {
    // These signal numbers are the same on at least Linux, macOS, FreeBSD and illumos.
    match signal {
        1 => Some("HUP"),
        2 => Some("INT"),
        3 => Some("QUIT"),
        4 => Some("ILL"),
        5 => Some("TRAP"),
        6 => Some("ABRT"),
        8 => Some("FPE"),
        9 => Some("KILL"),
        11 => Some("SEGV"),
        13 => Some("PIPE"),
        14 => Some("ALRM"),
        15 => Some("TERM"),
        _ => None,
    }
}

/// Lossily joins a build tool's captured stdout and stderr into one diagnostic string.
pub(crate) fn join_output(stdout: &[u8], stderr: &[u8]) -> String {
    let mut out = String::from_utf8_lossy(stdout).into_owned();
    out.push_str(&String::from_utf8_lossy(stderr));
    out
}
