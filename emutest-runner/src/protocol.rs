// Copyright (c) The emutest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The sentinel-delimited output protocol spoken by test firmware.
//!
//! Test firmware writes arbitrary text lines to the emulator's standard output, then a line that
//! is exactly [`SENTINEL_LINE`]. Everything before the sentinel, byte for byte, is the test's
//! payload. A test passes iff its payload is exactly [`PASS_PAYLOAD`].
//!
//! Matching is by equality only: a sentinel with leading or trailing whitespace, a missing newline
//! or a `\r\n` terminator is an ordinary line.

use crate::errors::ProtocolError;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

/// The line that terminates a test's output, including its newline.
pub const SENTINEL_LINE: &[u8] = b"<Test finished>\n";

/// The payload produced by a passing test.
pub const PASS_PAYLOAD: &str = "Pass\n";

/// Reads lines from `reader` until the sentinel line, returning everything before it.
///
/// There is no bound on the number of lines or bytes read: the caller is expected to bound the
/// whole operation externally.
pub async fn read_until_sentinel<R>(mut reader: R) -> Result<String, ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    let mut acc = Vec::new();
    let mut line = Vec::new();

    loop {
        line.clear();
        let n = reader
            .read_until(b'\n', &mut line)
            .await
            .map_err(ProtocolError::Read)?;
        if n == 0 {
            return Err(ProtocolError::UnexpectedEof {
                partial: into_string(acc),
            });
        }

        if line == SENTINEL_LINE {
            return Ok(into_string(acc));
        }
        acc.extend_from_slice(&line);
    }
}

fn into_string(bytes: Vec<u8>) -> String {
    match String::from_utf8(bytes) {
        Ok(s) => s,
        Err(err) => String::from_utf8_lossy(err.as_bytes()).into_owned(),
    }
}
