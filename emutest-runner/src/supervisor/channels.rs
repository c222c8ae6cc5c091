// Copyright (c) The emutest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The supervisor side of the worker protocol.
//!
//! The worker's standard output carries newline-delimited [`WorkerMessage`]s. A demultiplexer
//! task splits them into two one-shot channels, one for the emulator pid and one for the captured
//! output. Each channel is written at most once; a channel whose message never arrives is closed
//! once the worker's standard output reaches EOF.

use super::EmulatorPid;
use crate::worker::WorkerMessage;
use std::time::Duration;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    sync::oneshot,
    task::JoinHandle,
};
use tracing::{debug, warn};

/// The result of a bounded read from a one-shot channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum ChannelRead<T> {
    /// The message was received.
    Received(T),

    /// The worker closed its output without sending this message.
    Closed,

    /// The read didn't complete within the bound.
    TimedOut,
}

#[derive(Debug)]
pub(crate) struct WorkerChannels {
    pid_rx: oneshot::Receiver<EmulatorPid>,
    output_rx: oneshot::Receiver<String>,
    demux: JoinHandle<()>,
}

impl WorkerChannels {
    /// Spawns the demultiplexer on the worker's standard output.
    pub(crate) fn spawn<R>(worker_stdout: R) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (pid_tx, pid_rx) = oneshot::channel();
        let (output_tx, output_rx) = oneshot::channel();
        let demux = tokio::spawn(demux(worker_stdout, pid_tx, output_tx));
        Self {
            pid_rx,
            output_rx,
            demux,
        }
    }

    /// Reads the emulator pid, waiting at most `bound`.
    ///
    /// Must be called at most once.
    pub(crate) async fn recv_pid(&mut self, bound: Duration) -> ChannelRead<EmulatorPid> {
        bounded_recv(&mut self.pid_rx, bound).await
    }

    /// Reads the captured output, waiting at most `bound`.
    ///
    /// Must be called at most once.
    pub(crate) async fn recv_output(&mut self, bound: Duration) -> ChannelRead<String> {
        bounded_recv(&mut self.output_rx, bound).await
    }

    /// Waits for the demultiplexer to finish, aborting it if it takes longer than `bound`.
    pub(crate) async fn join(mut self, bound: Duration) {
        match tokio::time::timeout(bound, &mut self.demux).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!("worker channel task failed: {err}"),
            Err(_) => {
                warn!("worker channel task didn't finish within {bound:?}, aborting it");
                self.demux.abort();
            }
        }
    }
}

async fn bounded_recv<T>(rx: &mut oneshot::Receiver<T>, bound: Duration) -> ChannelRead<T> {
    match tokio::time::timeout(bound, rx).await {
        Ok(Ok(value)) => ChannelRead::Received(value),
        Ok(Err(_)) => ChannelRead::Closed,
        Err(_) => ChannelRead::TimedOut,
    }
}

async fn demux<R>(
    worker_stdout: R,
    pid_tx: oneshot::Sender<EmulatorPid>,
    output_tx: oneshot::Sender<String>,
) where
    R: AsyncRead + Unpin,
{
    let mut pid_tx = Some(pid_tx);
    let mut output_tx = Some(output_tx);
    let mut lines = BufReader::new(worker_stdout).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                debug!("error reading worker output: {err}");
                break;
            }
        };

        match serde_json::from_str::<WorkerMessage>(&line) {
            Ok(WorkerMessage::EmulatorStarted { pid }) => match pid_tx.take() {
                Some(tx) => {
                    // The receiver may already be gone if the supervisor stopped listening.
                    _ = tx.send(EmulatorPid::new(pid));
                }
                None => warn!("worker published a second emulator pid {pid}, ignoring it"),
            },
            Ok(WorkerMessage::OutputCaptured { output }) => match output_tx.take() {
                Some(tx) => {
                    _ = tx.send(output);
                }
                None => warn!("worker published output twice, ignoring the second"),
            },
            Err(err) => warn!("ignoring unrecognized worker message `{line}`: {err}"),
        }
    }
}
