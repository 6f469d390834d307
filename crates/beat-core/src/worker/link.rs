// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Connection to the scheduler.

use std::time::Duration;

use beat_protocol::{Frame, FrameError, WorkerCommand, read_frame, write_frame};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Strip the `tcp://` scheme of a scheduler address.
pub fn socket_address(address: &str) -> &str {
    address.strip_prefix("tcp://").unwrap_or(address)
}

/// Framed connection to the scheduler.
///
/// Frames are read by a background task so that [`receive`](Self::receive)
/// can time out without losing a partially read frame.
#[derive(Debug)]
pub struct SchedulerLink {
    writer: OwnedWriteHalf,
    incoming: mpsc::Receiver<Result<Frame, FrameError>>,
    reader: JoinHandle<()>,
}

impl SchedulerLink {
    /// Connect to `address` (`tcp://host:port` or `host:port`).
    pub async fn connect(address: &str) -> std::io::Result<Self> {
        let stream = TcpStream::connect(socket_address(address)).await?;
        stream.set_nodelay(true)?;
        let (mut reader, writer) = stream.into_split();

        let (tx, incoming) = mpsc::channel(16);
        let reader = tokio::spawn(async move {
            loop {
                let frame = read_frame(&mut reader).await;
                let failed = frame.is_err();
                if tx.send(frame).await.is_err() || failed {
                    break;
                }
            }
        });

        debug!(address = %address, "Connected to the scheduler");
        Ok(Self {
            writer,
            incoming,
            reader,
        })
    }

    /// Send a frame.
    pub async fn send(&mut self, frame: &Frame) -> Result<(), FrameError> {
        write_frame(&mut self.writer, frame).await
    }

    /// Shut down the sending side, later sends fail.
    pub async fn close(&mut self) {
        if let Err(e) = self.writer.shutdown().await {
            debug!(error = %e, "Cannot shut the scheduler connection down");
        }
    }

    /// Next frame from the scheduler, `None` when `timeout` elapsed first.
    pub async fn receive(&mut self, timeout: Duration) -> Result<Option<Frame>, FrameError> {
        match tokio::time::timeout(timeout, self.incoming.recv()).await {
            Err(_) => Ok(None),
            Ok(Some(frame)) => frame.map(Some),
            Ok(None) => Err(FrameError::ConnectionClosed),
        }
    }

    /// Send `READY` and wait for the scheduler's `ACK`.
    ///
    /// Returns `false` when `stopped` turned true first.
    pub async fn handshake(
        &mut self,
        name: &str,
        stopped: impl Fn() -> bool,
    ) -> Result<bool, FrameError> {
        self.send(&Frame::command_only(WorkerCommand::Ready.as_bytes()).with_part(name.to_string()))
            .await?;

        while !stopped() {
            let Some(frame) = self.receive(Duration::from_millis(100)).await? else {
                continue;
            };
            match frame.command().map(WorkerCommand::try_from) {
                Some(Ok(WorkerCommand::Ack)) => {
                    debug!(worker = %name, "Scheduler acknowledged");
                    return Ok(true);
                }
                _ => warn!(
                    command = ?frame.command().map(String::from_utf8_lossy),
                    "Ignoring message received before the scheduler acknowledged"
                ),
            }
        }
        Ok(false)
    }
}

impl Drop for SchedulerLink {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
