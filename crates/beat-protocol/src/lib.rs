// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Beat Protocol - multipart framing over byte streams
//!
//! This crate provides the wire protocol for communication between:
//! - Workers and the scheduler ([`WorkerCommand`])
//! - Executors and algorithm processes ([`AlgorithmCommand`])
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      beat-protocol                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Commands: first frame part (3 ASCII bytes)                 │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Framing: length-prefixed multipart frames                  │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Transport: any tokio AsyncRead + AsyncWrite (TCP)          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use beat_protocol::{Frame, FramedStream, WorkerCommand};
//!
//! let stream = tokio::net::TcpStream::connect("127.0.0.1:5555").await?;
//! let mut framed = FramedStream::new(stream);
//! framed
//!     .write_frame(&Frame::command_only(WorkerCommand::Ready.as_bytes()).with_part("node-1"))
//!     .await?;
//! let reply = framed.read_frame().await?;
//! ```

pub mod commands;
pub mod frame;

pub use commands::{AlgorithmCommand, WorkerCommand};
pub use frame::{
    Frame, FrameError, FramedStream, HEADER_SIZE, MAX_FRAME_SIZE, MAX_PARTS, read_frame,
    write_frame,
};
