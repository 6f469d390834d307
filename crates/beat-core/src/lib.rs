// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Beat Core - execution engine for experiment blocks
//!
//! This crate runs one execution block (an algorithm applied to cached input
//! data, producing cached outputs) either as local processes or inside
//! containers, and provides the worker that receives blocks from a
//! scheduler.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                          Scheduler                                  │
//! └─────────────────────────────────────────────────────────────────────┘
//!                                  │ rdy/ack, exe/cnl, don/erj/err/cld
//!                                  ▼
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │  worker: one OS process per job                                     │
//! └─────────────────────────────────────────────────────────────────────┘
//!                                  │ JobRequest (stdin) / JobOutcome (stdout)
//!                                  ▼
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │  execution: ExecutionContext ──► LocalExecutor | DockerExecutor     │
//! │               │                        │               │            │
//! │          declaration              MessageHandler      dock::Host    │
//! │          schema, data             (stp/pre/prc/don)   (docker CLI)  │
//! └─────────────────────────────────────────────────────────────────────┘
//!                                  │
//!                                  ▼
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │  algorithm process (local or containerised), beat-protocol frames   │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Binaries
//!
//! | Binary | Description |
//! |--------|-------------|
//! | `beat-worker` | Connects to a scheduler and runs the jobs it sends |
//! | `beat-run` | Runs a single execution block file |
//!
//! # Configuration
//!
//! Runtime knobs are read from `BEAT_*` environment variables, see
//! [`config::Config`].

#![deny(missing_docs)]

/// Runtime configuration loaded from environment variables.
pub mod config;

/// Cached data files and the I/O endpoints of a block.
pub mod data;

/// Algorithm, database, library and data format declarations.
pub mod declaration;

/// Docker host: container lifecycle and environment discovery.
pub mod dock;

/// Error types.
pub mod error;

/// Block execution.
pub mod execution;

/// Content-addressed cache paths.
pub mod hash;

/// Tracing subscriber setup.
pub mod logging;

/// Execution block schema.
pub mod schema;

/// Resource statistics.
pub mod stats;

/// Worker process driver.
pub mod worker;

pub use error::{Error, Result};
