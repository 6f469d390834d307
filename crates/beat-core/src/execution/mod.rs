// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Block execution.
//!
//! An [`ExecutionContext`] validates and resolves one block. An [`Executor`]
//! then drives the algorithm process(es) of the block through
//! setup → prepare → process, either as local processes ([`LocalExecutor`])
//! or inside containers ([`DockerExecutor`]).
//!
//! ```text
//!   executor ──control──► MessageHandler ◄──tcp──► algorithm process
//!                              │  ▲                  (setup/prepare/process,
//!                              ▼  │                   data requests)
//!                          cached data files
//! ```
//!
//! For loop blocks a second handler serves the loop algorithm; the main
//! handler forwards the main algorithm's loop requests to it.

mod algorithm;
mod context;
mod docker;
mod engine;
mod failure;
mod local;
mod message_handler;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use algorithm::{
    AlgorithmLauncher, AlgorithmProcess, AlgorithmRole, LaunchRequest, ProcessLauncher,
    ProcessLogs, ProcessOutput,
};
pub use context::{BlockSource, ExecutionContext};
pub use docker::DockerExecutor;
pub use failure::{Failure, FailureKind, TraceFrame};
pub use local::LocalExecutor;
pub use message_handler::{HandlerLink, HandlerReport, MessageHandler};

use crate::config::Config;
use crate::dock::{DockError, Host};
use crate::stats::ResourceStatistics;

/// Per-job resource limits; zero means unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Memory cap in megabytes
    pub max_memory_mb: u64,
    /// CPU cap, 100 per core
    pub max_cpu_percent: u32,
    /// Wall-clock limit of the processing step, in minutes
    pub timeout_minutes: u64,
}

impl ResourceLimits {
    /// Processing timeout, if any.
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_minutes > 0).then(|| Duration::from_secs(60 * self.timeout_minutes))
    }
}

/// Summary of one block execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// 0 on success; non-zero when processing failed
    pub status: i32,
    /// Resources used
    pub statistics: ResourceStatistics,
    /// Standard error of the algorithm process
    pub stderr: String,
    /// Standard output of the algorithm process
    pub stdout: String,
    /// Infrastructure failure, empty when none
    pub system_error: String,
    /// Failure of the user code, empty when none
    pub user_error: String,
    /// Whether the processing was killed on timeout
    pub timed_out: bool,
}

/// Execution failures that prevent a result from being produced.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ExecutionError {
    /// Algorithm setup or prepare failed; carries the filtered traceback.
    #[error("{0}")]
    Setup(String),

    /// The block did not validate.
    #[error("execution information is bogus:\n  * {}", .0.join("\n  * "))]
    InvalidBlock(Vec<String>),

    /// The cache folder does not exist.
    #[error("Cache path `{0}' does not exist")]
    CacheNotFound(PathBuf),

    /// The requested environment is not available.
    #[error("Environment `{key}' is not available - available environments are {}", .available.join(", "))]
    EnvironmentNotFound {
        /// Requested environment key
        key: String,
        /// Known environment keys
        available: Vec<String>,
    },

    /// An algorithm process could not be launched.
    #[error("Failed to launch the algorithm process: {0}")]
    Launch(String),

    /// The algorithm replied with a failure.
    #[error("{0}")]
    Algorithm(Failure),

    /// The algorithm process exited while a reply was expected.
    #[error("Algorithm process exited unexpectedly (status {0:?})")]
    ProcessExited(Option<i32>),

    /// A step did not complete in time.
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// The message handler is gone.
    #[error("Message handler closed")]
    HandlerClosed,

    /// Wire protocol failure.
    #[error("Protocol error: {0}")]
    Protocol(#[from] beat_protocol::FrameError),

    /// Container host failure.
    #[error("Docker error: {0}")]
    Dock(#[from] DockError),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Runs a resolved block to completion.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Execute the block of `context` under `limits`.
    ///
    /// A failure of the algorithm's processing step is reported in the
    /// result (`status != 0`); setup and prepare failures are errors.
    async fn process(
        &self,
        context: &mut ExecutionContext,
        limits: &ResourceLimits,
    ) -> Result<ExecutionResult, ExecutionError>;
}

/// Where blocks run, selected once per worker.
#[derive(Debug, Clone)]
pub enum ExecutionTarget {
    /// Local processes
    Local,
    /// Containers on a docker host
    Container(Arc<Host>),
}

impl ExecutionTarget {
    /// Executor for this target.
    pub fn executor(&self, config: &Config) -> Box<dyn Executor> {
        match self {
            Self::Local => Box::new(LocalExecutor::new(config)),
            Self::Container(host) => Box::new(DockerExecutor::new(host.clone(), config)),
        }
    }
}
