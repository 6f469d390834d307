// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for beat-core.

use thiserror::Error;

/// Crate level errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Wire protocol failure.
    #[error("Protocol error: {0}")]
    Protocol(#[from] beat_protocol::FrameError),

    /// Container host operation failed.
    #[error("Docker error: {0}")]
    Dock(#[from] crate::dock::DockError),

    /// Block execution failed.
    #[error("Execution error: {0}")]
    Execution(#[from] crate::execution::ExecutionError),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Result type using the crate Error.
pub type Result<T> = std::result::Result<T, Error>;
