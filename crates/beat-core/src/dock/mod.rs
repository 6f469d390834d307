// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Docker host: container lifecycle and environment discovery.
//!
//! Every interaction with the container runtime is a CLI shell-out through a
//! [`CommandExecutor`], so the host logic can be driven by a scripted
//! executor in tests.

mod cgroup;
mod command;
mod container;
mod discovery;
mod host;
mod images;
pub mod mock;

use thiserror::Error;

pub use cgroup::{CgroupLocation, CgroupReader};
pub use command::{CommandExecutor, ExecOutput, ProcessExecutor};
pub(crate) use command::drain;
pub use container::{Container, PortBinding, VolumeBinding};
pub use host::{Catalog, ContainerStatistics, Host, HostCatalog, HostConfig};
pub use images::{EnvVersion, EnvironmentInfo, ImagesCache, build_env_name};

/// Errors from container host operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DockError {
    /// The runtime CLI could not be executed.
    #[error("Failed to run `{program}': {source}")]
    Spawn {
        /// CLI program
        program: String,
        /// Underlying error
        source: std::io::Error,
    },

    /// `docker run` failed.
    #[error("Failed to create the container, reason:\n\n{0}")]
    StartFailed(String),

    /// The container has no id (never started or already removed).
    #[error("Container has not been started")]
    NotStarted,

    /// Two distinct images provide the same environment key.
    #[error(
        "Environments at '{first}' and '{second}' have the same name ('{key}'). \
         Distinct environments must be uniquely named. Fix this and re-start."
    )]
    Conflict {
        /// Newly discovered image
        first: String,
        /// Previously registered image
        second: String,
        /// Environment key
        key: String,
    },

    /// Environment discovery failed.
    #[error("Failed to discover environments: {0}")]
    Discovery(String),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
