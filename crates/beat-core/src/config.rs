// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for beat-core.
//!
//! Knobs that are not exposed on the command line are read from environment
//! variables (optionally from a `.env` file loaded by the binaries).

use std::path::PathBuf;

use crate::execution::ResourceLimits;

/// Runtime configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Container runtime CLI (`BEAT_DOCKER_PROGRAM`)
    pub docker_program: String,
    /// JSON file persisting the images cache across runs (`BEAT_DOCKER_IMAGES_CACHE`)
    pub images_cache: Option<PathBuf>,
    /// Fail on discovery conflicts instead of warning (`BEAT_DOCKER_STRICT`)
    pub docker_strict: bool,
    /// Algorithm process entry point (`BEAT_EXECUTE_PROGRAM`)
    pub execute_program: String,
    /// Loop algorithm process entry point (`BEAT_LOOP_EXECUTE_PROGRAM`)
    pub loop_execute_program: String,
    /// Address containers use to reach this host (`BEAT_HOST_ADDRESS`)
    pub host_address: Option<String>,
    /// cgroup filesystem mount point (`BEAT_CGROUP_ROOT`)
    pub cgroup_root: PathBuf,
    /// proc filesystem mount point (`BEAT_PROC_ROOT`)
    pub proc_root: PathBuf,
    /// Default per-job limits
    pub limits: ResourceLimits,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            docker_program: "docker".to_string(),
            images_cache: None,
            docker_strict: false,
            execute_program: "execute".to_string(),
            loop_execute_program: "loop_execute".to_string(),
            host_address: None,
            cgroup_root: PathBuf::from("/sys/fs/cgroup"),
            proc_root: PathBuf::from("/proc"),
            limits: ResourceLimits::default(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        Ok(Self {
            docker_program: non_empty("BEAT_DOCKER_PROGRAM").unwrap_or(defaults.docker_program),
            images_cache: non_empty("BEAT_DOCKER_IMAGES_CACHE").map(PathBuf::from),
            docker_strict: non_empty("BEAT_DOCKER_STRICT")
                .map(|v| parse_bool(&v))
                .unwrap_or(defaults.docker_strict),
            execute_program: non_empty("BEAT_EXECUTE_PROGRAM")
                .unwrap_or(defaults.execute_program),
            loop_execute_program: non_empty("BEAT_LOOP_EXECUTE_PROGRAM")
                .unwrap_or(defaults.loop_execute_program),
            host_address: non_empty("BEAT_HOST_ADDRESS"),
            cgroup_root: non_empty("BEAT_CGROUP_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.cgroup_root),
            proc_root: non_empty("BEAT_PROC_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.proc_root),
            limits: ResourceLimits {
                max_memory_mb: parse_number("BEAT_MAX_MEMORY_MB", non_empty("BEAT_MAX_MEMORY_MB"))?,
                max_cpu_percent: parse_number(
                    "BEAT_MAX_CPU_PERCENT",
                    non_empty("BEAT_MAX_CPU_PERCENT"),
                )?,
                timeout_minutes: parse_number(
                    "BEAT_TIMEOUT_MINUTES",
                    non_empty("BEAT_TIMEOUT_MINUTES"),
                )?,
            },
        })
    }
}

/// Parse a boolean flag value.
pub fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn parse_number<T: std::str::FromStr + Default>(
    var: &'static str,
    value: Option<String>,
) -> Result<T, ConfigError> {
    match value {
        None => Ok(T::default()),
        Some(v) => v
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidNumber { var, value: v }),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A numeric variable could not be parsed.
    #[error("Invalid value for {var}: '{value}'")]
    InvalidNumber {
        /// Variable name
        var: &'static str,
        /// Offending value
        value: String,
    },
}
