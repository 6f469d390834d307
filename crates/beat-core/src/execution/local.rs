// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Execution through local processes.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use async_trait::async_trait;
use nix::sys::resource::{Usage, UsageWho, getrusage};
use tracing::{debug, info, warn};

use super::algorithm::{AlgorithmLauncher, ProcessLauncher, ProcessLogs};
use super::engine::{self, EngineOptions};
use super::{ExecutionContext, ExecutionError, ExecutionResult, Executor, ResourceLimits};
use crate::config::Config;
use crate::stats::{ContextSwitches, CpuStatistics, MemoryStatistics, ResourceStatistics};

/// Runs the algorithms of a block as local processes, connected to
/// handlers on the loopback interface.
#[derive(Clone)]
pub struct LocalExecutor {
    launcher: Arc<dyn AlgorithmLauncher>,
}

impl std::fmt::Debug for LocalExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalExecutor").finish_non_exhaustive()
    }
}

impl LocalExecutor {
    /// Executor running the configured algorithm entry points.
    pub fn new(config: &Config) -> Self {
        Self::with_launcher(Arc::new(ProcessLauncher::new(
            config.execute_program.clone(),
            config.loop_execute_program.clone(),
        )))
    }

    /// Executor starting algorithm processes through `launcher`.
    pub fn with_launcher(launcher: Arc<dyn AlgorithmLauncher>) -> Self {
        Self { launcher }
    }
}

fn children_usage() -> Option<Usage> {
    getrusage(UsageWho::RUSAGE_CHILDREN)
        .map_err(|e| warn!(error = %e, "getrusage failed"))
        .ok()
}

/// Usage of the children reaped between `before` and `after`.
///
/// The memory peak is only reported when it rose in between, as
/// `RUSAGE_CHILDREN` keeps a lifetime maximum rather than a per-child one.
fn usage_delta(before: Option<Usage>, after: Option<Usage>) -> (CpuStatistics, MemoryStatistics) {
    let (Some(before), Some(after)) = (before, after) else {
        return Default::default();
    };
    let seconds = |tv: nix::sys::time::TimeVal| tv.tv_sec() as f64 + tv.tv_usec() as f64 / 1e6;

    let user = (seconds(after.user_time()) - seconds(before.user_time())).max(0.0);
    let system = (seconds(after.system_time()) - seconds(before.system_time())).max(0.0);
    let cpu = CpuStatistics {
        user,
        system,
        total: user + system,
        context_switches: ContextSwitches {
            voluntary: after
                .voluntary_context_switches()
                .saturating_sub(before.voluntary_context_switches()) as u64,
            involuntary: after
                .involuntary_context_switches()
                .saturating_sub(before.involuntary_context_switches())
                as u64,
        },
        ..CpuStatistics::default()
    };
    // ru_maxrss (kilobytes) is the peak of every child ever reaped, not of
    // this execution. Job processes start fresh so the peak is exact there;
    // elsewhere a peak that did not rise belongs to an earlier child.
    let peak = if after.max_rss() > before.max_rss() {
        after.max_rss()
    } else {
        0
    };
    let memory = MemoryStatistics {
        rss: (peak.max(0) as u64) * 1024,
        ..MemoryStatistics::default()
    };
    (cpu, memory)
}

#[async_trait]
impl Executor for LocalExecutor {
    async fn process(
        &self,
        context: &mut ExecutionContext,
        limits: &ResourceLimits,
    ) -> Result<ExecutionResult, ExecutionError> {
        if !context.valid() {
            return Err(ExecutionError::InvalidBlock(context.errors.clone()));
        }

        let options = EngineOptions {
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            advertised_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port_range: None,
            timeout: limits.timeout(),
            configuration_mount: None,
        };

        let before = children_usage();
        let outcome = engine::run(context, self.launcher.as_ref(), &options).await?;
        let (cpu, memory) = usage_delta(before, children_usage());

        let mut stdout = String::new();
        let mut stderr = String::new();
        for output in outcome.looped.iter().chain(outcome.main.iter()) {
            match &output.logs {
                ProcessLogs::Split {
                    stdout: out,
                    stderr: err,
                } => {
                    stdout.push_str(out);
                    stderr.push_str(err);
                }
                ProcessLogs::Merged(logs) if outcome.status == 0 => stdout.push_str(logs),
                ProcessLogs::Merged(logs) => stderr.push_str(logs),
            }
        }
        if !stdout.is_empty() {
            debug!(stdout = %stdout, "Algorithm output");
        }

        info!(
            status = outcome.status,
            timed_out = outcome.timed_out,
            "Local execution finished"
        );
        Ok(ExecutionResult {
            status: outcome.status,
            statistics: ResourceStatistics {
                cpu,
                memory,
                data: outcome.data,
            },
            stderr,
            stdout,
            system_error: outcome.system_error,
            user_error: outcome.user_error,
            timed_out: outcome.timed_out,
        })
    }
}
