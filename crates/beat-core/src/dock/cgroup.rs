// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Container resource sampling through the cgroup filesystem.

use std::path::{Path, PathBuf};

use crate::stats::{CpuSample, MemoryStatistics, memory_statistics};

/// Clock ticks per second used by `/proc/stat` and `cpuacct.stat`.
const USER_HZ: u64 = 100;

async fn read_cgroup_value(path: &Path) -> Option<u64> {
    tokio::fs::read_to_string(path)
        .await
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
}

/// Where the controllers of a process live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CgroupLocation {
    /// Unified hierarchy
    V2 {
        /// Cgroup folder
        unified_path: PathBuf,
    },
    /// Legacy per-controller hierarchies
    V1 {
        /// `memory` controller folder
        memory_path: Option<PathBuf>,
        /// `cpu`/`cpuacct` controller folder
        cpu_path: Option<PathBuf>,
    },
}

/// Reads cgroup and proc files under configurable mount points.
#[derive(Debug, Clone)]
pub struct CgroupReader {
    cgroup_root: PathBuf,
    proc_root: PathBuf,
}

impl CgroupReader {
    /// Reader for the given cgroup and proc mount points.
    pub fn new(cgroup_root: impl Into<PathBuf>, proc_root: impl Into<PathBuf>) -> Self {
        Self {
            cgroup_root: cgroup_root.into(),
            proc_root: proc_root.into(),
        }
    }

    /// Locate the cgroup(s) of `pid`.
    pub async fn locate(&self, pid: u32) -> Option<CgroupLocation> {
        let cgroup_info =
            tokio::fs::read_to_string(self.proc_root.join(pid.to_string()).join("cgroup"))
                .await
                .ok()?;

        // cgroups v2 format: "0::/path/to/cgroup"
        for line in cgroup_info.lines() {
            if let Some(cgroup_path) = line.strip_prefix("0::") {
                return Some(CgroupLocation::V2 {
                    unified_path: self.cgroup_root.join(cgroup_path.trim_start_matches('/')),
                });
            }
        }

        // cgroups v1 / hybrid
        let mut memory_path = None;
        let mut cpu_path = None;

        for line in cgroup_info.lines() {
            let mut parts = line.splitn(3, ':');
            let _hierarchy = parts.next();
            let Some(controllers) = parts.next() else {
                continue;
            };
            let path = parts.next().unwrap_or_default().trim_start_matches('/');

            for controller in controllers.split(',') {
                match controller {
                    "memory" => {
                        memory_path = Some(self.cgroup_root.join(controllers).join(path));
                    }
                    "cpu" | "cpuacct" => {
                        if cpu_path.is_none() {
                            cpu_path = Some(self.cgroup_root.join(controllers).join(path));
                        }
                    }
                    _ => {}
                }
            }
        }

        if memory_path.is_some() || cpu_path.is_some() {
            Some(CgroupLocation::V1 {
                memory_path,
                cpu_path,
            })
        } else {
            None
        }
    }

    /// Cumulative CPU usage of the cgroup, together with the host counters.
    pub async fn cpu_sample(&self, location: &CgroupLocation) -> CpuSample {
        let (host_usec, online_cpus) = self.host_cpu().await;
        let mut sample = CpuSample {
            host_usec,
            online_cpus,
            ..CpuSample::default()
        };

        match location {
            CgroupLocation::V2 { unified_path } => {
                if let Ok(content) = tokio::fs::read_to_string(unified_path.join("cpu.stat")).await
                {
                    for line in content.lines() {
                        let parts: Vec<&str> = line.split_whitespace().collect();
                        if parts.len() == 2
                            && let Ok(value) = parts[1].parse::<u64>()
                        {
                            match parts[0] {
                                "usage_usec" => sample.usage_usec = value,
                                "user_usec" => sample.user_usec = value,
                                "system_usec" => sample.system_usec = value,
                                _ => {}
                            }
                        }
                    }
                }
            }
            CgroupLocation::V1 { cpu_path, .. } => {
                if let Some(path) = cpu_path {
                    if let Some(usage_ns) = read_cgroup_value(&path.join("cpuacct.usage")).await {
                        sample.usage_usec = usage_ns / 1_000;
                    }
                    if let Ok(content) =
                        tokio::fs::read_to_string(path.join("cpuacct.stat")).await
                    {
                        for line in content.lines() {
                            let mut parts = line.split_whitespace();
                            let (Some(key), Some(Ok(ticks))) =
                                (parts.next(), parts.next().map(str::parse::<u64>))
                            else {
                                continue;
                            };
                            let usec = ticks * (1_000_000 / USER_HZ);
                            match key {
                                "user" => sample.user_usec = usec,
                                "system" => sample.system_usec = usec,
                                _ => {}
                            }
                        }
                    }
                }
            }
        }

        sample
    }

    /// Peak memory usage of the cgroup against its limit.
    ///
    /// An unlimited cgroup is measured against the host memory.
    pub async fn memory(&self, location: &CgroupLocation) -> MemoryStatistics {
        let (peak, limit) = match location {
            CgroupLocation::V2 { unified_path } => {
                let peak = match read_cgroup_value(&unified_path.join("memory.peak")).await {
                    Some(peak) => Some(peak),
                    None => read_cgroup_value(&unified_path.join("memory.current")).await,
                };
                (peak, read_cgroup_value(&unified_path.join("memory.max")).await)
            }
            CgroupLocation::V1 { memory_path, .. } => match memory_path {
                Some(path) => (
                    read_cgroup_value(&path.join("memory.max_usage_in_bytes")).await,
                    read_cgroup_value(&path.join("memory.limit_in_bytes")).await,
                ),
                None => (None, None),
            },
        };

        let host_total = self.host_memory_total().await;
        let limit = match (limit, host_total) {
            (Some(limit), Some(total)) => limit.min(total),
            (Some(limit), None) => limit,
            (None, total) => total.unwrap_or_default(),
        };

        memory_statistics(peak.unwrap_or_default(), limit)
    }

    /// Cumulative host CPU time (microseconds) and online processors.
    async fn host_cpu(&self) -> (u64, u32) {
        let Ok(content) = tokio::fs::read_to_string(self.proc_root.join("stat")).await else {
            return (0, 0);
        };

        let mut total_usec = 0;
        let mut cpus = 0;
        for line in content.lines() {
            if let Some(fields) = line.strip_prefix("cpu ") {
                // user nice system idle iowait irq softirq steal
                let ticks: u64 = fields
                    .split_whitespace()
                    .take(8)
                    .filter_map(|v| v.parse::<u64>().ok())
                    .sum();
                total_usec = ticks * (1_000_000 / USER_HZ);
            } else if line
                .strip_prefix("cpu")
                .and_then(|rest| rest.chars().next())
                .is_some_and(|c| c.is_ascii_digit())
            {
                cpus += 1;
            }
        }
        (total_usec, cpus)
    }

    async fn host_memory_total(&self) -> Option<u64> {
        let content = tokio::fs::read_to_string(self.proc_root.join("meminfo"))
            .await
            .ok()?;
        let line = content.lines().find(|l| l.starts_with("MemTotal:"))?;
        let kb = line.split_whitespace().nth(1)?.parse::<u64>().ok()?;
        Some(kb * 1024)
    }
}
