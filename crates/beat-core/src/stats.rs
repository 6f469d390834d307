// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Resource statistics of a block execution.
//!
//! Adding two [`ResourceStatistics`] sums cumulative work (CPU time, context
//! switches, I/O volume, blocks and time) while watermarks (peak memory,
//! memory limit, CPU percent, processor count) keep the maximum. File lists
//! are concatenated.

use std::ops::{Add, AddAssign};

use serde::{Deserialize, Serialize};

/// Statistics of one execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceStatistics {
    /// CPU usage
    #[serde(default)]
    pub cpu: CpuStatistics,
    /// Memory usage
    #[serde(default)]
    pub memory: MemoryStatistics,
    /// Data (I/O) usage
    #[serde(default)]
    pub data: DataStatistics,
}

/// CPU usage, times in seconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CpuStatistics {
    /// Time spent in user mode
    pub user: f64,
    /// Time spent in kernel mode
    pub system: f64,
    /// Total CPU time
    pub total: f64,
    /// Context switches
    #[serde(default)]
    pub context_switches: ContextSwitches,
    /// Share of the host CPU time (100 = one full core)
    #[serde(default)]
    pub percent: f64,
    /// Processors available to the process
    #[serde(default)]
    pub processors: u32,
}

/// Context switch counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextSwitches {
    /// Voluntary switches
    pub voluntary: u64,
    /// Involuntary switches
    pub involuntary: u64,
}

/// Memory usage in bytes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryStatistics {
    /// Peak resident set size
    pub rss: u64,
    /// Memory limit (0 when unknown)
    #[serde(default)]
    pub limit: u64,
    /// Peak usage as a share of the limit
    #[serde(default)]
    pub percent: f64,
}

/// Integer read/write counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoCounters {
    /// Read side
    pub read: u64,
    /// Write side
    pub write: u64,
}

/// Read/write durations in seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct IoTimes {
    /// Time spent reading
    pub read: f64,
    /// Time spent writing
    pub write: f64,
}

/// Network counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkStatistics {
    /// Time spent waiting on the data channel, in seconds
    pub wait_time: f64,
}

/// Statistics of one file written by the execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileStatistics {
    /// Cache relative path
    pub path: String,
    /// Bytes written
    pub volume: u64,
    /// Records written
    pub blocks: u64,
}

/// Data (I/O) usage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataStatistics {
    /// Bytes
    #[serde(default)]
    pub volume: IoCounters,
    /// Records
    #[serde(default)]
    pub blocks: IoCounters,
    /// Time
    #[serde(default)]
    pub time: IoTimes,
    /// Written files
    #[serde(default)]
    pub files: Vec<FileStatistics>,
    /// Network
    #[serde(default)]
    pub network: NetworkStatistics,
}

impl AddAssign for ContextSwitches {
    fn add_assign(&mut self, rhs: Self) {
        self.voluntary += rhs.voluntary;
        self.involuntary += rhs.involuntary;
    }
}

impl AddAssign for CpuStatistics {
    fn add_assign(&mut self, rhs: Self) {
        self.user += rhs.user;
        self.system += rhs.system;
        self.total += rhs.total;
        self.context_switches += rhs.context_switches;
        self.percent = self.percent.max(rhs.percent);
        self.processors = self.processors.max(rhs.processors);
    }
}

impl AddAssign for MemoryStatistics {
    fn add_assign(&mut self, rhs: Self) {
        self.rss = self.rss.max(rhs.rss);
        self.limit = self.limit.max(rhs.limit);
        self.percent = self.percent.max(rhs.percent);
    }
}

impl AddAssign for IoCounters {
    fn add_assign(&mut self, rhs: Self) {
        self.read += rhs.read;
        self.write += rhs.write;
    }
}

impl AddAssign for IoTimes {
    fn add_assign(&mut self, rhs: Self) {
        self.read += rhs.read;
        self.write += rhs.write;
    }
}

impl AddAssign for DataStatistics {
    fn add_assign(&mut self, rhs: Self) {
        self.volume += rhs.volume;
        self.blocks += rhs.blocks;
        self.time += rhs.time;
        self.files.extend(rhs.files);
        self.network.wait_time += rhs.network.wait_time;
    }
}

impl AddAssign for ResourceStatistics {
    fn add_assign(&mut self, rhs: Self) {
        self.cpu += rhs.cpu;
        self.memory += rhs.memory;
        self.data += rhs.data;
    }
}

impl Add for ResourceStatistics {
    type Output = ResourceStatistics;

    fn add(mut self, rhs: Self) -> Self::Output {
        self += rhs;
        self
    }
}

impl Add for DataStatistics {
    type Output = DataStatistics;

    fn add(mut self, rhs: Self) -> Self::Output {
        self += rhs;
        self
    }
}

/// One cumulative CPU usage sample of a container, all times in microseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuSample {
    /// Total CPU time consumed by the container
    pub usage_usec: u64,
    /// User mode share of `usage_usec`
    pub user_usec: u64,
    /// Kernel mode share of `usage_usec`
    pub system_usec: u64,
    /// Cumulative CPU time of the whole host
    pub host_usec: u64,
    /// Online processors on the host
    pub online_cpus: u32,
}

/// CPU statistics between two cumulative samples.
///
/// With no previous sample the delta is taken against zero.
pub fn cpu_statistics(previous: Option<&CpuSample>, current: &CpuSample) -> CpuStatistics {
    let start = previous.copied().unwrap_or_default();
    let usage = current.usage_usec.saturating_sub(start.usage_usec);
    let host = current.host_usec.saturating_sub(start.host_usec);

    let percent = if host > 0 {
        100.0 * (usage as f64 / host as f64) * f64::from(current.online_cpus.max(1))
    } else {
        0.0
    };

    CpuStatistics {
        user: current.user_usec.saturating_sub(start.user_usec) as f64 / 1e6,
        system: current.system_usec.saturating_sub(start.system_usec) as f64 / 1e6,
        total: usage as f64 / 1e6,
        context_switches: ContextSwitches::default(),
        percent,
        processors: current.online_cpus,
    }
}

/// Memory statistics from a peak usage and a limit, both in bytes.
pub fn memory_statistics(max_usage: u64, limit: u64) -> MemoryStatistics {
    let percent = if limit > 0 {
        100.0 * max_usage as f64 / limit as f64
    } else {
        0.0
    };
    MemoryStatistics {
        rss: max_usage,
        limit,
        percent,
    }
}

/// Human readable duration, e.g. `"2.50 minutes"`.
pub fn format_duration(seconds: f64) -> String {
    if seconds > 3600.0 {
        format!("{:.2} hours", seconds / 3600.0)
    } else if seconds > 60.0 {
        format!("{:.2} minutes", seconds / 60.0)
    } else {
        format!("{:.2} seconds", seconds)
    }
}

/// Human readable size, e.g. `"1.50 MB"`.
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    if value < 1024.0 {
        return format!("{bytes} bytes");
    }
    let mut unit = "bytes";
    for candidate in UNITS {
        if value < 1024.0 {
            break;
        }
        value /= 1024.0;
        unit = candidate;
    }
    format!("{value:.2} {unit}")
}

impl ResourceStatistics {
    /// Lines summarizing the statistics for terminal output.
    pub fn summary(&self) -> Vec<String> {
        let cpu = &self.cpu;
        let data = &self.data;
        let mut lines = vec![
            format!(
                "CPU time (user, system, total): {}, {}, {}",
                format_duration(cpu.user),
                format_duration(cpu.system),
                format_duration(cpu.total)
            ),
            format!("Memory usage: {}", format_size(self.memory.rss)),
            format!(
                "Cached input read: {}, {}",
                format_duration(data.time.read),
                format_size(data.volume.read)
            ),
            format!(
                "Cached output write: {}, {}",
                format_duration(data.time.write),
                format_size(data.volume.write)
            ),
        ];
        if cpu.context_switches != ContextSwitches::default() {
            lines.push(format!(
                "Context switches (voluntary, involuntary): {}, {}",
                cpu.context_switches.voluntary, cpu.context_switches.involuntary
            ));
        }
        if data.network.wait_time > 0.0 {
            lines.push(format!(
                "Time waiting on data: {}",
                format_duration(data.network.wait_time)
            ));
        }
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(total: f64, rss: u64) -> ResourceStatistics {
        ResourceStatistics {
            cpu: CpuStatistics {
                user: total / 2.0,
                system: total / 2.0,
                total,
                context_switches: ContextSwitches {
                    voluntary: 3,
                    involuntary: 1,
                },
                percent: 40.0,
                processors: 2,
            },
            memory: MemoryStatistics {
                rss,
                limit: 0,
                percent: 0.0,
            },
            data: DataStatistics {
                volume: IoCounters { read: 10, write: 4 },
                blocks: IoCounters { read: 2, write: 1 },
                files: vec![FileStatistics {
                    path: "ab/cd".into(),
                    volume: 4,
                    blocks: 1,
                }],
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_self_addition_doubles_work_not_memory() {
        let a = sample(2.0, 1000);
        let sum = a.clone() + a.clone();
        assert_eq!(sum.cpu.total, 4.0);
        assert_eq!(sum.cpu.context_switches.voluntary, 6);
        assert_eq!(sum.memory.rss, 1000);
        assert_eq!(sum.cpu.percent, 40.0);
        assert_eq!(sum.data.volume.read, 20);
        assert_eq!(sum.data.files.len(), 2);
    }

    #[test]
    fn test_addition_is_commutative() {
        let a = sample(2.0, 1000);
        let b = sample(6.0, 3000);
        let ab = a.clone() + b.clone();
        let ba = b + a;
        assert_eq!(ab.cpu.total, ba.cpu.total);
        assert_eq!(ab.memory.rss, 3000);
        assert_eq!(ba.memory.rss, 3000);
        assert_eq!(ab.data.blocks, ba.data.blocks);
    }

    #[test]
    fn test_addition_is_associative() {
        let a = sample(1.0, 10);
        let b = sample(2.0, 30);
        let c = sample(4.0, 20);
        let left = (a.clone() + b.clone()) + c.clone();
        let right = a + (b + c);
        assert_eq!(left.cpu.total, right.cpu.total);
        assert_eq!(left.memory.rss, right.memory.rss);
        assert_eq!(left.data.volume, right.data.volume);
    }

    #[test]
    fn test_cpu_statistics_first_sample() {
        let current = CpuSample {
            usage_usec: 2_000_000,
            user_usec: 1_500_000,
            system_usec: 500_000,
            host_usec: 8_000_000,
            online_cpus: 4,
        };
        let stats = cpu_statistics(None, &current);
        assert_eq!(stats.total, 2.0);
        assert_eq!(stats.user, 1.5);
        assert_eq!(stats.processors, 4);
        assert_eq!(stats.percent, 100.0);
    }

    #[test]
    fn test_cpu_statistics_delta() {
        let previous = CpuSample {
            usage_usec: 1_000_000,
            host_usec: 4_000_000,
            online_cpus: 1,
            ..Default::default()
        };
        let current = CpuSample {
            usage_usec: 1_500_000,
            host_usec: 5_000_000,
            online_cpus: 1,
            ..Default::default()
        };
        let stats = cpu_statistics(Some(&previous), &current);
        assert_eq!(stats.total, 0.5);
        assert_eq!(stats.percent, 50.0);
    }

    #[test]
    fn test_memory_statistics() {
        let stats = memory_statistics(256, 1024);
        assert_eq!(stats.percent, 25.0);
        assert_eq!(memory_statistics(10, 0).percent, 0.0);
    }

    #[test]
    fn test_format_helpers() {
        assert_eq!(format_duration(30.0), "30.00 seconds");
        assert_eq!(format_duration(90.0), "1.50 minutes");
        assert_eq!(format_duration(7200.0), "2.00 hours");
        assert_eq!(format_size(512), "512 bytes");
        assert_eq!(format_size(1536), "1.50 KB");
        assert_eq!(format_size(3 * 1024 * 1024), "3.00 MB");
    }

    #[test]
    fn test_deserialize_partial() {
        let stats: ResourceStatistics =
            serde_json::from_str(r#"{"cpu": {"user": 1.0, "system": 0.5, "total": 1.5}}"#)
                .unwrap();
        assert_eq!(stats.cpu.total, 1.5);
        assert_eq!(stats.memory.rss, 0);
    }
}
