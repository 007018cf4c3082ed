// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Throttle sources backed by cgroup v1 accounting files.
//!
//! CPU usage is read from `cpuacct.usage` (nanoseconds, cumulative) and turned
//! into a rate between two consecutive polls. The CPU limit is
//! min(cpuset, CFS quota / period), falling back to the host CPU count.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Instant;

use tracing::debug;

use super::ThrottleSource;

const CGROUP_CPU_USAGE_PATH: &str = "/sys/fs/cgroup/cpu/cpuacct.usage"; // Total CPU time, in nanoseconds, consumed by all tasks in this cgroup
const CGROUP_CPUSET_CPUS_PATH: &str = "/sys/fs/cgroup/cpuset/cpuset.cpus"; // CPUs that tasks in this cgroup may run on
const CGROUP_CPU_PERIOD_PATH: &str = "/sys/fs/cgroup/cpu/cpu.cfs_period_us"; // CFS reallocation period, in microseconds
const CGROUP_CPU_QUOTA_PATH: &str = "/sys/fs/cgroup/cpu/cpu.cfs_quota_us"; // CFS runtime allowed per period, in microseconds
const CGROUP_MEMORY_USAGE_PATH: &str = "/sys/fs/cgroup/memory/memory.usage_in_bytes";
const CGROUP_MEMORY_LIMIT_PATH: &str = "/sys/fs/cgroup/memory/memory.limit_in_bytes";

// cgroup v1 reports "no limit" as a page-aligned i64::MAX
const UNLIMITED_MEMORY_BYTES: u64 = 1 << 62;

/// Locations of the cgroup accounting files.
#[derive(Debug, Clone)]
pub struct CgroupPaths {
    pub cpu_usage: PathBuf,
    pub cpuset_cpus: PathBuf,
    pub cpu_period: PathBuf,
    pub cpu_quota: PathBuf,
    pub memory_usage: PathBuf,
    pub memory_limit: PathBuf,
}

impl Default for CgroupPaths {
    fn default() -> Self {
        Self {
            cpu_usage: CGROUP_CPU_USAGE_PATH.into(),
            cpuset_cpus: CGROUP_CPUSET_CPUS_PATH.into(),
            cpu_period: CGROUP_CPU_PERIOD_PATH.into(),
            cpu_quota: CGROUP_CPU_QUOTA_PATH.into(),
            memory_usage: CGROUP_MEMORY_USAGE_PATH.into(),
            memory_limit: CGROUP_MEMORY_LIMIT_PATH.into(),
        }
    }
}

fn read_u64(path: &Path) -> Option<u64> {
    fs::read_to_string(path)
        .ok()
        .and_then(|contents| contents.trim().parse::<u64>().ok())
}

/// Counts the CPUs in a cpuset list.
///
/// The list is comma-separated with dashes for ranges, e.g. "0-2,16" is
/// CPUs 0, 1, 2 and 16, so the count is 4.
fn parse_cpuset(contents: &str) -> Result<u64, io::Error> {
    let cpuset_str = contents.trim();
    if cpuset_str.is_empty() {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "cpuset is empty"));
    }

    let parse = |value: &str| {
        value.trim().parse::<u64>().map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Failed to parse u64 from cpuset {cpuset_str:?}: {e}"),
            )
        })
    };

    let mut cpu_count: u64 = 0;
    for part in cpuset_str.split(',') {
        match part.split_once('-') {
            Some((start, end)) => {
                let (start, end) = (parse(start)?, parse(end)?);
                if end < start {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("Invalid cpuset range {part:?}"),
                    ));
                }
                cpu_count += end - start + 1;
            }
            None => {
                parse(part)?;
                cpu_count += 1;
            }
        }
    }
    Ok(cpu_count)
}

/// CPU limit in cores from the cgroup files, `None` when unconstrained.
fn read_cgroup_cpu_limit(paths: &CgroupPaths) -> Option<f64> {
    let mut limit = None;

    if let Some(cpu_count) = fs::read_to_string(&paths.cpuset_cpus)
        .ok()
        .and_then(|contents| parse_cpuset(&contents).ok())
    {
        if cpu_count != num_cpus::get() as u64 {
            debug!("CPU limit from cpuset: {cpu_count} CPUs");
            limit = Some(cpu_count as f64);
        }
    }

    let quota = fs::read_to_string(&paths.cpu_quota)
        .ok()
        .and_then(|contents| contents.trim().parse::<i64>().ok())
        .filter(|quota| *quota > 0);
    let period = read_u64(&paths.cpu_period).filter(|period| *period > 0);

    if let (Some(quota), Some(period)) = (quota, period) {
        let quota_limit = quota as f64 / period as f64;
        match limit {
            Some(current) if current <= quota_limit => {
                debug!("Keeping cpuset limit: {current} CPUs");
            }
            _ => {
                debug!("CPU limit from cfs quota: {quota_limit} CPUs");
                limit = Some(quota_limit);
            }
        }
    }

    limit
}

/// Returns true if the CPU used between two samples is above `threshold`
/// of `limit_cores`.
pub fn cpu_usage_exceeded(
    previous_usage_ns: u64,
    usage_ns: u64,
    elapsed_ns: u128,
    limit_cores: f64,
    threshold: f64,
) -> bool {
    if elapsed_ns == 0 || limit_cores <= 0.0 {
        return false;
    }
    let used_cores = usage_ns.saturating_sub(previous_usage_ns) as f64 / elapsed_ns as f64;
    used_cores > limit_cores * threshold
}

/// Triggers "CPU" when cgroup CPU usage is above the threshold of its limit.
///
/// The first poll only records a baseline and returns no determination.
pub struct CpuThrottleSource {
    paths: CgroupPaths,
    threshold: f64,
    last_sample: Mutex<Option<(u64, Instant)>>,
}

impl CpuThrottleSource {
    pub fn new(paths: CgroupPaths, threshold: f64) -> Self {
        Self {
            paths,
            threshold,
            last_sample: Mutex::new(None),
        }
    }
}

impl ThrottleSource for CpuThrottleSource {
    fn name(&self) -> &str {
        "CPU"
    }

    fn is_throttling(&self) -> Option<bool> {
        let Some(usage_ns) = read_u64(&self.paths.cpu_usage) else {
            debug!("Could not read CPU usage from {}", self.paths.cpu_usage.display());
            return None;
        };
        let now = Instant::now();

        let previous = self
            .last_sample
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace((usage_ns, now));
        let (previous_usage_ns, previous_at) = previous?;

        let limit_cores = read_cgroup_cpu_limit(&self.paths).unwrap_or_else(|| {
            let host_cpu_count = num_cpus::get() as f64;
            debug!("No CPU limit found, defaulting to host CPU count: {host_cpu_count} CPUs");
            host_cpu_count
        });

        let elapsed_ns = now.duration_since(previous_at).as_nanos();
        let exceeded = cpu_usage_exceeded(
            previous_usage_ns,
            usage_ns,
            elapsed_ns,
            limit_cores,
            self.threshold,
        );
        debug!(
            "CPU usage since last poll: {}ns over {elapsed_ns}ns, limit {limit_cores} CPUs, exceeded: {exceeded}",
            usage_ns.saturating_sub(previous_usage_ns)
        );
        Some(exceeded)
    }
}

/// Triggers "Memory" when cgroup memory usage is above the threshold of its limit.
pub struct MemoryThrottleSource {
    paths: CgroupPaths,
    threshold: f64,
}

impl MemoryThrottleSource {
    pub fn new(paths: CgroupPaths, threshold: f64) -> Self {
        Self { paths, threshold }
    }
}

impl ThrottleSource for MemoryThrottleSource {
    fn name(&self) -> &str {
        "Memory"
    }

    fn is_throttling(&self) -> Option<bool> {
        let usage = read_u64(&self.paths.memory_usage)?;
        let limit = read_u64(&self.paths.memory_limit)?;
        if limit == 0 || limit >= UNLIMITED_MEMORY_BYTES {
            return Some(false);
        }
        Some(usage as f64 > limit as f64 * self.threshold)
    }
}
