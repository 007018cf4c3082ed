// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Application performance counters reported by the hosting environment.
//!
//! The environment publishes a JSON object of named integer counters and their
//! limits through the `WEBSITE_COUNTERS_APP` variable. The payload is sometimes
//! followed by garbage characters after the closing brace, so everything past
//! the last `}` is dropped before parsing.

use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, error};

use crate::environment::{HostEnvironment, WEBSITE_COUNTERS_APP};

/// Point-in-time snapshot of the application performance counters.
///
/// Never mutated after construction; a new snapshot is produced per sample.
/// Missing counters default to zero, and a limit of zero or less means the
/// environment does not enforce that counter.
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PerformanceCounterSnapshot {
    pub user_time: i64,
    pub kernel_time: i64,
    pub page_faults: i64,
    pub processes: i64,
    pub process_limit: i64,
    pub threads: i64,
    pub thread_limit: i64,
    pub connections: i64,
    pub connection_limit: i64,
    pub active_connections: i64,
    pub active_connection_limit: i64,
    pub sections: i64,
    pub section_limit: i64,
    pub named_pipes: i64,
    pub named_pipe_limit: i64,
    pub remote_dir_monitors: i64,
    pub remote_dir_monitor_limit: i64,
    pub read_io_operations: i64,
    pub write_io_operations: i64,
    pub other_io_operations: i64,
    pub read_io_bytes: i64,
    pub write_io_bytes: i64,
    pub other_io_bytes: i64,
    pub private_bytes: i64,
    pub handles: i64,
    pub context_switches: i64,
    pub remote_opens: i64,
}

/// A counter paired with the limit the environment enforces on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitedCounter {
    pub name: &'static str,
    pub current: i64,
    pub limit: i64,
}

impl PerformanceCounterSnapshot {
    /// Counters that carry a limit, in the order they are evaluated and reported.
    pub fn limited_counters(&self) -> [LimitedCounter; 7] {
        let counter = |name, current, limit| LimitedCounter {
            name,
            current,
            limit,
        };
        [
            counter("Connections", self.connections, self.connection_limit),
            counter(
                "ActiveConnections",
                self.active_connections,
                self.active_connection_limit,
            ),
            counter(
                "RemoteDirMonitors",
                self.remote_dir_monitors,
                self.remote_dir_monitor_limit,
            ),
            counter("Threads", self.threads, self.thread_limit),
            counter("Processes", self.processes, self.process_limit),
            counter("NamedPipes", self.named_pipes, self.named_pipe_limit),
            counter("Sections", self.sections, self.section_limit),
        ]
    }
}

/// Parses a raw counters payload.
///
/// An empty payload yields an all-zero snapshot.
pub fn parse_counters(raw: &str) -> Result<PerformanceCounterSnapshot, serde_json::Error> {
    let payload = trim_payload(raw);
    if payload.is_empty() {
        return Ok(PerformanceCounterSnapshot::default());
    }
    serde_json::from_str(payload)
}

fn trim_payload(raw: &str) -> &str {
    match raw.rfind('}') {
        Some(idx) => &raw[..=idx],
        None => raw.trim(),
    }
}

/// Samples performance counters from a [`HostEnvironment`].
pub struct PerformanceSampler {
    environment: Arc<dyn HostEnvironment>,
}

impl PerformanceSampler {
    pub fn new(environment: Arc<dyn HostEnvironment>) -> Self {
        Self { environment }
    }

    /// Takes a fresh snapshot.
    ///
    /// Returns `None` when the environment does not publish counters or when
    /// the payload cannot be parsed. Parse failures are logged with the
    /// offending content and never propagate.
    pub fn sample(&self) -> Option<PerformanceCounterSnapshot> {
        let Some(raw) = self.environment.get_var(WEBSITE_COUNTERS_APP) else {
            debug!("{WEBSITE_COUNTERS_APP} is not set, no performance counters available");
            return None;
        };

        match parse_counters(&raw) {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                error!(
                    "Failed to deserialize application performance counters. JSON Content: \"{}\" ({e}, sku dynamic: {}, instance: {:?})",
                    trim_payload(&raw),
                    self.environment.is_dynamic_sku(),
                    self.environment.instance_id()
                );
                None
            }
        }
    }
}
