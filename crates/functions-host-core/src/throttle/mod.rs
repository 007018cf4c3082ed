// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Concurrency throttle aggregation.
//!
//! Independent throttle sources (CPU, memory, operator overrides, ...) each
//! report whether they are currently triggering. The aggregator merges them
//! into a single [`ThrottleStatus`].

use std::sync::{Arc, PoisonError, RwLock};

use tracing::debug;

pub mod cgroup;

pub use cgroup::{CgroupPaths, CpuThrottleSource, MemoryThrottleSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleState {
    /// No source is triggering.
    Disabled,
    /// No source has produced a determination yet.
    Unknown,
    /// At least one source is triggering.
    Enabled,
}

/// Aggregate throttle status.
///
/// The state is `Enabled` exactly when `enabled_throttles` is non-empty; the
/// constructors are the only way to build one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThrottleStatus {
    state: ThrottleState,
    enabled_throttles: Vec<String>,
}

impl ThrottleStatus {
    pub fn unknown() -> Self {
        Self {
            state: ThrottleState::Unknown,
            enabled_throttles: Vec::new(),
        }
    }

    pub fn disabled() -> Self {
        Self {
            state: ThrottleState::Disabled,
            enabled_throttles: Vec::new(),
        }
    }

    /// Builds an `Enabled` status, or `Disabled` if `throttles` is empty.
    pub fn enabled(throttles: Vec<String>) -> Self {
        if throttles.is_empty() {
            return Self::disabled();
        }
        Self {
            state: ThrottleState::Enabled,
            enabled_throttles: throttles,
        }
    }

    pub fn state(&self) -> ThrottleState {
        self.state
    }

    pub fn enabled_throttles(&self) -> &[String] {
        &self.enabled_throttles
    }

    pub fn is_enabled(&self) -> bool {
        self.state == ThrottleState::Enabled
    }
}

/// A single throttle signal.
pub trait ThrottleSource: Send + Sync {
    /// Name reported in [`ThrottleStatus::enabled_throttles`] when triggering.
    fn name(&self) -> &str;

    /// `None` until the source has enough data to decide.
    fn is_throttling(&self) -> Option<bool>;
}

/// Throttle signal driven by the embedder.
#[derive(Debug)]
pub struct StaticThrottleSource {
    name: String,
    value: RwLock<Option<bool>>,
}

impl StaticThrottleSource {
    pub fn new(name: &str, value: Option<bool>) -> Self {
        Self {
            name: name.to_string(),
            value: RwLock::new(value),
        }
    }

    pub fn set(&self, value: Option<bool>) {
        *self.value.write().unwrap_or_else(PoisonError::into_inner) = value;
    }
}

impl ThrottleSource for StaticThrottleSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_throttling(&self) -> Option<bool> {
        *self.value.read().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Merges a fixed set of throttle sources.
pub struct ConcurrencyThrottleAggregator {
    sources: Vec<Arc<dyn ThrottleSource>>,
    last_status: RwLock<Arc<ThrottleStatus>>,
}

impl ConcurrencyThrottleAggregator {
    pub fn new(sources: Vec<Arc<dyn ThrottleSource>>) -> Self {
        Self {
            sources,
            last_status: RwLock::new(Arc::new(ThrottleStatus::unknown())),
        }
    }

    /// Polls every source and returns the aggregate status.
    ///
    /// Triggering names are reported in source registration order.
    pub fn get_status(&self) -> ThrottleStatus {
        let mut determined = false;
        let mut enabled = Vec::new();

        for source in &self.sources {
            match source.is_throttling() {
                Some(true) => {
                    determined = true;
                    enabled.push(source.name().to_string());
                }
                Some(false) => determined = true,
                None => debug!("Throttle source {} has no determination yet", source.name()),
            }
        }

        let status = if !determined {
            ThrottleStatus::unknown()
        } else {
            ThrottleStatus::enabled(enabled)
        };

        *self.last_status.write().unwrap_or_else(PoisonError::into_inner) =
            Arc::new(status.clone());
        status
    }

    /// Status computed by the most recent [`get_status`](Self::get_status) call.
    pub fn last_status(&self) -> Arc<ThrottleStatus> {
        Arc::clone(&self.last_status.read().unwrap_or_else(PoisonError::into_inner))
    }
}
