// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Restart backoff policy for supervised worker slots.

use std::str::FromStr;
use std::time::Duration;

use crate::error::HostError;

pub const DEFAULT_RESTART_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_RESTART_DELAY: Duration = Duration::from_secs(30);

// 2^16 * base is far past any sane cap; stop doubling there
const MAX_BACKOFF_EXPONENT: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStrategy {
    /// Doubles the delay per consecutive failure, capped at `max_delay`.
    ExponentialBackoff {
        base_delay: Duration,
        max_delay: Duration,
    },
    /// Same delay before every attempt.
    FixedDelay { delay: Duration },
}

impl Default for RetryStrategy {
    fn default() -> Self {
        RetryStrategy::ExponentialBackoff {
            base_delay: DEFAULT_RESTART_DELAY,
            max_delay: DEFAULT_MAX_RESTART_DELAY,
        }
    }
}

impl RetryStrategy {
    /// Delay to wait after the `attempt`-th consecutive failure (1-based).
    ///
    /// # Examples
    ///
    /// ```
    /// use std::time::Duration;
    /// use functions_host_core::retry::RetryStrategy;
    ///
    /// let strategy = RetryStrategy::ExponentialBackoff {
    ///     base_delay: Duration::from_millis(100),
    ///     max_delay: Duration::from_millis(500),
    /// };
    /// assert_eq!(strategy.delay_for(1), Duration::from_millis(100));
    /// assert_eq!(strategy.delay_for(3), Duration::from_millis(400));
    /// assert_eq!(strategy.delay_for(4), Duration::from_millis(500));
    /// ```
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match *self {
            RetryStrategy::ExponentialBackoff {
                base_delay,
                max_delay,
            } => {
                let exponent = attempt.saturating_sub(1).min(MAX_BACKOFF_EXPONENT);
                base_delay.saturating_mul(1 << exponent).min(max_delay)
            }
            RetryStrategy::FixedDelay { delay } => delay,
        }
    }
}

/// Strategy kind as written in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStrategyKind {
    ExponentialBackoff,
    FixedDelay,
}

impl FromStr for RetryStrategyKind {
    type Err = HostError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "exponential" | "exponentialbackoff" => Ok(RetryStrategyKind::ExponentialBackoff),
            "fixed" | "fixeddelay" => Ok(RetryStrategyKind::FixedDelay),
            other => Err(HostError::InvalidConfig(format!(
                "Unknown worker restart strategy '{other}'. Must be one of: exponential, fixed"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RetryOptions {
    pub strategy: RetryStrategy,
    /// Maximum consecutive failures tolerated; 0 retries forever.
    pub max_attempts: u32,
}

/// Consecutive-failure counter for one supervised worker slot.
#[derive(Debug, Clone)]
pub struct RetryContext {
    options: RetryOptions,
    attempts: u32,
}

impl RetryContext {
    pub fn new(options: RetryOptions) -> Self {
        Self {
            options,
            attempts: 0,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Records a failed attempt.
    ///
    /// Returns the delay before the next attempt, or `None` once the
    /// configured maximum is exceeded.
    pub fn record_failure(&mut self) -> Option<Duration> {
        self.attempts = self.attempts.saturating_add(1);
        if self.options.max_attempts > 0 && self.attempts > self.options.max_attempts {
            return None;
        }
        Some(self.options.strategy.delay_for(self.attempts))
    }

    /// Called once a channel reaches Ready.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}
