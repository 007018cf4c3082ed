// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::str::FromStr;
use std::time::Duration;

use crate::environment::{HostEnvironment, SystemEnvironment};
use crate::error::HostError;
use crate::health::HostHealthMonitorOptions;
use crate::retry::{
    RetryOptions, RetryStrategy, RetryStrategyKind, DEFAULT_MAX_RESTART_DELAY,
    DEFAULT_RESTART_DELAY,
};
use crate::worker::http::DEFAULT_INITIALIZATION_TIMEOUT;
use crate::worker::manager::DEFAULT_PROCESS_COUNT;
use crate::worker::{
    CustomHandlerType, HttpWorkerOptions, WorkerChannelManagerOptions, WorkerProcessArguments,
};

const MAX_PROCESS_COUNT: usize = 10;

/// Configuration for the functions host
#[derive(Debug, Clone, PartialEq)]
pub struct HostConfig {
    /// Log level (e.g., trace, debug, info, warn, error)
    pub log_level: String,
    /// Language of the out-of-process worker, if any
    pub worker_runtime: Option<String>,
    /// Worker processes per language
    pub process_count: usize,
    pub health: HostHealthMonitorOptions,
    pub retry: RetryOptions,
    /// Bound on one worker start, from spawn to handshake
    pub worker_init_timeout: Duration,
    /// Present when a custom handler executable is configured
    pub http_worker: Option<HttpWorkerOptions>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            worker_runtime: None,
            process_count: DEFAULT_PROCESS_COUNT,
            health: HostHealthMonitorOptions::default(),
            retry: RetryOptions::default(),
            worker_init_timeout: DEFAULT_INITIALIZATION_TIMEOUT,
            http_worker: None,
        }
    }
}

fn var(env: &dyn HostEnvironment, name: &str) -> Option<String> {
    env.get_var(name)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_or<T: FromStr>(env: &dyn HostEnvironment, name: &str, default: T) -> T {
    var(env, name)
        .and_then(|value| value.parse::<T>().ok())
        .unwrap_or(default)
}

fn flag(env: &dyn HostEnvironment, name: &str, default: bool) -> bool {
    var(env, name)
        .map(|value| match value.to_lowercase().as_str() {
            "true" | "1" => true,
            "false" | "0" => false,
            _ => default,
        })
        .unwrap_or(default)
}

fn secs(env: &dyn HostEnvironment, name: &str, default: Duration) -> Duration {
    Duration::from_secs(parse_or(env, name, default.as_secs()))
}

fn millis(env: &dyn HostEnvironment, name: &str, default: Duration) -> Duration {
    Duration::from_millis(parse_or(env, name, default.as_millis() as u64))
}

impl HostConfig {
    /// Create configuration from the process environment
    pub fn from_env() -> Result<Self, HostError> {
        Self::from_environment(&SystemEnvironment)
    }

    /// Create configuration from `env`.
    ///
    /// Unparseable numbers fall back to their defaults. Unknown enum values
    /// and an invalid port are configuration errors.
    pub fn from_environment(env: &dyn HostEnvironment) -> Result<Self, HostError> {
        let defaults = HostConfig::default();

        let log_level = var(env, "FUNCTIONS_HOST_LOG_LEVEL")
            .map(|val| val.to_lowercase())
            .unwrap_or(defaults.log_level);
        let worker_runtime = var(env, "FUNCTIONS_WORKER_RUNTIME").map(|val| val.to_lowercase());
        let process_count = parse_or(env, "FUNCTIONS_WORKER_PROCESS_COUNT", DEFAULT_PROCESS_COUNT);

        let health_defaults = HostHealthMonitorOptions::default();
        let health = HostHealthMonitorOptions {
            enabled: flag(env, "FUNCTIONS_HEALTH_MONITOR_ENABLED", true),
            health_check_interval: secs(
                env,
                "FUNCTIONS_HEALTH_CHECK_INTERVAL_SECS",
                health_defaults.health_check_interval,
            ),
            health_check_window: secs(
                env,
                "FUNCTIONS_HEALTH_CHECK_WINDOW_SECS",
                health_defaults.health_check_window,
            ),
            health_check_threshold: parse_or(
                env,
                "FUNCTIONS_HEALTH_CHECK_THRESHOLD",
                health_defaults.health_check_threshold,
            ),
            counter_threshold: parse_or(
                env,
                "FUNCTIONS_COUNTER_THRESHOLD",
                health_defaults.counter_threshold,
            ),
            worker_latency_threshold: var(env, "FUNCTIONS_WORKER_LATENCY_THRESHOLD_MS")
                .and_then(|val| val.parse::<u64>().ok())
                .map(Duration::from_millis),
        };

        let strategy_kind = var(env, "FUNCTIONS_WORKER_RESTART_STRATEGY")
            .map(|val| val.parse::<RetryStrategyKind>())
            .transpose()?
            .unwrap_or(RetryStrategyKind::ExponentialBackoff);
        let base_delay = millis(env, "FUNCTIONS_WORKER_RESTART_DELAY_MS", DEFAULT_RESTART_DELAY);
        let strategy = match strategy_kind {
            RetryStrategyKind::ExponentialBackoff => RetryStrategy::ExponentialBackoff {
                base_delay,
                max_delay: millis(
                    env,
                    "FUNCTIONS_WORKER_RESTART_MAX_DELAY_MS",
                    DEFAULT_MAX_RESTART_DELAY,
                ),
            },
            RetryStrategyKind::FixedDelay => RetryStrategy::FixedDelay { delay: base_delay },
        };
        let retry = RetryOptions {
            strategy,
            max_attempts: parse_or(env, "FUNCTIONS_WORKER_RESTART_MAX_ATTEMPTS", 0),
        };

        let worker_init_timeout = secs(
            env,
            "FUNCTIONS_WORKER_INIT_TIMEOUT_SECS",
            DEFAULT_INITIALIZATION_TIMEOUT,
        );
        let http_worker = http_worker_from_environment(env, worker_init_timeout)?;

        let config = Self {
            log_level,
            worker_runtime,
            process_count,
            health,
            retry,
            worker_init_timeout,
            http_worker,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), HostError> {
        // Validate log level
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.log_level.as_str()) {
            return Err(HostError::InvalidConfig(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.log_level
            )));
        }

        let threshold = self.health.counter_threshold;
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(HostError::InvalidConfig(format!(
                "Counter threshold must be in (0, 1], got {threshold}"
            )));
        }

        if self.health.health_check_interval.is_zero() {
            return Err(HostError::InvalidConfig(
                "Health check interval must be greater than 0".to_string(),
            ));
        }

        if self.health.health_check_window < self.health.health_check_interval {
            return Err(HostError::InvalidConfig(
                "Health check window must be at least the health check interval".to_string(),
            ));
        }

        if self.health.health_check_threshold == 0 {
            return Err(HostError::InvalidConfig(
                "Health check threshold must be greater than 0".to_string(),
            ));
        }

        if let RetryStrategy::ExponentialBackoff {
            base_delay,
            max_delay,
        } = self.retry.strategy
        {
            if max_delay < base_delay {
                return Err(HostError::InvalidConfig(format!(
                    "Worker restart max delay {max_delay:?} is below the base delay {base_delay:?}"
                )));
            }
        }

        if self.worker_init_timeout.is_zero() {
            return Err(HostError::InvalidConfig(
                "Worker initialization timeout must be greater than 0".to_string(),
            ));
        }

        if !(1..=MAX_PROCESS_COUNT).contains(&self.process_count) {
            return Err(HostError::InvalidConfig(format!(
                "Worker process count must be between 1 and {MAX_PROCESS_COUNT}, got {}",
                self.process_count
            )));
        }

        Ok(())
    }

    pub fn worker_manager_options(&self) -> WorkerChannelManagerOptions {
        WorkerChannelManagerOptions {
            retry: self.retry,
            initialization_timeout: self.worker_init_timeout,
            process_count: self.process_count,
        }
    }
}

fn http_worker_from_environment(
    env: &dyn HostEnvironment,
    initialization_timeout: Duration,
) -> Result<Option<HttpWorkerOptions>, HostError> {
    let Some(executable_path) = var(env, "FUNCTIONS_CUSTOMHANDLER_EXECUTABLE") else {
        return Ok(None);
    };

    let handler_type = var(env, "FUNCTIONS_CUSTOMHANDLER_TYPE")
        .map(|val| val.parse::<CustomHandlerType>())
        .transpose()?
        .unwrap_or_default();
    let port = var(env, "FUNCTIONS_CUSTOMHANDLER_PORT")
        .map(|val| {
            val.parse::<u16>().map_err(|_| {
                HostError::InvalidConfig(format!("Invalid custom handler port '{val}'"))
            })
        })
        .transpose()?
        .unwrap_or(0);
    let arguments = var(env, "FUNCTIONS_CUSTOMHANDLER_ARGUMENTS")
        .map(|val| val.split_whitespace().map(String::from).collect())
        .unwrap_or_default();

    Ok(Some(HttpWorkerOptions {
        handler_type,
        arguments: WorkerProcessArguments {
            executable_path,
            arguments,
            working_directory: None,
        },
        port,
        enable_forwarding_http_request: flag(env, "FUNCTIONS_CUSTOMHANDLER_FORWARD_HTTP", false),
        initialization_timeout,
    }))
}
