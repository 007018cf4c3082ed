// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Worker dispatch and health throttling for a serverless functions host.
//!
//! Out-of-process language workers are supervised by the
//! [`WorkerChannelManager`] and reached through the
//! [`FunctionInvocationDispatcher`]. The [`HostHealthManager`] combines the
//! performance counters, the throttle sources and worker latency into a
//! single decision on whether the host should accept more work.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod config;
pub mod counters;
pub mod dispatcher;
pub mod environment;
pub mod error;
pub mod health;
pub mod retry;
pub mod threshold;
pub mod throttle;
pub mod worker;

pub use config::HostConfig;
pub use counters::{PerformanceCounterSnapshot, PerformanceSampler};
pub use dispatcher::{DispatcherState, FunctionInvocationDispatcher, InvocationDispatcher};
pub use environment::{HostEnvironment, StaticEnvironment, SystemEnvironment};
pub use error::HostError;
pub use health::{HealthReport, HostHealthManager, HostHealthMonitorOptions};
pub use retry::{RetryContext, RetryOptions, RetryStrategy};
pub use throttle::{ConcurrencyThrottleAggregator, ThrottleSource, ThrottleState, ThrottleStatus};
pub use worker::{
    ChannelEvent, ChannelId, ChannelState, InvocationRequest, InvocationResponse,
    InvocationResult, WorkerChannel, WorkerChannelManager, WorkerStatus,
};
