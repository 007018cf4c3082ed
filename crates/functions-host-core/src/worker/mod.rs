// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Out-of-process language workers.
//!
//! A [`WorkerChannel`] is one supervised connection to a worker process. The
//! [`WorkerChannelManager`] owns every channel, restarts them with backoff
//! when they fail, and publishes [`ChannelEvent`]s in the order they happen.
//! How bytes reach the worker is the [`WorkerTransport`]'s concern.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod channel;
pub mod http;
pub mod manager;
pub mod transport;

#[cfg(test)]
pub(crate) mod test_support;

pub use channel::{ChannelState, WorkerChannel};
pub use http::{
    CustomHandlerType, HttpWorkerOptions, HttpWorkerTransportFactory, WorkerProcessArguments,
};
pub use manager::{ChannelEvent, WorkerChannelManager, WorkerChannelManagerOptions};
pub use transport::{
    StreamWorkerTransport, StreamWorkerTransportFactory, WorkerConnection, WorkerStream,
    WorkerStreamConnector, WorkerTransport, WorkerTransportFactory,
};

/// Identity of a worker channel. A fresh id is generated for every channel,
/// so a restarted worker is always distinguishable from the one it replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(Uuid);

impl ChannelId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ChannelId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationRequest {
    pub invocation_id: String,
    pub function_name: String,
    pub payload: serde_json::Value,
}

impl InvocationRequest {
    pub fn new(function_name: &str, payload: serde_json::Value) -> Self {
        Self {
            invocation_id: Uuid::new_v4().to_string(),
            function_name: function_name.to_string(),
            payload,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum InvocationResult {
    Success(serde_json::Value),
    Failure(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationResponse {
    pub invocation_id: String,
    pub result: InvocationResult,
}

/// Events a transport reports about its worker.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    /// The worker finished its initialization handshake.
    WorkerReady,
    InvocationResponse(InvocationResponse),
    /// Latency observed by the transport for a round trip to the worker.
    LatencySample(Duration),
    ProcessExited { exit_code: Option<i32> },
}

/// Health reported for one worker, rebuilt on every query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WorkerStatus {
    /// Last latency the worker reported, if any.
    pub latency: Option<Duration>,
}
