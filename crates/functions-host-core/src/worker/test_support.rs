// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! In-memory workers for unit tests.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::transport::{StreamWorkerTransport, WorkerConnection, WorkerStream, WorkerTransportFactory};
use super::{ChannelId, InvocationRequest, InvocationResponse, InvocationResult, WorkerEvent};
use crate::error::HostError;

/// Test side of one worker stream. Dropping it looks like the worker died.
pub(crate) struct TestWorker {
    pub language: String,
    pub channel_id: ChannelId,
    pub requests: mpsc::Receiver<InvocationRequest>,
    pub events: mpsc::Sender<WorkerEvent>,
}

impl TestWorker {
    pub async fn ready(&self) {
        self.events.send(WorkerEvent::WorkerReady).await.unwrap();
    }

    /// Answers the next request with `value`.
    pub async fn respond(&mut self, value: serde_json::Value) {
        let request = self.requests.recv().await.unwrap();
        self.events
            .send(WorkerEvent::InvocationResponse(InvocationResponse {
                invocation_id: request.invocation_id,
                result: InvocationResult::Success(value),
            }))
            .await
            .unwrap();
    }
}

pub(crate) struct TestFactory {
    workers: mpsc::UnboundedSender<TestWorker>,
    connects: AtomicU32,
    failure: Option<HostError>,
    auto_ready: bool,
}

impl TestFactory {
    pub fn new(auto_ready: bool) -> (Arc<Self>, mpsc::UnboundedReceiver<TestWorker>) {
        Self::build(auto_ready, None)
    }

    /// Every connect attempt fails with `error`.
    pub fn failing(error: HostError) -> (Arc<Self>, mpsc::UnboundedReceiver<TestWorker>) {
        Self::build(false, Some(error))
    }

    fn build(
        auto_ready: bool,
        failure: Option<HostError>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<TestWorker>) {
        let (workers_tx, workers_rx) = mpsc::unbounded_channel();
        let factory = Arc::new(Self {
            workers: workers_tx,
            connects: AtomicU32::new(0),
            failure,
            auto_ready,
        });
        (factory, workers_rx)
    }

    pub fn connects(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WorkerTransportFactory for TestFactory {
    async fn connect(
        &self,
        language: &str,
        channel_id: ChannelId,
    ) -> Result<WorkerConnection, HostError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = &self.failure {
            return Err(error.clone());
        }
        let (outbound_tx, outbound_rx) = mpsc::channel(8);
        let (inbound_tx, inbound_rx) = mpsc::channel(8);
        if self.auto_ready {
            inbound_tx.send(WorkerEvent::WorkerReady).await.unwrap();
        }
        let _ = self.workers.send(TestWorker {
            language: language.to_string(),
            channel_id,
            requests: outbound_rx,
            events: inbound_tx,
        });
        Ok(StreamWorkerTransport::connect(WorkerStream {
            outbound: outbound_tx,
            inbound: inbound_rx,
        }))
    }
}
