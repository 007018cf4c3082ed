// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Transport boundary between the host and a worker process.
//!
//! The core only needs three capabilities from a transport: send an
//! invocation, report events, and answer whether the worker is ready. Two
//! variants exist: [`StreamWorkerTransport`] for workers reached over a
//! bidirectional message stream, and the HTTP forwarding transport in
//! [`super::http`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{ChannelId, InvocationRequest, WorkerEvent};
use crate::error::HostError;

/// Capacity of the per-channel event queue.
pub const EVENT_BUFFER: usize = 64;

#[async_trait]
pub trait WorkerTransport: Send + Sync {
    /// Hands an invocation to the worker. The response arrives later as a
    /// [`WorkerEvent::InvocationResponse`].
    async fn send_invocation(&self, request: InvocationRequest) -> Result<(), HostError>;

    fn is_ready_for_invocations(&self) -> bool;

    /// Releases the worker. Must be safe to call more than once.
    async fn shutdown(&self);
}

/// A freshly established transport and the events it will report.
pub struct WorkerConnection {
    pub transport: Arc<dyn WorkerTransport>,
    pub events: mpsc::Receiver<WorkerEvent>,
}

/// Builds one connection per (language, channel) pair.
#[async_trait]
pub trait WorkerTransportFactory: Send + Sync {
    async fn connect(
        &self,
        language: &str,
        channel_id: ChannelId,
    ) -> Result<WorkerConnection, HostError>;
}

/// Raw message stream to a worker, as provided by the wire layer.
pub struct WorkerStream {
    pub outbound: mpsc::Sender<InvocationRequest>,
    pub inbound: mpsc::Receiver<WorkerEvent>,
}

/// Opens message streams to new workers.
#[async_trait]
pub trait WorkerStreamConnector: Send + Sync {
    async fn open(&self, language: &str, channel_id: ChannelId) -> Result<WorkerStream, HostError>;
}

/// Transport over a [`WorkerStream`].
///
/// Readiness flips on once the worker sends [`WorkerEvent::WorkerReady`] and
/// off when it exits or the stream closes.
pub struct StreamWorkerTransport {
    outbound: mpsc::Sender<InvocationRequest>,
    ready: Arc<AtomicBool>,
    closed: CancellationToken,
}

impl StreamWorkerTransport {
    pub fn connect(stream: WorkerStream) -> WorkerConnection {
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let ready = Arc::new(AtomicBool::new(false));
        let closed = CancellationToken::new();

        tokio::spawn(relay_events(
            stream.inbound,
            events_tx,
            Arc::clone(&ready),
            closed.clone(),
        ));

        WorkerConnection {
            transport: Arc::new(StreamWorkerTransport {
                outbound: stream.outbound,
                ready,
                closed,
            }),
            events: events_rx,
        }
    }
}

async fn relay_events(
    mut inbound: mpsc::Receiver<WorkerEvent>,
    events: mpsc::Sender<WorkerEvent>,
    ready: Arc<AtomicBool>,
    closed: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = closed.cancelled() => break,
            event = inbound.recv() => event,
        };

        // readiness is updated before the event is observable downstream
        let event = match event {
            Some(WorkerEvent::WorkerReady) => {
                ready.store(true, Ordering::SeqCst);
                WorkerEvent::WorkerReady
            }
            Some(event @ WorkerEvent::ProcessExited { .. }) => {
                ready.store(false, Ordering::SeqCst);
                event
            }
            Some(event) => event,
            None => {
                debug!("Worker event stream closed");
                ready.store(false, Ordering::SeqCst);
                WorkerEvent::ProcessExited { exit_code: None }
            }
        };

        let exited = matches!(event, WorkerEvent::ProcessExited { .. });
        if events.send(event).await.is_err() || exited {
            break;
        }
    }
    ready.store(false, Ordering::SeqCst);
}

#[async_trait]
impl WorkerTransport for StreamWorkerTransport {
    async fn send_invocation(&self, request: InvocationRequest) -> Result<(), HostError> {
        if self.closed.is_cancelled() {
            return Err(HostError::Transport("worker stream is closed".to_string()));
        }
        self.outbound
            .send(request)
            .await
            .map_err(|_| HostError::Transport("worker stream is closed".to_string()))
    }

    fn is_ready_for_invocations(&self) -> bool {
        self.ready.load(Ordering::SeqCst) && !self.closed.is_cancelled()
    }

    async fn shutdown(&self) {
        self.ready.store(false, Ordering::SeqCst);
        self.closed.cancel();
    }
}

/// Factory for [`StreamWorkerTransport`]s on top of a connector.
pub struct StreamWorkerTransportFactory<C> {
    connector: C,
}

impl<C: WorkerStreamConnector> StreamWorkerTransportFactory<C> {
    pub fn new(connector: C) -> Self {
        Self { connector }
    }
}

#[async_trait]
impl<C: WorkerStreamConnector> WorkerTransportFactory for StreamWorkerTransportFactory<C> {
    async fn connect(
        &self,
        language: &str,
        channel_id: ChannelId,
    ) -> Result<WorkerConnection, HostError> {
        let stream = self.connector.open(language, channel_id).await?;
        debug!("Opened worker stream for {language} channel {channel_id}");
        Ok(StreamWorkerTransport::connect(stream))
    }
}
