// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};

use tokio::sync::{oneshot, watch};
use tracing::{debug, warn};

use super::transport::WorkerTransport;
use super::{ChannelId, InvocationRequest, InvocationResponse};
use crate::error::HostError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Initializing,
    Ready,
    Errored,
    Disposing,
    Disposed,
}

impl ChannelState {
    fn can_transition_to(self, next: ChannelState) -> bool {
        use ChannelState::*;
        matches!(
            (self, next),
            (Initializing, Ready)
                | (Initializing, Errored)
                | (Initializing, Disposing)
                | (Ready, Errored)
                | (Ready, Disposing)
                | (Errored, Disposed)
                | (Disposing, Disposed)
        )
    }
}

/// One connection to a worker process.
///
/// Owned by the [`WorkerChannelManager`](super::WorkerChannelManager); other
/// components hold `Arc`s and only read from it or invoke through it.
pub struct WorkerChannel {
    id: ChannelId,
    language: String,
    created_at: SystemTime,
    transport: Arc<dyn WorkerTransport>,
    state: watch::Sender<ChannelState>,
    latency: Mutex<Option<Duration>>,
    pending: Mutex<HashMap<String, oneshot::Sender<InvocationResponse>>>,
}

impl WorkerChannel {
    pub fn new(id: ChannelId, language: &str, transport: Arc<dyn WorkerTransport>) -> Self {
        let (state, _) = watch::channel(ChannelState::Initializing);
        Self {
            id,
            language: language.to_string(),
            created_at: SystemTime::now(),
            transport,
            state,
            latency: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ChannelState> {
        self.state.subscribe()
    }

    /// Moves the channel to `next` if the lifecycle allows it.
    ///
    /// Returns false, leaving the state untouched, for an invalid transition.
    pub fn transition(&self, next: ChannelState) -> bool {
        let mut from = None;
        let changed = self.state.send_if_modified(|current| {
            if current.can_transition_to(next) {
                *current = next;
                true
            } else {
                from = Some(*current);
                false
            }
        });
        match from {
            Some(from) => debug!(
                "Channel {} ignored transition {from:?} -> {next:?}",
                self.id
            ),
            None => debug!("Channel {} is now {next:?}", self.id),
        }
        changed
    }

    /// Routable: Ready and the transport accepts invocations.
    pub fn is_ready(&self) -> bool {
        self.state() == ChannelState::Ready && self.transport.is_ready_for_invocations()
    }

    pub fn latency(&self) -> Option<Duration> {
        *self.latency.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap_or_else(PoisonError::into_inner) = Some(latency);
    }

    pub fn pending_invocations(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Sends `request` to the worker and waits for its response.
    ///
    /// Fails with [`HostError::ChannelUnavailable`] if the channel is not
    /// Ready or is torn down before the worker answers.
    pub async fn invoke(&self, request: InvocationRequest) -> Result<InvocationResponse, HostError> {
        let invocation_id = request.invocation_id.clone();
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(invocation_id.clone(), tx);

        // checked after registering so a concurrent teardown cannot miss it
        if !self.is_ready() {
            self.remove_pending(&invocation_id);
            return Err(self.unavailable());
        }

        if let Err(e) = self.transport.send_invocation(request).await {
            warn!("Failed to send invocation {invocation_id} on channel {}: {e}", self.id);
            self.remove_pending(&invocation_id);
            return Err(self.unavailable());
        }

        rx.await.map_err(|_| self.unavailable())
    }

    /// Routes a worker response to its waiting caller.
    pub fn complete(&self, response: InvocationResponse) {
        let waiter = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&response.invocation_id);
        match waiter {
            Some(tx) => {
                let _ = tx.send(response);
            }
            None => debug!(
                "Channel {} received a response for unknown invocation {}",
                self.id, response.invocation_id
            ),
        }
    }

    /// Drops every in-flight invocation; callers see `ChannelUnavailable`.
    pub fn fail_pending(&self) {
        let pending: Vec<_> = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        if !pending.is_empty() {
            debug!(
                "Failing {} in-flight invocations on channel {}",
                pending.len(),
                self.id
            );
        }
    }

    pub(crate) fn transport(&self) -> &Arc<dyn WorkerTransport> {
        &self.transport
    }

    fn remove_pending(&self, invocation_id: &str) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(invocation_id);
    }

    fn unavailable(&self) -> HostError {
        HostError::ChannelUnavailable {
            channel_id: self.id.to_string(),
        }
    }
}

impl std::fmt::Debug for WorkerChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerChannel")
            .field("id", &self.id)
            .field("language", &self.language)
            .field("state", &self.state())
            .finish()
    }
}
