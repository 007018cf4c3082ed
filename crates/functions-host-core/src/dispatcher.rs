// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Invocation routing to out-of-process workers.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::HostError;
use crate::worker::{
    ChannelEvent, InvocationRequest, InvocationResponse, WorkerChannel, WorkerChannelManager,
    WorkerStatus,
};

/// Lifecycle of the dispatcher.
///
/// `Default -> Initializing -> Initialized <-> WorkerProcessRestarting`, and
/// from any of those `-> Disposing -> Disposed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    Default,
    Initializing,
    Initialized,
    WorkerProcessRestarting,
    Disposing,
    Disposed,
}

impl DispatcherState {
    fn is_disposed(self) -> bool {
        matches!(self, DispatcherState::Disposing | DispatcherState::Disposed)
    }
}

/// What the health manager needs to know about dispatch.
#[async_trait]
pub trait InvocationDispatcher: Send + Sync {
    fn state(&self) -> DispatcherState;

    /// Status of every routable worker, keyed by channel id.
    async fn get_worker_statuses(&self) -> HashMap<String, WorkerStatus>;
}

pub struct FunctionInvocationDispatcher {
    manager: Arc<WorkerChannelManager>,
    state: Arc<watch::Sender<DispatcherState>>,
    next_channel: AtomicUsize,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl FunctionInvocationDispatcher {
    pub fn new(manager: Arc<WorkerChannelManager>) -> Self {
        let (state, _) = watch::channel(DispatcherState::Default);
        Self {
            manager,
            state: Arc::new(state),
            next_channel: AtomicUsize::new(0),
            monitor: Mutex::new(None),
        }
    }

    pub fn manager(&self) -> &Arc<WorkerChannelManager> {
        &self.manager
    }

    pub fn subscribe_state(&self) -> watch::Receiver<DispatcherState> {
        self.state.subscribe()
    }

    /// Ordered stream of channel Ready/Lost/Exhausted events.
    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.manager.subscribe()
    }

    /// Starts worker supervision for `languages`.
    ///
    /// The first call moves the dispatcher to `Initializing`; it becomes
    /// `Initialized` once any channel is Ready. Later calls only add
    /// languages.
    pub fn initialize(&self, languages: &[&str]) -> Result<(), HostError> {
        let mut disposed = false;
        let first = self.state.send_if_modified(|state| match *state {
            DispatcherState::Default => {
                *state = DispatcherState::Initializing;
                true
            }
            current => {
                disposed = current.is_disposed();
                false
            }
        });
        if disposed {
            return Err(HostError::DispatcherDisposed);
        }

        if first {
            info!("Initializing function dispatcher for {languages:?}");
            // subscribe before starting so the first Ready is not missed
            let events = self.manager.subscribe();
            let monitor = tokio::spawn(monitor_channels(
                events,
                Arc::clone(&self.state),
                Arc::clone(&self.manager),
            ));
            *self.monitor.lock().unwrap_or_else(PoisonError::into_inner) = Some(monitor);

            // channels that became Ready before the subscription
            if !self.manager.all_ready_channels().is_empty() {
                mark_initialized(&self.state);
            }
        }

        for language in languages {
            self.manager.start(language);
        }
        Ok(())
    }

    /// Routes `request` to a Ready channel for `language`.
    ///
    /// Ready channels are used round-robin. Without one the call fails
    /// immediately with [`HostError::NoWorkerAvailable`] (or the slot's
    /// fatal error) instead of waiting for a worker.
    pub async fn invoke(
        &self,
        language: &str,
        request: InvocationRequest,
    ) -> Result<InvocationResponse, HostError> {
        match self.state() {
            state if state.is_disposed() => return Err(HostError::DispatcherDisposed),
            DispatcherState::Default => self.initialize(&[language])?,
            _ => {}
        }

        let channel = match self.next_ready_channel(language) {
            Some(channel) => channel,
            None => self.manager.ensure_channel(language)?,
        };
        debug!(
            "Dispatching invocation {} of {} to channel {}",
            request.invocation_id,
            request.function_name,
            channel.id()
        );
        channel.invoke(request).await
    }

    /// Polls every `poll_interval` until a channel for `language` is Ready.
    ///
    /// Fails with [`HostError::WaitTimeout`] after `timeout`, or early with
    /// the slot's error if supervision gave up.
    pub async fn wait_for_ready_channel(
        &self,
        language: &str,
        poll_interval: Duration,
        timeout: Duration,
    ) -> Result<Arc<WorkerChannel>, HostError> {
        let wait = async {
            loop {
                if self.state().is_disposed() {
                    return Err(HostError::DispatcherDisposed);
                }
                if let Some(channel) = self.manager.ready_channels(language).into_iter().next() {
                    return Ok(channel);
                }
                if let Some(error) = self.manager.fatal_error(language) {
                    return Err(error);
                }
                tokio::time::sleep(poll_interval).await;
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| HostError::WaitTimeout(timeout))?
    }

    /// Newest channel for `language`, in any state.
    pub fn current_channel(&self, language: &str) -> Option<Arc<WorkerChannel>> {
        self.manager
            .channels(language)
            .into_iter()
            .max_by_key(|channel| channel.created_at())
    }

    pub async fn shutdown(&self) {
        let mut already_disposed = false;
        self.state.send_if_modified(|state| {
            if state.is_disposed() {
                already_disposed = true;
                return false;
            }
            *state = DispatcherState::Disposing;
            true
        });
        if already_disposed {
            return;
        }

        info!("Shutting down function dispatcher");
        if let Some(monitor) = self
            .monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            monitor.abort();
        }
        self.manager.shutdown().await;
        self.state.send_replace(DispatcherState::Disposed);
    }

    fn next_ready_channel(&self, language: &str) -> Option<Arc<WorkerChannel>> {
        let ready = self.manager.ready_channels(language);
        if ready.is_empty() {
            return None;
        }
        let index = self.next_channel.fetch_add(1, Ordering::Relaxed) % ready.len();
        ready.into_iter().nth(index)
    }
}

#[async_trait]
impl InvocationDispatcher for FunctionInvocationDispatcher {
    fn state(&self) -> DispatcherState {
        *self.state.borrow()
    }

    async fn get_worker_statuses(&self) -> HashMap<String, WorkerStatus> {
        self.manager
            .all_ready_channels()
            .into_iter()
            .map(|channel| {
                (
                    channel.id().to_string(),
                    WorkerStatus {
                        latency: channel.latency(),
                    },
                )
            })
            .collect()
    }
}

impl Drop for FunctionInvocationDispatcher {
    fn drop(&mut self) {
        if let Some(monitor) = self
            .monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            monitor.abort();
        }
    }
}

/// Moves `state` between Initializing, Initialized and
/// WorkerProcessRestarting as channels come and go.
///
/// The dispatcher is restarting while any language that lost its last Ready
/// channel has not recovered one.
async fn monitor_channels(
    mut events: broadcast::Receiver<ChannelEvent>,
    state: Arc<watch::Sender<DispatcherState>>,
    manager: Arc<WorkerChannelManager>,
) {
    let mut restarting: HashSet<String> = HashSet::new();
    loop {
        match events.recv().await {
            Ok(ChannelEvent::Ready { language, channel_id }) => {
                debug!("Dispatcher observed ready {language} channel {channel_id}");
                restarting.remove(&language);
                if restarting.is_empty() {
                    mark_initialized(&state);
                }
            }
            Ok(ChannelEvent::Lost { language, channel_id }) => {
                debug!("Dispatcher observed lost {language} channel {channel_id}");
                if manager.ready_channels(&language).is_empty() {
                    restarting.insert(language);
                    mark_restarting(&state);
                }
            }
            Ok(ChannelEvent::Exhausted { language, attempts }) => {
                error!("{language} workers exhausted after {attempts} attempts");
                let initializing = *state.borrow() == DispatcherState::Initializing;
                if !initializing && manager.ready_channels(&language).is_empty() {
                    restarting.insert(language);
                    mark_restarting(&state);
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!("Dispatcher missed {skipped} channel events, resynchronizing");
                if *state.borrow() == DispatcherState::Initializing {
                    // languages that never had a Ready channel are starting, not restarting
                    restarting.clear();
                    if !manager.all_ready_channels().is_empty() {
                        mark_initialized(&state);
                    }
                    continue;
                }
                restarting = manager
                    .languages()
                    .into_iter()
                    .filter(|language| manager.ready_channels(language).is_empty())
                    .collect();
                if restarting.is_empty() {
                    mark_initialized(&state);
                } else {
                    mark_restarting(&state);
                }
            }
            Err(RecvError::Closed) => return,
        }
    }
}

fn mark_initialized(state: &watch::Sender<DispatcherState>) {
    state.send_if_modified(|current| match *current {
        DispatcherState::Initializing | DispatcherState::WorkerProcessRestarting => {
            *current = DispatcherState::Initialized;
            true
        }
        _ => false,
    });
}

fn mark_restarting(state: &watch::Sender<DispatcherState>) {
    state.send_if_modified(|current| match *current {
        DispatcherState::Initialized => {
            *current = DispatcherState::WorkerProcessRestarting;
            true
        }
        _ => false,
    });
}
