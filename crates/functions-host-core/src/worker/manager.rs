// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Worker channel supervision.
//!
//! Each language gets a fixed number of slots. A slot is driven by one
//! supervisor task that connects a worker, waits for its handshake, pumps its
//! events, and after a fault tears the channel down and reconnects according
//! to the slot's [`RetryContext`]. Slot state is only written by its
//! supervisor; everything else reads snapshots of it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::channel::{ChannelState, WorkerChannel};
use super::http::DEFAULT_INITIALIZATION_TIMEOUT;
use super::transport::{WorkerConnection, WorkerTransportFactory};
use super::{ChannelId, WorkerEvent};
use crate::error::HostError;
use crate::retry::{RetryContext, RetryOptions};

pub const DEFAULT_PROCESS_COUNT: usize = 1;

const EVENT_CAPACITY: usize = 64;

/// Channel lifecycle notifications, published in the order they happen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Ready {
        language: String,
        channel_id: ChannelId,
    },
    Lost {
        language: String,
        channel_id: ChannelId,
    },
    /// A slot gave up after too many consecutive failures.
    Exhausted { language: String, attempts: u32 },
}

#[derive(Debug, Clone)]
pub struct WorkerChannelManagerOptions {
    pub retry: RetryOptions,
    /// Bound on connect-to-handshake for one attempt.
    pub initialization_timeout: Duration,
    /// Supervised slots per language.
    pub process_count: usize,
}

impl Default for WorkerChannelManagerOptions {
    fn default() -> Self {
        Self {
            retry: RetryOptions::default(),
            initialization_timeout: DEFAULT_INITIALIZATION_TIMEOUT,
            process_count: DEFAULT_PROCESS_COUNT,
        }
    }
}

#[derive(Default)]
struct WorkerSlot {
    current: RwLock<Option<Arc<WorkerChannel>>>,
    fatal: RwLock<Option<HostError>>,
}

impl WorkerSlot {
    fn current(&self) -> Option<Arc<WorkerChannel>> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_current(&self, channel: Arc<WorkerChannel>) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Some(channel);
    }

    fn clear_current(&self, id: ChannelId) {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        if current.as_ref().is_some_and(|channel| channel.id() == id) {
            *current = None;
        }
    }

    fn fatal(&self) -> Option<HostError> {
        self.fatal
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_fatal(&self, error: HostError) {
        *self.fatal.write().unwrap_or_else(PoisonError::into_inner) = Some(error);
    }
}

type LanguagePool = Arc<Vec<Arc<WorkerSlot>>>;

pub struct WorkerChannelManager {
    factory: Arc<dyn WorkerTransportFactory>,
    options: WorkerChannelManagerOptions,
    pools: RwLock<HashMap<String, LanguagePool>>,
    supervisors: Mutex<Vec<JoinHandle<()>>>,
    events: broadcast::Sender<ChannelEvent>,
    cancel: CancellationToken,
}

impl WorkerChannelManager {
    pub fn new(
        factory: Arc<dyn WorkerTransportFactory>,
        options: WorkerChannelManagerOptions,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            factory,
            options,
            pools: RwLock::new(HashMap::new()),
            supervisors: Mutex::new(Vec::new()),
            events,
            cancel: CancellationToken::new(),
        }
    }

    pub fn options(&self) -> &WorkerChannelManagerOptions {
        &self.options
    }

    /// Starts supervising `language`. Starting an already supervised
    /// language does nothing.
    pub fn start(&self, language: &str) {
        if self.cancel.is_cancelled() {
            debug!("Manager is shut down, not starting {language} workers");
            return;
        }

        let mut pools = self.pools.write().unwrap_or_else(PoisonError::into_inner);
        if pools.contains_key(language) {
            return;
        }

        let slot_count = self.options.process_count.max(1);
        let slots: Vec<Arc<WorkerSlot>> = (0..slot_count)
            .map(|_| Arc::new(WorkerSlot::default()))
            .collect();
        info!("Starting {slot_count} {language} worker slot(s)");

        let mut supervisors = self
            .supervisors
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for slot in &slots {
            let supervisor = Supervisor {
                language: language.to_string(),
                slot: Arc::clone(slot),
                factory: Arc::clone(&self.factory),
                options: self.options.clone(),
                events: self.events.clone(),
                cancel: self.cancel.child_token(),
            };
            supervisors.push(tokio::spawn(supervisor.run()));
        }
        pools.insert(language.to_string(), Arc::new(slots));
    }

    /// Returns a Ready channel for `language`, starting supervision if
    /// needed.
    ///
    /// While a worker is still starting this fails with
    /// [`HostError::NoWorkerAvailable`]. Once every slot has failed fatally,
    /// the slot's error is returned instead.
    pub fn ensure_channel(&self, language: &str) -> Result<Arc<WorkerChannel>, HostError> {
        if let Some(channel) = self.ready_channels(language).into_iter().next() {
            return Ok(channel);
        }
        self.start(language);
        if let Some(error) = self.fatal_error(language) {
            return Err(error);
        }
        Err(HostError::NoWorkerAvailable {
            language: language.to_string(),
        })
    }

    /// Routable channels for `language`, in slot order.
    pub fn ready_channels(&self, language: &str) -> Vec<Arc<WorkerChannel>> {
        self.channels(language)
            .into_iter()
            .filter(|channel| channel.is_ready())
            .collect()
    }

    /// Current channel of every slot for `language`, in any state.
    pub fn channels(&self, language: &str) -> Vec<Arc<WorkerChannel>> {
        self.pool(language)
            .map(|slots| slots.iter().filter_map(|slot| slot.current()).collect())
            .unwrap_or_default()
    }

    /// Routable channels across every supervised language.
    pub fn all_ready_channels(&self) -> Vec<Arc<WorkerChannel>> {
        self.languages()
            .iter()
            .flat_map(|language| self.ready_channels(language))
            .collect()
    }

    pub fn languages(&self) -> Vec<String> {
        let mut languages: Vec<String> = self
            .pools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        languages.sort();
        languages
    }

    /// The fatal error for `language` once no slot is left running.
    pub fn fatal_error(&self, language: &str) -> Option<HostError> {
        let slots = self.pool(language)?;
        let errors: Vec<HostError> = slots.iter().filter_map(|slot| slot.fatal()).collect();
        if errors.len() == slots.len() {
            errors.into_iter().next()
        } else {
            None
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }

    /// Stops every supervisor and disposes their channels. In-flight
    /// invocations fail with [`HostError::ChannelUnavailable`].
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let supervisors = std::mem::take(
            &mut *self
                .supervisors
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for supervisor in supervisors {
            if let Err(e) = supervisor.await {
                error!("Worker supervisor task failed: {e}");
            }
        }
        info!("Worker channel manager shut down");
    }

    fn pool(&self, language: &str) -> Option<LanguagePool> {
        self.pools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(language)
            .cloned()
    }
}

impl Drop for WorkerChannelManager {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

enum Outcome {
    Cancelled,
    Failed(HostError),
}

struct Supervisor {
    language: String,
    slot: Arc<WorkerSlot>,
    factory: Arc<dyn WorkerTransportFactory>,
    options: WorkerChannelManagerOptions,
    events: broadcast::Sender<ChannelEvent>,
    cancel: CancellationToken,
}

impl Supervisor {
    async fn run(self) {
        let mut retry = RetryContext::new(self.options.retry);
        loop {
            let error = match self.run_channel(&mut retry).await {
                Outcome::Cancelled => return,
                Outcome::Failed(error) => error,
            };

            if !error.is_retryable() {
                error!("{} worker slot failed permanently: {error}", self.language);
                self.slot.set_fatal(error);
                return;
            }

            let Some(delay) = retry.record_failure() else {
                let attempts = retry.attempts();
                error!(
                    "{} worker failed {attempts} consecutive times, giving up: {error}",
                    self.language
                );
                self.slot.set_fatal(HostError::RetriesExhausted {
                    language: self.language.clone(),
                    attempts,
                });
                let _ = self.events.send(ChannelEvent::Exhausted {
                    language: self.language.clone(),
                    attempts,
                });
                return;
            };

            warn!(
                "{} worker failed ({error}), restarting in {delay:?} (attempt {})",
                self.language,
                retry.attempts()
            );
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn run_channel(&self, retry: &mut RetryContext) -> Outcome {
        let channel_id = ChannelId::new();
        let connection = tokio::select! {
            _ = self.cancel.cancelled() => return Outcome::Cancelled,
            connection = self.factory.connect(&self.language, channel_id) => connection,
        };
        let WorkerConnection {
            transport,
            mut events,
        } = match connection {
            Ok(connection) => connection,
            Err(e) => return Outcome::Failed(e),
        };

        let channel = Arc::new(WorkerChannel::new(channel_id, &self.language, transport));
        self.slot.set_current(Arc::clone(&channel));
        debug!("{} worker channel {channel_id} is initializing", self.language);

        let init_timeout = self.options.initialization_timeout;
        let handshake = tokio::select! {
            _ = self.cancel.cancelled() => {
                self.dispose(&channel).await;
                return Outcome::Cancelled;
            }
            handshake = tokio::time::timeout(init_timeout, wait_for_handshake(&channel, &mut events)) => handshake,
        };
        match handshake {
            Ok(Ok(())) => {}
            Ok(Err(exit_code)) => {
                self.teardown(&channel, false).await;
                return Outcome::Failed(HostError::WorkerStart(format!(
                    "worker exited with code {exit_code:?} before becoming ready"
                )));
            }
            Err(_) => {
                self.teardown(&channel, false).await;
                return Outcome::Failed(HostError::InitializationTimeout(init_timeout));
            }
        }

        channel.transition(ChannelState::Ready);
        retry.reset();
        info!("{} worker channel {channel_id} is ready", self.language);
        let _ = self.events.send(ChannelEvent::Ready {
            language: self.language.clone(),
            channel_id,
        });

        let exit_code = loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.dispose(&channel).await;
                    return Outcome::Cancelled;
                }
                event = events.recv() => event,
            };
            match event {
                Some(WorkerEvent::InvocationResponse(response)) => channel.complete(response),
                Some(WorkerEvent::LatencySample(latency)) => channel.record_latency(latency),
                Some(WorkerEvent::WorkerReady) => {
                    debug!("Duplicate ready signal on channel {channel_id}")
                }
                Some(WorkerEvent::ProcessExited { exit_code }) => break exit_code,
                None => break None,
            }
        };

        warn!(
            "{} worker channel {channel_id} exited with code {exit_code:?}",
            self.language
        );
        self.teardown(&channel, true).await;
        Outcome::Failed(HostError::Transport(format!(
            "worker channel {channel_id} exited with code {exit_code:?}"
        )))
    }

    /// Fault path: Errored, removed from the slot, then Disposed.
    async fn teardown(&self, channel: &Arc<WorkerChannel>, was_ready: bool) {
        channel.transition(ChannelState::Errored);
        channel.fail_pending();
        self.slot.clear_current(channel.id());
        channel.transport().shutdown().await;
        channel.transition(ChannelState::Disposed);
        if was_ready {
            let _ = self.events.send(ChannelEvent::Lost {
                language: self.language.clone(),
                channel_id: channel.id(),
            });
        }
    }

    /// Shutdown path: Disposing, removed from the slot, then Disposed.
    async fn dispose(&self, channel: &Arc<WorkerChannel>) {
        channel.transition(ChannelState::Disposing);
        channel.fail_pending();
        self.slot.clear_current(channel.id());
        channel.transport().shutdown().await;
        channel.transition(ChannelState::Disposed);
        debug!("{} worker channel {} disposed", self.language, channel.id());
    }
}

/// Waits for the worker handshake. Returns the exit code if the worker goes
/// away first.
async fn wait_for_handshake(
    channel: &WorkerChannel,
    events: &mut mpsc::Receiver<WorkerEvent>,
) -> Result<(), Option<i32>> {
    loop {
        match events.recv().await {
            Some(WorkerEvent::WorkerReady) => return Ok(()),
            Some(WorkerEvent::LatencySample(latency)) => channel.record_latency(latency),
            Some(WorkerEvent::InvocationResponse(response)) => channel.complete(response),
            Some(WorkerEvent::ProcessExited { exit_code }) => return Err(exit_code),
            None => return Err(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryStrategy;
    use crate::worker::test_support::{TestFactory, TestWorker};
    use crate::worker::{InvocationRequest, InvocationResponse, InvocationResult};

    fn manager_with(
        failure: Option<HostError>,
        auto_ready: bool,
        options: WorkerChannelManagerOptions,
    ) -> (
        WorkerChannelManager,
        Arc<TestFactory>,
        mpsc::UnboundedReceiver<TestWorker>,
    ) {
        let (factory, workers) = match failure {
            Some(error) => TestFactory::failing(error),
            None => TestFactory::new(auto_ready),
        };
        let manager = WorkerChannelManager::new(factory.clone(), options);
        (manager, factory, workers)
    }

    fn fast_options(max_attempts: u32) -> WorkerChannelManagerOptions {
        WorkerChannelManagerOptions {
            retry: RetryOptions {
                strategy: RetryStrategy::FixedDelay {
                    delay: Duration::from_millis(10),
                },
                max_attempts,
            },
            initialization_timeout: Duration::from_secs(5),
            process_count: 1,
        }
    }

    async fn next_event(events: &mut broadcast::Receiver<ChannelEvent>) -> ChannelEvent {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_ensure_channel_starts_supervision() {
        let (manager, _, _workers) = manager_with(None, true, fast_options(0));
        let mut events = manager.subscribe();

        assert_eq!(
            manager.ensure_channel("node").unwrap_err(),
            HostError::NoWorkerAvailable {
                language: "node".to_string()
            }
        );

        let ChannelEvent::Ready { channel_id, .. } = next_event(&mut events).await else {
            panic!("expected a ready channel");
        };
        let channel = manager.ensure_channel("node").unwrap();
        assert_eq!(channel.id(), channel_id);
        assert_eq!(channel.state(), ChannelState::Ready);
        assert_eq!(manager.languages(), vec!["node".to_string()]);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_channel_not_ready_before_handshake() {
        let (manager, _, mut workers) = manager_with(None, false, fast_options(0));
        let mut events = manager.subscribe();
        manager.start("python");

        let worker = workers.recv().await.unwrap();
        assert!(manager.ready_channels("python").is_empty());
        assert_eq!(manager.channels("python").len(), 1);
        assert_eq!(
            manager.channels("python")[0].state(),
            ChannelState::Initializing
        );

        worker.events.send(WorkerEvent::WorkerReady).await.unwrap();
        assert_eq!(
            next_event(&mut events).await,
            ChannelEvent::Ready {
                language: "python".to_string(),
                channel_id: worker.channel_id
            }
        );
        assert_eq!(manager.ready_channels("python").len(), 1);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_lost_channel_is_replaced() {
        let (manager, _, mut workers) = manager_with(None, true, fast_options(0));
        let mut events = manager.subscribe();
        manager.start("node");

        let first = workers.recv().await.unwrap();
        next_event(&mut events).await;
        let old_channel = manager.ensure_channel("node").unwrap();
        drop(first);

        assert_eq!(
            next_event(&mut events).await,
            ChannelEvent::Lost {
                language: "node".to_string(),
                channel_id: old_channel.id()
            }
        );
        let second = workers.recv().await.unwrap();
        assert_eq!(
            next_event(&mut events).await,
            ChannelEvent::Ready {
                language: "node".to_string(),
                channel_id: second.channel_id
            }
        );
        assert_ne!(second.channel_id, old_channel.id());
        assert_eq!(old_channel.state(), ChannelState::Disposed);
        assert_eq!(manager.ensure_channel("node").unwrap().id(), second.channel_id);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_events_pumped_into_channel() {
        let (manager, _, mut workers) = manager_with(None, true, fast_options(0));
        let mut events = manager.subscribe();
        manager.start("node");
        let mut worker = workers.recv().await.unwrap();
        next_event(&mut events).await;

        let channel = manager.ensure_channel("node").unwrap();
        let invoking = {
            let channel = channel.clone();
            tokio::spawn(async move {
                channel
                    .invoke(InvocationRequest::new("HttpTrigger", serde_json::json!(1)))
                    .await
            })
        };
        let request = worker.requests.recv().await.unwrap();
        worker
            .events
            .send(WorkerEvent::LatencySample(Duration::from_millis(7)))
            .await
            .unwrap();
        worker
            .events
            .send(WorkerEvent::InvocationResponse(InvocationResponse {
                invocation_id: request.invocation_id,
                result: InvocationResult::Success(serde_json::json!("done")),
            }))
            .await
            .unwrap();

        let response = invoking.await.unwrap().unwrap();
        assert_eq!(response.result, InvocationResult::Success(serde_json::json!("done")));
        assert_eq!(channel.latency(), Some(Duration::from_millis(7)));
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_retries_exhausted_is_fatal() {
        let (manager, factory, _workers) = manager_with(
            Some(HostError::WorkerStart("boom".to_string())),
            true,
            fast_options(2),
        );
        let mut events = manager.subscribe();
        manager.start("java");

        assert_eq!(
            next_event(&mut events).await,
            ChannelEvent::Exhausted {
                language: "java".to_string(),
                attempts: 3
            }
        );
        assert_eq!(factory.connects(), 3);
        assert_eq!(
            manager.ensure_channel("java").unwrap_err(),
            HostError::RetriesExhausted {
                language: "java".to_string(),
                attempts: 3
            }
        );
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_config_is_not_retried() {
        let (manager, factory, _workers) = manager_with(
            Some(HostError::InvalidConfig("no executable".to_string())),
            true,
            fast_options(0),
        );
        manager.start("custom");

        tokio::time::timeout(Duration::from_secs(5), async {
            while manager.fatal_error("custom").is_none() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(factory.connects(), 1);
        assert!(matches!(
            manager.ensure_channel("custom"),
            Err(HostError::InvalidConfig(_))
        ));
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_handshake_timeout_counts_as_failure() {
        let mut options = fast_options(0);
        options.initialization_timeout = Duration::from_millis(30);
        let (manager, _, mut workers) = manager_with(None, false, options);
        manager.start("node");

        let first = workers.recv().await.unwrap();
        let second = tokio::time::timeout(Duration::from_secs(5), workers.recv())
            .await
            .unwrap()
            .unwrap();
        assert_ne!(first.channel_id, second.channel_id);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_process_count_slots() {
        let mut options = fast_options(0);
        options.process_count = 2;
        let (manager, _, _workers) = manager_with(None, true, options);
        let mut events = manager.subscribe();
        manager.start("node");
        manager.start("node");

        next_event(&mut events).await;
        next_event(&mut events).await;
        let ready = manager.ready_channels("node");
        assert_eq!(ready.len(), 2);
        assert_ne!(ready[0].id(), ready[1].id());
        assert_eq!(manager.all_ready_channels().len(), 2);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_disposes_channels() {
        let (manager, _, _workers) = manager_with(None, true, fast_options(0));
        let mut events = manager.subscribe();
        manager.start("node");
        next_event(&mut events).await;
        let channel = manager.ensure_channel("node").unwrap();

        let invoking = {
            let channel = channel.clone();
            tokio::spawn(async move {
                channel
                    .invoke(InvocationRequest::new("f", serde_json::Value::Null))
                    .await
            })
        };
        while channel.pending_invocations() == 0 {
            tokio::task::yield_now().await;
        }

        manager.shutdown().await;
        assert_eq!(channel.state(), ChannelState::Disposed);
        assert!(manager.channels("node").is_empty());
        assert!(matches!(
            invoking.await.unwrap(),
            Err(HostError::ChannelUnavailable { .. })
        ));

        // no restarts after shutdown
        manager.start("python");
        assert!(manager.channels("python").is_empty());
    }
}
