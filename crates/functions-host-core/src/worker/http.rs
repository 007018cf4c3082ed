// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! HTTP forwarding workers ("custom handlers").
//!
//! The worker is an executable that listens on a local port. The host starts
//! it with the port in `FUNCTIONS_CUSTOMHANDLER_PORT`, considers it ready once
//! the port accepts TCP connections, and forwards every invocation as a POST
//! to `http://127.0.0.1:<port>/<function>`.

use std::path::PathBuf;
use std::process::Stdio;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::transport::{WorkerConnection, WorkerTransport, WorkerTransportFactory, EVENT_BUFFER};
use super::{ChannelId, InvocationRequest, InvocationResponse, InvocationResult, WorkerEvent};
use crate::error::HostError;

pub const CUSTOM_HANDLER_PORT_ENV: &str = "FUNCTIONS_CUSTOMHANDLER_PORT";
pub const DEFAULT_INITIALIZATION_TIMEOUT: Duration = Duration::from_secs(30);

const HANDSHAKE_POLL_INTERVAL: Duration = Duration::from_millis(50);
// time a failed request waits for the process to be reported gone
const TRANSPORT_ERROR_GRACE: Duration = Duration::from_secs(5);
const WORKER_HOST: &str = "127.0.0.1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CustomHandlerType {
    #[default]
    Http,
}

impl FromStr for CustomHandlerType {
    type Err = HostError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "http" => Ok(CustomHandlerType::Http),
            other => Err(HostError::InvalidConfig(format!(
                "Unknown custom handler type '{other}'. Must be one of: http"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WorkerProcessArguments {
    pub executable_path: String,
    pub arguments: Vec<String>,
    pub working_directory: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpWorkerOptions {
    pub handler_type: CustomHandlerType,
    pub arguments: WorkerProcessArguments,
    /// 0 picks a free local port per worker.
    pub port: u16,
    /// Send the invocation payload as the raw request body instead of the
    /// `{"Data", "Metadata"}` envelope.
    pub enable_forwarding_http_request: bool,
    pub initialization_timeout: Duration,
}

impl Default for HttpWorkerOptions {
    fn default() -> Self {
        Self {
            handler_type: CustomHandlerType::Http,
            arguments: WorkerProcessArguments::default(),
            port: 0,
            enable_forwarding_http_request: false,
            initialization_timeout: DEFAULT_INITIALIZATION_TIMEOUT,
        }
    }
}

pub struct HttpWorkerTransportFactory {
    options: HttpWorkerOptions,
    client: reqwest::Client,
}

impl HttpWorkerTransportFactory {
    pub fn new(options: HttpWorkerOptions) -> Self {
        Self {
            options,
            client: reqwest::Client::new(),
        }
    }

    async fn resolve_port(&self) -> Result<u16, HostError> {
        if self.options.port != 0 {
            return Ok(self.options.port);
        }
        let listener = TcpListener::bind((WORKER_HOST, 0))
            .await
            .map_err(|e| HostError::WorkerStart(format!("Failed to reserve a worker port: {e}")))?;
        let port = listener
            .local_addr()
            .map_err(|e| HostError::WorkerStart(format!("Failed to reserve a worker port: {e}")))?
            .port();
        Ok(port)
    }

    fn base_url(&self, port: u16) -> String {
        match self.options.handler_type {
            CustomHandlerType::Http => format!("http://{WORKER_HOST}:{port}"),
        }
    }

    fn spawn_process(&self, port: u16) -> Result<Child, HostError> {
        let arguments = &self.options.arguments;
        let mut command = Command::new(&arguments.executable_path);
        command
            .args(&arguments.arguments)
            .env(CUSTOM_HANDLER_PORT_ENV, port.to_string())
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = &arguments.working_directory {
            command.current_dir(dir);
        }
        command.spawn().map_err(|e| {
            HostError::WorkerStart(format!(
                "Failed to start worker process {}: {e}",
                arguments.executable_path
            ))
        })
    }
}

#[async_trait]
impl WorkerTransportFactory for HttpWorkerTransportFactory {
    async fn connect(
        &self,
        language: &str,
        channel_id: ChannelId,
    ) -> Result<WorkerConnection, HostError> {
        if self.options.arguments.executable_path.trim().is_empty() {
            return Err(HostError::InvalidConfig(
                "Custom handler executable is not configured".to_string(),
            ));
        }

        let port = self.resolve_port().await?;
        let child = self.spawn_process(port)?;
        info!(
            "Started {language} worker process {:?} for channel {channel_id} on port {port}",
            child.id()
        );

        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let ready = Arc::new(AtomicBool::new(false));
        let stop = CancellationToken::new();
        let exited = CancellationToken::new();

        tokio::spawn(await_handshake(
            port,
            self.options.initialization_timeout,
            events_tx.clone(),
            Arc::clone(&ready),
            stop.clone(),
        ));
        tokio::spawn(watch_process(
            child,
            events_tx.clone(),
            Arc::clone(&ready),
            stop.clone(),
            exited.clone(),
        ));

        Ok(WorkerConnection {
            transport: Arc::new(HttpWorkerTransport {
                base_url: self.base_url(port),
                client: self.client.clone(),
                forward_raw: self.options.enable_forwarding_http_request,
                events: events_tx,
                ready,
                stop,
                exited,
            }),
            events: events_rx,
        })
    }
}

/// Polls the worker port until it accepts a connection. A worker that is not
/// listening within `timeout` is stopped.
async fn await_handshake(
    port: u16,
    timeout: Duration,
    events: mpsc::Sender<WorkerEvent>,
    ready: Arc<AtomicBool>,
    stop: CancellationToken,
) {
    let probe = async {
        loop {
            if TcpStream::connect((WORKER_HOST, port)).await.is_ok() {
                return;
            }
            tokio::time::sleep(HANDSHAKE_POLL_INTERVAL).await;
        }
    };

    tokio::select! {
        _ = stop.cancelled() => {}
        listening = tokio::time::timeout(timeout, probe) => match listening {
            Ok(()) => {
                debug!("Worker is listening on port {port}");
                ready.store(true, Ordering::SeqCst);
                let _ = events.send(WorkerEvent::WorkerReady).await;
            }
            Err(_) => {
                warn!("Worker did not listen on port {port} within {timeout:?}, stopping it");
                stop.cancel();
            }
        }
    }
}

/// Reaps the worker process, killing it once `stop` fires. `exited` fires as
/// soon as the process is gone.
async fn watch_process(
    mut child: Child,
    events: mpsc::Sender<WorkerEvent>,
    ready: Arc<AtomicBool>,
    stop: CancellationToken,
    exited: CancellationToken,
) {
    let exit_code = tokio::select! {
        status = child.wait() => match status {
            Ok(status) => status.code(),
            Err(e) => {
                error!("Failed to wait on worker process: {e}");
                None
            }
        },
        _ = stop.cancelled() => {
            if let Err(e) = child.kill().await {
                debug!("Worker process already gone: {e}");
            }
            None
        }
    };
    ready.store(false, Ordering::SeqCst);
    stop.cancel();
    exited.cancel();
    debug!("Worker process exited with code {exit_code:?}");
    let _ = events.send(WorkerEvent::ProcessExited { exit_code }).await;
}

struct HttpWorkerTransport {
    base_url: String,
    client: reqwest::Client,
    forward_raw: bool,
    events: mpsc::Sender<WorkerEvent>,
    ready: Arc<AtomicBool>,
    stop: CancellationToken,
    exited: CancellationToken,
}

impl HttpWorkerTransport {
    fn request_body(&self, request: &InvocationRequest) -> serde_json::Value {
        if self.forward_raw {
            return request.payload.clone();
        }
        json!({
            "Data": request.payload,
            "Metadata": {
                "InvocationId": request.invocation_id,
                "FunctionName": request.function_name,
            }
        })
    }
}

/// Sends one invocation and reports its response and latency.
///
/// A request that fails below HTTP (refused, reset) usually means the worker
/// died. Nothing is reported then, so the caller is released by the channel
/// teardown as unavailable. Only if the process outlives the grace period is
/// the failure reported as the invocation result.
async fn forward(
    builder: reqwest::RequestBuilder,
    invocation_id: String,
    events: mpsc::Sender<WorkerEvent>,
    stop: CancellationToken,
) {
    let start = Instant::now();
    let result = match builder.send().await {
        Ok(response) => {
            let status = response.status();
            match response.text().await {
                Ok(body) if status.is_success() => Ok(InvocationResult::Success(
                    serde_json::from_str(&body).unwrap_or(serde_json::Value::String(body)),
                )),
                Ok(body) => Ok(InvocationResult::Failure(format!(
                    "Worker returned {status}: {body}"
                ))),
                Err(e) => Err(e),
            }
        }
        Err(e) => Err(e),
    };
    let elapsed = start.elapsed();

    let result = match result {
        Ok(result) => result,
        Err(e) => {
            debug!("Invocation {invocation_id} failed in transport: {e}");
            tokio::select! {
                _ = stop.cancelled() => return,
                _ = tokio::time::sleep(TRANSPORT_ERROR_GRACE) => {}
            }
            error!("Failed to forward invocation {invocation_id}: {e}");
            InvocationResult::Failure(e.to_string())
        }
    };

    let _ = events
        .send(WorkerEvent::InvocationResponse(InvocationResponse {
            invocation_id,
            result,
        }))
        .await;
    let _ = events.send(WorkerEvent::LatencySample(elapsed)).await;
}

#[async_trait]
impl WorkerTransport for HttpWorkerTransport {
    async fn send_invocation(&self, request: InvocationRequest) -> Result<(), HostError> {
        if self.stop.is_cancelled() {
            return Err(HostError::Transport("worker process has stopped".to_string()));
        }
        let url = format!("{}/{}", self.base_url, request.function_name);
        let builder = self.client.post(url).json(&self.request_body(&request));
        tokio::spawn(forward(
            builder,
            request.invocation_id,
            self.events.clone(),
            self.stop.clone(),
        ));
        Ok(())
    }

    fn is_ready_for_invocations(&self) -> bool {
        self.ready.load(Ordering::SeqCst) && !self.stop.is_cancelled()
    }

    /// Kills the worker process and returns once it is gone, so a
    /// replacement on the same port never reaches the old process.
    async fn shutdown(&self) {
        self.ready.store(false, Ordering::SeqCst);
        self.stop.cancel();
        self.exited.cancelled().await;
    }
}
