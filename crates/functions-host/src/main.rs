// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::{env, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use functions_host_core::{
    environment::{HostEnvironment, SystemEnvironment},
    throttle::{CgroupPaths, CpuThrottleSource, MemoryThrottleSource},
    worker::HttpWorkerTransportFactory,
    ConcurrencyThrottleAggregator, FunctionInvocationDispatcher, HostConfig, HostHealthManager,
    InvocationDispatcher, PerformanceSampler, ThrottleSource, WorkerChannelManager,
};

const DEFAULT_CUSTOM_HANDLER_RUNTIME: &str = "custom";

#[tokio::main]
pub async fn main() {
    let log_level = env::var("FUNCTIONS_HOST_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());

    let env_filter = format!("h2=off,hyper=off,reqwest=off,{}", log_level);

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    let config = match HostConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!("Error loading functions host configuration: {e}");
            return;
        }
    };

    let threshold = config.health.counter_threshold;
    let throttle_sources: Vec<Arc<dyn ThrottleSource>> = vec![
        Arc::new(CpuThrottleSource::new(CgroupPaths::default(), threshold)),
        Arc::new(MemoryThrottleSource::new(CgroupPaths::default(), threshold)),
    ];
    let throttle = Arc::new(ConcurrencyThrottleAggregator::new(throttle_sources));

    let environment: Arc<dyn HostEnvironment> = Arc::new(SystemEnvironment);
    if environment.is_dynamic_sku() {
        debug!("Running on a dynamic plan, instance {:?}", environment.instance_id());
    }
    let sampler = PerformanceSampler::new(environment);

    let dispatcher = start_dispatcher(&config);

    let mut health = HostHealthManager::new(sampler, throttle, config.health.clone());
    if let Some(dispatcher) = dispatcher.as_ref() {
        health = health.with_dispatcher(Arc::clone(dispatcher) as Arc<dyn InvocationDispatcher>);
    }
    let health = Arc::new(health);

    let cancel_token = CancellationToken::new();
    let monitor = tokio::spawn(Arc::clone(&health).run(cancel_token.clone()));

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Unable to listen for shutdown signal: {e}");
    }

    info!("Shutting down functions host");
    cancel_token.cancel();
    if let Some(dispatcher) = dispatcher {
        dispatcher.shutdown().await;
    }
    if let Err(e) = monitor.await {
        error!("Host health monitor failed: {e}");
    }
}

fn start_dispatcher(config: &HostConfig) -> Option<Arc<FunctionInvocationDispatcher>> {
    let Some(http_worker) = config.http_worker.clone() else {
        info!("No custom handler configured, running without out-of-process workers");
        return None;
    };
    let runtime = config
        .worker_runtime
        .clone()
        .unwrap_or_else(|| DEFAULT_CUSTOM_HANDLER_RUNTIME.to_string());

    let factory = Arc::new(HttpWorkerTransportFactory::new(http_worker));
    let manager = Arc::new(WorkerChannelManager::new(
        factory,
        config.worker_manager_options(),
    ));
    let dispatcher = Arc::new(FunctionInvocationDispatcher::new(manager));

    match dispatcher.initialize(&[runtime.as_str()]) {
        Ok(()) => {
            info!("Started {runtime} worker dispatcher");
            Some(dispatcher)
        }
        Err(e) => {
            error!("Error starting {runtime} worker dispatcher: {e}");
            None
        }
    }
}
