// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Host health policy.
//!
//! [`HostHealthManager`] combines the performance counters, the throttle
//! aggregate and, when out-of-process workers are active, their reported
//! latency into one admission decision. Results are kept in a sliding window
//! so a single bad sample does not mark the host unhealthy.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant, SystemTime};

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::counters::{PerformanceCounterSnapshot, PerformanceSampler};
use crate::dispatcher::{DispatcherState, InvocationDispatcher};
use crate::threshold::{self, DEFAULT_COUNTER_THRESHOLD};
use crate::throttle::ConcurrencyThrottleAggregator;

pub const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_HEALTH_CHECK_WINDOW: Duration = Duration::from_secs(120);
pub const DEFAULT_HEALTH_CHECK_THRESHOLD: u32 = 6;

/// Name reported when worker latency is over its threshold.
pub const WORKER_LATENCY_THROTTLE: &str = "WorkerLatency";

const SECONDS_PER_DAY: u64 = 86_400;

#[derive(Debug, Clone, PartialEq)]
pub struct HostHealthMonitorOptions {
    pub enabled: bool,
    pub health_check_interval: Duration,
    pub health_check_window: Duration,
    /// Unhealthy results within the window that make the host unhealthy.
    pub health_check_threshold: u32,
    pub counter_threshold: f64,
    /// Average worker latency above which workers count as overloaded.
    /// `None` leaves worker latency out of the decision.
    pub worker_latency_threshold: Option<Duration>,
}

impl Default for HostHealthMonitorOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            health_check_interval: DEFAULT_HEALTH_CHECK_INTERVAL,
            health_check_window: DEFAULT_HEALTH_CHECK_WINDOW,
            health_check_threshold: DEFAULT_HEALTH_CHECK_THRESHOLD,
            counter_threshold: DEFAULT_COUNTER_THRESHOLD,
            worker_latency_threshold: None,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct FormattedOptions {
    enabled: bool,
    health_check_interval: String,
    health_check_window: String,
    counter_threshold: f64,
}

impl HostHealthMonitorOptions {
    /// JSON rendering for startup logs, durations as `[d.]hh:mm:ss`.
    pub fn format(&self) -> String {
        let formatted = FormattedOptions {
            enabled: self.enabled,
            health_check_interval: format_duration(self.health_check_interval),
            health_check_window: format_duration(self.health_check_window),
            counter_threshold: self.counter_threshold,
        };
        serde_json::to_string(&formatted).unwrap_or_default()
    }
}

fn format_duration(duration: Duration) -> String {
    let total = duration.as_secs();
    let (days, rest) = (total / SECONDS_PER_DAY, total % SECONDS_PER_DAY);
    let clock = format!("{:02}:{:02}:{:02}", rest / 3600, (rest % 3600) / 60, rest % 60);
    if days > 0 {
        format!("{days}.{clock}")
    } else {
        clock
    }
}

/// Outcome of one health check.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthReport {
    pub thresholds_exceeded: bool,
    /// Counter, throttle and worker signals that triggered, in that order.
    pub exceeded: Vec<String>,
    pub checked_at: SystemTime,
}

impl HealthReport {
    fn empty() -> Self {
        Self {
            thresholds_exceeded: false,
            exceeded: Vec::new(),
            checked_at: SystemTime::UNIX_EPOCH,
        }
    }
}

pub struct HostHealthManager {
    sampler: PerformanceSampler,
    throttle: Arc<ConcurrencyThrottleAggregator>,
    dispatcher: Option<Arc<dyn InvocationDispatcher>>,
    options: HostHealthMonitorOptions,
    counters: RwLock<Option<Arc<PerformanceCounterSnapshot>>>,
    window: Mutex<VecDeque<(Instant, bool)>>,
    last_report: RwLock<Arc<HealthReport>>,
}

impl HostHealthManager {
    pub fn new(
        sampler: PerformanceSampler,
        throttle: Arc<ConcurrencyThrottleAggregator>,
        options: HostHealthMonitorOptions,
    ) -> Self {
        Self {
            sampler,
            throttle,
            dispatcher: None,
            options,
            counters: RwLock::new(None),
            window: Mutex::new(VecDeque::new()),
            last_report: RwLock::new(Arc::new(HealthReport::empty())),
        }
    }

    /// Adds the out-of-process worker signal.
    pub fn with_dispatcher(mut self, dispatcher: Arc<dyn InvocationDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn options(&self) -> &HostHealthMonitorOptions {
        &self.options
    }

    /// Samples the performance counters. A successful sample replaces the
    /// last known snapshot.
    pub fn get_performance_counters(&self) -> Option<Arc<PerformanceCounterSnapshot>> {
        let snapshot = Arc::new(self.sampler.sample()?);
        *self.counters.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&snapshot));
        Some(snapshot)
    }

    /// Last successfully sampled snapshot.
    pub fn last_performance_counters(&self) -> Option<Arc<PerformanceCounterSnapshot>> {
        self.counters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Evaluates the limited counters of `snapshot` against `threshold`,
    /// or the configured counter threshold when `None`.
    pub fn performance_counter_thresholds_exceeded(
        &self,
        snapshot: &PerformanceCounterSnapshot,
        threshold: Option<f64>,
    ) -> (bool, Vec<&'static str>) {
        let threshold = threshold.unwrap_or(self.options.counter_threshold);
        let exceeded = threshold::evaluate_counter_set(snapshot, threshold);
        for counter in snapshot
            .limited_counters()
            .iter()
            .filter(|counter| exceeded.contains(&counter.name))
        {
            warn!(
                "{} threshold exceeded ({}/{})",
                counter.name, counter.current, counter.limit
            );
        }
        (!exceeded.is_empty(), exceeded)
    }

    /// True when the throttle aggregate is Enabled or, with an initialized
    /// dispatcher, the workers report excessive latency.
    pub async fn process_thresholds_exceeded(&self) -> bool {
        let status = self.throttle.get_status();
        if status.is_enabled() {
            warn!("Host throttles enabled: {:?}", status.enabled_throttles());
        }
        let workers_exceeded = self.worker_latency_exceeded().await;
        status.is_enabled() || workers_exceeded
    }

    async fn worker_latency_exceeded(&self) -> bool {
        let (Some(dispatcher), Some(limit)) =
            (&self.dispatcher, self.options.worker_latency_threshold)
        else {
            return false;
        };
        if dispatcher.state() != DispatcherState::Initialized {
            return false;
        }

        let latencies: Vec<Duration> = dispatcher
            .get_worker_statuses()
            .await
            .into_values()
            .filter_map(|status| status.latency)
            .collect();
        if latencies.is_empty() {
            return false;
        }
        let average = average_latency(&latencies);
        let exceeded = average > limit;
        if exceeded {
            warn!(
                "Average worker latency {average:?} over {} workers exceeds {limit:?}",
                latencies.len()
            );
        }
        exceeded
    }

    /// Runs one full evaluation and records it in the health window.
    pub async fn check_health(&self) -> Arc<HealthReport> {
        let mut exceeded: Vec<String> = Vec::new();

        if let Some(snapshot) = self.get_performance_counters() {
            let (_, names) = self.performance_counter_thresholds_exceeded(&snapshot, None);
            exceeded.extend(names.into_iter().map(String::from));
        }
        exceeded.extend(self.throttle.get_status().enabled_throttles().iter().cloned());
        if self.worker_latency_exceeded().await {
            exceeded.push(WORKER_LATENCY_THROTTLE.to_string());
        }

        let report = Arc::new(HealthReport {
            thresholds_exceeded: !exceeded.is_empty(),
            exceeded,
            checked_at: SystemTime::now(),
        });
        self.record(report.thresholds_exceeded);
        if report.thresholds_exceeded {
            warn!("Host health check failed: {:?}", report.exceeded);
        } else {
            debug!("Host health check passed");
        }

        *self.last_report.write().unwrap_or_else(PoisonError::into_inner) = Arc::clone(&report);
        report
    }

    /// False once `health_check_threshold` failed checks fall within the
    /// window. Always true when monitoring is disabled.
    pub fn is_host_healthy(&self) -> bool {
        if !self.options.enabled {
            return true;
        }
        let mut window = self.window.lock().unwrap_or_else(PoisonError::into_inner);
        prune(&mut window, self.options.health_check_window);
        let failures = window.iter().filter(|(_, exceeded)| *exceeded).count();
        failures < self.options.health_check_threshold as usize
    }

    pub fn last_report(&self) -> Arc<HealthReport> {
        self.last_report
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Checks health every `health_check_interval` until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        if !self.options.enabled {
            info!("Host health monitor is disabled");
            return;
        }
        info!("Host health monitor options: {}", self.options.format());

        let mut interval = tokio::time::interval(self.options.health_check_interval);
        interval.tick().await; // first tick is immediate
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Host health monitor stopped");
                    return;
                }
                _ = interval.tick() => {
                    self.check_health().await;
                }
            }
        }
    }

    fn record(&self, exceeded: bool) {
        let mut window = self.window.lock().unwrap_or_else(PoisonError::into_inner);
        window.push_back((Instant::now(), exceeded));
        prune(&mut window, self.options.health_check_window);
    }
}

/// Mean of `latencies`, computed in nanoseconds so that large reported values
/// cannot overflow. Saturates at `Duration::MAX`.
fn average_latency(latencies: &[Duration]) -> Duration {
    let total: u128 = latencies.iter().map(Duration::as_nanos).sum();
    let count = u128::try_from(latencies.len()).unwrap_or(u128::MAX).max(1);
    u64::try_from(total / count)
        .map(Duration::from_nanos)
        .unwrap_or(Duration::MAX)
}

fn prune(window: &mut VecDeque<(Instant, bool)>, length: Duration) {
    while let Some((at, _)) = window.front() {
        if at.elapsed() <= length {
            break;
        }
        window.pop_front();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::{StaticEnvironment, WEBSITE_COUNTERS_APP};
    use crate::throttle::{StaticThrottleSource, ThrottleSource};
    use crate::worker::WorkerStatus;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use tracing_test::traced_test;

    struct FixedDispatcher {
        state: DispatcherState,
        latencies: Vec<Duration>,
    }

    #[async_trait]
    impl InvocationDispatcher for FixedDispatcher {
        fn state(&self) -> DispatcherState {
            self.state
        }

        async fn get_worker_statuses(&self) -> HashMap<String, WorkerStatus> {
            self.latencies
                .iter()
                .enumerate()
                .map(|(i, latency)| {
                    (
                        i.to_string(),
                        WorkerStatus {
                            latency: Some(*latency),
                        },
                    )
                })
                .collect()
        }
    }

    fn health_manager(
        counters: Option<&str>,
        throttle: Option<bool>,
        options: HostHealthMonitorOptions,
    ) -> (HostHealthManager, Arc<StaticThrottleSource>) {
        let mut environment = StaticEnvironment::new();
        if let Some(counters) = counters {
            environment = environment.with_var(WEBSITE_COUNTERS_APP, counters);
        }
        let source = Arc::new(StaticThrottleSource::new("CPU", throttle));
        let sources: Vec<Arc<dyn ThrottleSource>> = vec![source.clone()];
        let manager = HostHealthManager::new(
            PerformanceSampler::new(Arc::new(environment)),
            Arc::new(ConcurrencyThrottleAggregator::new(sources)),
            options,
        );
        (manager, source)
    }

    fn workers(state: DispatcherState, millis: &[u64]) -> Arc<dyn InvocationDispatcher> {
        Arc::new(FixedDispatcher {
            state,
            latencies: millis.iter().map(|ms| Duration::from_millis(*ms)).collect(),
        })
    }

    #[test]
    fn test_options_format() {
        assert_eq!(
            HostHealthMonitorOptions::default().format(),
            r#"{"Enabled":true,"HealthCheckInterval":"00:00:10","HealthCheckWindow":"00:02:00","CounterThreshold":0.8}"#
        );
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(0)), "00:00:00");
        assert_eq!(format_duration(Duration::from_secs(3723)), "01:02:03");
        assert_eq!(format_duration(Duration::from_secs(90_061)), "1.01:01:01");
    }

    #[traced_test]
    #[test]
    fn test_counter_thresholds() {
        let (manager, _) = health_manager(None, None, HostHealthMonitorOptions::default());
        let snapshot = PerformanceCounterSnapshot {
            threads: 600,
            thread_limit: 512,
            processes: 40,
            process_limit: 32,
            named_pipes: 130,
            named_pipe_limit: 128,
            connections: 10,
            connection_limit: 100,
            ..Default::default()
        };

        let (exceeded, names) = manager.performance_counter_thresholds_exceeded(&snapshot, None);
        assert!(exceeded);
        assert_eq!(names, vec!["Threads", "Processes", "NamedPipes"]);
        assert!(logs_contain("Threads threshold exceeded (600/512)"));

        let (exceeded, names) =
            manager.performance_counter_thresholds_exceeded(&snapshot, Some(0.05));
        assert!(exceeded);
        assert_eq!(names[0], "Connections");
    }

    #[test]
    fn test_get_performance_counters_swaps_snapshot() {
        let (manager, _) = health_manager(Some("{\"threads\": 5}"), None, Default::default());
        assert!(manager.last_performance_counters().is_none());
        let snapshot = manager.get_performance_counters().unwrap();
        assert_eq!(snapshot.threads, 5);
        assert_eq!(manager.last_performance_counters(), Some(snapshot));

        let (manager, _) = health_manager(Some("not json"), None, Default::default());
        assert!(manager.get_performance_counters().is_none());
        assert!(manager.last_performance_counters().is_none());
    }

    #[tokio::test]
    async fn test_process_thresholds_follow_throttle_state() {
        for (throttle, expected) in [(Some(false), false), (None, false), (Some(true), true)] {
            // in-process
            let (in_proc, _) = health_manager(None, throttle, Default::default());
            assert_eq!(in_proc.process_thresholds_exceeded().await, expected);

            // out-of-process workers at a healthy baseline
            let options = HostHealthMonitorOptions {
                worker_latency_threshold: Some(Duration::from_millis(100)),
                ..Default::default()
            };
            let (out_of_proc, _) = health_manager(None, throttle, options);
            let out_of_proc =
                out_of_proc.with_dispatcher(workers(DispatcherState::Initialized, &[25, 25, 25]));
            assert_eq!(out_of_proc.process_thresholds_exceeded().await, expected);
        }
    }

    #[tokio::test]
    async fn test_worker_latency_signal() {
        let options = HostHealthMonitorOptions {
            worker_latency_threshold: Some(Duration::from_millis(100)),
            ..Default::default()
        };

        let (slow, _) = health_manager(None, Some(false), options.clone());
        let slow = slow.with_dispatcher(workers(DispatcherState::Initialized, &[50, 250]));
        assert!(slow.process_thresholds_exceeded().await);

        // ignored while workers restart
        let (restarting, _) = health_manager(None, Some(false), options.clone());
        let restarting =
            restarting.with_dispatcher(workers(DispatcherState::WorkerProcessRestarting, &[500]));
        assert!(!restarting.process_thresholds_exceeded().await);

        // no threshold configured
        let (unconfigured, _) = health_manager(None, Some(false), Default::default());
        let unconfigured =
            unconfigured.with_dispatcher(workers(DispatcherState::Initialized, &[500]));
        assert!(!unconfigured.process_thresholds_exceeded().await);
    }

    #[test]
    fn test_average_latency() {
        let ms = Duration::from_millis;
        assert_eq!(average_latency(&[ms(50), ms(250)]), ms(150));
        assert_eq!(average_latency(&[]), Duration::ZERO);
        assert_eq!(average_latency(&[Duration::MAX, Duration::MAX]), Duration::MAX);
    }

    #[tokio::test]
    async fn test_huge_worker_latency_does_not_panic() {
        let options = HostHealthMonitorOptions {
            worker_latency_threshold: Some(Duration::from_millis(100)),
            ..Default::default()
        };
        let (manager, _) = health_manager(None, Some(false), options);
        let manager = manager.with_dispatcher(Arc::new(FixedDispatcher {
            state: DispatcherState::Initialized,
            latencies: vec![Duration::MAX, Duration::MAX],
        }));
        assert!(manager.process_thresholds_exceeded().await);
    }

    #[tokio::test]
    async fn test_check_health_report() {
        let options = HostHealthMonitorOptions {
            worker_latency_threshold: Some(Duration::from_millis(10)),
            ..Default::default()
        };
        let counters = r#"{"threads": 600, "threadLimit": 512}"#;
        let (manager, _) = health_manager(Some(counters), Some(true), options);
        let manager = manager.with_dispatcher(workers(DispatcherState::Initialized, &[20]));

        let report = manager.check_health().await;
        assert!(report.thresholds_exceeded);
        assert_eq!(report.exceeded, vec!["Threads", "CPU", WORKER_LATENCY_THROTTLE]);
        assert_eq!(manager.last_report(), report);
    }

    #[tokio::test]
    async fn test_health_window() {
        let options = HostHealthMonitorOptions {
            health_check_threshold: 2,
            health_check_window: Duration::from_millis(200),
            ..Default::default()
        };
        let (manager, cpu) = health_manager(None, Some(true), options);
        assert!(manager.is_host_healthy());
        assert!(!manager.last_report().thresholds_exceeded);

        manager.check_health().await;
        assert!(manager.is_host_healthy());
        manager.check_health().await;
        assert!(!manager.is_host_healthy());

        cpu.set(Some(false));
        manager.check_health().await;
        assert!(!manager.is_host_healthy());

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(manager.is_host_healthy());
    }

    #[tokio::test]
    async fn test_disabled_monitor_is_always_healthy() {
        let options = HostHealthMonitorOptions {
            enabled: false,
            health_check_threshold: 1,
            ..Default::default()
        };
        let (manager, _) = health_manager(None, Some(true), options);
        manager.check_health().await;
        assert!(manager.is_host_healthy());

        // returns immediately
        Arc::new(manager).run(CancellationToken::new()).await;
    }

    #[tokio::test]
    async fn test_run_checks_periodically() {
        let options = HostHealthMonitorOptions {
            health_check_interval: Duration::from_millis(10),
            ..Default::default()
        };
        let (manager, _) = health_manager(None, Some(true), options);
        let manager = Arc::new(manager);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(Arc::clone(&manager).run(cancel.clone()));

        tokio::time::timeout(Duration::from_secs(5), async {
            while !manager.last_report().thresholds_exceeded {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        cancel.cancel();
        task.await.unwrap();
        assert_eq!(manager.last_report().exceeded, vec!["CPU"]);
    }
}
