//! # Health Checking System
//!
//! Out-of-band probing of upstream instances. The checker flips the shared
//! `healthy` flag on each [`ServiceInstance`], which the load balancer reads
//! on every selection.
//!
//! ## Key Features
//! - HTTP GET/POST, TCP connect and custom probes behind the [`HealthProbe`] trait
//! - Every probe bounded by its own timeout; any error means unhealthy
//! - All instances probed concurrently, each result applied as soon as it lands
//! - Bounded per-instance history with aggregate statistics
//! - Callbacks on every result
//! - A cancellable background loop that re-reads its [`InstanceSource`] every
//!   cycle, so routes added at runtime get probed
//!
//! ## Rust Concepts Used
//! - `async_trait` for async methods in traits
//! - `DashMap` for thread-safe concurrent access to health history
//! - `CancellationToken` + `JoinHandle` for an owned, stoppable background task

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use metrics::{counter, gauge, histogram};
use parking_lot::{Mutex, RwLock};
use reqwest::Client as HttpClient;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::config::{HealthCheckConfig, HealthCheckMethod};
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::ServiceInstance;

/// Number of results kept per instance
pub const HEALTH_HISTORY_LIMIT: usize = 100;

/// Where the background loop gets the instances to probe
pub trait InstanceSource: Send + Sync {
    fn instances(&self) -> Vec<Arc<ServiceInstance>>;
}

impl InstanceSource for Vec<Arc<ServiceInstance>> {
    fn instances(&self) -> Vec<Arc<ServiceInstance>> {
        self.clone()
    }
}

/// Individual health check result
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheckResult {
    pub instance_key: String,
    pub healthy: bool,
    pub response_time_ms: Option<f64>,
    pub status_code: Option<u16>,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// What a probe observed, before timing is attached
#[derive(Debug, Clone)]
pub struct ProbeOutcome {
    pub healthy: bool,
    pub status_code: Option<u16>,
    pub error: Option<String>,
}

impl ProbeOutcome {
    pub fn healthy(status_code: Option<u16>) -> Self {
        Self {
            healthy: true,
            status_code,
            error: None,
        }
    }

    pub fn unhealthy(status_code: Option<u16>, error: impl Into<String>) -> Self {
        Self {
            healthy: false,
            status_code,
            error: Some(error.into()),
        }
    }
}

/// Health check probe trait for different types of health checks
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Probe one instance; the caller applies the timeout
    async fn check(&self, instance: &ServiceInstance) -> ProbeOutcome;

    /// Get the probe type name
    fn probe_type(&self) -> &'static str;
}

/// HTTP probe: healthy means status 200 from `<base_url><path>`
pub struct HttpHealthProbe {
    client: HttpClient,
    method: reqwest::Method,
    path: String,
}

impl HttpHealthProbe {
    pub fn new(method: reqwest::Method, path: impl Into<String>) -> GatewayResult<Self> {
        let client = HttpClient::builder()
            .build()
            .map_err(|e| GatewayError::config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            method,
            path: path.into(),
        })
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn check(&self, instance: &ServiceInstance) -> ProbeOutcome {
        let url = format!("{}{}", instance.base_url(), self.path);

        match self.client.request(self.method.clone(), &url).send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                if status == 200 {
                    ProbeOutcome::healthy(Some(status))
                } else {
                    ProbeOutcome::unhealthy(Some(status), format!("Unexpected status code: {}", status))
                }
            }
            Err(e) => ProbeOutcome::unhealthy(None, format!("HTTP request failed: {}", e)),
        }
    }

    fn probe_type(&self) -> &'static str {
        "http"
    }
}

/// TCP probe: healthy means the connection was established
#[derive(Debug, Default)]
pub struct TcpHealthProbe;

#[async_trait]
impl HealthProbe for TcpHealthProbe {
    async fn check(&self, instance: &ServiceInstance) -> ProbeOutcome {
        match tokio::net::TcpStream::connect((instance.host.as_str(), instance.port)).await {
            Ok(_) => ProbeOutcome::healthy(None),
            Err(e) => ProbeOutcome::unhealthy(None, format!("TCP connect failed: {}", e)),
        }
    }

    fn probe_type(&self) -> &'static str {
        "tcp"
    }
}

/// Called for every result; errors are logged and otherwise ignored
pub type HealthCallback =
    Arc<dyn Fn(&ServiceInstance, &HealthCheckResult) -> anyhow::Result<()> + Send + Sync>;

#[derive(Debug, Clone, Serialize)]
pub struct InstanceHealthStats {
    pub instance_key: String,
    pub total_checks: usize,
    pub healthy_checks: usize,
    pub unhealthy_checks: usize,
    pub success_rate: f64,
    pub average_response_time_ms: f64,
    pub last_check: Option<DateTime<Utc>>,
    pub currently_healthy: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OverallHealthStats {
    pub total_instances: usize,
    pub total_checks: usize,
    pub healthy_checks: usize,
    pub unhealthy_checks: usize,
    pub overall_success_rate: f64,
    pub average_response_time_ms: f64,
    pub running: bool,
}

struct BackgroundTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Main health checker that manages all health checks
pub struct HealthChecker {
    config: HealthCheckConfig,
    probe: Arc<dyn HealthProbe>,
    history: DashMap<String, VecDeque<HealthCheckResult>>,
    callbacks: RwLock<Vec<HealthCallback>>,
    task: Mutex<Option<BackgroundTask>>,
}

impl HealthChecker {
    /// Build a checker for the configured method
    ///
    /// `custom_probe` is used when the method is `custom`. Without one, the
    /// checker falls back to HTTP GET.
    pub fn new(
        config: HealthCheckConfig,
        custom_probe: Option<Arc<dyn HealthProbe>>,
    ) -> GatewayResult<Self> {
        let probe: Arc<dyn HealthProbe> = match (config.method, custom_probe) {
            (HealthCheckMethod::Custom, Some(probe)) => probe,
            (HealthCheckMethod::Custom, None) => {
                warn!("Custom health check method configured without a probe, using HTTP GET");
                Arc::new(HttpHealthProbe::new(reqwest::Method::GET, config.path.clone())?)
            }
            (HealthCheckMethod::HttpGet, _) => {
                Arc::new(HttpHealthProbe::new(reqwest::Method::GET, config.path.clone())?)
            }
            (HealthCheckMethod::HttpPost, _) => {
                Arc::new(HttpHealthProbe::new(reqwest::Method::POST, config.path.clone())?)
            }
            (HealthCheckMethod::TcpConnect, _) => Arc::new(TcpHealthProbe),
        };

        Ok(Self::with_probe(config, probe))
    }

    pub fn with_probe(config: HealthCheckConfig, probe: Arc<dyn HealthProbe>) -> Self {
        info!(
            probe = probe.probe_type(),
            interval = ?config.interval,
            timeout = ?config.timeout,
            "Health checker initialized"
        );

        Self {
            config,
            probe,
            history: DashMap::new(),
            callbacks: RwLock::new(Vec::new()),
            task: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &HealthCheckConfig {
        &self.config
    }

    pub fn add_callback(&self, callback: HealthCallback) {
        self.callbacks.write().push(callback);
    }

    /// Probe one instance and apply the result immediately
    pub async fn check_instance(&self, instance: &ServiceInstance) -> HealthCheckResult {
        let started = Instant::now();
        let outcome = match timeout(self.config.timeout, self.probe.check(instance)).await {
            Ok(outcome) => outcome,
            Err(_) => ProbeOutcome::unhealthy(
                None,
                format!("Health check timed out after {:?}", self.config.timeout),
            ),
        };
        let elapsed = started.elapsed();

        let result = HealthCheckResult {
            instance_key: instance.key(),
            healthy: outcome.healthy,
            response_time_ms: Some(elapsed.as_secs_f64() * 1000.0),
            status_code: outcome.status_code,
            error: outcome.error,
            timestamp: Utc::now(),
        };

        self.apply(instance, &result);
        result
    }

    /// Probe every instance concurrently
    pub async fn check_all(&self, instances: &[Arc<ServiceInstance>]) -> Vec<HealthCheckResult> {
        join_all(instances.iter().map(|instance| self.check_instance(instance))).await
    }

    fn apply(&self, instance: &ServiceInstance, result: &HealthCheckResult) {
        let was_healthy = instance.is_healthy();
        instance.set_health(result.healthy, result.timestamp);

        if was_healthy != result.healthy {
            if result.healthy {
                info!(instance = %result.instance_key, "Instance became healthy");
            } else {
                warn!(
                    instance = %result.instance_key,
                    error = ?result.error,
                    "Instance became unhealthy"
                );
            }
        } else {
            debug!(
                instance = %result.instance_key,
                healthy = result.healthy,
                "Health check completed"
            );
        }

        counter!(
            "health_checks_total",
            "result" => if result.healthy { "healthy" } else { "unhealthy" }
        )
        .increment(1);
        if let Some(ms) = result.response_time_ms {
            histogram!("health_check_duration_seconds").record(ms / 1000.0);
        }

        {
            let mut history = self.history.entry(result.instance_key.clone()).or_default();
            if history.len() == HEALTH_HISTORY_LIMIT {
                history.pop_front();
            }
            history.push_back(result.clone());
        }

        let callbacks = self.callbacks.read().clone();
        for callback in callbacks {
            if let Err(e) = callback(instance, result) {
                error!(instance = %result.instance_key, error = %e, "Health check callback failed");
            }
        }
    }

    /// Start the periodic loop; a second call while running is a no-op
    pub fn start(self: &Arc<Self>, source: Arc<dyn InstanceSource>) {
        let mut task = self.task.lock();
        if task.is_some() {
            warn!("Health checker already running");
            return;
        }

        let token = CancellationToken::new();
        let checker = Arc::clone(self);
        let loop_token = token.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = interval(checker.config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = loop_token.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let instances = source.instances();
                tokio::select! {
                    _ = loop_token.cancelled() => break,
                    results = checker.check_all(&instances) => {
                        let healthy = results.iter().filter(|r| r.healthy).count();
                        gauge!("upstream_instances_healthy").set(healthy as f64);
                        gauge!("upstream_instances_total").set(results.len() as f64);
                        info!(
                            healthy = healthy,
                            total = results.len(),
                            "Health check cycle completed"
                        );
                    }
                }
            }

            debug!("Health check loop stopped");
        });

        *task = Some(BackgroundTask { token, handle });
        info!(interval = ?self.config.interval, "Started continuous health checks");
    }

    /// Cancel the loop and wait for it to finish
    pub async fn stop(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            task.token.cancel();
            if let Err(e) = task.handle.await {
                error!(error = %e, "Health check task ended abnormally");
            }
            info!("Stopped continuous health checks");
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().is_some()
    }

    /// Drop the history of an instance that is no longer routed to
    pub fn forget(&self, instance_key: &str) -> bool {
        self.history.remove(instance_key).is_some()
    }

    /// The last `limit` results for `instance_key`, oldest first
    pub fn instance_history(&self, instance_key: &str, limit: usize) -> Vec<HealthCheckResult> {
        self.history
            .get(instance_key)
            .map(|history| {
                let skip = history.len().saturating_sub(limit);
                history.iter().skip(skip).cloned().collect()
            })
            .unwrap_or_default()
    }

    pub fn instance_stats(&self, instance_key: &str) -> InstanceHealthStats {
        let history = self.instance_history(instance_key, HEALTH_HISTORY_LIMIT);
        let healthy_checks = history.iter().filter(|r| r.healthy).count();

        InstanceHealthStats {
            instance_key: instance_key.to_string(),
            total_checks: history.len(),
            healthy_checks,
            unhealthy_checks: history.len() - healthy_checks,
            success_rate: ratio(healthy_checks, history.len()),
            average_response_time_ms: average_response_time(history.iter()),
            last_check: history.last().map(|r| r.timestamp),
            currently_healthy: history.last().map(|r| r.healthy),
        }
    }

    pub fn overall_stats(&self) -> OverallHealthStats {
        let mut total_checks = 0;
        let mut healthy_checks = 0;
        let mut response_times = Vec::new();

        for entry in self.history.iter() {
            total_checks += entry.len();
            healthy_checks += entry.iter().filter(|r| r.healthy).count();
            response_times.extend(entry.iter().filter_map(|r| r.response_time_ms));
        }

        let average_response_time_ms = if response_times.is_empty() {
            0.0
        } else {
            response_times.iter().sum::<f64>() / response_times.len() as f64
        };

        OverallHealthStats {
            total_instances: self.history.len(),
            total_checks,
            healthy_checks,
            unhealthy_checks: total_checks - healthy_checks,
            overall_success_rate: ratio(healthy_checks, total_checks),
            average_response_time_ms,
            running: self.is_running(),
        }
    }

    /// Stats for every instance with history, sorted by key
    pub fn all_instance_stats(&self) -> Vec<InstanceHealthStats> {
        let mut keys: Vec<String> = self.history.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys.iter().map(|key| self.instance_stats(key)).collect()
    }
}

fn ratio(part: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64
    }
}

fn average_response_time<'a>(results: impl Iterator<Item = &'a HealthCheckResult>) -> f64 {
    let samples: Vec<f64> = results.filter_map(|r| r.response_time_ms).collect();
    if samples.is_empty() {
        0.0
    } else {
        samples.iter().sum::<f64>() / samples.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedProbe {
        healthy: bool,
        delay: Duration,
    }

    #[async_trait]
    impl HealthProbe for FixedProbe {
        async fn check(&self, _instance: &ServiceInstance) -> ProbeOutcome {
            tokio::time::sleep(self.delay).await;
            if self.healthy {
                ProbeOutcome::healthy(Some(200))
            } else {
                ProbeOutcome::unhealthy(Some(500), "boom")
            }
        }

        fn probe_type(&self) -> &'static str {
            "fixed"
        }
    }

    fn config() -> HealthCheckConfig {
        HealthCheckConfig {
            interval: Duration::from_millis(20),
            timeout: Duration::from_millis(100),
            ..HealthCheckConfig::default()
        }
    }

    fn checker(healthy: bool, delay: Duration) -> HealthChecker {
        HealthChecker::with_probe(config(), Arc::new(FixedProbe { healthy, delay }))
    }

    #[tokio::test]
    async fn test_unhealthy_result_flips_flag() {
        let checker = checker(false, Duration::ZERO);
        let instance = ServiceInstance::new("127.0.0.1", 9, 1);

        let result = checker.check_instance(&instance).await;
        assert!(!result.healthy);
        assert_eq!(result.status_code, Some(500));
        assert_eq!(result.error.as_deref(), Some("boom"));
        assert!(!instance.is_healthy());
        assert!(instance.last_health_check().is_some());
    }

    #[tokio::test]
    async fn test_probe_timeout_is_unhealthy() {
        let checker = checker(true, Duration::from_millis(500));
        let instance = ServiceInstance::new("127.0.0.1", 9, 1);

        let result = checker.check_instance(&instance).await;
        assert!(!result.healthy);
        assert!(result.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_history_is_bounded_and_stats_aggregate() {
        let checker = checker(true, Duration::ZERO);
        let instance = ServiceInstance::new("127.0.0.1", 9, 1);

        for _ in 0..(HEALTH_HISTORY_LIMIT + 5) {
            checker.check_instance(&instance).await;
        }

        assert_eq!(checker.instance_history(&instance.key(), 10).len(), 10);
        let stats = checker.instance_stats(&instance.key());
        assert_eq!(stats.total_checks, HEALTH_HISTORY_LIMIT);
        assert_eq!(stats.success_rate, 1.0);
        assert_eq!(stats.currently_healthy, Some(true));

        let overall = checker.overall_stats();
        assert_eq!(overall.total_instances, 1);
        assert_eq!(overall.unhealthy_checks, 0);
    }

    #[tokio::test]
    async fn test_callback_errors_are_swallowed() {
        let checker = checker(true, Duration::ZERO);
        let calls = Arc::new(AtomicUsize::new(0));

        let seen = Arc::clone(&calls);
        checker.add_callback(Arc::new(move |_: &ServiceInstance, _: &HealthCheckResult| {
            seen.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("callback failure")
        }));
        let seen = Arc::clone(&calls);
        checker.add_callback(Arc::new(move |_: &ServiceInstance, result: &HealthCheckResult| {
            assert!(result.healthy);
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));

        let instance = ServiceInstance::new("127.0.0.1", 9, 1);
        checker.check_instance(&instance).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_check_all_probes_every_instance() {
        let checker = checker(false, Duration::from_millis(30));
        let instances: Vec<_> = (0..5)
            .map(|i| Arc::new(ServiceInstance::new("127.0.0.1", 9000 + i, 1)))
            .collect();

        let started = Instant::now();
        let results = checker.check_all(&instances).await;
        assert_eq!(results.len(), 5);
        assert!(instances.iter().all(|i| !i.is_healthy()));
        // concurrent probes finish well under the sum of their delays
        assert!(started.elapsed() < Duration::from_millis(150));
    }

    #[tokio::test]
    async fn test_start_stop_loop() {
        let checker = Arc::new(checker(false, Duration::ZERO));
        let instance = Arc::new(ServiceInstance::new("127.0.0.1", 9, 1));
        let source: Arc<dyn InstanceSource> = Arc::new(vec![Arc::clone(&instance)]);

        checker.start(Arc::clone(&source));
        checker.start(source);
        assert!(checker.is_running());

        tokio::time::sleep(Duration::from_millis(100)).await;
        checker.stop().await;
        assert!(!checker.is_running());

        let checks = checker.instance_stats(&instance.key()).total_checks;
        assert!(checks >= 2);
        assert!(!instance.is_healthy());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(checker.instance_stats(&instance.key()).total_checks, checks);
    }

    #[tokio::test]
    async fn test_tcp_probe() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let up = ServiceInstance::new("127.0.0.1", port, 1);

        let probe = TcpHealthProbe;
        assert!(probe.check(&up).await.healthy);

        drop(listener);
        let down = ServiceInstance::new("127.0.0.1", port, 1);
        assert!(!probe.check(&down).await.healthy);
    }
}
