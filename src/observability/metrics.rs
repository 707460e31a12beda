//! # Metrics Collector
//!
//! In-process request and error aggregation for the gateway.
//!
//! Every finished request is appended to a bounded history and folded into
//! running aggregates: gateway totals, a status-code histogram, response-time
//! buckets and one [`ServiceMetrics`] per upstream service. The same events are
//! also emitted through the `metrics` facade so an installed Prometheus
//! recorder sees them.
//!
//! All aggregate state sits behind a single `parking_lot::Mutex`; each
//! recording call holds it for a handful of field updates and never across an
//! `.await`.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::config::MetricsConfig;

pub const REQUEST_HISTORY_LIMIT: usize = 10_000;
pub const ERROR_HISTORY_LIMIT: usize = 1_000;
pub const SERVICE_RECENT_LIMIT: usize = 1_000;

const RECENT_WINDOW: Duration = Duration::from_secs(300);
const RPM_WINDOW: Duration = Duration::from_secs(60);
const TOP_ERRORS: usize = 10;

/// Response-time bucket labels with their exclusive upper bounds in ms
const RESPONSE_TIME_BUCKETS: [(&str, Option<u64>); 6] = [
    ("0-50ms", Some(50)),
    ("50-100ms", Some(100)),
    ("100-250ms", Some(250)),
    ("250-500ms", Some(500)),
    ("500-1000ms", Some(1000)),
    ("1000ms+", None),
];

/// Metrics errors
#[derive(Error, Debug)]
pub enum MetricsError {
    #[error("Metrics initialization failed: {0}")]
    InitializationError(String),
}

/// Install the process-wide Prometheus recorder behind the `metrics` facade
pub fn install_prometheus_recorder() -> Result<PrometheusHandle, MetricsError> {
    PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| MetricsError::InitializationError(e.to_string()))
}

/// One finished request
#[derive(Debug, Clone, Serialize)]
pub struct RequestMetric {
    pub timestamp: DateTime<Utc>,
    pub method: String,
    pub path: String,
    pub status_code: u16,
    #[serde(with = "duration_ms")]
    pub duration: Duration,
    pub service: String,
    pub user_id: Option<String>,
    pub trace_id: Option<String>,
}

impl RequestMetric {
    pub fn new(
        method: impl Into<String>,
        path: impl Into<String>,
        status_code: u16,
        duration: Duration,
        service: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            method: method.into(),
            path: path.into(),
            status_code,
            duration,
            service: service.into(),
            user_id: None,
            trace_id: None,
        }
    }

    pub fn with_user(mut self, user_id: Option<String>) -> Self {
        self.user_id = user_id;
        self
    }

    pub fn with_trace(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    fn is_success(&self) -> bool {
        (200..400).contains(&self.status_code)
    }
}

/// One failed request, recorded alongside its [`RequestMetric`]
#[derive(Debug, Clone, Serialize)]
pub struct ErrorMetric {
    pub timestamp: DateTime<Utc>,
    pub method: String,
    pub path: String,
    pub error_type: String,
    pub error_message: String,
    pub service: String,
    pub user_id: Option<String>,
    pub trace_id: Option<String>,
}

impl ErrorMetric {
    pub fn new(
        method: impl Into<String>,
        path: impl Into<String>,
        error_type: impl Into<String>,
        error_message: impl Into<String>,
        service: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            method: method.into(),
            path: path.into(),
            error_type: error_type.into(),
            error_message: error_message.into(),
            service: service.into(),
            user_id: None,
            trace_id: None,
        }
    }

    pub fn with_user(mut self, user_id: Option<String>) -> Self {
        self.user_id = user_id;
        self
    }

    pub fn with_trace(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }
}

#[derive(Debug, Clone)]
struct Timed<T> {
    at: Instant,
    record: T,
}

/// Running aggregate for one upstream service
#[derive(Debug, Clone, Default)]
pub struct ServiceMetrics {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub total_duration: Duration,
    pub min_duration: Option<Duration>,
    pub max_duration: Duration,
    pub error_counts: HashMap<String, u64>,
    recent: VecDeque<Instant>,
}

impl ServiceMetrics {
    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 0.0;
        }
        self.successful_requests as f64 / self.total_requests as f64
    }

    pub fn average_duration(&self) -> Duration {
        if self.total_requests == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.total_duration.as_secs_f64() / self.total_requests as f64)
    }

    fn record(&mut self, at: Instant, duration: Duration, success: bool) {
        self.total_requests += 1;
        if success {
            self.successful_requests += 1;
        } else {
            self.failed_requests += 1;
        }
        self.total_duration += duration;
        self.min_duration = Some(self.min_duration.map_or(duration, |min| min.min(duration)));
        self.max_duration = self.max_duration.max(duration);

        if self.recent.len() == SERVICE_RECENT_LIMIT {
            self.recent.pop_front();
        }
        self.recent.push_back(at);
    }

    fn requests_in(&self, now: Instant, window: Duration) -> usize {
        self.recent
            .iter()
            .filter(|at| now.saturating_duration_since(**at) <= window)
            .count()
    }
}

#[derive(Debug)]
struct MetricsState {
    requests: VecDeque<Timed<RequestMetric>>,
    errors: VecDeque<Timed<ErrorMetric>>,
    services: HashMap<String, ServiceMetrics>,
    status_codes: BTreeMap<u16, u64>,
    response_time_buckets: [u64; RESPONSE_TIME_BUCKETS.len()],
    total_requests: u64,
    total_errors: u64,
    active_connections: u64,
}

impl MetricsState {
    fn new() -> Self {
        Self {
            requests: VecDeque::new(),
            errors: VecDeque::new(),
            services: HashMap::new(),
            status_codes: BTreeMap::new(),
            response_time_buckets: [0; RESPONSE_TIME_BUCKETS.len()],
            total_requests: 0,
            total_errors: 0,
            active_connections: 0,
        }
    }
}

fn bucket_index(duration: Duration) -> usize {
    let ms = duration.as_millis();
    RESPONSE_TIME_BUCKETS
        .iter()
        .position(|(_, bound)| bound.map_or(true, |bound| ms < u128::from(bound)))
        .unwrap_or(RESPONSE_TIME_BUCKETS.len() - 1)
}

/// `42.0s`, `3.5m`, `1.2h`, `2.0d`
pub fn format_uptime(seconds: f64) -> String {
    if seconds < 60.0 {
        format!("{:.1}s", seconds)
    } else if seconds < 3600.0 {
        format!("{:.1}m", seconds / 60.0)
    } else if seconds < 86_400.0 {
        format!("{:.1}h", seconds / 3600.0)
    } else {
        format!("{:.1}d", seconds / 86_400.0)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GatewaySummary {
    pub uptime_seconds: f64,
    pub uptime_human: String,
    pub active_connections: u64,
    pub total_requests: u64,
    pub total_errors: u64,
    pub error_rate: f64,
    pub requests_per_second: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceSummary {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub success_rate: f64,
    pub average_duration_ms: f64,
    pub min_duration_ms: f64,
    pub max_duration_ms: f64,
    pub requests_per_minute: usize,
    pub error_counts: HashMap<String, u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecentActivity {
    pub requests_last_5min: usize,
    pub errors_last_5min: usize,
    pub avg_response_time_5min_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorCount {
    pub error_type: String,
    pub count: usize,
}

/// Serializable view returned by `GET /metrics`
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub gateway: GatewaySummary,
    pub response_times: BTreeMap<String, u64>,
    pub status_codes: BTreeMap<u16, u64>,
    pub services: BTreeMap<String, ServiceSummary>,
    pub recent_activity: RecentActivity,
    pub top_errors: Vec<ErrorCount>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsHealth {
    pub status: &'static str,
    pub uptime_seconds: f64,
    pub request_history_size: usize,
    pub error_history_size: usize,
    pub services_tracked: usize,
    pub total_requests: u64,
    pub total_errors: u64,
}

struct SweepTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Aggregates request and error records for the gateway
pub struct MetricsCollector {
    config: MetricsConfig,
    state: Mutex<MetricsState>,
    started_at: Instant,
    task: Mutex<Option<SweepTask>>,
}

impl MetricsCollector {
    pub fn new(config: MetricsConfig) -> Self {
        Self {
            config,
            state: Mutex::new(MetricsState::new()),
            started_at: Instant::now(),
            task: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &MetricsConfig {
        &self.config
    }

    /// Record a finished request
    pub fn record_request(&self, metric: RequestMetric) {
        self.record_request_at(metric, Instant::now());
    }

    pub fn record_request_at(&self, metric: RequestMetric, at: Instant) {
        if !self.config.enabled {
            return;
        }

        let success = metric.is_success();
        let status = metric.status_code.to_string();
        counter!(
            "dispatch_proxy_requests_total",
            "method" => metric.method.clone(),
            "service" => metric.service.clone(),
            "status" => status
        )
        .increment(1);
        histogram!(
            "dispatch_proxy_request_duration_seconds",
            "service" => metric.service.clone()
        )
        .record(metric.duration.as_secs_f64());

        let mut state = self.state.lock();
        state.total_requests += 1;
        *state.status_codes.entry(metric.status_code).or_insert(0) += 1;
        state.response_time_buckets[bucket_index(metric.duration)] += 1;
        state
            .services
            .entry(metric.service.clone())
            .or_default()
            .record(at, metric.duration, success);

        if state.requests.len() == REQUEST_HISTORY_LIMIT {
            state.requests.pop_front();
        }
        state.requests.push_back(Timed { at, record: metric });
    }

    /// Record an error; the matching request is recorded separately
    pub fn record_error(&self, metric: ErrorMetric) {
        self.record_error_at(metric, Instant::now());
    }

    pub fn record_error_at(&self, metric: ErrorMetric, at: Instant) {
        if !self.config.enabled {
            return;
        }

        counter!(
            "dispatch_proxy_errors_total",
            "error_type" => metric.error_type.clone(),
            "service" => metric.service.clone()
        )
        .increment(1);

        let mut state = self.state.lock();
        state.total_errors += 1;
        *state
            .services
            .entry(metric.service.clone())
            .or_default()
            .error_counts
            .entry(metric.error_type.clone())
            .or_insert(0) += 1;

        if state.errors.len() == ERROR_HISTORY_LIMIT {
            state.errors.pop_front();
        }
        state.errors.push_back(Timed { at, record: metric });
    }

    pub fn connection_opened(&self) {
        let active = {
            let mut state = self.state.lock();
            state.active_connections += 1;
            state.active_connections
        };
        gauge!("dispatch_proxy_active_connections").set(active as f64);
    }

    pub fn connection_closed(&self) {
        let active = {
            let mut state = self.state.lock();
            state.active_connections = state.active_connections.saturating_sub(1);
            state.active_connections
        };
        gauge!("dispatch_proxy_active_connections").set(active as f64);
    }

    pub fn active_connections(&self) -> u64 {
        self.state.lock().active_connections
    }

    pub fn total_requests(&self) -> u64 {
        self.state.lock().total_requests
    }

    pub fn total_errors(&self) -> u64 {
        self.state.lock().total_errors
    }

    pub fn service_metrics(&self, service: &str) -> Option<ServiceMetrics> {
        self.state.lock().services.get(service).cloned()
    }

    /// Drop history entries older than the retention window
    ///
    /// Returns the number of request and error records removed. Aggregates
    /// and per-service recent rings are pruned too.
    pub fn sweep(&self, now: Instant) -> usize {
        let retention = self.config.retention;
        let is_stale = |at: Instant| now.saturating_duration_since(at) > retention;

        let mut state = self.state.lock();
        let before = state.requests.len() + state.errors.len();

        while state.requests.front().map_or(false, |r| is_stale(r.at)) {
            state.requests.pop_front();
        }
        while state.errors.front().map_or(false, |e| is_stale(e.at)) {
            state.errors.pop_front();
        }
        for service in state.services.values_mut() {
            while service.recent.front().map_or(false, |at| is_stale(*at)) {
                service.recent.pop_front();
            }
        }

        before - (state.requests.len() + state.errors.len())
    }

    /// Start the periodic sweep; a second call while running is a no-op
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if task.is_some() {
            warn!("Metrics sweep already running");
            return;
        }

        let token = CancellationToken::new();
        let collector = Arc::clone(self);
        let loop_token = token.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = interval(collector.config.sweep_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = loop_token.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = collector.sweep(Instant::now());
                        debug!(removed = removed, "Metrics sweep completed");
                    }
                }
            }
        });

        *task = Some(SweepTask { token, handle });
        info!(interval = ?self.config.sweep_interval, "Metrics collection started");
    }

    pub async fn stop(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            task.token.cancel();
            if let Err(e) = task.handle.await {
                error!(error = %e, "Metrics sweep task ended abnormally");
            }
            info!("Metrics collection stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().is_some()
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.snapshot_at(Instant::now())
    }

    pub fn snapshot_at(&self, now: Instant) -> MetricsSnapshot {
        let uptime = now.saturating_duration_since(self.started_at).as_secs_f64();
        let state = self.state.lock();

        let gateway = GatewaySummary {
            uptime_seconds: uptime,
            uptime_human: format_uptime(uptime),
            active_connections: state.active_connections,
            total_requests: state.total_requests,
            total_errors: state.total_errors,
            error_rate: state.total_errors as f64 / state.total_requests.max(1) as f64,
            requests_per_second: state.total_requests as f64 / uptime.max(1.0),
        };

        let response_times = RESPONSE_TIME_BUCKETS
            .iter()
            .zip(state.response_time_buckets.iter())
            .map(|((label, _), count)| (label.to_string(), *count))
            .collect();

        let services = state
            .services
            .iter()
            .map(|(name, service)| {
                let summary = ServiceSummary {
                    total_requests: service.total_requests,
                    successful_requests: service.successful_requests,
                    failed_requests: service.failed_requests,
                    success_rate: service.success_rate(),
                    average_duration_ms: as_ms(service.average_duration()),
                    min_duration_ms: service.min_duration.map_or(0.0, as_ms),
                    max_duration_ms: as_ms(service.max_duration),
                    requests_per_minute: service.requests_in(now, RPM_WINDOW),
                    error_counts: service.error_counts.clone(),
                };
                (name.clone(), summary)
            })
            .collect();

        let in_window = |at: Instant| now.saturating_duration_since(at) <= RECENT_WINDOW;
        let recent_durations: Vec<Duration> = state
            .requests
            .iter()
            .filter(|r| in_window(r.at))
            .map(|r| r.record.duration)
            .collect();
        let recent_avg = if recent_durations.is_empty() {
            0.0
        } else {
            recent_durations.iter().map(|d| as_ms(*d)).sum::<f64>() / recent_durations.len() as f64
        };

        let mut error_types: HashMap<&str, usize> = HashMap::new();
        let mut errors_last_5min = 0;
        for entry in state.errors.iter().filter(|e| in_window(e.at)) {
            errors_last_5min += 1;
            *error_types.entry(entry.record.error_type.as_str()).or_insert(0) += 1;
        }
        let mut top_errors: Vec<ErrorCount> = error_types
            .into_iter()
            .map(|(error_type, count)| ErrorCount {
                error_type: error_type.to_string(),
                count,
            })
            .collect();
        top_errors.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.error_type.cmp(&b.error_type)));
        top_errors.truncate(TOP_ERRORS);

        MetricsSnapshot {
            gateway,
            response_times,
            status_codes: state.status_codes.clone(),
            services,
            recent_activity: RecentActivity {
                requests_last_5min: recent_durations.len(),
                errors_last_5min,
                avg_response_time_5min_ms: recent_avg,
            },
            top_errors,
        }
    }

    /// Text exposition of the aggregates; empty when Prometheus output is off
    pub fn render_prometheus(&self) -> String {
        if !self.config.prometheus_enabled {
            return String::new();
        }

        let snapshot = self.snapshot();
        let duration_sum: f64 = self
            .state
            .lock()
            .services
            .values()
            .map(|service| service.total_duration.as_secs_f64())
            .sum();
        let gateway = &snapshot.gateway;
        let mut out = String::new();

        write_family(&mut out, "gateway_uptime_seconds", "Gateway uptime in seconds", "counter");
        let _ = writeln!(out, "gateway_uptime_seconds {}", gateway.uptime_seconds);
        write_family(&mut out, "gateway_active_connections", "Current active connections", "gauge");
        let _ = writeln!(out, "gateway_active_connections {}", gateway.active_connections);
        write_family(&mut out, "gateway_requests_total", "Total number of requests", "counter");
        let _ = writeln!(out, "gateway_requests_total {}", gateway.total_requests);
        write_family(&mut out, "gateway_errors_total", "Total number of errors", "counter");
        let _ = writeln!(out, "gateway_errors_total {}", gateway.total_errors);
        write_family(&mut out, "gateway_error_rate", "Fraction of requests that errored", "gauge");
        let _ = writeln!(out, "gateway_error_rate {}", gateway.error_rate);

        write_family(
            &mut out,
            "gateway_request_duration_seconds",
            "Request duration histogram",
            "histogram",
        );
        let mut cumulative = 0;
        for (label, bound) in RESPONSE_TIME_BUCKETS.iter() {
            cumulative += snapshot.response_times.get(*label).copied().unwrap_or(0);
            let le = bound.map_or_else(|| "+Inf".to_string(), |ms| format!("{}", ms as f64 / 1000.0));
            let _ = writeln!(
                out,
                "gateway_request_duration_seconds_bucket{{le=\"{}\"}} {}",
                le, cumulative
            );
        }
        let _ = writeln!(out, "gateway_request_duration_seconds_sum {}", duration_sum);
        let _ = writeln!(out, "gateway_request_duration_seconds_count {}", cumulative);

        write_family(&mut out, "gateway_status_codes_total", "Responses by status code", "counter");
        for (code, count) in &snapshot.status_codes {
            let _ = writeln!(out, "gateway_status_codes_total{{code=\"{}\"}} {}", code, count);
        }

        if !snapshot.services.is_empty() {
            write_family(&mut out, "service_requests_total", "Requests per service", "counter");
            for (name, service) in &snapshot.services {
                let _ = writeln!(
                    out,
                    "service_requests_total{{service=\"{}\"}} {}",
                    escape_label(name),
                    service.total_requests
                );
            }
            write_family(&mut out, "service_success_rate", "Success rate per service", "gauge");
            for (name, service) in &snapshot.services {
                let _ = writeln!(
                    out,
                    "service_success_rate{{service=\"{}\"}} {}",
                    escape_label(name),
                    service.success_rate
                );
            }
            write_family(
                &mut out,
                "service_average_duration_seconds",
                "Average request duration per service",
                "gauge",
            );
            for (name, service) in &snapshot.services {
                let _ = writeln!(
                    out,
                    "service_average_duration_seconds{{service=\"{}\"}} {}",
                    escape_label(name),
                    service.average_duration_ms / 1000.0
                );
            }
        }

        out
    }

    pub fn health_status(&self) -> MetricsHealth {
        let state = self.state.lock();
        MetricsHealth {
            status: if self.is_running() { "healthy" } else { "stopped" },
            uptime_seconds: self.uptime().as_secs_f64(),
            request_history_size: state.requests.len(),
            error_history_size: state.errors.len(),
            services_tracked: state.services.len(),
            total_requests: state.total_requests,
            total_errors: state.total_errors,
        }
    }
}

fn as_ms(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

/// Escape a label value for the text exposition format
fn escape_label(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '"' => escaped.push_str("\\\""),
            '\n' => escaped.push_str("\\n"),
            c => escaped.push(c),
        }
    }
    escaped
}

fn write_family(out: &mut String, name: &str, help: &str, kind: &str) {
    if !out.is_empty() {
        out.push('\n');
    }
    let _ = writeln!(out, "# HELP {} {}", name, help);
    let _ = writeln!(out, "# TYPE {} {}", name, kind);
}

mod duration_ms {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(duration.as_secs_f64() * 1000.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collector() -> MetricsCollector {
        MetricsCollector::new(MetricsConfig::default())
    }

    fn request(status: u16, ms: u64, service: &str) -> RequestMetric {
        RequestMetric::new("GET", "/api/v1/products/1", status, Duration::from_millis(ms), service)
    }

    #[test]
    fn test_bucket_boundaries() {
        assert_eq!(bucket_index(Duration::from_millis(0)), 0);
        assert_eq!(bucket_index(Duration::from_millis(49)), 0);
        assert_eq!(bucket_index(Duration::from_millis(50)), 1);
        assert_eq!(bucket_index(Duration::from_millis(999)), 4);
        assert_eq!(bucket_index(Duration::from_millis(1000)), 5);
        assert_eq!(bucket_index(Duration::from_secs(30)), 5);
    }

    #[test]
    fn test_format_uptime() {
        assert_eq!(format_uptime(42.0), "42.0s");
        assert_eq!(format_uptime(90.0), "1.5m");
        assert_eq!(format_uptime(7200.0), "2.0h");
        assert_eq!(format_uptime(172_800.0), "2.0d");
    }

    #[test]
    fn test_record_request_aggregates() {
        let metrics = collector();
        metrics.record_request(request(200, 20, "products"));
        metrics.record_request(request(302, 80, "products"));
        metrics.record_request(request(502, 1500, "products"));

        let service = metrics.service_metrics("products").unwrap();
        assert_eq!(service.total_requests, 3);
        assert_eq!(service.successful_requests, 2);
        assert_eq!(service.failed_requests, 1);
        assert_eq!(service.min_duration, Some(Duration::from_millis(20)));
        assert_eq!(service.max_duration, Duration::from_millis(1500));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.gateway.total_requests, 3);
        assert_eq!(snapshot.status_codes.get(&502), Some(&1));
        assert_eq!(snapshot.response_times["0-50ms"], 1);
        assert_eq!(snapshot.response_times["50-100ms"], 1);
        assert_eq!(snapshot.response_times["1000ms+"], 1);
        assert_eq!(snapshot.services["products"].requests_per_minute, 3);
        assert_eq!(snapshot.recent_activity.requests_last_5min, 3);
    }

    #[test]
    fn test_record_error_and_top_errors() {
        let metrics = collector();
        for _ in 0..3 {
            metrics.record_error(ErrorMetric::new("GET", "/a", "timeout", "slow", "orders"));
        }
        metrics.record_error(ErrorMetric::new("GET", "/a", "upstream_connect", "refused", "orders"));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.gateway.total_errors, 4);
        assert_eq!(snapshot.recent_activity.errors_last_5min, 4);
        assert_eq!(snapshot.top_errors[0].error_type, "timeout");
        assert_eq!(snapshot.top_errors[0].count, 3);
        assert_eq!(snapshot.services["orders"].error_counts["upstream_connect"], 1);
    }

    #[test]
    fn test_request_history_is_bounded() {
        let metrics = collector();
        for _ in 0..(REQUEST_HISTORY_LIMIT + 5) {
            metrics.record_request(request(200, 1, "svc"));
        }
        let health = metrics.health_status();
        assert_eq!(health.request_history_size, REQUEST_HISTORY_LIMIT);
        assert_eq!(health.total_requests, REQUEST_HISTORY_LIMIT as u64 + 5);
    }

    #[test]
    fn test_sweep_drops_old_entries() {
        let metrics = collector();
        let now = Instant::now();
        metrics.record_request_at(request(200, 10, "svc"), now);
        metrics.record_error_at(ErrorMetric::new("GET", "/", "timeout", "x", "svc"), now);

        assert_eq!(metrics.sweep(now + Duration::from_secs(60)), 0);
        assert_eq!(metrics.sweep(now + Duration::from_secs(2 * 3600)), 2);

        let health = metrics.health_status();
        assert_eq!(health.request_history_size, 0);
        assert_eq!(health.error_history_size, 0);
        // totals survive the sweep
        assert_eq!(health.total_requests, 1);
    }

    #[test]
    fn test_trailing_windows_use_snapshot_instant() {
        let metrics = collector();
        let now = Instant::now();
        metrics.record_request_at(request(200, 10, "svc"), now);

        let later = metrics.snapshot_at(now + Duration::from_secs(120));
        assert_eq!(later.services["svc"].requests_per_minute, 0);
        assert_eq!(later.recent_activity.requests_last_5min, 1);

        let much_later = metrics.snapshot_at(now + Duration::from_secs(600));
        assert_eq!(much_later.recent_activity.requests_last_5min, 0);
    }

    #[test]
    fn test_active_connections_never_negative() {
        let metrics = collector();
        metrics.connection_opened();
        metrics.connection_closed();
        metrics.connection_closed();
        assert_eq!(metrics.active_connections(), 0);
    }

    #[test]
    fn test_prometheus_exposition() {
        let metrics = collector();
        metrics.record_request(request(200, 20, "products"));
        metrics.record_request(request(200, 300, "products"));
        metrics.record_request(request(404, 20, "unknown"));

        let text = metrics.render_prometheus();
        assert_eq!(text.matches("# TYPE gateway_requests_total").count(), 1);
        assert_eq!(text.matches("# HELP service_requests_total").count(), 1);
        assert!(text.contains("gateway_requests_total 3"));
        assert!(text.contains("gateway_request_duration_seconds_bucket{le=\"0.05\"} 2"));
        assert!(text.contains("gateway_request_duration_seconds_bucket{le=\"0.5\"} 3"));
        assert!(text.contains("gateway_request_duration_seconds_bucket{le=\"+Inf\"} 3"));
        assert!(text.contains("gateway_status_codes_total{code=\"404\"} 1"));
        assert!(text.contains("service_requests_total{service=\"products\"} 2"));
    }

    #[test]
    fn test_prometheus_histogram_sum_and_label_escaping() {
        let metrics = collector();
        metrics.record_request(request(200, 250, "edge\"svc\\a\nb"));

        let text = metrics.render_prometheus();
        assert!(text.contains("gateway_request_duration_seconds_sum 0.25"));
        assert!(text.contains("gateway_request_duration_seconds_count 1"));
        assert!(text.contains(r#"service_requests_total{service="edge\"svc\\a\nb"} 1"#));
        assert!(!text.contains("a\nb\"} 1"));
    }

    #[test]
    fn test_prometheus_disabled_renders_nothing() {
        let config = MetricsConfig {
            prometheus_enabled: false,
            ..MetricsConfig::default()
        };
        let metrics = MetricsCollector::new(config);
        metrics.record_request(request(200, 20, "svc"));
        assert!(metrics.render_prometheus().is_empty());
    }

    #[tokio::test]
    async fn test_start_stop() {
        let metrics = Arc::new(collector());
        assert_eq!(metrics.health_status().status, "stopped");
        metrics.start();
        metrics.start();
        assert!(metrics.is_running());
        assert_eq!(metrics.health_status().status, "healthy");
        metrics.stop().await;
        assert!(!metrics.is_running());
    }
}
