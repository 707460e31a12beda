//! # Rate Limiting
//!
//! Sliding-window rate limiting across up to three dimensions per request:
//! client IP, authenticated user and target service. Each dimension maps to a
//! bucket key (`ip:…`, `user:…`, `service:…`) holding the timestamps of the
//! requests admitted in the trailing 60 seconds.
//!
//! A request is admitted only when every bucket is below both its per-minute
//! limit and its per-second burst limit; the timestamp is then appended to all
//! of them. The check and the append happen under one lock, so two concurrent
//! requests can never both take the last slot.
//!
//! ## Usage Example
//! ```rust,ignore
//! let limiter = RateLimiter::new(config.rate_limiting.clone());
//! let request = RateLimitRequest::new("10.0.0.1").with_service("orders");
//! let decision = limiter.check(&request);
//! if !decision.allowed {
//!     // 429 with decision.headers()
//! }
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use axum::http::{HeaderName, HeaderValue};
use metrics::counter;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::core::config::{RateLimitConfig, RateLimitRule};

/// Length of the sliding window
pub const WINDOW: Duration = Duration::from_secs(60);

/// Window the burst limit is counted over
pub const BURST_WINDOW: Duration = Duration::from_secs(1);

/// Value of `Retry-After` on rejection, in seconds
pub const RETRY_AFTER_SECS: u64 = 60;

/// What the limiter needs to know about one request
#[derive(Debug, Clone, Default)]
pub struct RateLimitRequest<'a> {
    pub client_ip: &'a str,
    pub user_id: Option<&'a str>,
    pub service: Option<&'a str>,
    /// Route-level override, applied to the service key only
    pub route_rule: Option<RateLimitRule>,
}

impl<'a> RateLimitRequest<'a> {
    pub fn new(client_ip: &'a str) -> Self {
        Self {
            client_ip,
            ..Default::default()
        }
    }

    pub fn with_user(mut self, user_id: Option<&'a str>) -> Self {
        self.user_id = user_id;
        self
    }

    pub fn with_service(mut self, service: &'a str) -> Self {
        self.service = Some(service);
        self
    }

    pub fn with_route_rule(mut self, rule: Option<RateLimitRule>) -> Self {
        self.route_rule = rule;
        self
    }
}

/// Limit state of the key reported in response headers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitStatus {
    pub key: String,
    pub limit: u32,
    pub remaining: u32,
    /// Epoch seconds
    pub reset: u64,
}

/// Rate limit decision result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// `None` when no dimension applied to the request
    pub status: Option<RateLimitStatus>,
    pub retry_after: Option<Duration>,
}

impl RateLimitDecision {
    fn unlimited() -> Self {
        Self {
            allowed: true,
            status: None,
            retry_after: None,
        }
    }

    /// `X-RateLimit-*` headers, plus `Retry-After` on rejection
    pub fn headers(&self) -> Vec<(HeaderName, HeaderValue)> {
        let mut headers = Vec::with_capacity(4);
        if let Some(status) = &self.status {
            headers.push((
                HeaderName::from_static("x-ratelimit-limit"),
                HeaderValue::from(status.limit),
            ));
            headers.push((
                HeaderName::from_static("x-ratelimit-remaining"),
                HeaderValue::from(status.remaining),
            ));
            headers.push((
                HeaderName::from_static("x-ratelimit-reset"),
                HeaderValue::from(status.reset),
            ));
        }
        if let Some(retry_after) = self.retry_after {
            headers.push((
                axum::http::header::RETRY_AFTER,
                HeaderValue::from(retry_after.as_secs()),
            ));
        }
        headers
    }
}

/// Rate limiting metrics
#[derive(Debug, Default)]
pub struct RateLimitMetrics {
    pub requests_allowed: AtomicU64,
    pub requests_denied: AtomicU64,
}

/// Snapshot of rate limiting metrics
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitMetricsSnapshot {
    pub requests_allowed: u64,
    pub requests_denied: u64,
    pub active_buckets: usize,
}

struct BucketKey {
    key: String,
    rule: RateLimitRule,
}

/// Sliding-window limiter over IP, user and service buckets
pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: Mutex<HashMap<String, VecDeque<Instant>>>,
    metrics: RateLimitMetrics,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: Mutex::new(HashMap::new()),
            metrics: RateLimitMetrics::default(),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    pub fn check(&self, request: &RateLimitRequest<'_>) -> RateLimitDecision {
        self.check_at(request, Instant::now())
    }

    /// Check and, if admitted, record `request` as happening at `now`
    pub fn check_at(&self, request: &RateLimitRequest<'_>, now: Instant) -> RateLimitDecision {
        if !self.config.enabled {
            return RateLimitDecision::unlimited();
        }

        let keys = self.bucket_keys(request);
        if keys.is_empty() {
            return RateLimitDecision::unlimited();
        }

        let reset = epoch_secs() + WINDOW.as_secs();
        let mut buckets = self.buckets.lock();

        for bucket_key in &keys {
            let count = match buckets.get_mut(&bucket_key.key) {
                Some(bucket) => {
                    prune(bucket, now);
                    bucket.len()
                }
                None => 0,
            };

            let burst = buckets
                .get(&bucket_key.key)
                .map(|bucket| count_since(bucket, now, BURST_WINDOW))
                .unwrap_or(0);

            let over_minute = count >= bucket_key.rule.rpm as usize;
            let over_burst = burst >= bucket_key.rule.burst as usize;
            if over_minute || over_burst {
                for pruned in &keys {
                    if buckets.get(&pruned.key).map_or(false, |bucket| bucket.is_empty()) {
                        buckets.remove(&pruned.key);
                    }
                }
                drop(buckets);

                self.metrics.requests_denied.fetch_add(1, Ordering::Relaxed);
                counter!("rate_limit_rejections_total", "dimension" => dimension(&bucket_key.key))
                    .increment(1);
                warn!(
                    key = %bucket_key.key,
                    rpm = bucket_key.rule.rpm,
                    burst = bucket_key.rule.burst,
                    burst_exceeded = !over_minute,
                    "Rate limit exceeded"
                );

                return RateLimitDecision {
                    allowed: false,
                    status: Some(RateLimitStatus {
                        key: bucket_key.key.clone(),
                        limit: bucket_key.rule.rpm,
                        remaining: 0,
                        reset,
                    }),
                    retry_after: Some(Duration::from_secs(RETRY_AFTER_SECS)),
                };
            }
        }

        let mut tightest: Option<RateLimitStatus> = None;
        for bucket_key in &keys {
            let bucket = buckets.entry(bucket_key.key.clone()).or_default();
            bucket.push_back(now);
            let remaining = (bucket_key.rule.rpm as usize).saturating_sub(bucket.len()) as u32;

            if tightest.as_ref().map_or(true, |t| remaining < t.remaining) {
                tightest = Some(RateLimitStatus {
                    key: bucket_key.key.clone(),
                    limit: bucket_key.rule.rpm,
                    remaining,
                    reset,
                });
            }
        }
        drop(buckets);

        self.metrics.requests_allowed.fetch_add(1, Ordering::Relaxed);
        debug!(keys = keys.len(), "Rate limit check passed");

        RateLimitDecision {
            allowed: true,
            status: tightest,
            retry_after: None,
        }
    }

    /// Forget every timestamp recorded under `key`
    pub fn reset(&self, key: &str) -> bool {
        self.buckets.lock().remove(key).is_some()
    }

    /// Prune every bucket to the window and drop the empty ones
    pub fn cleanup(&self, now: Instant) -> usize {
        let mut buckets = self.buckets.lock();
        let before = buckets.len();
        for bucket in buckets.values_mut() {
            prune(bucket, now);
        }
        buckets.retain(|_, bucket| !bucket.is_empty());
        before - buckets.len()
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.lock().len()
    }

    pub fn metrics(&self) -> RateLimitMetricsSnapshot {
        RateLimitMetricsSnapshot {
            requests_allowed: self.metrics.requests_allowed.load(Ordering::Relaxed),
            requests_denied: self.metrics.requests_denied.load(Ordering::Relaxed),
            active_buckets: self.bucket_count(),
        }
    }

    fn bucket_keys(&self, request: &RateLimitRequest<'_>) -> Vec<BucketKey> {
        let mut keys = Vec::with_capacity(3);

        if self.config.by_ip {
            let ip = if request.client_ip.is_empty() { "unknown" } else { request.client_ip };
            keys.push(self.bucket_key(format!("ip:{}", ip), None));
        }
        if self.config.by_user {
            if let Some(user_id) = request.user_id {
                keys.push(self.bucket_key(format!("user:{}", user_id), None));
            }
        }
        if self.config.by_service {
            if let Some(service) = request.service {
                keys.push(self.bucket_key(format!("service:{}", service), request.route_rule));
            }
        }

        keys
    }

    fn bucket_key(&self, key: String, route_rule: Option<RateLimitRule>) -> BucketKey {
        let rule = self
            .config
            .custom_limits
            .get(&key)
            .copied()
            .or(route_rule)
            .unwrap_or(RateLimitRule {
                rpm: self.config.default_rpm,
                burst: self.config.default_burst,
            });
        BucketKey { key, rule }
    }
}

fn prune(bucket: &mut VecDeque<Instant>, now: Instant) {
    while bucket
        .front()
        .map_or(false, |at| now.saturating_duration_since(*at) >= WINDOW)
    {
        bucket.pop_front();
    }
}

fn count_since(bucket: &VecDeque<Instant>, now: Instant, window: Duration) -> usize {
    bucket
        .iter()
        .rev()
        .take_while(|at| now.saturating_duration_since(**at) < window)
        .count()
}

fn dimension(key: &str) -> String {
    key.split(':').next().unwrap_or("unknown").to_string()
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
