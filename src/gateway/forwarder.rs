//! # Request Forwarder
//!
//! [`Gateway`] owns every dispatch component and runs the per-request
//! pipeline:
//!
//! route → auth → rate limit → sticky session / load balancer →
//! circuit-breaker-wrapped upstream call → metrics.
//!
//! It is also the only place that turns component results into HTTP
//! responses. Lower layers hand back typed results (`Option` from selection,
//! [`RateLimitDecision`], [`CircuitBreakerError`]) and the mapping to status
//! codes happens here.
//!
//! ## Rust Concepts Used
//!
//! - `Arc` shared components; no lock is held across an `.await`
//! - RAII guards ([`InFlightGuard`], [`OpenConnection`]) so a cancelled
//!   request still releases its counters
//! - `Bytes` request bodies, cloned cheaply for retries

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::{Body, Bytes};
use axum::extract::Request;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::auth::middleware::Authenticator;
use crate::core::circuit_breaker::{CircuitBreakerError, CircuitBreakerRegistry};
use crate::core::config::{GatewayConfig, RateLimitRule, RouteConfig};
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::{RequestContext, ServiceInstance};
use crate::load_balancing::{
    ConnectionStatsStore, InFlightGuard, SelectionContext, StickySessionManager,
};
use crate::middleware::rate_limiting::{RateLimitDecision, RateLimitRequest, RateLimiter};
use crate::observability::health::{HealthChecker, InstanceSource};
use crate::observability::metrics::{ErrorMetric, MetricsCollector, RequestMetric};
use crate::routing::router::{Route, Router};

/// Largest inbound body the gateway buffers before forwarding
pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Service label used for requests that never matched a route
const UNKNOWN_SERVICE: &str = "unknown";

/// Headers that describe a single connection and are never forwarded
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

/// Methods that may be replayed after a connection failure
fn is_idempotent(method: &Method) -> bool {
    matches!(
        *method,
        Method::GET | Method::HEAD | Method::OPTIONS | Method::PUT | Method::DELETE
    )
}

/// Client address: first `X-Forwarded-For` hop, then `X-Real-IP`, then the peer
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    if let Some(ip) = forwarded {
        return ip.to_string();
    }

    let real_ip = headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    if let Some(ip) = real_ip {
        return ip.to_string();
    }

    peer.map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Value of cookie `name` from the `Cookie` headers
pub fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Route-level limit override; a missing half falls back to the default
fn route_rule(route: &RouteConfig, default_rpm: u32, default_burst: u32) -> Option<RateLimitRule> {
    match (route.rate_limit_rpm, route.rate_limit_burst) {
        (None, None) => None,
        (rpm, burst) => Some(RateLimitRule {
            rpm: rpm.unwrap_or(default_rpm),
            burst: burst.unwrap_or(default_burst),
        }),
    }
}

/// Counts the request in the gateway's active connection gauge until dropped
struct OpenConnection<'a>(&'a MetricsCollector);

impl<'a> OpenConnection<'a> {
    fn open(metrics: &'a MetricsCollector) -> Self {
        metrics.connection_opened();
        Self(metrics)
    }
}

impl Drop for OpenConnection<'_> {
    fn drop(&mut self) {
        self.0.connection_closed();
    }
}

struct UpstreamResponse {
    status: reqwest::StatusCode,
    headers: reqwest::header::HeaderMap,
    body: Bytes,
}

async fn send_upstream(request: reqwest::RequestBuilder) -> Result<UpstreamResponse, reqwest::Error> {
    let response = request.send().await?;
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.bytes().await?;
    Ok(UpstreamResponse {
        status,
        headers,
        body,
    })
}

/// Inbound request parts the pipeline needs after the body is taken
struct Inbound {
    method: Method,
    path: String,
    query: Option<String>,
    headers: HeaderMap,
}

struct HousekeepingTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// The gateway dispatch core and lifecycle owner
pub struct Gateway {
    config: GatewayConfig,
    router: Arc<Router>,
    stats: Arc<ConnectionStatsStore>,
    sticky: Arc<StickySessionManager>,
    health_checker: Arc<HealthChecker>,
    breakers: Arc<CircuitBreakerRegistry>,
    rate_limiter: Arc<RateLimiter>,
    metrics: Arc<MetricsCollector>,
    authenticator: Arc<Authenticator>,
    housekeeping: Mutex<Option<HousekeepingTask>>,
}

impl Gateway {
    /// Build every component from `config` and register its routes
    pub fn new(config: GatewayConfig) -> GatewayResult<Self> {
        let stats = Arc::new(ConnectionStatsStore::new());
        let router = Arc::new(Router::new(Arc::clone(&stats)));
        for route in &config.routes {
            router.add_route(route.clone())?;
        }

        let health_checker = Arc::new(HealthChecker::new(
            config.load_balancer.health_check.clone(),
            None,
        )?);
        let authenticator = Arc::new(Authenticator::from_config(config.auth.clone())?);

        info!(
            routes = router.len(),
            sticky_sessions = config.load_balancer.sticky_sessions,
            auth_enabled = config.auth.enabled,
            rate_limiting = config.rate_limiting.enabled,
            "Gateway initialized"
        );

        Ok(Self {
            sticky: Arc::new(StickySessionManager::new(config.load_balancer.session_ttl)),
            breakers: Arc::new(CircuitBreakerRegistry::new(config.circuit_breaker.clone())),
            rate_limiter: Arc::new(RateLimiter::new(config.rate_limiting.clone())),
            metrics: Arc::new(MetricsCollector::new(config.metrics.clone())),
            router,
            stats,
            health_checker,
            authenticator,
            housekeeping: Mutex::new(None),
            config,
        })
    }

    /// Replace the authenticator, e.g. to plug in a custom token validator
    pub fn with_authenticator(mut self, authenticator: Authenticator) -> Self {
        self.authenticator = Arc::new(authenticator);
        self
    }

    /// Replace the health checker, e.g. to use a custom probe
    pub fn with_health_checker(mut self, health_checker: Arc<HealthChecker>) -> Self {
        self.health_checker = health_checker;
        self
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn stats(&self) -> &Arc<ConnectionStatsStore> {
        &self.stats
    }

    pub fn sticky_sessions(&self) -> &Arc<StickySessionManager> {
        &self.sticky
    }

    pub fn health_checker(&self) -> &Arc<HealthChecker> {
        &self.health_checker
    }

    pub fn circuit_breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    pub fn authenticator(&self) -> &Arc<Authenticator> {
        &self.authenticator
    }

    /// Unregister a route and drop per-instance state no other route uses
    pub fn remove_route(&self, pattern: &str) -> bool {
        let Some(removed) = self.router.take_route(pattern) else {
            return false;
        };

        let still_routed: HashSet<String> = self
            .router
            .routes()
            .iter()
            .flat_map(|route| route.instances.iter().map(|instance| instance.key()))
            .collect();

        for instance in &removed.instances {
            let key = instance.key();
            if !still_routed.contains(&key) {
                self.health_checker.forget(&key);
                self.stats.remove(&key);
            }
        }
        true
    }

    /// Launch health checking, the metrics sweep and state housekeeping
    pub fn start(&self) {
        if self.config.load_balancer.health_check.enabled {
            let source: Arc<dyn InstanceSource> = self.router.clone();
            self.health_checker.start(source);
        }
        if self.config.metrics.enabled {
            self.metrics.start();
        }

        let mut housekeeping = self.housekeeping.lock();
        if housekeeping.is_some() {
            return;
        }

        let token = CancellationToken::new();
        let loop_token = token.clone();
        let sticky = Arc::clone(&self.sticky);
        let rate_limiter = Arc::clone(&self.rate_limiter);
        let authenticator = Arc::clone(&self.authenticator);
        let period = self.config.metrics.sweep_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = loop_token.cancelled() => break,
                    _ = ticker.tick() => {
                        let sessions = sticky.cleanup_expired();
                        let buckets = rate_limiter.cleanup(Instant::now());
                        let tokens = authenticator.purge_expired();
                        debug!(
                            sessions = sessions,
                            buckets = buckets,
                            tokens = tokens,
                            "Housekeeping removed expired state"
                        );
                    }
                }
            }
        });

        *housekeeping = Some(HousekeepingTask { token, handle });
        info!("Gateway background tasks started");
    }

    /// Stop every background task and wait for them to finish
    pub async fn shutdown(&self) {
        self.health_checker.stop().await;
        self.metrics.stop().await;

        let task = self.housekeeping.lock().take();
        if let Some(task) = task {
            task.token.cancel();
            if let Err(e) = task.handle.await {
                error!(error = %e, "Housekeeping task ended abnormally");
            }
        }
        info!("Gateway background tasks stopped");
    }

    /// Dispatch one inbound request to its upstream
    pub async fn handle(&self, request: Request, peer: Option<SocketAddr>) -> Response {
        let _open = OpenConnection::open(&self.metrics);
        let (parts, body) = request.into_parts();

        let trace_id = parts
            .headers
            .get(self.config.tracing.trace_header.as_str())
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(str::to_string);
        let mut ctx = RequestContext::new(trace_id);
        ctx.client_ip = Some(client_ip(&parts.headers, peer));
        if self.config.load_balancer.sticky_sessions {
            ctx.session_id = cookie_value(&parts.headers, &self.config.load_balancer.session_cookie_name);
        }

        let inbound = Inbound {
            method: parts.method,
            path: parts.uri.path().to_string(),
            query: parts.uri.query().map(str::to_string),
            headers: parts.headers,
        };

        // 1. route
        let Some(route) = self.router.match_route(&inbound.path) else {
            debug!(path = %inbound.path, "No route matched");
            let err = GatewayError::route_not_found(inbound.path.clone());
            return self.reject(&inbound, &ctx, UNKNOWN_SERVICE, err, None);
        };

        // 2. auth
        match self
            .authenticator
            .authenticate(&inbound.path, &inbound.headers, &route.config)
            .await
        {
            Ok(outcome) => ctx.auth = outcome.into_context(),
            Err(err) => return self.reject(&inbound, &ctx, route.service_name(), err, None),
        }

        // 3. rate limit
        let decision = {
            let rules = &self.config.rate_limiting;
            let request = RateLimitRequest::new(ctx.client_ip.as_deref().unwrap_or("unknown"))
                .with_user(ctx.user_id())
                .with_service(route.service_name())
                .with_route_rule(route_rule(&route.config, rules.default_rpm, rules.default_burst));
            self.rate_limiter.check(&request)
        };
        if !decision.allowed {
            let limit = decision.status.as_ref().map_or(0, |s| s.limit);
            let err = GatewayError::RateLimitExceeded {
                limit,
                window: "minute".to_string(),
            };
            return self.reject(&inbound, &ctx, route.service_name(), err, Some(&decision));
        }

        let body = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
            Ok(body) => body,
            Err(e) => {
                let err = GatewayError::validation("body", format!("Failed to read request body: {}", e));
                return self.reject(&inbound, &ctx, route.service_name(), err, Some(&decision));
            }
        };

        // 4-9. select, forward, respond
        match self.forward(&route, &inbound, &ctx, body).await {
            Ok(upstream) => self.respond(&route, &inbound, &ctx, upstream, &decision),
            Err(err) => self.reject(&inbound, &ctx, route.service_name(), err, Some(&decision)),
        }
    }

    /// Sticky session first, then the route's balancer
    fn select_instance(&self, route: &Route, ctx: &RequestContext) -> Option<Arc<ServiceInstance>> {
        let eligible = route.eligible_instances();
        if eligible.is_empty() {
            return None;
        }

        let session_id = ctx.session_id.as_deref();
        if let Some(session_id) = session_id {
            if let Some(instance) = self.sticky.get_instance(session_id, &eligible) {
                debug!(session_id = %session_id, instance = %instance.key(), "Using sticky session");
                return Some(instance);
            }
        }

        let selection = SelectionContext {
            client_ip: ctx.client_ip.clone(),
            session_id: ctx.session_id.clone(),
        };
        let instance = route.select(&eligible, &selection)?;

        if let Some(session_id) = session_id {
            self.sticky.create(session_id, &instance);
        }
        Some(instance)
    }

    /// Send the request upstream, retrying connection failures per the route policy
    async fn forward(
        &self,
        route: &Route,
        inbound: &Inbound,
        ctx: &RequestContext,
        body: Bytes,
    ) -> GatewayResult<UpstreamResponse> {
        let service = route.service_name();
        let breaker = self.breakers.get_or_create(service);
        let retries_allowed = if is_idempotent(&inbound.method) {
            route.config.max_retries
        } else {
            0
        };

        let mut attempt: u32 = 0;
        loop {
            let instance = self
                .select_instance(route, ctx)
                .ok_or_else(|| GatewayError::no_healthy_upstream(service))?;

            let guard: InFlightGuard = self.stats.begin(&instance.key());
            let url = self.upstream_url(route, &instance, inbound);
            let request = self.build_request(route, inbound, ctx, &url, body.clone())?;

            debug!(
                trace_id = %ctx.trace_id,
                service = %service,
                instance = %instance.key(),
                url = %url,
                attempt = attempt,
                "Forwarding request"
            );

            match breaker.call(send_upstream(request)).await {
                Ok(upstream) => {
                    let elapsed = guard.elapsed();
                    guard.finish(true, Some(elapsed));
                    return Ok(upstream);
                }
                Err(err) => {
                    guard.finish(false, None);
                    let err = self.classify(route, err);

                    let retryable = matches!(err, GatewayError::UpstreamConnect { .. });
                    if retryable && attempt < retries_allowed {
                        let backoff = retry_delay(route.config.retry_backoff, attempt);
                        warn!(
                            trace_id = %ctx.trace_id,
                            service = %service,
                            instance = %instance.key(),
                            attempt = attempt + 1,
                            backoff = ?backoff,
                            error = %err,
                            "Upstream connection failed, retrying"
                        );
                        tokio::time::sleep(backoff).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(err);
                }
            }
        }
    }

    fn classify(&self, route: &Route, err: CircuitBreakerError<reqwest::Error>) -> GatewayError {
        let service = route.service_name().to_string();
        match err {
            CircuitBreakerError::Open => GatewayError::CircuitBreakerOpen { service },
            CircuitBreakerError::Timeout(limit) => GatewayError::Timeout {
                timeout_ms: limit.as_millis() as u64,
            },
            CircuitBreakerError::Inner(e) if e.is_connect() => GatewayError::UpstreamConnect {
                service,
                message: e.to_string(),
            },
            CircuitBreakerError::Inner(e) if e.is_timeout() => GatewayError::Timeout {
                timeout_ms: route.config.read_timeout.as_millis() as u64,
            },
            CircuitBreakerError::Inner(e) => GatewayError::Upstream {
                service,
                message: e.to_string(),
            },
        }
    }

    fn upstream_url(&self, route: &Route, instance: &ServiceInstance, inbound: &Inbound) -> String {
        let mut url = format!("{}{}", instance.base_url(), route.upstream_path(&inbound.path));
        if let Some(query) = &inbound.query {
            url.push('?');
            url.push_str(query);
        }
        url
    }

    fn build_request(
        &self,
        route: &Route,
        inbound: &Inbound,
        ctx: &RequestContext,
        url: &str,
        body: Bytes,
    ) -> GatewayResult<reqwest::RequestBuilder> {
        let method = reqwest::Method::from_bytes(inbound.method.as_str().as_bytes())
            .map_err(|e| GatewayError::validation("method", e.to_string()))?;

        let mut headers = reqwest::header::HeaderMap::new();
        for (name, value) in &inbound.headers {
            let name = name.as_str();
            if is_hop_by_hop(name)
                || name == "host"
                || name == "content-length"
                || route
                    .config
                    .remove_headers
                    .iter()
                    .any(|removed| removed.eq_ignore_ascii_case(name))
            {
                continue;
            }
            append_outbound(&mut headers, name, value.as_bytes());
        }

        for (name, value) in &route.config.add_headers {
            insert_outbound(&mut headers, name, value.as_bytes());
        }

        let tracing = &self.config.tracing;
        if tracing.enabled {
            insert_outbound(&mut headers, &tracing.trace_header, ctx.trace_id.as_bytes());
            insert_outbound(&mut headers, &tracing.span_header, ctx.span_id.as_bytes());
        }

        if let Some(ip) = &ctx.client_ip {
            let forwarded = match inbound
                .headers
                .get("x-forwarded-for")
                .and_then(|v| v.to_str().ok())
            {
                Some(existing) => format!("{}, {}", existing, ip),
                None => ip.clone(),
            };
            insert_outbound(&mut headers, "x-forwarded-for", forwarded.as_bytes());
        }

        Ok(route
            .client()
            .request(method, url)
            .headers(headers)
            .timeout(route.config.read_timeout)
            .body(body))
    }

    fn respond(
        &self,
        route: &Route,
        inbound: &Inbound,
        ctx: &RequestContext,
        upstream: UpstreamResponse,
        decision: &RateLimitDecision,
    ) -> Response {
        let status = StatusCode::from_u16(upstream.status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
        let mut response = Response::new(Body::from(upstream.body));
        *response.status_mut() = status;

        let headers = response.headers_mut();
        for (name, value) in &upstream.headers {
            let name = name.as_str();
            if is_hop_by_hop(name) || name == "content-length" {
                continue;
            }
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_bytes(value.as_bytes()),
            ) {
                headers.append(name, value);
            }
        }
        self.decorate(&mut response, ctx, Some(decision));

        let duration = ctx.started_at.elapsed();
        self.metrics.record_request(
            RequestMetric::new(
                inbound.method.as_str(),
                inbound.path.clone(),
                status.as_u16(),
                duration,
                route.service_name(),
            )
            .with_user(ctx.user_id().map(str::to_string))
            .with_trace(ctx.trace_id.clone()),
        );

        info!(
            trace_id = %ctx.trace_id,
            method = %inbound.method,
            path = %inbound.path,
            service = %route.service_name(),
            status = status.as_u16(),
            duration_ms = duration.as_millis() as u64,
            "Request completed"
        );

        response
    }

    /// Gateway-generated error response, recorded in metrics like any other
    fn reject(
        &self,
        inbound: &Inbound,
        ctx: &RequestContext,
        service: &str,
        err: GatewayError,
        decision: Option<&RateLimitDecision>,
    ) -> Response {
        let status = err.status_code();
        let duration = ctx.started_at.elapsed();
        let user_id = ctx.user_id().map(str::to_string);

        self.metrics.record_request(
            RequestMetric::new(inbound.method.as_str(), inbound.path.clone(), status.as_u16(), duration, service)
                .with_user(user_id.clone())
                .with_trace(ctx.trace_id.clone()),
        );
        self.metrics.record_error(
            ErrorMetric::new(
                inbound.method.as_str(),
                inbound.path.clone(),
                err.error_type(),
                err.to_string(),
                service,
            )
            .with_user(user_id)
            .with_trace(ctx.trace_id.clone()),
        );

        if status.is_server_error() {
            error!(
                trace_id = %ctx.trace_id,
                method = %inbound.method,
                path = %inbound.path,
                service = %service,
                status = status.as_u16(),
                error = %err,
                "Request failed"
            );
        } else {
            warn!(
                trace_id = %ctx.trace_id,
                method = %inbound.method,
                path = %inbound.path,
                service = %service,
                status = status.as_u16(),
                error = %err,
                "Request rejected"
            );
        }

        let mut response = err.into_response();
        self.decorate(&mut response, ctx, decision);
        response
    }

    /// Trace and rate-limit headers for the caller
    fn decorate(&self, response: &mut Response, ctx: &RequestContext, decision: Option<&RateLimitDecision>) {
        let tracing = &self.config.tracing;
        let headers = response.headers_mut();
        if tracing.enabled {
            for (name, value) in [
                (tracing.trace_header.as_str(), ctx.trace_id.as_str()),
                (tracing.span_header.as_str(), ctx.span_id.as_str()),
            ] {
                if let (Ok(name), Ok(value)) = (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
                    headers.insert(name, value);
                }
            }
        }

        if let Some(decision) = decision {
            for (name, value) in decision.headers() {
                headers.insert(name, value);
            }
        }
    }
}

fn outbound_pair(
    name: &str,
    value: &[u8],
) -> Option<(reqwest::header::HeaderName, reqwest::header::HeaderValue)> {
    let name = reqwest::header::HeaderName::from_bytes(name.as_bytes()).ok()?;
    let value = reqwest::header::HeaderValue::from_bytes(value).ok()?;
    Some((name, value))
}

fn append_outbound(headers: &mut reqwest::header::HeaderMap, name: &str, value: &[u8]) {
    if let Some((name, value)) = outbound_pair(name, value) {
        headers.append(name, value);
    }
}

fn insert_outbound(headers: &mut reqwest::header::HeaderMap, name: &str, value: &[u8]) {
    match outbound_pair(name, value) {
        Some((name, value)) => {
            headers.insert(name, value);
        }
        None => warn!(header = %name, "Skipping invalid outbound header"),
    }
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("routes", &self.router.len())
            .field("sticky_sessions", &self.sticky.len())
            .finish()
    }
}

/// Backoff before retry number `attempt` (zero-based)
pub fn retry_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_ip_precedence() {
        let peer: SocketAddr = "192.168.1.9:5000".parse().unwrap();
        let mut headers = HeaderMap::new();
        assert_eq!(client_ip(&headers, Some(peer)), "192.168.1.9");
        assert_eq!(client_ip(&headers, None), "unknown");

        headers.insert("x-real-ip", HeaderValue::from_static("10.1.1.1"));
        assert_eq!(client_ip(&headers, Some(peer)), "10.1.1.1");

        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.7, 10.0.0.1"));
        assert_eq!(client_ip(&headers, Some(peer)), "203.0.113.7");
    }

    #[test]
    fn test_cookie_value() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("theme=dark; gateway_session=abc123; other=1"),
        );
        assert_eq!(cookie_value(&headers, "gateway_session").as_deref(), Some("abc123"));
        assert_eq!(cookie_value(&headers, "missing"), None);
    }

    #[test]
    fn test_idempotent_methods() {
        assert!(is_idempotent(&Method::GET));
        assert!(is_idempotent(&Method::DELETE));
        assert!(!is_idempotent(&Method::POST));
        assert!(!is_idempotent(&Method::PATCH));
    }

    #[test]
    fn test_hop_by_hop() {
        assert!(is_hop_by_hop("Connection"));
        assert!(is_hop_by_hop("transfer-encoding"));
        assert!(!is_hop_by_hop("content-type"));
    }

    #[test]
    fn test_route_rule_fallbacks() {
        let mut route = RouteConfig::new("/a/*", "a");
        assert_eq!(route_rule(&route, 1000, 100), None);

        route.rate_limit_rpm = Some(10);
        assert_eq!(route_rule(&route, 1000, 100), Some(RateLimitRule { rpm: 10, burst: 100 }));

        route.rate_limit_burst = Some(2);
        assert_eq!(route_rule(&route, 1000, 100), Some(RateLimitRule { rpm: 10, burst: 2 }));
    }

    #[test]
    fn test_retry_delay_doubles() {
        let base = Duration::from_millis(100);
        assert_eq!(retry_delay(base, 0), Duration::from_millis(100));
        assert_eq!(retry_delay(base, 1), Duration::from_millis(200));
        assert_eq!(retry_delay(base, 3), Duration::from_millis(800));
        assert_eq!(retry_delay(Duration::MAX, 2), Duration::MAX);
        assert_eq!(retry_delay(Duration::from_secs(u64::MAX / 2), 40), Duration::MAX);
    }
}
