//! # Rate Limiting Tests
//!
//! Sliding-window limits applied by the gateway per client IP, per user and
//! per service, including custom limits and the burst window.

use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::Request;
use axum::http::StatusCode;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

use dispatch_gateway::core::config::{
    GatewayConfig, InstanceConfig, RateLimitConfig, RateLimitRule, RouteConfig,
};
use dispatch_gateway::middleware::{RateLimitRequest, RateLimiter};
use dispatch_gateway::Gateway;

async fn gateway_with(upstream: &MockServer, rate_limiting: RateLimitConfig) -> Gateway {
    let addr = upstream.address();
    let mut route = RouteConfig::new("/api/v1/search/*", "search")
        .with_instance(InstanceConfig::new(addr.ip().to_string(), addr.port()));
    route.require_auth = false;

    let mut config = GatewayConfig::default();
    config.rate_limiting = rate_limiting;
    config.routes = vec![route];
    Gateway::new(config).unwrap()
}

fn from_client(ip: &str) -> Request {
    Request::builder()
        .uri("/api/v1/search/q")
        .header("X-Forwarded-For", ip)
        .body(Body::empty())
        .unwrap()
}

async fn ok_upstream() -> MockServer {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&upstream)
        .await;
    upstream
}

#[tokio::test]
async fn test_custom_ip_limit_isolates_clients() {
    let upstream = ok_upstream().await;
    let mut limits = RateLimitConfig::default();
    limits
        .custom_limits
        .insert("ip:198.51.100.1".to_string(), RateLimitRule { rpm: 2, burst: 10 });
    let gateway = gateway_with(&upstream, limits).await;

    for _ in 0..2 {
        let response = gateway.handle(from_client("198.51.100.1"), None).await;
        assert_eq!(response.status(), StatusCode::OK);
    }
    let response = gateway.handle(from_client("198.51.100.1"), None).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

    let response = gateway.handle(from_client("198.51.100.2"), None).await;
    assert_eq!(response.status(), StatusCode::OK);

    let snapshot = gateway.rate_limiter().metrics();
    assert_eq!(snapshot.requests_allowed, 3);
    assert_eq!(snapshot.requests_denied, 1);
}

#[tokio::test]
async fn test_burst_window_rejects_fast_clients() {
    let upstream = ok_upstream().await;
    let mut limits = RateLimitConfig::default();
    limits.default_burst = 2;
    limits.by_service = false;
    let gateway = gateway_with(&upstream, limits).await;

    assert_eq!(gateway.handle(from_client("203.0.113.9"), None).await.status(), StatusCode::OK);
    assert_eq!(gateway.handle(from_client("203.0.113.9"), None).await.status(), StatusCode::OK);
    assert_eq!(
        gateway.handle(from_client("203.0.113.9"), None).await.status(),
        StatusCode::TOO_MANY_REQUESTS
    );
}

#[tokio::test]
async fn test_disabled_limiter_adds_no_headers() {
    let upstream = ok_upstream().await;
    let mut limits = RateLimitConfig::default();
    limits.enabled = false;
    let gateway = gateway_with(&upstream, limits).await;

    let response = gateway.handle(from_client("203.0.113.9"), None).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get("x-ratelimit-limit").is_none());
}

#[test]
fn test_window_slides() {
    let limiter = RateLimiter::new(RateLimitConfig {
        default_rpm: 3,
        default_burst: 10,
        by_user: false,
        by_service: false,
        ..RateLimitConfig::default()
    });
    let request = RateLimitRequest::new("192.0.2.1");
    let start = Instant::now();

    for i in 0..3 {
        assert!(limiter.check_at(&request, start + Duration::from_secs(i * 2)).allowed);
    }
    assert!(!limiter.check_at(&request, start + Duration::from_secs(10)).allowed);

    // the first entry has aged out of the minute window
    let decision = limiter.check_at(&request, start + Duration::from_secs(61));
    assert!(decision.allowed);
    assert_eq!(decision.status.unwrap().remaining, 0);
}

#[test]
fn test_user_bucket_follows_the_caller() {
    let limiter = RateLimiter::new(RateLimitConfig {
        default_rpm: 1,
        default_burst: 10,
        by_ip: false,
        by_service: false,
        ..RateLimitConfig::default()
    });
    let now = Instant::now();

    let alice = RateLimitRequest::new("192.0.2.1").with_user(Some("alice"));
    let alice_elsewhere = RateLimitRequest::new("192.0.2.99").with_user(Some("alice"));
    let bob = RateLimitRequest::new("192.0.2.1").with_user(Some("bob"));

    assert!(limiter.check_at(&alice, now).allowed);
    assert!(!limiter.check_at(&alice_elsewhere, now).allowed);
    assert!(limiter.check_at(&bob, now).allowed);

    assert!(limiter.reset("user:alice"));
    assert!(limiter.check_at(&alice_elsewhere, now).allowed);
}
