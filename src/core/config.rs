//! # Configuration Module
//!
//! Typed configuration for the gateway, loaded once at startup and validated
//! before any component is built from it.
//!
//! ## Key Features
//! - YAML/JSON configuration parsing with serde
//! - Human readable durations (`"30s"`, `"5m"`) through `humantime_serde`
//! - Environment variable overrides following `GATEWAY_<SECTION>_<FIELD>`
//! - Validation that reports every problem at once
//!
//! Every section uses `#[serde(default)]`, so a config file only has to name
//! what differs from the defaults.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::circuit_breaker::CircuitBreakerConfig;
use crate::core::error::{GatewayError, GatewayResult};

/// Main gateway configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Listener addresses for the proxy and admin surfaces
    pub server: ServerConfig,

    /// Health checking and sticky sessions
    pub load_balancer: LoadBalancerConfig,

    /// Defaults applied to every per-service breaker
    pub circuit_breaker: CircuitBreakerConfig,

    pub rate_limiting: RateLimitConfig,

    pub auth: AuthConfig,

    /// Trace header propagation
    pub tracing: TracingConfig,

    pub metrics: MetricsConfig,

    /// Cross-origin policy applied to the gateway port
    pub cors: CorsConfig,

    /// Route definitions, matched in order
    pub routes: Vec<RouteConfig>,
}

impl GatewayConfig {
    /// Load configuration from a YAML file
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> GatewayResult<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| GatewayError::config(format!("Failed to read config file: {}", e)))?;

        let mut config: GatewayConfig = serde_yaml::from_str(&content)
            .map_err(|e| GatewayError::config(format!("Failed to parse config: {}", e)))?;

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from JSON
    pub async fn load_from_json<P: AsRef<Path>>(path: P) -> GatewayResult<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| GatewayError::config(format!("Failed to read config file: {}", e)))?;

        let mut config: GatewayConfig = serde_json::from_str(&content)
            .map_err(|e| GatewayError::config(format!("Failed to parse JSON config: {}", e)))?;

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Pick the parser from the file extension (`.json` or YAML otherwise)
    pub async fn load<P: AsRef<Path>>(path: P) -> GatewayResult<Self> {
        let is_json = path
            .as_ref()
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        if is_json {
            Self::load_from_json(path).await
        } else {
            Self::load_from_file(path).await
        }
    }

    /// Apply environment variable overrides to configuration
    ///
    /// Environment variables follow the pattern: GATEWAY_<SECTION>_<FIELD>
    /// For example: GATEWAY_SERVER_PORT=8080
    pub fn apply_env_overrides(&mut self) -> GatewayResult<()> {
        use std::env;

        if let Ok(host) = env::var("GATEWAY_SERVER_HOST") {
            self.server.host = host;
        }

        if let Ok(port) = env::var("GATEWAY_SERVER_PORT") {
            self.server.port = port
                .parse()
                .map_err(|e| GatewayError::config(format!("Invalid GATEWAY_SERVER_PORT: {}", e)))?;
        }

        if let Ok(port) = env::var("GATEWAY_SERVER_ADMIN_PORT") {
            self.server.admin_port = Some(port.parse().map_err(|e| {
                GatewayError::config(format!("Invalid GATEWAY_SERVER_ADMIN_PORT: {}", e))
            })?);
        }

        if let Ok(interval) = env::var("GATEWAY_HEALTH_CHECK_INTERVAL") {
            self.load_balancer.health_check.interval = humantime::parse_duration(&interval)
                .map_err(|e| {
                    GatewayError::config(format!("Invalid GATEWAY_HEALTH_CHECK_INTERVAL: {}", e))
                })?;
        }

        if let Ok(rpm) = env::var("GATEWAY_RATE_LIMIT_DEFAULT_RPM") {
            self.rate_limiting.default_rpm = rpm.parse().map_err(|e| {
                GatewayError::config(format!("Invalid GATEWAY_RATE_LIMIT_DEFAULT_RPM: {}", e))
            })?;
        }

        if let Ok(burst) = env::var("GATEWAY_RATE_LIMIT_DEFAULT_BURST") {
            self.rate_limiting.default_burst = burst.parse().map_err(|e| {
                GatewayError::config(format!("Invalid GATEWAY_RATE_LIMIT_DEFAULT_BURST: {}", e))
            })?;
        }

        if let Ok(secret) = env::var("GATEWAY_AUTH_JWT_SECRET") {
            self.auth.jwt_secret = secret;
        }

        Ok(())
    }

    /// Validate the whole configuration, reporting every problem in one error
    pub fn validate(&self) -> GatewayResult<()> {
        let mut errors = Vec::new();

        if self.server.host.is_empty() {
            errors.push("server.host cannot be empty".to_string());
        }
        if self.server.port == 0 {
            errors.push("server.port must be greater than 0".to_string());
        }
        if self.server.admin_port() == self.server.port {
            errors.push("server.admin_port must differ from server.port".to_string());
        }

        let health = &self.load_balancer.health_check;
        if health.enabled {
            if health.interval.is_zero() {
                errors.push("load_balancer.health_check.interval must be greater than 0".to_string());
            }
            if health.timeout.is_zero() {
                errors.push("load_balancer.health_check.timeout must be greater than 0".to_string());
            }
            if !health.path.starts_with('/') {
                errors.push("load_balancer.health_check.path must start with '/'".to_string());
            }
        }
        if self.load_balancer.sticky_sessions && self.load_balancer.session_cookie_name.is_empty() {
            errors.push("load_balancer.session_cookie_name cannot be empty".to_string());
        }

        if self.circuit_breaker.failure_threshold == 0 {
            errors.push("circuit_breaker.failure_threshold must be greater than 0".to_string());
        }
        if self.circuit_breaker.success_threshold == 0 {
            errors.push("circuit_breaker.success_threshold must be greater than 0".to_string());
        }
        if self.circuit_breaker.call_timeout.is_zero() {
            errors.push("circuit_breaker.call_timeout must be greater than 0".to_string());
        }

        if self.rate_limiting.default_rpm == 0 {
            errors.push("rate_limiting.default_rpm must be greater than 0".to_string());
        }
        if self.rate_limiting.default_burst == 0 {
            errors.push("rate_limiting.default_burst must be greater than 0".to_string());
        }
        for (key, rule) in &self.rate_limiting.custom_limits {
            if rule.rpm == 0 || rule.burst == 0 {
                errors.push(format!(
                    "rate_limiting.custom_limits['{}'] must have non-zero rpm and burst",
                    key
                ));
            }
        }

        if self.auth.enabled {
            if self.auth.jwt_secret.is_empty() {
                errors.push("auth.jwt_secret must be set when auth is enabled".to_string());
            }
            if !matches!(self.auth.jwt_algorithm.as_str(), "HS256" | "HS384" | "HS512") {
                errors.push(format!(
                    "auth.jwt_algorithm '{}' is not supported",
                    self.auth.jwt_algorithm
                ));
            }
        }

        if self.tracing.trace_header.is_empty() || self.tracing.span_header.is_empty() {
            errors.push("tracing headers cannot be empty".to_string());
        }

        self.cors.collect_errors(&mut errors);

        let mut seen = std::collections::HashSet::new();
        for (index, route) in self.routes.iter().enumerate() {
            route.collect_errors(index, &mut errors);
            if !seen.insert(route.path.as_str()) {
                errors.push(format!("Duplicate route path: {}", route.path));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(GatewayError::config(format!(
                "Configuration validation failed:\n{}",
                errors.join("\n")
            )))
        }
    }
}

/// Server configuration for both listeners
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,

    /// Proxy port
    pub port: u16,

    /// Admin port; `port + 1000` when unset
    pub admin_port: Option<u16>,
}

impl ServerConfig {
    pub fn admin_port(&self) -> u16 {
        self.admin_port
            .unwrap_or_else(|| self.port.saturating_add(1000))
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            admin_port: None,
        }
    }
}

/// Load balancing algorithm of a route
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancingAlgorithm {
    #[default]
    RoundRobin,
    LeastConnections,
    WeightedRoundRobin,
    IpHash,
    Random,
}

impl LoadBalancingAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RoundRobin => "round_robin",
            Self::LeastConnections => "least_connections",
            Self::WeightedRoundRobin => "weighted_round_robin",
            Self::IpHash => "ip_hash",
            Self::Random => "random",
        }
    }
}

/// How an instance is probed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthCheckMethod {
    #[default]
    HttpGet,
    HttpPost,
    TcpConnect,
    /// Uses the probe handed to the health checker at construction time
    Custom,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    pub enabled: bool,

    #[serde(with = "humantime_serde")]
    pub interval: Duration,

    /// Deadline for a single probe
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    pub method: HealthCheckMethod,

    pub path: String,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(10),
            method: HealthCheckMethod::HttpGet,
            path: "/health".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadBalancerConfig {
    pub health_check: HealthCheckConfig,

    pub sticky_sessions: bool,

    pub session_cookie_name: String,

    /// How long a sticky pin lives
    #[serde(with = "humantime_serde")]
    pub session_ttl: Duration,
}

impl Default for LoadBalancerConfig {
    fn default() -> Self {
        Self {
            health_check: HealthCheckConfig::default(),
            sticky_sessions: false,
            session_cookie_name: "gateway_session".to_string(),
            session_ttl: Duration::from_secs(3600),
        }
    }
}

/// Explicit limit for one rate-limit key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRule {
    /// Requests per minute
    pub rpm: u32,
    /// Requests per second
    pub burst: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub default_rpm: u32,
    pub default_burst: u32,
    pub by_ip: bool,
    pub by_user: bool,
    pub by_service: bool,

    /// Keyed by the full bucket key, e.g. `"ip:10.0.0.1"` or `"service:orders"`
    pub custom_limits: HashMap<String, RateLimitRule>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_rpm: 1000,
            default_burst: 100,
            by_ip: true,
            by_user: true,
            by_service: true,
            custom_limits: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub enabled: bool,

    pub jwt_secret: String,

    /// One of HS256, HS384, HS512
    pub jwt_algorithm: String,

    /// Paths that never require a token; a trailing `*` matches by prefix
    pub public_paths: Vec<String>,

    /// How long a validated token is cached
    #[serde(with = "humantime_serde")]
    pub cache_ttl: Duration,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            jwt_secret: String::new(),
            jwt_algorithm: "HS256".to_string(),
            public_paths: vec![
                "/health".to_string(),
                "/metrics".to_string(),
                "/api/v1/auth/login".to_string(),
                "/api/v1/auth/register".to_string(),
            ],
            cache_ttl: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TracingConfig {
    /// Send trace and span headers upstream and back to the caller
    pub enabled: bool,
    pub trace_header: String,
    pub span_header: String,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            trace_header: "X-Trace-ID".to_string(),
            span_header: "X-Span-ID".to_string(),
        }
    }
}

/// Cross-origin policy for the gateway port
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorsConfig {
    pub enabled: bool,

    /// Exact origins, or `*` for any
    pub allowed_origins: Vec<String>,

    pub allowed_methods: Vec<String>,

    /// Header names, or `*` for any
    pub allowed_headers: Vec<String>,

    pub allow_credentials: bool,

    /// How long browsers may cache a preflight answer
    #[serde(with = "humantime_serde")]
    pub max_age: Duration,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            allowed_origins: vec!["*".to_string()],
            allowed_methods: ["GET", "POST", "PUT", "DELETE", "PATCH", "OPTIONS"]
                .iter()
                .map(|m| m.to_string())
                .collect(),
            allowed_headers: vec!["*".to_string()],
            allow_credentials: true,
            max_age: Duration::from_secs(86_400),
        }
    }
}

impl CorsConfig {
    fn collect_errors(&self, errors: &mut Vec<String>) {
        if !self.enabled {
            return;
        }
        for origin in self.allowed_origins.iter().filter(|o| o.as_str() != "*") {
            if axum::http::HeaderValue::from_str(origin).is_err() {
                errors.push(format!("cors.allowed_origins entry '{}' is not a valid origin", origin));
            }
        }
        for method in self.allowed_methods.iter().filter(|m| m.as_str() != "*") {
            if method.parse::<axum::http::Method>().is_err() {
                errors.push(format!("cors.allowed_methods entry '{}' is not a valid method", method));
            }
        }
        for name in self.allowed_headers.iter().filter(|h| h.as_str() != "*") {
            if name.parse::<axum::http::HeaderName>().is_err() {
                errors.push(format!("cors.allowed_headers entry '{}' is not a valid header name", name));
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,

    /// Install the Prometheus recorder and append its output to `/metrics`
    pub prometheus_enabled: bool,

    /// Entries older than this are dropped by the sweep
    #[serde(with = "humantime_serde")]
    pub retention: Duration,

    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            prometheus_enabled: true,
            retention: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(300),
        }
    }
}

/// One upstream instance as written in the config file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceConfig {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

impl InstanceConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            weight: 1,
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }
}

/// Route definition
///
/// `path` is an exact path, `prefix/*` or a bare `prefix*`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteConfig {
    pub path: String,

    pub service_name: String,

    #[serde(alias = "instances")]
    pub upstream_instances: Vec<InstanceConfig>,

    #[serde(alias = "algorithm")]
    pub load_balancing_algorithm: LoadBalancingAlgorithm,

    pub require_auth: bool,

    /// Empty means any authenticated caller
    pub allowed_roles: Vec<String>,

    pub rate_limit_rpm: Option<u32>,

    pub rate_limit_burst: Option<u32>,

    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    #[serde(with = "humantime_serde")]
    pub read_timeout: Duration,

    pub max_retries: u32,

    /// Base delay, doubled on every further attempt
    #[serde(with = "humantime_serde")]
    pub retry_backoff: Duration,

    pub health_check_enabled: bool,

    pub strip_path_prefix: bool,

    pub add_headers: HashMap<String, String>,

    pub remove_headers: Vec<String>,
}

impl Default for RouteConfig {
    fn default() -> Self {
        Self {
            path: String::new(),
            service_name: String::new(),
            upstream_instances: Vec::new(),
            load_balancing_algorithm: LoadBalancingAlgorithm::RoundRobin,
            require_auth: true,
            allowed_roles: Vec::new(),
            rate_limit_rpm: None,
            rate_limit_burst: None,
            connect_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(60),
            max_retries: 3,
            retry_backoff: Duration::from_secs(1),
            health_check_enabled: true,
            strip_path_prefix: true,
            add_headers: HashMap::new(),
            remove_headers: Vec::new(),
        }
    }
}

impl RouteConfig {
    pub fn new(path: impl Into<String>, service_name: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            service_name: service_name.into(),
            ..Self::default()
        }
    }

    pub fn with_instance(mut self, instance: InstanceConfig) -> Self {
        self.upstream_instances.push(instance);
        self
    }

    pub fn with_algorithm(mut self, algorithm: LoadBalancingAlgorithm) -> Self {
        self.load_balancing_algorithm = algorithm;
        self
    }

    /// Validate a single route, as done by the admin API before registering it
    pub fn validate(&self) -> GatewayResult<()> {
        let mut errors = Vec::new();
        self.collect_errors(0, &mut errors);
        if errors.is_empty() {
            Ok(())
        } else {
            Err(GatewayError::validation("route", errors.join("; ")))
        }
    }

    fn collect_errors(&self, index: usize, errors: &mut Vec<String>) {
        if self.path.is_empty() {
            errors.push(format!("Route {} has empty path", index));
        } else if !self.path.starts_with('/') {
            errors.push(format!("Route '{}' must start with '/'", self.path));
        }

        if self.service_name.is_empty() {
            errors.push(format!("Route '{}' has empty service_name", self.path));
        }

        if self.upstream_instances.is_empty() {
            errors.push(format!("Route '{}' has no upstream instances", self.path));
        }

        for instance in &self.upstream_instances {
            if instance.host.is_empty() {
                errors.push(format!("Route '{}' has an instance with empty host", self.path));
            }
            if instance.port == 0 {
                errors.push(format!("Route '{}' has an instance with port 0", self.path));
            }
        }

        if self.load_balancing_algorithm == LoadBalancingAlgorithm::WeightedRoundRobin
            && !self.upstream_instances.is_empty()
            && self.upstream_instances.iter().all(|i| i.weight == 0)
        {
            errors.push(format!("Route '{}' has only zero-weight instances", self.path));
        }

        if self.connect_timeout.is_zero() || self.read_timeout.is_zero() {
            errors.push(format!("Route '{}' timeouts must be greater than 0", self.path));
        }

        if matches!(self.rate_limit_rpm, Some(0)) || matches!(self.rate_limit_burst, Some(0)) {
            errors.push(format!(
                "Route '{}' rate limit overrides must be greater than 0",
                self.path
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use tempfile::TempDir;
    use tokio::fs;

    // Serializes tests that read or write GATEWAY_* variables.
    static ENV_LOCK: parking_lot::Mutex<()> = parking_lot::const_mutex(());

    fn route() -> RouteConfig {
        RouteConfig::new("/api/v1/products/*", "products")
            .with_instance(InstanceConfig::new("localhost", 8004))
    }

    #[test]
    fn test_default_config_validation() {
        let config = GatewayConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.server.admin_port(), 9000);
    }

    #[test]
    fn test_route_defaults() {
        let route = RouteConfig::default();
        assert_eq!(route.connect_timeout, Duration::from_secs(30));
        assert_eq!(route.read_timeout, Duration::from_secs(60));
        assert_eq!(route.max_retries, 3);
        assert!(route.require_auth);
        assert!(route.strip_path_prefix);
        assert!(route.health_check_enabled);
    }

    #[tokio::test]
    async fn test_load_config_from_yaml_file() {
        let _env = ENV_LOCK.lock();
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("gateway.yaml");

        let config_content = r#"
server:
  host: "127.0.0.1"
  port: 8100

load_balancer:
  health_check:
    interval: "15s"
    timeout: "2s"
    method: tcp_connect
  sticky_sessions: true

rate_limiting:
  default_rpm: 600
  custom_limits:
    "ip:10.0.0.1":
      rpm: 10
      burst: 2

routes:
  - path: "/api/v1/products/*"
    service_name: "products"
    algorithm: weighted_round_robin
    require_auth: false
    read_timeout: "5s"
    instances:
      - host: "localhost"
        port: 8004
        weight: 3
      - host: "localhost"
        port: 8005
"#;

        fs::write(&config_path, config_content).await.unwrap();

        let config = GatewayConfig::load(&config_path).await.unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.admin_port(), 9100);
        assert_eq!(config.load_balancer.health_check.interval, Duration::from_secs(15));
        assert_eq!(config.load_balancer.health_check.method, HealthCheckMethod::TcpConnect);
        assert_eq!(config.load_balancer.session_cookie_name, "gateway_session");
        assert_eq!(config.rate_limiting.default_rpm, 600);
        assert_eq!(config.rate_limiting.default_burst, 100);
        assert_eq!(
            config.rate_limiting.custom_limits.get("ip:10.0.0.1"),
            Some(&RateLimitRule { rpm: 10, burst: 2 })
        );

        let route = &config.routes[0];
        assert_eq!(route.load_balancing_algorithm, LoadBalancingAlgorithm::WeightedRoundRobin);
        assert_eq!(route.upstream_instances[0].weight, 3);
        assert_eq!(route.upstream_instances[1].weight, 1);
        assert_eq!(route.read_timeout, Duration::from_secs(5));
        assert_eq!(route.connect_timeout, Duration::from_secs(30));
        assert!(!route.require_auth);
    }

    #[tokio::test]
    async fn test_load_config_from_json_file() {
        let _env = ENV_LOCK.lock();
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("gateway.json");

        let mut config = GatewayConfig::default();
        config.routes.push(route());
        fs::write(&config_path, serde_json::to_string_pretty(&config).unwrap())
            .await
            .unwrap();

        let loaded = GatewayConfig::load(&config_path).await.unwrap();
        assert_eq!(loaded.routes.len(), 1);
        assert_eq!(loaded.routes[0].service_name, "products");
    }

    #[tokio::test]
    async fn test_load_missing_file_is_config_error() {
        let result = GatewayConfig::load_from_file("/nonexistent/gateway.yaml").await;
        assert!(matches!(result, Err(GatewayError::Configuration { .. })));
    }

    #[test]
    fn test_environment_variable_overrides() {
        let _env = ENV_LOCK.lock();
        env::set_var("GATEWAY_SERVER_HOST", "192.168.1.1");
        env::set_var("GATEWAY_SERVER_PORT", "8200");
        env::set_var("GATEWAY_HEALTH_CHECK_INTERVAL", "45s");
        env::set_var("GATEWAY_RATE_LIMIT_DEFAULT_RPM", "50");
        env::set_var("GATEWAY_AUTH_JWT_SECRET", "from-env");

        let mut config = GatewayConfig::default();
        config.apply_env_overrides().unwrap();

        assert_eq!(config.server.host, "192.168.1.1");
        assert_eq!(config.server.port, 8200);
        assert_eq!(config.load_balancer.health_check.interval, Duration::from_secs(45));
        assert_eq!(config.rate_limiting.default_rpm, 50);
        assert_eq!(config.auth.jwt_secret, "from-env");

        env::set_var("GATEWAY_SERVER_PORT", "invalid_port");
        let result = GatewayConfig::default().apply_env_overrides();
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Invalid GATEWAY_SERVER_PORT"));

        env::remove_var("GATEWAY_SERVER_HOST");
        env::remove_var("GATEWAY_SERVER_PORT");
        env::remove_var("GATEWAY_HEALTH_CHECK_INTERVAL");
        env::remove_var("GATEWAY_RATE_LIMIT_DEFAULT_RPM");
        env::remove_var("GATEWAY_AUTH_JWT_SECRET");
    }

    #[test]
    fn test_config_validation_collects_all_errors() {
        let mut config = GatewayConfig::default();
        config.rate_limiting.default_rpm = 0;
        config.auth.enabled = true;
        config.routes.push(RouteConfig::new("no-slash", ""));

        let message = config.validate().unwrap_err().to_string();
        assert!(message.contains("default_rpm"));
        assert!(message.contains("jwt_secret"));
        assert!(message.contains("must start with '/'"));
        assert!(message.contains("empty service_name"));
        assert!(message.contains("no upstream instances"));
    }

    #[test]
    fn test_duplicate_route_paths_rejected() {
        let mut config = GatewayConfig::default();
        config.routes.push(route());
        config.routes.push(route());

        let message = config.validate().unwrap_err().to_string();
        assert!(message.contains("Duplicate route path"));
    }

    #[test]
    fn test_route_validation() {
        assert!(route().validate().is_ok());

        let zero_weight_mixed = route()
            .with_algorithm(LoadBalancingAlgorithm::WeightedRoundRobin)
            .with_instance(InstanceConfig::new("localhost", 8005).with_weight(0));
        assert!(zero_weight_mixed.validate().is_ok());

        let mut all_zero = RouteConfig::new("/x/*", "x")
            .with_algorithm(LoadBalancingAlgorithm::WeightedRoundRobin)
            .with_instance(InstanceConfig::new("localhost", 8005).with_weight(0));
        assert!(matches!(all_zero.validate(), Err(GatewayError::Validation { .. })));

        all_zero.load_balancing_algorithm = LoadBalancingAlgorithm::RoundRobin;
        assert!(all_zero.validate().is_ok());
    }
}
