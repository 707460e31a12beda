//! # Error Handling Module
//!
//! Every failure the dispatch path can produce is a variant of [`GatewayError`].
//! Lower layers (circuit breaker, rate limiter, load balancer) report typed
//! outcomes of their own; the request forwarder is the single place that turns
//! them into a `GatewayError` and, through [`IntoResponse`], into an HTTP status.
//!
//! ## Status mapping
//! - `RouteNotFound` → 404
//! - `RateLimitExceeded` → 429
//! - `NoHealthyUpstream` / `CircuitBreakerOpen` → 503
//! - `Timeout` → 504
//! - `UpstreamConnect` / `Upstream` → 502
//!
//! Upstream failures never leak their internal text to the client; the
//! detailed message stays in the logs and the response carries a generic one.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Main result type used throughout the gateway
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Error taxonomy for the API gateway
///
/// The `#[error("...")]` attribute from `thiserror` implements `Display`;
/// that text is what ends up in the logs.
#[derive(Debug, Error, Clone)]
pub enum GatewayError {
    /// Configuration-related errors (invalid config, missing files, etc.)
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// No registered route matches the request path
    #[error("No route matches path: {path}")]
    RouteNotFound { path: String },

    /// Missing or invalid credentials
    #[error("Authentication failed: {reason}")]
    Authentication { reason: String },

    /// Valid credentials without the required role
    #[error("Authorization failed: {reason}")]
    Authorization { reason: String },

    /// Rate limiting errors when request limits are exceeded
    #[error("Rate limit exceeded: {limit} requests per {window}")]
    RateLimitExceeded { limit: u32, window: String },

    /// Every instance of the target service is unhealthy (or excluded)
    #[error("No healthy upstream instance for service: {service}")]
    NoHealthyUpstream { service: String },

    /// Circuit breaker is open, preventing requests to failing services
    #[error("Circuit breaker open for service: {service}")]
    CircuitBreakerOpen { service: String },

    /// Upstream call exceeded its deadline
    #[error("Request timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// Connection or DNS failure reaching an upstream instance
    #[error("Failed to connect to upstream {service}: {message}")]
    UpstreamConnect { service: String, message: String },

    /// Any other failure while talking to an upstream
    #[error("Upstream error for {service}: {message}")]
    Upstream { service: String, message: String },

    /// Invalid input on the admin surface
    #[error("Validation failed: {field} - {reason}")]
    Validation { field: String, reason: String },

    /// Internal server errors for unexpected failures
    #[error("Internal server error: {message}")]
    Internal { message: String },

    /// I/O errors (file operations, socket binding, etc.)
    #[error("I/O error: {message}")]
    Io { message: String },

    /// JSON serialization/deserialization errors
    #[error("JSON error: {message}")]
    Json { message: String },

    /// YAML parsing errors for configuration files
    #[error("YAML error: {message}")]
    Yaml { message: String },
}

impl GatewayError {
    /// Create a configuration error with a custom message
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an authentication error with a custom reason
    pub fn auth<S: Into<String>>(reason: S) -> Self {
        Self::Authentication {
            reason: reason.into(),
        }
    }

    /// Create an authorization error with a custom reason
    pub fn authz<S: Into<String>>(reason: S) -> Self {
        Self::Authorization {
            reason: reason.into(),
        }
    }

    pub fn route_not_found<S: Into<String>>(path: S) -> Self {
        Self::RouteNotFound { path: path.into() }
    }

    pub fn no_healthy_upstream<S: Into<String>>(service: S) -> Self {
        Self::NoHealthyUpstream {
            service: service.into(),
        }
    }

    pub fn upstream<S: Into<String>, M: Into<String>>(service: S, message: M) -> Self {
        Self::Upstream {
            service: service.into(),
            message: message.into(),
        }
    }

    /// Create a validation error for a named field
    pub fn validation<F: Into<String>, R: Into<String>>(field: F, reason: R) -> Self {
        Self::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create an internal error with a custom message
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Get the appropriate HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::RouteNotFound { .. } => StatusCode::NOT_FOUND,
            Self::Authentication { .. } => StatusCode::UNAUTHORIZED,
            Self::Authorization { .. } => StatusCode::FORBIDDEN,
            Self::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::NoHealthyUpstream { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::CircuitBreakerOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::UpstreamConnect { .. } => StatusCode::BAD_GATEWAY,
            Self::Upstream { .. } => StatusCode::BAD_GATEWAY,
            Self::Validation { .. } => StatusCode::BAD_REQUEST,
            Self::Json { .. } => StatusCode::BAD_REQUEST,
            Self::Configuration { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Io { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Yaml { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the client may retry the same request later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimitExceeded { .. }
                | Self::NoHealthyUpstream { .. }
                | Self::CircuitBreakerOpen { .. }
                | Self::Timeout { .. }
                | Self::UpstreamConnect { .. }
        )
    }

    /// Whether this failure counts against the upstream's circuit breaker
    pub fn should_trigger_circuit_breaker(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::UpstreamConnect { .. } | Self::Upstream { .. }
        )
    }

    /// Get a string representation of the error type for API responses and metrics
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Configuration { .. } => "configuration_error",
            Self::RouteNotFound { .. } => "route_not_found",
            Self::Authentication { .. } => "authentication_error",
            Self::Authorization { .. } => "authorization_error",
            Self::RateLimitExceeded { .. } => "rate_limit_exceeded",
            Self::NoHealthyUpstream { .. } => "no_healthy_upstream",
            Self::CircuitBreakerOpen { .. } => "circuit_breaker_open",
            Self::Timeout { .. } => "upstream_timeout",
            Self::UpstreamConnect { .. } => "upstream_connect_error",
            Self::Upstream { .. } => "upstream_error",
            Self::Validation { .. } => "validation_error",
            Self::Internal { .. } => "internal_error",
            Self::Io { .. } => "io_error",
            Self::Json { .. } => "json_error",
            Self::Yaml { .. } => "yaml_error",
        }
    }

    /// Message that is safe to show to the caller
    pub fn public_message(&self) -> String {
        match self {
            Self::NoHealthyUpstream { .. } => "No healthy upstream instances".to_string(),
            Self::CircuitBreakerOpen { .. } => "Service temporarily unavailable".to_string(),
            Self::Timeout { .. } => "Gateway Timeout".to_string(),
            Self::UpstreamConnect { .. } => "Bad Gateway - Connection Error".to_string(),
            Self::Upstream { .. } => "Bad Gateway".to_string(),
            Self::Internal { .. } | Self::Io { .. } | Self::Yaml { .. } | Self::Configuration { .. } => {
                "Internal Server Error".to_string()
            }
            other => other.to_string(),
        }
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json {
            message: err.to_string(),
        }
    }
}

impl From<serde_yaml::Error> for GatewayError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Yaml {
            message: err.to_string(),
        }
    }
}

/// Without knowing which service was called this can only be classified by kind
impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout { timeout_ms: 0 }
        } else if err.is_connect() {
            Self::UpstreamConnect {
                service: "unknown".to_string(),
                message: err.to_string(),
            }
        } else {
            Self::Upstream {
                service: "unknown".to_string(),
                message: err.to_string(),
            }
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        let error_response = json!({
            "error": {
                "code": status.as_u16(),
                "message": self.public_message(),
                "type": self.error_type(),
                "retryable": self.is_retryable(),
            }
        });

        (status, Json(error_response)).into_response()
    }
}

/// Convenience macro for creating configuration errors
///
/// Usage: `config_error!("Invalid port: {}", port)`
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::core::error::GatewayError::config(format!($($arg)*))
    };
}
