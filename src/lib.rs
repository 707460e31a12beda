//! # Dispatch Gateway
//!
//! An HTTP API gateway core: ordered path routing to upstream instance pools,
//! pluggable load balancing with sticky sessions, active health checking,
//! per-service circuit breakers, sliding-window rate limiting, JWT
//! authentication, request metrics and an admin API.
//!
//! The request path lives in [`gateway::Gateway::handle`]; everything else is a
//! component it owns and consults:
//!
//! ```text
//! route match -> auth -> rate limit -> instance selection -> breaker -> upstream
//! ```

/// Errors, configuration, circuit breaker and the shared data model
pub mod core;

/// Request dispatch and the gateway/admin HTTP servers
pub mod gateway;

/// Ordered path-pattern routing
pub mod routing;

/// Balancing algorithms, connection statistics and sticky sessions
pub mod load_balancing;

/// Sliding-window rate limiting
pub mod middleware;

/// JWT validation and the authenticate/authorize steps
pub mod auth;

/// Active health checks and request metrics
pub mod observability;

/// Runtime administration endpoints
pub mod admin;

pub use crate::core::config::GatewayConfig;
pub use crate::core::error::{GatewayError, GatewayResult};
pub use crate::gateway::{Gateway, GatewayServer};
pub use crate::routing::{Route, Router};
