//! # Admin Module
//!
//! Administrative endpoints served on the admin port:
//! - route table inspection and runtime add/replace/remove
//! - per-route instance statistics
//! - circuit breaker status and manual overrides
//! - health checker statistics
//!
//! ## Security Considerations
//! These endpoints change how traffic is dispatched. Bind the admin port to a
//! network only operators can reach.

pub mod circuit_breaker;
pub mod endpoints;
pub mod health;

use std::sync::Arc;

use axum::Router;
use tower_http::trace::TraceLayer;

use crate::gateway::forwarder::Gateway;

pub use endpoints::{RouteStats, RouteSummary};

/// Shared state for every admin handler
#[derive(Clone)]
pub struct AdminState {
    pub gateway: Arc<Gateway>,
}

impl AdminState {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self { gateway }
    }
}

/// Admin router assembly
pub struct AdminRouter;

impl AdminRouter {
    pub fn create_router(state: AdminState) -> Router {
        Router::new()
            .merge(endpoints::routes())
            .merge(circuit_breaker::routes())
            .merge(health::routes())
            .with_state(state)
            .layer(TraceLayer::new_for_http())
    }
}
