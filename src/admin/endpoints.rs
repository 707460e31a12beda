//! Route management endpoints

use std::collections::HashMap;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use crate::admin::AdminState;
use crate::core::config::RouteConfig;
use crate::core::types::ServiceInstanceSnapshot;
use crate::routing::router::Route;

pub(crate) fn routes() -> Router<AdminState> {
    Router::new()
        .route("/admin/routes", get(list_routes).post(add_route).delete(remove_route))
        .route("/admin/routes/stats", get(route_stats))
}

#[derive(Debug, Serialize)]
pub struct RouteSummary {
    #[serde(flatten)]
    pub config: RouteConfig,
    pub instance_status: Vec<ServiceInstanceSnapshot>,
}

impl From<&Route> for RouteSummary {
    fn from(route: &Route) -> Self {
        Self {
            config: route.config.clone(),
            instance_status: route.instances.iter().map(|i| i.snapshot()).collect(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct InstanceStats {
    pub url: String,
    pub healthy: bool,
    pub weight: u32,
    pub active_connections: u64,
    pub total_requests: u64,
    pub failed_requests: u64,
    pub success_rate: f64,
    pub average_response_time_ms: f64,
}

#[derive(Debug, Serialize)]
pub struct RouteStats {
    pub service_name: String,
    pub algorithm: &'static str,
    pub instances: Vec<InstanceStats>,
}

#[derive(Debug, Deserialize)]
pub struct RemoveRouteQuery {
    pub path: String,
}

/// List all routes in match order
async fn list_routes(State(state): State<AdminState>) -> Json<serde_json::Value> {
    let routes: Vec<RouteSummary> = state
        .gateway
        .router()
        .routes()
        .iter()
        .map(|route| RouteSummary::from(route.as_ref()))
        .collect();

    Json(json!({
        "total": routes.len(),
        "routes": routes,
    }))
}

/// Add a route, or replace the one registered under the same path
async fn add_route(State(state): State<AdminState>, Json(config): Json<RouteConfig>) -> Response {
    match state.gateway.router().add_route(config) {
        Ok(route) => {
            info!(path = %route.pattern(), service = %route.service_name(), "Route added via admin API");
            (
                StatusCode::CREATED,
                Json(json!({
                    "message": "Route added",
                    "path": route.pattern(),
                    "service_name": route.service_name(),
                })),
            )
                .into_response()
        }
        Err(err) => err.into_response(),
    }
}

async fn remove_route(
    State(state): State<AdminState>,
    Query(query): Query<RemoveRouteQuery>,
) -> StatusCode {
    if state.gateway.remove_route(&query.path) {
        info!(path = %query.path, "Route removed via admin API");
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

/// Per-route instance statistics keyed by route path
async fn route_stats(State(state): State<AdminState>) -> Json<HashMap<String, RouteStats>> {
    let gateway = &state.gateway;
    let stats = gateway
        .router()
        .routes()
        .iter()
        .map(|route| {
            let instances = route
                .instances
                .iter()
                .map(|instance| {
                    let connection = gateway.stats().snapshot(&instance.key());
                    InstanceStats {
                        url: instance.base_url(),
                        healthy: instance.is_healthy(),
                        weight: instance.weight,
                        active_connections: connection.active_connections,
                        total_requests: connection.total_requests,
                        failed_requests: connection.failed_requests,
                        success_rate: connection.success_rate,
                        average_response_time_ms: connection.average_response_time_ms,
                    }
                })
                .collect();

            let summary = RouteStats {
                service_name: route.service_name().to_string(),
                algorithm: route.balancer().algorithm_name(),
                instances,
            };
            (route.pattern().to_string(), summary)
        })
        .collect();

    Json(stats)
}
