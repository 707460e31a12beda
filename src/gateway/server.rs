//! # HTTP Server Module
//!
//! Two axum applications share one [`Gateway`]:
//!
//! - the gateway app: `GET /health`, `GET /metrics` and a fallback that proxies
//!   everything else through [`Gateway::handle`]
//! - the admin app from [`AdminRouter`]
//!
//! [`GatewayServer::run`] binds both listeners, starts the gateway's
//! background tasks and serves until the shutdown future resolves.
//!
//! ## Rust Concepts Used
//!
//! - `Option<ConnectInfo<SocketAddr>>` so the proxy handler also works when
//!   served without connection info (as in tests)
//! - `tokio_util::sync::CancellationToken` fans one shutdown signal out to both
//!   listeners

use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Query, Request, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router as AxumRouter,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::admin::{AdminRouter, AdminState};
use crate::core::config::CorsConfig;
use crate::core::error::{GatewayError, GatewayResult};
use crate::gateway::forwarder::Gateway;

/// State shared by the gateway-port handlers
#[derive(Clone)]
pub struct ServerState {
    pub gateway: Arc<Gateway>,
    /// Process-wide recorder output appended to the text exposition
    pub prometheus: Option<PrometheusHandle>,
}

#[derive(Debug, Serialize)]
pub struct ServiceHealth {
    pub total_instances: usize,
    pub healthy_instances: usize,
    pub status: &'static str,
}

#[derive(Debug, Serialize)]
pub struct GatewayHealth {
    pub status: &'static str,
    pub timestamp: String,
    pub version: &'static str,
    pub services: BTreeMap<String, ServiceHealth>,
}

#[derive(Debug, Deserialize)]
pub struct MetricsQuery {
    pub format: Option<String>,
}

/// Build the gateway-port application
pub fn create_gateway_app(state: ServerState) -> AxumRouter {
    let cors = cors_layer(&state.gateway.config().cors);

    let mut app = AxumRouter::new()
        .route("/health", get(gateway_health))
        .route("/metrics", get(gateway_metrics))
        .fallback(proxy)
        .with_state(state);

    if let Some(cors) = cors {
        app = app.layer(cors);
    }
    app.layer(TraceLayer::new_for_http())
}

/// CORS layer for the gateway port, `None` when disabled
///
/// With credentials allowed, `*` entries mirror the request instead of
/// answering with a literal wildcard, which browsers reject.
pub fn cors_layer(config: &CorsConfig) -> Option<CorsLayer> {
    if !config.enabled {
        return None;
    }
    let wildcard = |values: &[String]| values.iter().any(|v| v == "*");

    let origins = if wildcard(&config.allowed_origins) {
        if config.allow_credentials {
            AllowOrigin::mirror_request()
        } else {
            AllowOrigin::from(Any)
        }
    } else {
        AllowOrigin::list(
            config
                .allowed_origins
                .iter()
                .filter_map(|origin| origin.parse::<HeaderValue>().ok()),
        )
    };

    let methods = if wildcard(&config.allowed_methods) {
        if config.allow_credentials {
            AllowMethods::mirror_request()
        } else {
            AllowMethods::from(Any)
        }
    } else {
        AllowMethods::list(
            config
                .allowed_methods
                .iter()
                .filter_map(|method| method.parse::<Method>().ok()),
        )
    };

    let headers = if wildcard(&config.allowed_headers) {
        if config.allow_credentials {
            AllowHeaders::mirror_request()
        } else {
            AllowHeaders::from(Any)
        }
    } else {
        AllowHeaders::list(
            config
                .allowed_headers
                .iter()
                .filter_map(|name| name.parse::<HeaderName>().ok()),
        )
    };

    info!(origins = config.allowed_origins.len(), "CORS enabled on the gateway port");
    Some(
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(methods)
            .allow_headers(headers)
            .allow_credentials(config.allow_credentials)
            .max_age(config.max_age),
    )
}

/// Build the admin-port application
pub fn create_admin_app(gateway: Arc<Gateway>) -> AxumRouter {
    AdminRouter::create_router(AdminState::new(gateway))
}

pub struct GatewayServer {
    state: ServerState,
}

impl GatewayServer {
    pub fn new(gateway: Arc<Gateway>, prometheus: Option<PrometheusHandle>) -> Self {
        Self {
            state: ServerState { gateway, prometheus },
        }
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.state.gateway
    }

    pub fn bind_addr(&self) -> String {
        let server = &self.state.gateway.config().server;
        format!("{}:{}", server.host, server.port)
    }

    pub fn admin_bind_addr(&self) -> String {
        let server = &self.state.gateway.config().server;
        format!("{}:{}", server.host, server.admin_port())
    }

    /// Serve the gateway and admin ports until `shutdown` resolves
    pub async fn run<F>(self, shutdown: F) -> GatewayResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let gateway_addr = self.bind_addr();
        let admin_addr = self.admin_bind_addr();

        let gateway_listener = TcpListener::bind(&gateway_addr).await.map_err(|e| {
            GatewayError::internal(format!("Failed to bind gateway server to {}: {}", gateway_addr, e))
        })?;
        let admin_listener = TcpListener::bind(&admin_addr).await.map_err(|e| {
            GatewayError::internal(format!("Failed to bind admin server to {}: {}", admin_addr, e))
        })?;

        info!(addr = %gateway_addr, "Gateway HTTP server listening");
        info!(addr = %admin_addr, "Admin HTTP server listening");

        let gateway = Arc::clone(&self.state.gateway);
        gateway.start();

        let token = CancellationToken::new();
        let signal_token = token.clone();
        tokio::spawn(async move {
            shutdown.await;
            signal_token.cancel();
        });

        let gateway_app = create_gateway_app(self.state.clone());
        let admin_app = create_admin_app(Arc::clone(&gateway));

        let gateway_token = token.clone();
        let gateway_server = axum::serve(
            gateway_listener,
            gateway_app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { gateway_token.cancelled().await });

        let admin_token = token.clone();
        let admin_server = axum::serve(admin_listener, admin_app)
            .with_graceful_shutdown(async move { admin_token.cancelled().await });

        let (gateway_result, admin_result) = tokio::join!(gateway_server, admin_server);

        info!("HTTP servers stopped, shutting down background tasks");
        gateway.shutdown().await;

        gateway_result.map_err(|e| GatewayError::internal(format!("Gateway server error: {}", e)))?;
        admin_result.map_err(|e| GatewayError::internal(format!("Admin server error: {}", e)))?;
        Ok(())
    }
}

/// Fallback handler: everything that is not `/health` or `/metrics`
async fn proxy(
    State(state): State<ServerState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    request: Request,
) -> Response {
    let peer = connect_info.map(|ConnectInfo(addr)| addr);
    state.gateway.handle(request, peer).await
}

/// Gateway health with per-service instance counts
async fn gateway_health(State(state): State<ServerState>) -> Json<GatewayHealth> {
    let mut services: BTreeMap<String, ServiceHealth> = BTreeMap::new();
    let mut seen: HashSet<(String, String)> = HashSet::new();

    for route in state.gateway.router().routes() {
        let entry = services
            .entry(route.service_name().to_string())
            .or_insert(ServiceHealth {
                total_instances: 0,
                healthy_instances: 0,
                status: "unhealthy",
            });

        for instance in &route.instances {
            if !seen.insert((route.service_name().to_string(), instance.key())) {
                continue;
            }
            entry.total_instances += 1;
            if instance.is_healthy() {
                entry.healthy_instances += 1;
            }
        }
        entry.status = if entry.healthy_instances > 0 { "healthy" } else { "unhealthy" };
    }

    let degraded = services.values().any(|s| s.healthy_instances == 0);

    Json(GatewayHealth {
        status: if degraded { "degraded" } else { "healthy" },
        timestamp: chrono::Utc::now().to_rfc3339(),
        version: env!("CARGO_PKG_VERSION"),
        services,
    })
}

/// JSON snapshot, or the text exposition when asked for it
async fn gateway_metrics(
    State(state): State<ServerState>,
    Query(query): Query<MetricsQuery>,
    headers: HeaderMap,
) -> Response {
    let wants_text = query.format.as_deref() == Some("prometheus")
        || headers
            .get(header::ACCEPT)
            .and_then(|v| v.to_str().ok())
            .map_or(false, |accept| accept.contains("text/plain"));

    let metrics = state.gateway.metrics();
    if !wants_text {
        return Json(metrics.snapshot()).into_response();
    }

    let mut body = metrics.render_prometheus();
    if let Some(handle) = &state.prometheus {
        if !body.is_empty() {
            body.push('\n');
        }
        body.push_str(&handle.render());
    }

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
        .into_response()
}
