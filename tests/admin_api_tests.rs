//! # Admin API Tests
//!
//! Route management, route statistics, circuit breaker overrides and the
//! health statistics endpoint, driven through `axum_test::TestServer`.

use std::sync::Arc;

use axum::http::StatusCode;
use axum_test::TestServer;
use serde_json::{json, Value};

use dispatch_gateway::core::config::{GatewayConfig, InstanceConfig, RouteConfig};
use dispatch_gateway::gateway::create_admin_app;
use dispatch_gateway::Gateway;

fn create_test_gateway() -> Arc<Gateway> {
    let mut config = GatewayConfig::default();
    config.routes = vec![
        RouteConfig::new("/api/v1/users/*", "users")
            .with_instance(InstanceConfig::new("127.0.0.1", 8001))
            .with_instance(InstanceConfig::new("127.0.0.1", 8011)),
        RouteConfig::new("/api/v1/orders/*", "orders")
            .with_instance(InstanceConfig::new("127.0.0.1", 8002)),
    ];
    Arc::new(Gateway::new(config).unwrap())
}

fn create_test_server(gateway: &Arc<Gateway>) -> TestServer {
    TestServer::new(create_admin_app(Arc::clone(gateway))).unwrap()
}

#[tokio::test]
async fn test_list_routes_in_match_order() {
    let gateway = create_test_gateway();
    let server = create_test_server(&gateway);

    let response = server.get("/admin/routes").await;
    response.assert_status_ok();

    let body: Value = response.json();
    assert_eq!(body["total"], 2);
    assert_eq!(body["routes"][0]["path"], "/api/v1/users/*");
    assert_eq!(body["routes"][0]["service_name"], "users");
    assert_eq!(body["routes"][0]["instance_status"].as_array().unwrap().len(), 2);
    assert_eq!(body["routes"][0]["instance_status"][0]["healthy"], true);
    assert_eq!(body["routes"][1]["path"], "/api/v1/orders/*");
}

#[tokio::test]
async fn test_add_route_then_match() {
    let gateway = create_test_gateway();
    let server = create_test_server(&gateway);

    let response = server
        .post("/admin/routes")
        .json(&json!({
            "path": "/api/v1/payments/*",
            "service_name": "payments",
            "upstream_instances": [{"host": "127.0.0.1", "port": 8003}],
            "load_balancing_algorithm": "least_connections",
            "require_auth": false,
            "read_timeout": "5s"
        }))
        .await;
    response.assert_status(StatusCode::CREATED);

    let route = gateway.router().match_route("/api/v1/payments/9").unwrap();
    assert_eq!(route.service_name(), "payments");
    assert_eq!(route.balancer().algorithm_name(), "least_connections");
    assert_eq!(route.config.read_timeout, std::time::Duration::from_secs(5));
    assert_eq!(gateway.router().len(), 3);
}

#[tokio::test]
async fn test_add_route_replaces_same_path() {
    let gateway = create_test_gateway();
    let server = create_test_server(&gateway);

    let response = server
        .post("/admin/routes")
        .json(&json!({
            "path": "/api/v1/users/*",
            "service_name": "users-v2",
            "upstream_instances": [{"host": "127.0.0.1", "port": 8101}]
        }))
        .await;
    response.assert_status(StatusCode::CREATED);

    let routes = gateway.router().routes();
    assert_eq!(routes.len(), 2);
    assert_eq!(routes[0].service_name(), "users-v2");
}

#[tokio::test]
async fn test_add_invalid_route_is_rejected() {
    let gateway = create_test_gateway();
    let server = create_test_server(&gateway);

    let response = server
        .post("/admin/routes")
        .json(&json!({
            "path": "/api/v1/empty/*",
            "service_name": "empty",
            "upstream_instances": []
        }))
        .await;
    response.assert_status(StatusCode::BAD_REQUEST);
    assert!(gateway.router().match_route("/api/v1/empty/1").is_none());
}

#[tokio::test]
async fn test_remove_route() {
    let gateway = create_test_gateway();
    let server = create_test_server(&gateway);

    for path in ["/api/v1/orders/1", "/api/v1/users/1"] {
        let route = gateway.router().match_route(path).unwrap();
        gateway.health_checker().check_instance(&route.instances[0]).await;
    }
    assert_eq!(gateway.health_checker().instance_history("127.0.0.1:8002", 10).len(), 1);

    let response = server
        .delete("/admin/routes")
        .add_query_param("path", "/api/v1/orders/*")
        .await;
    response.assert_status(StatusCode::NO_CONTENT);
    assert!(gateway.router().match_route("/api/v1/orders/1").is_none());
    assert!(gateway.health_checker().instance_history("127.0.0.1:8002", 10).is_empty());
    assert_eq!(gateway.health_checker().instance_history("127.0.0.1:8001", 10).len(), 1);

    let response = server
        .delete("/admin/routes")
        .add_query_param("path", "/api/v1/orders/*")
        .await;
    response.assert_status(StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_route_stats() {
    let gateway = create_test_gateway();
    let server = create_test_server(&gateway);

    let guard = gateway.stats().begin("127.0.0.1:8001");

    let response = server.get("/admin/routes/stats").await;
    response.assert_status_ok();
    let body: Value = response.json();

    let users = &body["/api/v1/users/*"];
    assert_eq!(users["service_name"], "users");
    assert_eq!(users["algorithm"], "round_robin");
    assert_eq!(users["instances"][0]["url"], "http://127.0.0.1:8001");
    assert_eq!(users["instances"][0]["active_connections"], 1);
    assert_eq!(users["instances"][1]["active_connections"], 0);

    guard.finish(true, None);
}

#[tokio::test]
async fn test_circuit_breaker_overrides() {
    let gateway = create_test_gateway();
    let server = create_test_server(&gateway);
    gateway.circuit_breakers().get_or_create("users");

    let response = server.get("/admin/circuit-breakers").await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["total_count"], 1);
    assert_eq!(body["open_count"], 0);

    let response = server.post("/admin/circuit-breakers/users/force-open").await;
    response.assert_status_ok();
    assert_eq!(response.json::<Value>()["new_state"], "open");

    let body: Value = server.get("/admin/circuit-breakers").await.json();
    assert_eq!(body["open_count"], 1);

    let response = server.post("/admin/circuit-breakers/users/force-half-open").await;
    assert_eq!(response.json::<Value>()["new_state"], "half_open");

    let response = server.post("/admin/circuit-breakers/users/reset").await;
    assert_eq!(response.json::<Value>()["new_state"], "closed");

    let response = server.post("/admin/circuit-breakers/missing/reset").await;
    response.assert_status(StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_health_statistics() {
    let gateway = create_test_gateway();
    let server = create_test_server(&gateway);

    let response = server.get("/admin/health").await;
    response.assert_status_ok();

    let body: Value = response.json();
    assert!(body.get("overall").is_some());
    assert!(body["instances"].is_array());
    assert_eq!(body["metrics_collector"]["status"], "stopped");
    assert_eq!(body["sticky_sessions"], 0);
}
