//! Health checker statistics endpoint

use axum::{extract::State, response::Json, routing::get, Router};
use serde_json::json;

use crate::admin::AdminState;

pub(crate) fn routes() -> Router<AdminState> {
    Router::new().route("/admin/health", get(health_statistics))
}

async fn health_statistics(State(state): State<AdminState>) -> Json<serde_json::Value> {
    let gateway = &state.gateway;
    let checker = gateway.health_checker();

    Json(json!({
        "overall": checker.overall_stats(),
        "instances": checker.all_instance_stats(),
        "metrics_collector": gateway.metrics().health_status(),
        "rate_limiter": gateway.rate_limiter().metrics(),
        "sticky_sessions": gateway.sticky_sessions().len(),
    }))
}
