//! Circuit Breaker Admin Endpoints
//!
//! View breaker state per upstream service and override it by hand.
//!
//! ## Security Note
//! Forcing a breaker open takes the service out of rotation.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Serialize;
use tracing::warn;

use crate::admin::AdminState;
use crate::core::circuit_breaker::CircuitBreakerSnapshot;

pub(crate) fn routes() -> Router<AdminState> {
    Router::new()
        .route("/admin/circuit-breakers", get(list_circuit_breakers))
        .route("/admin/circuit-breakers/:name/reset", post(reset_circuit_breaker))
        .route("/admin/circuit-breakers/:name/force-open", post(force_circuit_breaker_open))
        .route(
            "/admin/circuit-breakers/:name/force-half-open",
            post(force_circuit_breaker_half_open),
        )
}

#[derive(Debug, Serialize)]
pub struct CircuitBreakerListResponse {
    pub circuit_breakers: Vec<CircuitBreakerSnapshot>,
    pub total_count: usize,
    pub open_count: usize,
}

/// Response for manual state change operations
#[derive(Debug, Serialize)]
pub struct StateChangeResponse {
    pub name: String,
    pub new_state: &'static str,
}

async fn list_circuit_breakers(State(state): State<AdminState>) -> Json<CircuitBreakerListResponse> {
    let circuit_breakers: Vec<CircuitBreakerSnapshot> = state
        .gateway
        .circuit_breakers()
        .get_all()
        .iter()
        .map(|cb| cb.snapshot())
        .collect();
    let open_count = circuit_breakers.iter().filter(|cb| cb.state == "open").count();

    Json(CircuitBreakerListResponse {
        total_count: circuit_breakers.len(),
        open_count,
        circuit_breakers,
    })
}

/// Close the breaker and clear its counters
async fn reset_circuit_breaker(
    State(state): State<AdminState>,
    Path(name): Path<String>,
) -> Result<Json<StateChangeResponse>, StatusCode> {
    let breaker = state
        .gateway
        .circuit_breakers()
        .get(&name)
        .ok_or(StatusCode::NOT_FOUND)?;

    breaker.force_close();
    warn!(circuit_breaker = %name, "Circuit breaker reset via admin API");

    Ok(Json(StateChangeResponse {
        name,
        new_state: breaker.state().as_str(),
    }))
}

async fn force_circuit_breaker_open(
    State(state): State<AdminState>,
    Path(name): Path<String>,
) -> Result<Json<StateChangeResponse>, StatusCode> {
    let breaker = state
        .gateway
        .circuit_breakers()
        .get(&name)
        .ok_or(StatusCode::NOT_FOUND)?;

    breaker.force_open();
    warn!(circuit_breaker = %name, "Circuit breaker forced open via admin API");

    Ok(Json(StateChangeResponse {
        name,
        new_state: breaker.state().as_str(),
    }))
}

async fn force_circuit_breaker_half_open(
    State(state): State<AdminState>,
    Path(name): Path<String>,
) -> Result<Json<StateChangeResponse>, StatusCode> {
    let breaker = state
        .gateway
        .circuit_breakers()
        .get(&name)
        .ok_or(StatusCode::NOT_FOUND)?;

    breaker.force_half_open();
    warn!(circuit_breaker = %name, "Circuit breaker forced half-open via admin API");

    Ok(Json(StateChangeResponse {
        name,
        new_state: breaker.state().as_str(),
    }))
}
