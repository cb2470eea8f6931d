//! Health check endpoint.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use saga::SagaStore;
use serde::Serialize;

use super::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: String,
    pub broker: &'static str,
}

/// GET /health - reports the service name and whether the broker
/// connection is up. Answers 503 while it is down.
pub async fn check<S: SagaStore>(
    State(state): State<Arc<AppState<S>>>,
) -> (StatusCode, Json<HealthResponse>) {
    let connected = state.connections.is_connected();
    let (code, status, broker) = if connected {
        (StatusCode::OK, "ok", "connected")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded", "disconnected")
    };
    (
        code,
        Json(HealthResponse {
            status,
            service: state.service_name.clone(),
            broker,
        }),
    )
}
