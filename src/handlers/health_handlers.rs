//! Health & readiness handlers.
//!
//! - GET /healthz  -> simple liveness ("ok")
//! - GET /readyz   -> readiness that probes the storage backend

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;

use crate::services::hub_service::HubService;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

/// `GET /healthz`
///
/// Very small liveness probe — always returns 200 OK with a plain JSON body.
/// This endpoint should be cheap and never perform I/O.
pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, Json(HealthResponse { status: "ok" }))
}

/// `GET /readyz`
///
/// Readiness probe that exercises the driver's metadata store and a
/// write/read/delete round-trip against the payload directory. HTTP 200
/// when the probe passes, HTTP 503 when it fails.
pub async fn readyz(State(service): State<HubService>) -> impl IntoResponse {
    match service.health_check().await {
        Ok(()) => (StatusCode::OK, Json(HealthResponse { status: "ok" })),
        Err(err) => {
            tracing::warn!(error = %err, "readiness probe failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthResponse { status: "error" }),
            )
        }
    }
}
