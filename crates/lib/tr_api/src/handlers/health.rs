//! Liveness and readiness checks.

use axum::extract::State;
use axum::http::StatusCode;

use crate::AppState;

/// `GET /healthz`
pub async fn healthz() -> &'static str {
    "OK"
}

/// `GET /readyz`: ready once the credential store answers.
pub async fn readyz(State(state): State<AppState>) -> (StatusCode, &'static str) {
    if state.auth.is_ready().await {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}
