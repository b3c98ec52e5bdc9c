//! Per-request deadline.

use std::time::Duration;

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::warn;

use crate::error::AppError;

/// Answer 504 when the inner service has not responded within the limit.
/// Dropping the inner future cancels its outstanding store and provider calls.
pub async fn deadline(State(limit): State<Duration>, request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    match tokio::time::timeout(limit, next.run(request)).await {
        Ok(response) => response,
        Err(_) => {
            warn!(%method, %path, limit_ms = limit.as_millis() as u64, "request deadline exceeded");
            AppError::Timeout.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Router, body::Body, http::StatusCode, routing::get};
    use tower::ServiceExt;

    fn app(limit: Duration) -> Router {
        Router::new()
            .route(
                "/slow",
                get(|| async {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    "done"
                }),
            )
            .route("/fast", get(|| async { "done" }))
            .layer(axum::middleware::from_fn_with_state(limit, deadline))
    }

    #[tokio::test]
    async fn slow_requests_time_out() {
        let req = Request::builder().uri("/slow").body(Body::empty()).unwrap();
        let resp = app(Duration::from_millis(20)).oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::GATEWAY_TIMEOUT);
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"request timed out");
    }

    #[tokio::test]
    async fn fast_requests_pass_through() {
        let req = Request::builder().uri("/fast").body(Body::empty()).unwrap();
        let resp = app(Duration::from_secs(5)).oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
