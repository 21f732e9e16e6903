//! Axum middleware shared by every gateway route.
//!
//! Stateless layers only: request correlation and timing. Per-request policy (auth,
//! limits, caching) lives in the core pipeline.
use std::time::Instant;

use axum::{
    extract::Request,
    http::{HeaderName, HeaderValue},
    middleware::Next,
    response::Response,
};
use tracing::Instrument;

use crate::tracing_setup::create_request_span;

pub const X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

/// Tag each request with a UUID, run it inside a request span and echo the id back
/// as `X-Request-ID`. An id supplied by the caller is kept.
pub async fn request_id_middleware(req: Request, next: Next) -> Response {
    let request_id = req
        .headers()
        .get(&X_REQUEST_ID)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let span = create_request_span(req.method().as_str(), req.uri().path(), &request_id);
    let mut response = next.run(req).instrument(span).await;

    if let Ok(header_value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(X_REQUEST_ID, header_value);
    }
    response
}

/// Log start/end of a request including latency.
pub async fn request_timing_middleware(req: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().clone();
    let uri = req.uri().clone();

    tracing::debug!("Started processing {} {}", method, uri);

    let response = next.run(req).await;
    let duration = start.elapsed();

    let span = tracing::Span::current();
    span.record("http.status_code", response.status().as_u16());
    span.record("duration_ms", duration.as_millis() as u64);

    tracing::info!(
        "Completed {} {} - {} in {:?}",
        method,
        uri,
        response.status(),
        duration
    );
    response
}

#[cfg(test)]
mod tests {
    use axum::{Router, body::Body, http::StatusCode, middleware, routing::get};
    use tower::ServiceExt;

    use super::*;

    fn app() -> Router {
        Router::new()
            .route("/", get(|| async { StatusCode::OK }))
            .layer(middleware::from_fn(request_timing_middleware))
            .layer(middleware::from_fn(request_id_middleware))
    }

    #[tokio::test]
    async fn test_request_id_is_generated() {
        let response = app()
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let request_id = response.headers()[X_REQUEST_ID].to_str().unwrap();
        assert!(uuid::Uuid::parse_str(request_id).is_ok());
    }

    #[tokio::test]
    async fn test_caller_request_id_is_kept() {
        let response = app()
            .oneshot(
                Request::builder()
                    .uri("/")
                    .header("x-request-id", "trace-abc")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.headers()[X_REQUEST_ID], "trace-abc");
    }
}
