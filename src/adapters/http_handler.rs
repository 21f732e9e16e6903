//! HTTP surface of the gateway: the axum router, admin endpoints and the proxy route.
use std::{any::Any, net::SocketAddr, sync::Arc};

use axum::{
    Json, Router,
    body::to_bytes,
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, Method},
    middleware,
    response::{IntoResponse, Response},
    routing::{any, get, post},
};
use serde_json::json;
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};

use crate::{
    adapters::middleware::{request_id_middleware, request_timing_middleware},
    core::{GatewayError, GatewayService, RequestContext},
};

/// Largest request body accepted for forwarding
pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Builds the router serving one [`GatewayService`].
pub struct HttpHandler {
    gateway: Arc<GatewayService>,
}

impl HttpHandler {
    pub fn new(gateway: Arc<GatewayService>) -> Self {
        Self { gateway }
    }

    pub fn gateway(&self) -> &Arc<GatewayService> {
        &self.gateway
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/", get(api_documentation))
            .route("/health", get(health))
            .route("/api/{service}/{*path}", any(proxy))
            .route("/admin/cache/clear", post(clear_cache))
            .route("/admin/services", get(list_services))
            .route("/admin/rate-limits", get(list_rate_limits))
            .fallback(not_found)
            .method_not_allowed_fallback(method_not_allowed)
            .with_state(self.gateway.clone())
            .layer(CatchPanicLayer::custom(handle_panic))
            .layer(middleware::from_fn(request_timing_middleware))
            .layer(TraceLayer::new_for_http())
            .layer(middleware::from_fn(request_id_middleware))
    }
}

async fn api_documentation(State(gateway): State<Arc<GatewayService>>) -> Json<serde_json::Value> {
    Json(json!({
        "name": "Waypoint API Gateway",
        "version": env!("CARGO_PKG_VERSION"),
        "description": "An API gateway with key auth, rate limiting, response caching and load balancing",
        "endpoints": {
            "/api/{service}/{path}": "Main gateway endpoint that proxies requests to backend services",
            "/health": "Health check endpoint",
            "/admin/cache/clear": "Clear the API Gateway cache",
            "/admin/services": "List all registered services",
            "/admin/rate-limits": "List current rate limit data",
        },
        "services": gateway.registry().service_names(),
    }))
}

async fn health(State(gateway): State<Arc<GatewayService>>) -> impl IntoResponse {
    Json(gateway.health())
}

async fn proxy(State(gateway): State<Arc<GatewayService>>, req: Request) -> Response {
    let (parts, body) = req.into_parts();
    let remote_addr = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);

    // Service and path come from the raw URI so encoded bytes reach the backend untouched
    let Some((service, path)) = split_proxy_path(parts.uri.path()) else {
        return GatewayError::NotFound.into_response();
    };
    let (service, path) = (service.to_string(), path.to_string());
    let query = parts.uri.query().map(str::to_string);

    let body = match to_bytes(body, MAX_BODY_BYTES).await {
        Ok(body) => body,
        Err(err) => {
            tracing::warn!(service = %service, "Failed to read request body: {}", err);
            return GatewayError::BadRequest(format!("Unreadable request body: {err}"))
                .into_response();
        }
    };

    let ctx = RequestContext::new(service, path, parts.method)
        .with_headers(parts.headers)
        .with_query(query)
        .with_body(body)
        .with_remote_addr(remote_addr);
    gateway.handle(ctx).await
}

/// Splits a raw `/api/{service}/{path}` request path into the service name and
/// everything after it, still percent-encoded.
fn split_proxy_path(path: &str) -> Option<(&str, &str)> {
    path.strip_prefix("/api/")?
        .split_once('/')
        .filter(|(service, _)| !service.is_empty())
}

async fn clear_cache(
    State(gateway): State<Arc<GatewayService>>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, GatewayError> {
    gateway.authorize(&headers)?;
    let message = match gateway.clear_cache().await {
        Some(_) => "Cache cleared successfully",
        None => "Cache is disabled",
    };
    Ok(Json(json!({ "message": message })))
}

async fn list_services(
    State(gateway): State<Arc<GatewayService>>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, GatewayError> {
    gateway.authorize(&headers)?;
    Ok(Json(json!({ "services": gateway.services() })))
}

async fn list_rate_limits(
    State(gateway): State<Arc<GatewayService>>,
    headers: HeaderMap,
) -> Result<Response, GatewayError> {
    gateway.authorize(&headers)?;
    Ok(match gateway.rate_limits().await {
        Some(report) => Json(report).into_response(),
        None => Json(json!({ "message": "Rate limiting is disabled" })).into_response(),
    })
}

async fn not_found(method: Method) -> GatewayError {
    tracing::debug!(%method, "No route matched");
    GatewayError::NotFound
}

async fn method_not_allowed() -> GatewayError {
    GatewayError::MethodNotAllowed
}

fn handle_panic(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "unknown panic payload".to_string()
    };
    GatewayError::Internal(format!("request handler panicked: {detail}")).into_response()
}

#[cfg(test)]
mod tests {
    use http_body_util::BodyExt;

    use super::*;

    #[test]
    fn test_split_proxy_path_keeps_encoding() {
        assert_eq!(
            split_proxy_path("/api/user_service/users/42"),
            Some(("user_service", "users/42"))
        );
        assert_eq!(
            split_proxy_path("/api/files/a%2Fb/c%20d"),
            Some(("files", "a%2Fb/c%20d"))
        );
        assert_eq!(split_proxy_path("/api/files/docs/%FF"), Some(("files", "docs/%FF")));
        assert_eq!(split_proxy_path("/api/only"), None);
        assert_eq!(split_proxy_path("/health"), None);
    }

    #[tokio::test]
    async fn test_panic_becomes_json_500() {
        let response = handle_panic(Box::new("boom"));
        assert_eq!(response.status(), axum::http::StatusCode::INTERNAL_SERVER_ERROR);

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"], "Internal server error");
    }
}
