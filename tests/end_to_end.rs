//! Forwarding through the real hyper client to an axum backend on an ephemeral port.
use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use axum::{
    Json, Router,
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, Request, StatusCode},
    routing::get,
};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;
use waypoint::{GatewayService, HttpClientAdapter, HttpHandler, config::GatewayConfig};

async fn user(
    State(hits): State<Arc<AtomicUsize>>,
    Path(id): Path<u32>,
    headers: HeaderMap,
) -> Json<Value> {
    hits.fetch_add(1, Ordering::SeqCst);
    let forwarded: Vec<String> = headers.keys().map(|name| name.to_string()).collect();
    Json(json!({ "id": id, "name": format!("user-{id}"), "headers": forwarded }))
}

async fn spawn_backend() -> (SocketAddr, Arc<AtomicUsize>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let app = Router::new()
        .route("/users/{id}", get(user))
        .route("/health", get(|| async { "ok" }))
        .with_state(hits.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, hits)
}

#[tokio::test(flavor = "multi_thread")]
async fn forwards_to_live_backend_and_caches() {
    let (addr, hits) = spawn_backend().await;
    let config = GatewayConfig::builder()
        .api_key("live-key")
        .service("user_service", [format!("http://{addr}")])
        .build()
        .unwrap();
    let client = Arc::new(HttpClientAdapter::new().unwrap());
    let gateway = Arc::new(GatewayService::new(Arc::new(config), client).unwrap());
    let app = HttpHandler::new(gateway).router();

    let call = || {
        Request::get("/api/user_service/users/42")
            .header("x-api-key", "live-key")
            .header("accept", "application/json")
            .header("cookie", "a=b")
            .body(Body::empty())
            .unwrap()
    };

    let response = app.clone().oneshot(call()).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-cache"], "MISS");
    assert!(response.headers().contains_key("x-request-id"));
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["name"], "user-42");

    let forwarded: Vec<&str> = body["headers"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(Value::as_str)
        .collect();
    assert!(forwarded.contains(&"accept"));
    assert!(forwarded.contains(&"x-gateway-source"));
    assert!(!forwarded.contains(&"cookie"));
    assert!(!forwarded.contains(&"x-api-key"));

    let cached = app.clone().oneshot(call()).await.unwrap();
    assert_eq!(cached.headers()["x-cache"], "HIT");
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn health_probe_against_live_backend() {
    use waypoint::HttpClient;

    let (addr, _) = spawn_backend().await;
    let client = HttpClientAdapter::new().unwrap();

    assert!(
        client
            .health_check(&format!("http://{addr}/health"), 2)
            .await
            .unwrap()
    );
    assert!(
        !client
            .health_check(&format!("http://{addr}/missing"), 2)
            .await
            .unwrap()
    );
}
