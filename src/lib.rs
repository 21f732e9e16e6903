//! Waypoint - an API gateway in front of a fixed set of backend services.
//!
//! Clients call `/api/{service}/{path}` with an API key. Waypoint authenticates the key,
//! applies a per-client sliding-window rate limit, answers repeated reads from a bounded
//! LRU cache and otherwise forwards the request to a healthy endpoint of the service.
//!
//! The crate follows a **hexagonal architecture**: `core` holds the gateway logic
//! (registry, load balancing, rate limiting, caching, forwarding and the request
//! pipeline), `ports` defines the traits it depends on and `adapters` provides the
//! HTTP server, the hyper based upstream client, active health checks and config
//! file watching.
//!
//! # Quick Example
//! ```no_run
//! use std::sync::Arc;
//!
//! use waypoint::{GatewayService, HttpClientAdapter, HttpHandler, config::GatewayConfig};
//!
//! # #[tokio::main] async fn main() -> eyre::Result<()> {
//! let config = GatewayConfig::builder()
//!     .service("user_service", ["http://localhost:8001"])
//!     .build()
//!     .map_err(|e| eyre::eyre!(e))?;
//! let client = Arc::new(HttpClientAdapter::new()?);
//! let gateway = Arc::new(GatewayService::new(Arc::new(config), client)?);
//! let app = HttpHandler::new(gateway).router();
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:5000").await?;
//! axum::serve(listener, app).await?;
//! # Ok(()) }
//! ```
//!
//! # Error Handling
//! Request failures are `thiserror` enums rendered as a JSON `{error, message?}`
//! envelope. Startup and configuration code returns `eyre::Result` with context.
//!
//! # Concurrency & Data Structures
//! Rate-limit windows live in an `scc::HashMap`, the service registry is an `ArcSwap`
//! snapshot with atomic health flags and the response cache is a `moka` LRU cache.
//! All of it is owned by one [`GatewayService`]; there is no global state.
pub mod config;
pub mod metrics;
pub mod ports;
pub mod tracing_setup;
pub mod utils;

pub mod adapters;
pub mod core;

pub use crate::{
    adapters::{FileConfigProvider, HealthChecker, HttpClientAdapter, HttpHandler},
    core::GatewayService,
    ports::http_client::HttpClient,
    utils::GracefulShutdown,
};
