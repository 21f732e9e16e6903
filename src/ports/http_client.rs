use async_trait::async_trait;
use axum::body::Body as AxumBody;
use hyper::{Request, Response};
use thiserror::Error;

/// Custom error type for HTTP client operations
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum HttpClientError {
    /// Error when connection to backend fails
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Error when request times out
    #[error("Timeout error after {0} seconds")]
    Timeout(u64),

    /// Error when request is invalid
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// Result type alias for HTTP client operations
pub type HttpClientResult<T> = Result<T, HttpClientError>;

/// HttpClient defines the port (interface) for making HTTP requests to backends.
///
/// The forwarder only ever talks to backends through this trait, which keeps the
/// gateway core testable with an in-memory double.
#[async_trait]
pub trait HttpClient: Send + Sync + 'static {
    /// Send an HTTP request to a backend server.
    ///
    /// Implementations must not add headers of their own beyond what the transport
    /// requires (`Host`); the forwarder decides what reaches the backend.
    async fn send_request(&self, req: Request<AxumBody>) -> HttpClientResult<Response<AxumBody>>;

    /// Perform a health check on a backend
    ///
    /// # Arguments
    /// * `url` - The URL to check
    /// * `timeout_secs` - Timeout in seconds
    ///
    /// # Returns
    /// A future that resolves to true if the backend is healthy, false otherwise
    async fn health_check(&self, url: &str, timeout_secs: u64) -> HttpClientResult<bool>;
}
