use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body as AxumBody;
use eyre::Result;
use http_body_util::BodyExt;
use hyper::{Method, Request, Response, Version, header, header::HeaderValue};
use hyper_rustls::HttpsConnector;
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};
use rustls_native_certs::load_native_certs;
use tokio::time::timeout;

use crate::ports::http_client::{HttpClient, HttpClientError, HttpClientResult};

/// HTTP client adapter using Hyper with Rustls.
///
/// Backends are reached over plain HTTP/1.1 or TLS with the platform's root
/// certificates. The adapter sets `Host` and nothing else; header policy belongs to
/// the forwarder.
pub struct HttpClientAdapter {
    client: Client<HttpsConnector<HttpConnector>, AxumBody>,
}

impl HttpClientAdapter {
    /// Create a new HTTP client adapter.
    pub fn new() -> Result<Self> {
        // Install default crypto provider for rustls if not already set
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

        let mut http_connector = HttpConnector::new();
        http_connector.enforce_http(false); // Allow HTTPS URLs

        let mut root_cert_store = rustls::RootCertStore::empty();
        let native_certs = load_native_certs();

        if !native_certs.certs.is_empty() {
            for cert in native_certs.certs {
                if root_cert_store.add(cert).is_err() {
                    tracing::warn!("Failed to add native certificate to rustls RootCertStore");
                }
            }
            tracing::debug!("Loaded {} native root certificates.", root_cert_store.len());
        }

        if !native_certs.errors.is_empty() {
            tracing::warn!(
                "Some native certificates failed to load: {:?}",
                native_certs.errors
            );
        }

        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_cert_store)
            .with_no_client_auth();

        let https_connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls_config)
            .https_or_http()
            .enable_http1()
            .wrap_connector(http_connector);

        let client = Client::builder(TokioExecutor::new()).build::<_, AxumBody>(https_connector);

        Ok(Self { client })
    }

    fn host_header(req: &Request<AxumBody>) -> HttpClientResult<HeaderValue> {
        let Some(host) = req.uri().host() else {
            return Err(HttpClientError::InvalidRequest(format!(
                "Outgoing URI has no host: {}",
                req.uri()
            )));
        };
        let value = match req.uri().port_u16() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };
        HeaderValue::from_str(&value).map_err(|e| HttpClientError::InvalidRequest(e.to_string()))
    }
}

#[async_trait]
impl HttpClient for HttpClientAdapter {
    async fn send_request(
        &self,
        mut req: Request<AxumBody>,
    ) -> HttpClientResult<Response<AxumBody>> {
        let host = Self::host_header(&req)?;
        req.headers_mut().insert(header::HOST, host);

        let (mut parts, body) = req.into_parts();
        parts.version = Version::HTTP_11;
        let method = parts.method.clone();
        let uri = parts.uri.clone();

        tracing::debug!("Sending request: {} {}", method, uri);
        tracing::trace!("Outgoing request headers: {:?}", parts.headers);

        match self.client.request(Request::from_parts(parts, body)).await {
            Ok(response) => {
                let (mut parts, hyper_body) = response.into_parts();
                // Body is re-framed by the gateway's own server
                parts.headers.remove(header::TRANSFER_ENCODING);
                Ok(Response::from_parts(parts, AxumBody::new(hyper_body)))
            }
            Err(e) => Err(HttpClientError::ConnectionError(format!(
                "Request to {method} {uri} failed: {e}"
            ))),
        }
    }

    async fn health_check(&self, url: &str, timeout_secs: u64) -> HttpClientResult<bool> {
        let request = Request::builder()
            .method(Method::GET)
            .uri(url)
            .version(Version::HTTP_11)
            .body(AxumBody::empty())
            .map_err(|e| HttpClientError::InvalidRequest(e.to_string()))?;

        tracing::debug!("Health checking URL: {}", url);
        let timeout_duration = Duration::from_secs(timeout_secs);

        match timeout(timeout_duration, self.client.request(request)).await {
            Ok(Ok(response)) => {
                let is_healthy = response.status().is_success();
                // Consume the body so the connection can be reused
                let _ = response.into_body().collect().await;
                tracing::debug!("Health check for {} result: {}", url, is_healthy);
                Ok(is_healthy)
            }
            Ok(Err(err)) => {
                tracing::debug!("Health check error for {}: {}", url, err);
                Ok(false)
            }
            Err(_) => {
                tracing::debug!("Health check timeout for {}", url);
                Err(HttpClientError::Timeout(timeout_secs))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_http_client_creation() {
        let client = HttpClientAdapter::new();
        assert!(client.is_ok());
    }

    #[test]
    fn test_host_header_includes_port() {
        let req = Request::builder()
            .uri("http://localhost:8001/users")
            .body(AxumBody::empty())
            .unwrap();
        assert_eq!(
            HttpClientAdapter::host_header(&req).unwrap(),
            HeaderValue::from_static("localhost:8001")
        );
    }

    #[test]
    fn test_host_header_requires_host() {
        let req = Request::builder()
            .uri("/relative")
            .body(AxumBody::empty())
            .unwrap();
        assert!(HttpClientAdapter::host_header(&req).is_err());
    }

    #[tokio::test]
    async fn test_health_check_invalid_url() {
        let client = HttpClientAdapter::new().unwrap();
        let result = client.health_check("invalid-url", 5).await;

        // Connection errors are reported as unhealthy rather than as failures
        match result {
            Ok(false) => {}
            _ => panic!("Expected Ok(false) for invalid URL"),
        }
    }

    #[tokio::test]
    async fn test_send_request_connection_refused() {
        let client = HttpClientAdapter::new().unwrap();
        let req = Request::builder()
            .uri("http://127.0.0.1:1/")
            .body(AxumBody::empty())
            .unwrap();
        assert!(matches!(
            client.send_request(req).await,
            Err(HttpClientError::ConnectionError(_))
        ));
    }
}
