//! Upstream request forwarding.
//!
//! The forwarder resolves a backend for the target service, builds the upstream request
//! from an explicit per-method allow-list of inbound headers, and copies back only a
//! fixed allow-list of response headers. It never retries: a failed call is reported to
//! the caller exactly once.
use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use axum::body::Body as AxumBody;
use bytes::Bytes;
use eyre::{Result, WrapErr};
use http::{HeaderMap, HeaderName, HeaderValue, Method, Request, StatusCode, Uri, header};
use http_body_util::BodyExt;
use thiserror::Error;
use tracing::Instrument;

use crate::{
    config::UpstreamConfig,
    core::registry::ServiceRegistry,
    metrics,
    ports::http_client::{HttpClient, HttpClientError},
};

const GET_REQUEST_HEADERS: &[HeaderName] = &[
    header::AUTHORIZATION,
    header::ACCEPT,
    header::ACCEPT_LANGUAGE,
];
const WRITE_REQUEST_HEADERS: &[HeaderName] = &[header::AUTHORIZATION, header::CONTENT_TYPE];
const DELETE_REQUEST_HEADERS: &[HeaderName] = &[header::AUTHORIZATION];

/// Response headers copied back from the upstream. Everything else is dropped.
pub const RESPONSE_HEADER_ALLOW_LIST: &[HeaderName] = &[
    header::CONTENT_TYPE,
    header::CONTENT_LENGTH,
    header::CONTENT_LANGUAGE,
    header::ETAG,
];

/// Inbound headers that may be forwarded for a given method.
pub fn request_header_allow_list(method: &Method) -> &'static [HeaderName] {
    if method == Method::GET {
        GET_REQUEST_HEADERS
    } else if method == Method::POST || method == Method::PUT || method == Method::PATCH {
        WRITE_REQUEST_HEADERS
    } else if method == Method::DELETE {
        DELETE_REQUEST_HEADERS
    } else {
        &[]
    }
}

fn copy_allowed(source: &HeaderMap, allowed: &[HeaderName]) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for name in allowed {
        for value in source.get_all(name) {
            headers.append(name.clone(), value.clone());
        }
    }
    headers
}

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ForwardError {
    #[error("Service {0} not found")]
    ServiceNotFound(String),

    #[error("No healthy backend available for service {0}")]
    ServiceUnavailable(String),

    #[error("Upstream {backend} did not respond within {timeout:?}")]
    UpstreamTimeout { backend: String, timeout: Duration },

    #[error("Upstream {backend} is unreachable: {reason}")]
    UpstreamUnreachable { backend: String, reason: String },

    #[error("Invalid upstream URL {0}")]
    InvalidUpstreamUrl(String),
}

/// An inbound request, reduced to what the forwarder needs.
#[derive(Debug, Clone)]
pub struct ForwardRequest<'a> {
    pub service: &'a str,
    /// Path below the service prefix, still percent-encoded
    pub path: &'a str,
    pub method: Method,
    /// All inbound headers; the forwarder applies the allow-list
    pub headers: &'a HeaderMap,
    pub query: Option<&'a str>,
    pub body: Bytes,
}

/// Normalized upstream response.
#[derive(Debug, Clone)]
pub struct ForwardResult {
    pub status: StatusCode,
    /// Only headers from [`RESPONSE_HEADER_ALLOW_LIST`]
    pub headers: HeaderMap,
    pub body: Bytes,
    pub backend: String,
}

impl ForwardResult {
    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
    }
}

pub struct Forwarder {
    registry: Arc<ServiceRegistry>,
    client: Arc<dyn HttpClient>,
    timeout: Duration,
    gateway_header: HeaderName,
    gateway_id: HeaderValue,
}

impl Forwarder {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        client: Arc<dyn HttpClient>,
        config: &UpstreamConfig,
    ) -> Result<Self> {
        let gateway_header = HeaderName::from_bytes(config.gateway_header.as_bytes())
            .wrap_err_with(|| format!("Invalid gateway header name '{}'", config.gateway_header))?;
        let gateway_id = HeaderValue::from_str(&config.gateway_id)
            .wrap_err_with(|| format!("Invalid gateway id '{}'", config.gateway_id))?;

        Ok(Self {
            registry,
            client,
            timeout: config.timeout,
            gateway_header,
            gateway_id,
        })
    }

    /// Forward one request to a healthy backend of `request.service`.
    pub async fn forward(&self, request: ForwardRequest<'_>) -> Result<ForwardResult, ForwardError> {
        let service = request.service;
        if !self.registry.contains(service) {
            return Err(ForwardError::ServiceNotFound(service.to_string()));
        }
        let endpoint = self
            .registry
            .resolve(service)
            .ok_or_else(|| ForwardError::ServiceUnavailable(service.to_string()))?;
        let backend = endpoint.url().to_string();

        let url = endpoint.url().join(request.path, request.query);
        let uri: Uri = url
            .parse()
            .map_err(|_| ForwardError::InvalidUpstreamUrl(url.clone()))?;

        let mut upstream = Request::new(AxumBody::from(request.body));
        *upstream.method_mut() = request.method.clone();
        *upstream.uri_mut() = uri;
        *upstream.headers_mut() =
            copy_allowed(request.headers, request_header_allow_list(&request.method));
        upstream
            .headers_mut()
            .insert(self.gateway_header.clone(), self.gateway_id.clone());

        let span = tracing::info_span!(
            "upstream_request",
            service = %service,
            backend = %backend,
            http.method = %request.method,
            http.path = %request.path,
            http.status_code = tracing::field::Empty,
        );

        let started = Instant::now();
        let client = self.client.clone();
        let outcome = tokio::time::timeout(self.timeout, async move {
            let response = client.send_request(upstream).await?;
            let (parts, body) = response.into_parts();
            let body = body
                .collect()
                .await
                .map_err(|e| HttpClientError::ConnectionError(format!("reading body: {e}")))?
                .to_bytes();
            Ok::<_, HttpClientError>((parts, body))
        })
        .instrument(span.clone())
        .await;
        let elapsed = started.elapsed();

        let failure = match outcome {
            Ok(Ok((parts, body))) => {
                span.record("http.status_code", parts.status.as_u16());
                metrics::record_upstream_request(&backend, parts.status.as_u16(), elapsed);
                return Ok(ForwardResult {
                    status: parts.status,
                    headers: copy_allowed(&parts.headers, RESPONSE_HEADER_ALLOW_LIST),
                    body,
                    backend,
                });
            }
            Err(_) | Ok(Err(HttpClientError::Timeout(_))) => ForwardError::UpstreamTimeout {
                backend: backend.clone(),
                timeout: self.timeout,
            },
            Ok(Err(e)) => ForwardError::UpstreamUnreachable {
                backend: backend.clone(),
                reason: e.to_string(),
            },
        };

        metrics::record_upstream_request(&backend, 0, elapsed);
        tracing::error!(
            service = %service,
            path = %request.path,
            backend = %backend,
            error = %failure,
            "Error forwarding request"
        );
        Err(failure)
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeMap, sync::Mutex};

    use async_trait::async_trait;
    use http::Response;

    use super::*;
    use crate::{
        config::LoadBalanceStrategy,
        core::load_balancer::LoadBalancerFactory,
        ports::http_client::HttpClientResult,
    };

    #[derive(Default)]
    struct RecordingClient {
        seen: Mutex<Vec<(Method, String, HeaderMap)>>,
        refuse: bool,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl HttpClient for RecordingClient {
        async fn send_request(
            &self,
            req: Request<AxumBody>,
        ) -> HttpClientResult<Response<AxumBody>> {
            self.seen.lock().unwrap().push((
                req.method().clone(),
                req.uri().to_string(),
                req.headers().clone(),
            ));
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.refuse {
                return Err(HttpClientError::ConnectionError("refused".into()));
            }
            Ok(Response::builder()
                .status(200)
                .header("content-type", "application/json")
                .header("etag", "\"v1\"")
                .header("set-cookie", "session=abc")
                .header("server", "backend/1.0")
                .body(AxumBody::from("{\"ok\":true}"))
                .unwrap())
        }

        async fn health_check(&self, _url: &str, _timeout_secs: u64) -> HttpClientResult<bool> {
            Ok(true)
        }
    }

    fn registry() -> Arc<ServiceRegistry> {
        let mut services = BTreeMap::new();
        services.insert(
            "order_service".to_string(),
            vec!["http://localhost:8021".to_string()],
        );
        Arc::new(
            ServiceRegistry::from_config(
                &services,
                LoadBalancerFactory::create_strategy(&LoadBalanceStrategy::Random),
            )
            .unwrap(),
        )
    }

    fn forwarder(client: Arc<RecordingClient>, timeout: Duration) -> Forwarder {
        let config = UpstreamConfig {
            timeout,
            ..UpstreamConfig::default()
        };
        Forwarder::new(registry(), client, &config).unwrap()
    }

    fn inbound_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer t"));
        headers.insert("accept", HeaderValue::from_static("application/json"));
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        headers.insert("x-api-key", HeaderValue::from_static("secret"));
        headers.insert("cookie", HeaderValue::from_static("a=b"));
        headers.insert("connection", HeaderValue::from_static("keep-alive"));
        headers
    }

    fn request<'a>(method: Method, headers: &'a HeaderMap) -> ForwardRequest<'a> {
        ForwardRequest {
            service: "order_service",
            path: "orders/5",
            method,
            headers,
            query: Some("expand=items"),
            body: Bytes::new(),
        }
    }

    #[test]
    fn test_allow_lists_per_method() {
        assert_eq!(request_header_allow_list(&Method::GET).len(), 3);
        assert_eq!(
            request_header_allow_list(&Method::POST),
            request_header_allow_list(&Method::PATCH)
        );
        assert_eq!(request_header_allow_list(&Method::DELETE), &[header::AUTHORIZATION]);
        assert!(request_header_allow_list(&Method::OPTIONS).is_empty());
    }

    #[tokio::test]
    async fn test_get_forwards_only_allowed_headers() {
        let client = Arc::new(RecordingClient::default());
        let forwarder = forwarder(client.clone(), Duration::from_secs(5));
        let headers = inbound_headers();

        let result = forwarder.forward(request(Method::GET, &headers)).await.unwrap();
        assert_eq!(result.status, StatusCode::OK);
        assert_eq!(result.backend, "http://localhost:8021");

        let seen = client.seen.lock().unwrap();
        let (method, uri, sent) = &seen[0];
        assert_eq!(*method, Method::GET);
        assert_eq!(uri, "http://localhost:8021/orders/5?expand=items");

        let mut names: Vec<&str> = sent.keys().map(|k| k.as_str()).collect();
        names.sort_unstable();
        assert_eq!(
            names,
            vec!["accept", "authorization", "x-gateway-source"]
        );
        assert_eq!(sent["x-gateway-source"], "api-gateway");
    }

    #[tokio::test]
    async fn test_delete_forwards_authorization_only() {
        let client = Arc::new(RecordingClient::default());
        let forwarder = forwarder(client.clone(), Duration::from_secs(5));
        let headers = inbound_headers();

        forwarder.forward(request(Method::DELETE, &headers)).await.unwrap();

        let seen = client.seen.lock().unwrap();
        let sent = &seen[0].2;
        assert_eq!(sent.len(), 2);
        assert!(sent.contains_key("authorization"));
        assert!(sent.contains_key("x-gateway-source"));
    }

    #[tokio::test]
    async fn test_response_headers_are_filtered() {
        let client = Arc::new(RecordingClient::default());
        let forwarder = forwarder(client, Duration::from_secs(5));
        let headers = inbound_headers();

        let result = forwarder.forward(request(Method::GET, &headers)).await.unwrap();
        assert_eq!(result.content_type(), Some("application/json"));
        assert!(result.headers.contains_key("etag"));
        assert!(!result.headers.contains_key("set-cookie"));
        assert!(!result.headers.contains_key("server"));
        assert_eq!(result.body, Bytes::from_static(b"{\"ok\":true}"));
    }

    #[tokio::test]
    async fn test_unknown_service() {
        let client = Arc::new(RecordingClient::default());
        let forwarder = forwarder(client.clone(), Duration::from_secs(5));
        let headers = HeaderMap::new();
        let mut req = request(Method::GET, &headers);
        req.service = "billing_service";

        assert!(matches!(
            forwarder.forward(req).await,
            Err(ForwardError::ServiceNotFound(name)) if name == "billing_service"
        ));
        assert!(client.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_no_healthy_backend() {
        let client = Arc::new(RecordingClient::default());
        let forwarder = forwarder(client.clone(), Duration::from_secs(5));
        forwarder.registry.mark_unhealthy("http://localhost:8021");
        let headers = HeaderMap::new();

        assert!(matches!(
            forwarder.forward(request(Method::GET, &headers)).await,
            Err(ForwardError::ServiceUnavailable(_))
        ));
        assert!(client.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_connection_error_is_unreachable() {
        let client = Arc::new(RecordingClient {
            refuse: true,
            ..RecordingClient::default()
        });
        let forwarder = forwarder(client.clone(), Duration::from_secs(5));
        let headers = HeaderMap::new();

        assert!(matches!(
            forwarder.forward(request(Method::POST, &headers)).await,
            Err(ForwardError::UpstreamUnreachable { .. })
        ));
        // Never retried
        assert_eq!(client.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_slow_upstream_times_out() {
        let client = Arc::new(RecordingClient {
            delay: Some(Duration::from_secs(5)),
            ..RecordingClient::default()
        });
        let forwarder = forwarder(client, Duration::from_millis(50));
        let headers = HeaderMap::new();

        let err = forwarder
            .forward(request(Method::GET, &headers))
            .await
            .unwrap_err();
        assert!(matches!(err, ForwardError::UpstreamTimeout { .. }));
    }
}
