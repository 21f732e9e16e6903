//! Interceptor chain run by the dispatcher before a request is forwarded.
//!
//! Each [`Stage`] inspects and annotates a [`RequestContext`] and either lets it continue
//! or ends the request with a terminal response. The dispatcher composes the stages in
//! order: API key, proxy method, known service, rate limit, cache lookup.
use std::{net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use axum::{
    Json,
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header};
use serde_json::json;

use crate::{
    core::{
        cache::{CachedResponse, ResponseCache, cache_key},
        error::GatewayError,
        rate_limiter::{RateDecision, SlidingWindowLimiter},
        registry::ServiceRegistry,
    },
    metrics,
};

/// Lifecycle of a proxied request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Received,
    Authenticated,
    RateChecked,
    CacheHit,
    Forwarding,
    Responded,
}

/// Everything the pipeline knows about one inbound proxied request.
#[derive(Debug)]
pub struct RequestContext {
    pub service: String,
    /// Path below `/api/{service}/`, as received (percent-encoded)
    pub path: String,
    pub method: Method,
    pub headers: HeaderMap,
    pub query: Option<String>,
    pub body: Bytes,
    pub remote_addr: Option<SocketAddr>,
    pub state: RequestState,
    /// Identity used for rate limiting; the API key once authenticated
    pub client_id: Option<String>,
    pub rate: Option<RateDecision>,
    pub cache_key: Option<String>,
    pub cached: Option<CachedResponse>,
}

impl RequestContext {
    pub fn new(service: impl Into<String>, path: impl Into<String>, method: Method) -> Self {
        Self {
            service: service.into(),
            path: path.into(),
            method,
            headers: HeaderMap::new(),
            query: None,
            body: Bytes::new(),
            remote_addr: None,
            state: RequestState::Received,
            client_id: None,
            rate: None,
            cache_key: None,
            cached: None,
        }
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_query(mut self, query: Option<String>) -> Self {
        self.query = query.filter(|q| !q.is_empty());
        self
    }

    pub fn with_body(mut self, body: Bytes) -> Self {
        self.body = body;
        self
    }

    pub fn with_remote_addr(mut self, addr: Option<SocketAddr>) -> Self {
        self.remote_addr = addr;
        self
    }

    pub fn advance(&mut self, next: RequestState) {
        tracing::trace!(from = ?self.state, to = ?next, service = %self.service, "Request state");
        self.state = next;
    }

    /// API key when present, else the source IP.
    pub fn client_identity(&self) -> String {
        match (&self.client_id, self.remote_addr) {
            (Some(id), _) => id.clone(),
            (None, Some(addr)) => addr.ip().to_string(),
            (None, None) => "unknown".to_string(),
        }
    }
}

#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    /// Continue with `Ok(())` or end the request with a terminal response.
    async fn process(&self, ctx: &mut RequestContext) -> Result<(), Response>;
}

/// Requires one of the configured API keys in the auth header.
pub struct ApiKeyStage {
    header: HeaderName,
    keys: Vec<String>,
}

impl ApiKeyStage {
    pub fn new(header: HeaderName, keys: Vec<String>) -> Self {
        Self { header, keys }
    }

    /// Returns the presented key if it is accepted.
    pub fn authenticate(&self, headers: &HeaderMap) -> Result<String, GatewayError> {
        headers
            .get(&self.header)
            .and_then(|value| value.to_str().ok())
            .filter(|key| self.keys.iter().any(|accepted| accepted == key))
            .map(str::to_string)
            .ok_or(GatewayError::Unauthorized)
    }
}

#[async_trait]
impl Stage for ApiKeyStage {
    fn name(&self) -> &'static str {
        "api_key"
    }

    async fn process(&self, ctx: &mut RequestContext) -> Result<(), Response> {
        let key = self.authenticate(&ctx.headers).map_err(|err| {
            tracing::debug!(service = %ctx.service, "Rejected request without valid API key");
            err.into_response()
        })?;
        ctx.client_id = Some(key);
        ctx.advance(RequestState::Authenticated);
        Ok(())
    }
}

const PROXY_METHODS: [Method; 5] = [
    Method::GET,
    Method::POST,
    Method::PUT,
    Method::DELETE,
    Method::PATCH,
];

pub fn is_proxy_method(method: &Method) -> bool {
    PROXY_METHODS.contains(method)
}

/// Answers 405 for methods the gateway does not forward. Runs after authentication so
/// the rejection is attributed to the caller's key.
pub struct ProxyMethodStage;

#[async_trait]
impl Stage for ProxyMethodStage {
    fn name(&self) -> &'static str {
        "proxy_method"
    }

    async fn process(&self, ctx: &mut RequestContext) -> Result<(), Response> {
        if is_proxy_method(&ctx.method) {
            Ok(())
        } else {
            Err(GatewayError::MethodNotAllowed.into_response())
        }
    }
}

/// Rejects requests for services the registry does not know.
pub struct KnownServiceStage {
    registry: Arc<ServiceRegistry>,
}

impl KnownServiceStage {
    pub fn new(registry: Arc<ServiceRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Stage for KnownServiceStage {
    fn name(&self) -> &'static str {
        "known_service"
    }

    async fn process(&self, ctx: &mut RequestContext) -> Result<(), Response> {
        if self.registry.contains(&ctx.service) {
            Ok(())
        } else {
            Err(GatewayError::ServiceNotFound(ctx.service.clone()).into_response())
        }
    }
}

/// Sliding window limit per client.
pub struct RateLimitStage {
    limiter: Arc<SlidingWindowLimiter>,
}

impl RateLimitStage {
    pub fn new(limiter: Arc<SlidingWindowLimiter>) -> Self {
        Self { limiter }
    }
}

#[async_trait]
impl Stage for RateLimitStage {
    fn name(&self) -> &'static str {
        "rate_limit"
    }

    async fn process(&self, ctx: &mut RequestContext) -> Result<(), Response> {
        let client = ctx.client_identity();
        let decision = self.limiter.allow(&client).await;
        ctx.rate = Some(decision.clone());
        ctx.advance(RequestState::RateChecked);

        if decision.allowed {
            return Ok(());
        }

        metrics::increment_rate_limit_rejections();
        let retry_after = decision.retry_after_secs().unwrap_or(1);
        tracing::info!(client = %client, retry_after, "Rate limit exceeded");

        let body = json!({
            "error": "Rate limit exceeded",
            "limit": decision.limit,
            "window": self.limiter.window().as_secs(),
            "retry_after": retry_after,
        });
        let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
        response
            .headers_mut()
            .insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
        Err(response)
    }
}

/// Serves idempotent reads from the response cache.
pub struct CacheLookupStage {
    cache: Arc<ResponseCache>,
    vary_headers: Vec<String>,
}

impl CacheLookupStage {
    pub fn new(cache: Arc<ResponseCache>, vary_headers: Vec<String>) -> Self {
        Self {
            cache,
            vary_headers,
        }
    }
}

#[async_trait]
impl Stage for CacheLookupStage {
    fn name(&self) -> &'static str {
        "cache_lookup"
    }

    async fn process(&self, ctx: &mut RequestContext) -> Result<(), Response> {
        if ctx.method != Method::GET {
            return Ok(());
        }

        let key = cache_key(
            &ctx.service,
            &ctx.path,
            ctx.query.as_deref(),
            &ctx.headers,
            &self.vary_headers,
        );
        match self.cache.get(&key).await {
            Some(cached) => {
                tracing::info!(service = %ctx.service, key = %key, "Cache hit");
                metrics::record_cache_lookup(true);
                ctx.cached = Some(cached);
                ctx.advance(RequestState::CacheHit);
            }
            None => metrics::record_cache_lookup(false),
        }
        ctx.cache_key = Some(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeMap, time::Duration};

    use super::*;
    use crate::{
        config::{LoadBalanceStrategy, RateLimitConfig},
        core::load_balancer::LoadBalancerFactory,
    };

    fn headers_with_key(key: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static(key));
        headers
    }

    fn api_key_stage() -> ApiKeyStage {
        ApiKeyStage::new(
            HeaderName::from_static("x-api-key"),
            vec!["good".to_string(), "other".to_string()],
        )
    }

    #[tokio::test]
    async fn test_api_key_stage_accepts_configured_key() {
        let stage = api_key_stage();
        let mut ctx = RequestContext::new("s", "p", Method::GET).with_headers(headers_with_key("other"));

        assert!(stage.process(&mut ctx).await.is_ok());
        assert_eq!(ctx.state, RequestState::Authenticated);
        assert_eq!(ctx.client_id.as_deref(), Some("other"));
    }

    #[tokio::test]
    async fn test_api_key_stage_rejects_missing_or_wrong_key() {
        let stage = api_key_stage();

        let mut missing = RequestContext::new("s", "p", Method::GET);
        let response = stage.process(&mut missing).await.unwrap_err();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(missing.state, RequestState::Received);

        let mut wrong = RequestContext::new("s", "p", Method::GET).with_headers(headers_with_key("bad"));
        assert!(stage.process(&mut wrong).await.is_err());
    }

    #[tokio::test]
    async fn test_known_service_stage() {
        let mut services = BTreeMap::new();
        services.insert("user_service".to_string(), vec!["http://localhost:8001".to_string()]);
        let registry = Arc::new(
            ServiceRegistry::from_config(
                &services,
                LoadBalancerFactory::create_strategy(&LoadBalanceStrategy::Random),
            )
            .unwrap(),
        );
        let stage = KnownServiceStage::new(registry);

        let mut known = RequestContext::new("user_service", "users", Method::GET);
        assert!(stage.process(&mut known).await.is_ok());

        let mut unknown = RequestContext::new("nope", "x", Method::GET);
        let response = stage.process(&mut unknown).await.unwrap_err();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_rate_limit_stage_rejects_with_retry_after() {
        let limiter = Arc::new(SlidingWindowLimiter::new(&RateLimitConfig {
            enabled: true,
            window: Duration::from_secs(60),
            max_requests: 1,
        }));
        let stage = RateLimitStage::new(limiter);

        let mut first = RequestContext::new("s", "p", Method::GET);
        first.client_id = Some("k".into());
        assert!(stage.process(&mut first).await.is_ok());
        assert_eq!(first.rate.as_ref().unwrap().remaining, 0);

        let mut second = RequestContext::new("s", "p", Method::GET);
        second.client_id = Some("k".into());
        let response = stage.process(&mut second).await.unwrap_err();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(response.headers().contains_key(header::RETRY_AFTER));
        assert!(!second.rate.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_retry_after_is_time_until_oldest_request_expires() {
        let limiter = Arc::new(SlidingWindowLimiter::new(&RateLimitConfig {
            enabled: true,
            window: Duration::from_secs(60),
            max_requests: 100,
        }));
        let filled_at = chrono::Utc::now() - chrono::TimeDelta::seconds(20);
        for _ in 0..100 {
            assert!(limiter.allow_at("k", filled_at).await.allowed);
        }
        let stage = RateLimitStage::new(limiter);

        let mut ctx = RequestContext::new("s", "p", Method::GET);
        ctx.client_id = Some("k".into());
        let response = stage.process(&mut ctx).await.unwrap_err();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "40");
        assert_eq!(
            ctx.rate.unwrap().reset_at,
            filled_at + chrono::TimeDelta::seconds(60)
        );
    }

    #[tokio::test]
    async fn test_proxy_method_stage() {
        let mut patch = RequestContext::new("s", "p", Method::PATCH);
        assert!(ProxyMethodStage.process(&mut patch).await.is_ok());

        let mut options = RequestContext::new("s", "p", Method::OPTIONS);
        let response = ProxyMethodStage.process(&mut options).await.unwrap_err();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_cache_lookup_only_for_get() {
        let cache = Arc::new(ResponseCache::new(10, Duration::from_secs(60)));
        let stage = CacheLookupStage::new(cache.clone(), vec![]);

        let mut post = RequestContext::new("s", "p", Method::POST);
        stage.process(&mut post).await.unwrap();
        assert!(post.cache_key.is_none());

        let mut get = RequestContext::new("s", "p", Method::GET);
        stage.process(&mut get).await.unwrap();
        let key = get.cache_key.clone().unwrap();
        assert!(get.cached.is_none());

        cache.put(
            key,
            CachedResponse {
                status: StatusCode::OK,
                headers: HeaderMap::new(),
                body: Bytes::from_static(b"[]"),
                content_type: None,
            },
        )
        .await;
        let mut again = RequestContext::new("s", "p", Method::GET);
        stage.process(&mut again).await.unwrap();
        assert_eq!(again.state, RequestState::CacheHit);
        assert!(again.cached.is_some());
    }

    #[test]
    fn test_client_identity_falls_back_to_address() {
        let ctx = RequestContext::new("s", "p", Method::GET)
            .with_remote_addr(Some("10.0.0.7:5555".parse().unwrap()));
        assert_eq!(ctx.client_identity(), "10.0.0.7");
    }
}
