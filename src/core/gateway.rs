//! Core gateway orchestration service.
//!
//! The `GatewayService` owns all runtime state of one gateway instance: the service
//! registry, the rate limiter windows and the response cache. Nothing is global; the
//! service is created once at startup and shared behind an `Arc`.
//!
//! Proxied requests move through `Received -> Authenticated -> RateChecked ->
//! (CacheHit | Forwarding) -> Responded`. While rate limiting is enabled every response
//! carries the `X-RateLimit-*` headers, including ones that end before the rate check.
use std::{collections::BTreeMap, sync::Arc, time::Instant};

use axum::{
    body::Body,
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use eyre::{Result, WrapErr};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header};
use serde::Serialize;

use crate::{
    config::{GatewayConfig, RateLimitConfig},
    core::{
        backend::EndpointView,
        cache::{CachedResponse, ResponseCache},
        error::GatewayError,
        forwarder::{ForwardRequest, ForwardResult, Forwarder},
        load_balancer::LoadBalancerFactory,
        pipeline::{
            self, ApiKeyStage, CacheLookupStage, KnownServiceStage, ProxyMethodStage,
            RateLimitStage, RequestContext, RequestState, Stage,
        },
        rate_limiter::{ClientWindow, RateDecision, SlidingWindowLimiter},
        registry::ServiceRegistry,
    },
    metrics,
    ports::http_client::HttpClient,
};

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");
pub const X_CACHE: HeaderName = HeaderName::from_static("x-cache");

/// Per-client window state as reported by the admin API.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitReport {
    pub rate_limits: BTreeMap<String, ClientWindow>,
    pub config: RateLimitSettings,
}

#[derive(Debug, Clone, Serialize)]
pub struct RateLimitSettings {
    pub window: u64,
    pub max_requests: u32,
}

/// Liveness summary for `/health`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub message: &'static str,
    pub backends: BackendCounts,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackendCounts {
    pub total: usize,
    pub healthy: usize,
}

pub struct GatewayService {
    config: Arc<GatewayConfig>,
    registry: Arc<ServiceRegistry>,
    limiter: Option<Arc<SlidingWindowLimiter>>,
    cache: Option<Arc<ResponseCache>>,
    auth: Arc<ApiKeyStage>,
    stages: Vec<Arc<dyn Stage>>,
    forwarder: Forwarder,
}

impl GatewayService {
    /// Build the gateway and its pipeline from configuration.
    pub fn new(config: Arc<GatewayConfig>, http_client: Arc<dyn HttpClient>) -> Result<Self> {
        let strategy = LoadBalancerFactory::create_strategy(&config.load_balancer.strategy);
        let registry = Arc::new(
            ServiceRegistry::from_config(&config.services, strategy)
                .wrap_err("Failed to build service registry")?,
        );

        let auth_header = HeaderName::from_bytes(config.auth.header.as_bytes())
            .wrap_err_with(|| format!("Invalid auth header name '{}'", config.auth.header))?;
        let auth = Arc::new(ApiKeyStage::new(auth_header, config.auth.api_keys.clone()));

        let limiter = config
            .rate_limit
            .enabled
            .then(|| Arc::new(SlidingWindowLimiter::new(&config.rate_limit)));
        let cache = config
            .cache
            .enabled
            .then(|| Arc::new(ResponseCache::new(config.cache.max_entries, config.cache.ttl)));

        let mut stages: Vec<Arc<dyn Stage>> = vec![
            auth.clone(),
            Arc::new(ProxyMethodStage),
            Arc::new(KnownServiceStage::new(registry.clone())),
        ];
        if let Some(limiter) = &limiter {
            stages.push(Arc::new(RateLimitStage::new(limiter.clone())));
        }
        if let Some(cache) = &cache {
            stages.push(Arc::new(CacheLookupStage::new(
                cache.clone(),
                config.cache.vary_headers.clone(),
            )));
        }
        tracing::debug!(
            stages = ?stages.iter().map(|s| s.name()).collect::<Vec<_>>(),
            "Request pipeline assembled"
        );

        let forwarder = Forwarder::new(registry.clone(), http_client, &config.upstream)?;

        Ok(Self {
            config,
            registry,
            limiter,
            cache,
            auth,
            stages,
            forwarder,
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    pub fn is_proxy_method(method: &Method) -> bool {
        pipeline::is_proxy_method(method)
    }

    /// Check the admin API key.
    pub fn authorize(&self, headers: &HeaderMap) -> Result<String, GatewayError> {
        self.auth.authenticate(headers)
    }

    /// Run one proxied request through the pipeline and produce the final response.
    pub async fn handle(&self, mut ctx: RequestContext) -> Response {
        let started = Instant::now();
        let service = ctx.service.clone();
        let method = ctx.method.clone();

        let mut response = self.dispatch(&mut ctx).await;
        let decision = match (ctx.rate.take(), &self.limiter) {
            (Some(decision), _) => Some(decision),
            // Ended before the rate check: report the window without using a slot
            (None, Some(limiter)) => Some(limiter.peek(&ctx.client_identity()).await),
            (None, None) => None,
        };
        if let Some(decision) = &decision {
            apply_rate_headers(response.headers_mut(), decision);
        }
        ctx.advance(RequestState::Responded);

        metrics::record_request(&service, method.as_str(), response.status().as_u16(), started.elapsed());
        tracing::info!(
            service = %service,
            method = %method,
            path = %ctx.path,
            status = response.status().as_u16(),
            "{} request to /{}/{}",
            method,
            service,
            ctx.path
        );
        response
    }

    async fn dispatch(&self, ctx: &mut RequestContext) -> Response {
        for stage in &self.stages {
            if let Err(response) = stage.process(ctx).await {
                return response;
            }
        }

        if let Some(cached) = ctx.cached.take() {
            let mut response = cached_response(cached);
            response
                .headers_mut()
                .insert(X_CACHE, HeaderValue::from_static("HIT"));
            return response;
        }

        ctx.advance(RequestState::Forwarding);
        let result = self
            .forwarder
            .forward(ForwardRequest {
                service: &ctx.service,
                path: &ctx.path,
                method: ctx.method.clone(),
                headers: &ctx.headers,
                query: ctx.query.as_deref(),
                body: std::mem::take(&mut ctx.body),
            })
            .await;

        match result {
            Ok(result) => {
                let cache_key = ctx.cache_key.take();
                let is_get = ctx.method == Method::GET;
                if let (Some(cache), Some(key), true) = (&self.cache, cache_key, is_get) {
                    self.store(cache, key, &result).await;
                }
                let mut response = forwarded_response(result);
                if self.cache.is_some() && is_get {
                    response
                        .headers_mut()
                        .insert(X_CACHE, HeaderValue::from_static("MISS"));
                }
                response
            }
            Err(err) => GatewayError::from(err).into_response(),
        }
    }

    /// Cache a successful read. A body that claims to be JSON but does not parse is
    /// passed through to the client but never cached.
    async fn store(&self, cache: &ResponseCache, key: String, result: &ForwardResult) {
        if !result.status.is_success() {
            return;
        }
        if result.content_type().is_some_and(is_json)
            && serde_json::from_slice::<serde::de::IgnoredAny>(&result.body).is_err()
        {
            tracing::warn!(
                backend = %result.backend,
                key = %key,
                "Malformed upstream response, skipping cache"
            );
            return;
        }

        cache.put(
            key.clone(),
            CachedResponse {
                status: result.status,
                headers: result.headers.clone(),
                body: result.body.clone(),
                content_type: result.content_type().map(str::to_string),
            },
        )
        .await;
        tracing::info!(key = %key, "Cached response");
    }

    /// Flush the response cache. `None` when caching is disabled.
    pub async fn clear_cache(&self) -> Option<usize> {
        let cache = self.cache.as_ref()?;
        let removed = cache.clear().await;
        tracing::info!(removed, "Cache cleared");
        Some(removed)
    }

    pub fn services(&self) -> BTreeMap<String, Vec<EndpointView>> {
        self.registry.view()
    }

    /// Current per-client windows. `None` when rate limiting is disabled.
    pub async fn rate_limits(&self) -> Option<RateLimitReport> {
        let limiter = self.limiter.as_ref()?;
        let rate_limits = limiter.snapshot().await.into_iter().collect();
        Some(RateLimitReport {
            rate_limits,
            config: settings(&self.config.rate_limit),
        })
    }

    pub fn health(&self) -> HealthReport {
        HealthReport {
            status: "ok",
            message: "API Gateway is running",
            backends: BackendCounts {
                total: self.registry.endpoint_count(),
                healthy: self.registry.healthy_endpoint_count(),
            },
        }
    }
}

fn settings(config: &RateLimitConfig) -> RateLimitSettings {
    RateLimitSettings {
        window: config.window.as_secs(),
        max_requests: config.max_requests,
    }
}

fn is_json(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .is_some_and(|mime| mime.trim().to_ascii_lowercase().ends_with("json"))
}

fn apply_rate_headers(headers: &mut HeaderMap, decision: &RateDecision) {
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(decision.limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(decision.remaining));
    headers.insert(
        X_RATELIMIT_RESET,
        HeaderValue::from(decision.reset_at.timestamp()),
    );
}

fn build_response(status: StatusCode, mut headers: HeaderMap, body: Bytes) -> Response {
    if !headers.contains_key(header::CONTENT_TYPE) {
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
    }
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

fn forwarded_response(result: ForwardResult) -> Response {
    build_response(result.status, result.headers, result.body)
}

fn cached_response(cached: CachedResponse) -> Response {
    build_response(cached.status, cached.headers, cached.body)
}
