//! Configuration data structures for Waypoint.
//!
//! These types map directly to TOML (also JSON / YAML) configuration files. They are
//! serde‑friendly and include defaults so that a minimal config only needs to list the
//! backend services. Durations use humantime strings (`"60s"`, `"5m"`).
use std::{collections::BTreeMap, time::Duration};

use serde::{Deserialize, Serialize};

/// Legacy default key; still accepted when no keys are configured, with a startup warning.
pub const DEFAULT_API_KEY: &str = "test-api-key";

fn default_listen_addr() -> String {
    "0.0.0.0:5000".to_string()
}

/// Top level gateway configuration.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GatewayConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub load_balancer: LoadBalancerConfig,
    #[serde(default)]
    pub health_check: HealthCheckConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Logical service name -> ordered list of backend base URLs.
    #[serde(default)]
    pub services: BTreeMap<String, Vec<String>>,
}

impl GatewayConfig {
    /// Create a new gateway configuration builder
    pub fn builder() -> GatewayConfigBuilder {
        GatewayConfigBuilder::default()
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            auth: AuthConfig::default(),
            rate_limit: RateLimitConfig::default(),
            cache: CacheConfig::default(),
            upstream: UpstreamConfig::default(),
            load_balancer: LoadBalancerConfig::default(),
            health_check: HealthCheckConfig::default(),
            logging: LoggingConfig::default(),
            services: BTreeMap::new(),
        }
    }
}

/// Builder for GatewayConfig, mostly used by tests and embedders.
#[derive(Default)]
pub struct GatewayConfigBuilder {
    listen_addr: Option<String>,
    api_keys: Vec<String>,
    rate_limit: Option<RateLimitConfig>,
    cache: Option<CacheConfig>,
    upstream: Option<UpstreamConfig>,
    load_balancer: Option<LoadBalancerConfig>,
    health_check: Option<HealthCheckConfig>,
    services: BTreeMap<String, Vec<String>>,
}

impl GatewayConfigBuilder {
    /// Set the listen address
    pub fn listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.listen_addr = Some(addr.into());
        self
    }

    /// Accept an additional API key
    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.api_keys.push(key.into());
        self
    }

    /// Register a service with its backend endpoints
    pub fn service<I, S>(mut self, name: impl Into<String>, endpoints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.services
            .insert(name.into(), endpoints.into_iter().map(Into::into).collect());
        self
    }

    pub fn rate_limit(mut self, config: RateLimitConfig) -> Self {
        self.rate_limit = Some(config);
        self
    }

    pub fn cache(mut self, config: CacheConfig) -> Self {
        self.cache = Some(config);
        self
    }

    pub fn upstream(mut self, config: UpstreamConfig) -> Self {
        self.upstream = Some(config);
        self
    }

    pub fn load_balancer(mut self, config: LoadBalancerConfig) -> Self {
        self.load_balancer = Some(config);
        self
    }

    pub fn health_check(mut self, config: HealthCheckConfig) -> Self {
        self.health_check = Some(config);
        self
    }

    /// Build the final GatewayConfig
    pub fn build(self) -> Result<GatewayConfig, String> {
        if self.services.is_empty() {
            return Err("At least one service must be configured".to_string());
        }

        let auth = if self.api_keys.is_empty() {
            AuthConfig::default()
        } else {
            AuthConfig {
                api_keys: self.api_keys,
                ..AuthConfig::default()
            }
        };

        Ok(GatewayConfig {
            listen_addr: self.listen_addr.unwrap_or_else(default_listen_addr),
            auth,
            rate_limit: self.rate_limit.unwrap_or_default(),
            cache: self.cache.unwrap_or_default(),
            upstream: self.upstream.unwrap_or_default(),
            load_balancer: self.load_balancer.unwrap_or_default(),
            health_check: self.health_check.unwrap_or_default(),
            logging: LoggingConfig::default(),
            services: self.services,
        })
    }
}

/// API key authentication settings.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct AuthConfig {
    /// Header carrying the key
    pub header: String,
    /// Accepted keys; each key is also the client identity for rate limiting
    pub api_keys: Vec<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            header: "X-API-Key".to_string(),
            api_keys: vec![DEFAULT_API_KEY.to_string()],
        }
    }
}

/// Sliding window rate limiting settings.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    pub max_requests: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window: Duration::from_secs(60),
            max_requests: 100,
        }
    }
}

/// Response cache settings.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    pub max_entries: usize,
    /// Request headers folded into the cache key (case-insensitive)
    pub vary_headers: Vec<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl: Duration::from_secs(300),
            max_entries: 10_000,
            vary_headers: vec![
                "accept".to_string(),
                "accept-language".to_string(),
                "authorization".to_string(),
            ],
        }
    }
}

/// Settings for calls to backend services.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct UpstreamConfig {
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Name of the header identifying the gateway to backends
    pub gateway_header: String,
    pub gateway_id: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            gateway_header: "X-Gateway-Source".to_string(),
            gateway_id: "api-gateway".to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct LoadBalancerConfig {
    pub strategy: LoadBalanceStrategy,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalanceStrategy {
    #[serde(rename = "round_robin")]
    RoundRobin,
    #[default]
    #[serde(rename = "random")]
    Random,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct HealthCheckConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub timeout_secs: u64,
    pub path: String,
    pub unhealthy_threshold: u32,
    pub healthy_threshold: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 10,
            timeout_secs: 2,
            path: "/health".to_string(),
            unhealthy_threshold: 3,
            healthy_threshold: 2,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Json,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    #[serde(rename = "healthy")]
    Healthy,
    #[serde(rename = "unhealthy")]
    Unhealthy,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
        }
    }
}
