use std::{
    fmt,
    str::FromStr,
    sync::atomic::{AtomicU8, AtomicU32, Ordering},
};

use serde::Serialize;
use thiserror::Error;

use crate::{config::HealthStatus, metrics::set_backend_health_status};

const HEALTH_STATUS_UNHEALTHY: u8 = 0;
const HEALTH_STATUS_HEALTHY: u8 = 1;

/// Errors related to backend operations
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum BackendError {
    /// Error when URL is invalid
    #[error("Invalid backend URL: {0}")]
    InvalidUrl(String),
}

/// Result type for backend operations
pub type BackendResult<T> = Result<T, BackendError>;

/// A validated backend base URL, stored without a trailing slash.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BackendUrl {
    url: String,
    is_secure: bool,
}

impl BackendUrl {
    /// Creates a new BackendUrl if the provided string is an http(s) URL.
    pub fn new(url: &str) -> BackendResult<Self> {
        let is_secure = url.starts_with("https://");
        let is_http = url.starts_with("http://");

        if !is_secure && !is_http {
            return Err(BackendError::InvalidUrl(format!(
                "Backend URL must start with http:// or https://, got: {url}"
            )));
        }

        let trimmed = url.trim_end_matches('/');
        let authority = trimmed
            .split_once("://")
            .map_or("", |(_, rest)| rest);
        if authority.is_empty() {
            return Err(BackendError::InvalidUrl(format!(
                "Backend URL has no host: {url}"
            )));
        }

        Ok(BackendUrl {
            url: trimmed.to_string(),
            is_secure,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.url
    }

    pub fn is_secure(&self) -> bool {
        self.is_secure
    }

    /// Join a request path (and optional raw query) onto this base URL.
    pub fn join(&self, path: &str, query: Option<&str>) -> String {
        let path = path.trim_start_matches('/');
        match query.filter(|q| !q.is_empty()) {
            Some(q) => format!("{}/{}?{}", self.url, path, q),
            None => format!("{}/{}", self.url, path),
        }
    }
}

impl FromStr for BackendUrl {
    type Err = BackendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BackendUrl::new(s)
    }
}

impl fmt::Display for BackendUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.url)
    }
}

/// A backend endpoint of a service together with its health state.
///
/// Health flags are atomics so health checks never block request routing.
#[derive(Debug)]
pub struct Endpoint {
    url: BackendUrl,
    status: AtomicU8,
    /// Counter for consecutive successful health checks
    pub consecutive_successes: AtomicU32,
    /// Counter for consecutive failed health checks
    pub consecutive_failures: AtomicU32,
}

impl Endpoint {
    /// New endpoints start out healthy.
    pub fn new(url: BackendUrl) -> Self {
        Self {
            url,
            status: AtomicU8::new(HEALTH_STATUS_HEALTHY),
            consecutive_successes: AtomicU32::new(0),
            consecutive_failures: AtomicU32::new(0),
        }
    }

    pub fn url(&self) -> &BackendUrl {
        &self.url
    }

    pub fn status(&self) -> HealthStatus {
        if self.status.load(Ordering::Acquire) == HEALTH_STATUS_HEALTHY {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status() == HealthStatus::Healthy
    }

    /// Mark the endpoint as healthy and reset the failure count
    pub fn mark_healthy(&self) {
        self.status.store(HEALTH_STATUS_HEALTHY, Ordering::Release);
        self.consecutive_failures.store(0, Ordering::Release);
        self.consecutive_successes.fetch_add(1, Ordering::AcqRel);
        set_backend_health_status(self.url.as_str(), true);
    }

    /// Mark the endpoint as unhealthy and reset the success count
    pub fn mark_unhealthy(&self) {
        self.status.store(HEALTH_STATUS_UNHEALTHY, Ordering::Release);
        self.consecutive_successes.store(0, Ordering::Release);
        self.consecutive_failures.fetch_add(1, Ordering::AcqRel);
        set_backend_health_status(self.url.as_str(), false);
    }

    pub fn consecutive_successes(&self) -> u32 {
        self.consecutive_successes.load(Ordering::Relaxed)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    /// Serializable point-in-time view used by the admin API.
    pub fn view(&self) -> EndpointView {
        EndpointView {
            url: self.url.to_string(),
            status: self.status(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EndpointView {
    pub url: String,
    pub status: HealthStatus,
}
