//! Lightweight metrics helpers for Waypoint.
//!
//! Thin wrappers over the `metrics` crate macros. No exporter is embedded; the embedding
//! application may install any compatible recorder. Without one, every call is a no-op.
//!
//! Provided metrics (labels vary by family):
//! * `waypoint_requests_total` (counter: service, method, status)
//! * `waypoint_request_duration_seconds` (histogram: service, method)
//! * `waypoint_upstream_requests_total` (counter: backend, status; status 0 = no response)
//! * `waypoint_upstream_request_duration_seconds` (histogram: backend)
//! * `waypoint_cache_lookups_total` (counter: result = hit | miss)
//! * `waypoint_rate_limit_rejections_total` (counter)
//! * `waypoint_backend_health_status` (gauge per backend)
use std::time::Duration;

use metrics::{
    Unit, counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram,
};
use once_cell::sync::Lazy;

pub const WAYPOINT_REQUESTS_TOTAL: &str = "waypoint_requests_total";
pub const WAYPOINT_REQUEST_DURATION_SECONDS: &str = "waypoint_request_duration_seconds";
pub const WAYPOINT_UPSTREAM_REQUESTS_TOTAL: &str = "waypoint_upstream_requests_total";
pub const WAYPOINT_UPSTREAM_REQUEST_DURATION_SECONDS: &str =
    "waypoint_upstream_request_duration_seconds";
pub const WAYPOINT_CACHE_LOOKUPS_TOTAL: &str = "waypoint_cache_lookups_total";
pub const WAYPOINT_RATE_LIMIT_REJECTIONS_TOTAL: &str = "waypoint_rate_limit_rejections_total";
pub const WAYPOINT_BACKEND_HEALTH_STATUS: &str = "waypoint_backend_health_status";

static DESCRIPTIONS: Lazy<()> = Lazy::new(|| {
    describe_counter!(
        WAYPOINT_REQUESTS_TOTAL,
        Unit::Count,
        "Total number of proxied requests handled by the gateway."
    );
    describe_histogram!(
        WAYPOINT_REQUEST_DURATION_SECONDS,
        Unit::Seconds,
        "End to end latency of proxied requests."
    );
    describe_counter!(
        WAYPOINT_UPSTREAM_REQUESTS_TOTAL,
        Unit::Count,
        "Total number of requests forwarded to backend services."
    );
    describe_histogram!(
        WAYPOINT_UPSTREAM_REQUEST_DURATION_SECONDS,
        Unit::Seconds,
        "Latency of requests forwarded to backend services."
    );
    describe_counter!(
        WAYPOINT_CACHE_LOOKUPS_TOTAL,
        Unit::Count,
        "Response cache lookups by result."
    );
    describe_counter!(
        WAYPOINT_RATE_LIMIT_REJECTIONS_TOTAL,
        Unit::Count,
        "Requests rejected by the rate limiter."
    );
    describe_gauge!(
        WAYPOINT_BACKEND_HEALTH_STATUS,
        "Health status of individual backends (1 for healthy, 0 for unhealthy)"
    );
});

/// Register metric descriptions (idempotent).
pub fn init_metrics() {
    Lazy::force(&DESCRIPTIONS);
    tracing::debug!("Waypoint metric descriptions registered");
}

/// Set the health status gauge for a backend.
pub fn set_backend_health_status(backend: &str, is_healthy: bool) {
    let value = if is_healthy { 1.0 } else { 0.0 };
    gauge!(WAYPOINT_BACKEND_HEALTH_STATUS, "backend" => backend.to_string()).set(value);
}

/// Count and time a completed proxied request.
pub fn record_request(service: &str, method: &str, status: u16, duration: Duration) {
    counter!(
        WAYPOINT_REQUESTS_TOTAL,
        "service" => service.to_string(),
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    histogram!(
        WAYPOINT_REQUEST_DURATION_SECONDS,
        "service" => service.to_string(),
        "method" => method.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Count and time an upstream call. `status` is 0 when no response arrived.
pub fn record_upstream_request(backend: &str, status: u16, duration: Duration) {
    counter!(
        WAYPOINT_UPSTREAM_REQUESTS_TOTAL,
        "backend" => backend.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    histogram!(
        WAYPOINT_UPSTREAM_REQUEST_DURATION_SECONDS,
        "backend" => backend.to_string()
    )
    .record(duration.as_secs_f64());
}

pub fn record_cache_lookup(hit: bool) {
    let result = if hit { "hit" } else { "miss" };
    counter!(WAYPOINT_CACHE_LOOKUPS_TOTAL, "result" => result).increment(1);
}

pub fn increment_rate_limit_rejections() {
    counter!(WAYPOINT_RATE_LIMIT_REJECTIONS_TOTAL).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_recorder_is_noop() {
        init_metrics();
        init_metrics();
        set_backend_health_status("http://test-backend", true);
        record_request("user_service", "GET", 200, Duration::from_millis(5));
        record_upstream_request("http://test-backend", 0, Duration::from_millis(5));
        record_cache_lookup(true);
        increment_rate_limit_rejections();
    }
}
