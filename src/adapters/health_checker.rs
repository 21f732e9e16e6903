use std::{
    sync::{Arc, atomic::Ordering},
    time::Duration,
};

use eyre::{Result, WrapErr};
use tokio::time::{MissedTickBehavior, interval};

use crate::{
    config::HealthCheckConfig,
    core::{ServiceRegistry, backend::Endpoint},
    ports::http_client::HttpClient,
    utils::ShutdownToken,
};

/// Actively probes every registered endpoint and flips its health after enough
/// consecutive results in the same direction.
pub struct HealthChecker {
    registry: Arc<ServiceRegistry>,
    http_client: Arc<dyn HttpClient>,
    config: HealthCheckConfig,
}

impl HealthChecker {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        http_client: Arc<dyn HttpClient>,
        config: HealthCheckConfig,
    ) -> Self {
        Self {
            registry,
            http_client,
            config,
        }
    }

    /// Probe on every interval until shutdown.
    pub async fn run(&self, mut shutdown: ShutdownToken) {
        if !self.config.enabled {
            tracing::info!("Health checking is disabled");
            return;
        }

        tracing::info!(
            "Starting health checker with interval: {}s, timeout: {}s, path: {}",
            self.config.interval_secs,
            self.config.timeout_secs,
            self.config.path
        );

        let mut ticker = interval(Duration::from_secs(self.config.interval_secs.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately; give backends one interval to come up
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => self.check_once().await,
                _ = shutdown.wait_for_shutdown() => {
                    tracing::info!("Health checker stopping");
                    return;
                }
            }
        }
    }

    /// Probe every endpoint once and apply the thresholds.
    pub async fn check_once(&self) {
        let endpoints = self.registry.endpoints();
        tracing::debug!(count = endpoints.len(), "Running health checks");

        for endpoint in endpoints {
            match self.probe(&endpoint).await {
                Ok(true) => self.record_success(&endpoint),
                Ok(false) => self.record_failure(&endpoint, "backend reported unhealthy"),
                Err(err) => self.record_failure(&endpoint, &format!("{err:#}")),
            }
        }
    }

    async fn probe(&self, endpoint: &Endpoint) -> Result<bool> {
        let url = endpoint.url().join(&self.config.path, None);
        self.http_client
            .health_check(&url, self.config.timeout_secs)
            .await
            .wrap_err_with(|| format!("Health check request to {url} failed"))
    }

    fn record_success(&self, endpoint: &Endpoint) {
        endpoint.consecutive_failures.store(0, Ordering::Relaxed);
        let successes = endpoint.consecutive_successes.fetch_add(1, Ordering::Relaxed) + 1;

        if !endpoint.is_healthy() && successes >= self.config.healthy_threshold {
            tracing::info!(
                "Backend {} is now HEALTHY (after {} consecutive successes)",
                endpoint.url(),
                successes
            );
            endpoint.mark_healthy();
        }
    }

    fn record_failure(&self, endpoint: &Endpoint, reason: &str) {
        endpoint.consecutive_successes.store(0, Ordering::Relaxed);
        let failures = endpoint.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;

        tracing::info!(
            "Health check failed for {}: {} (failures: {}/{})",
            endpoint.url(),
            reason,
            failures,
            self.config.unhealthy_threshold
        );

        if endpoint.is_healthy() && failures >= self.config.unhealthy_threshold {
            tracing::warn!(
                "Backend {} is now UNHEALTHY (after {} consecutive failures)",
                endpoint.url(),
                failures
            );
            endpoint.mark_unhealthy();
        }
    }

    /// (healthy, unhealthy) endpoint counts
    pub fn summary(&self) -> (usize, usize) {
        let total = self.registry.endpoint_count();
        let healthy = self.registry.healthy_endpoint_count();
        (healthy, total - healthy)
    }
}
