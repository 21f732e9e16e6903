use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use tokio::{signal, sync::broadcast};

/// Why the gateway is stopping
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// SIGTERM or SIGINT
    Graceful,
    /// Drain deadline passed or the signal channel went away
    Force,
}

/// Fans a single shutdown signal out to the server and background tasks.
pub struct GracefulShutdown {
    shutdown_tx: broadcast::Sender<ShutdownReason>,
    shutdown_initiated: Arc<AtomicBool>,
    drain_timeout: Duration,
}

impl GracefulShutdown {
    /// Create a new GracefulShutdown manager with default 30-second drain timeout
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(30))
    }

    pub fn with_timeout(drain_timeout: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(16);
        Self {
            shutdown_tx,
            shutdown_initiated: Arc::new(AtomicBool::new(false)),
            drain_timeout,
        }
    }

    /// How long in-flight requests may take to finish once shutdown starts
    pub fn drain_timeout(&self) -> Duration {
        self.drain_timeout
    }

    pub fn is_shutdown_initiated(&self) -> bool {
        self.shutdown_initiated.load(Ordering::Relaxed)
    }

    /// Start shutdown. Only the first call has an effect.
    pub fn trigger_shutdown(&self, reason: ShutdownReason) {
        if self
            .shutdown_initiated
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            tracing::info!("Shutdown initiated: {:?}", reason);
            // No receivers simply means nothing is waiting yet
            let _ = self.shutdown_tx.send(reason);
        } else {
            tracing::debug!("Shutdown already initiated, ignoring {:?}", reason);
        }
    }

    /// Listen for SIGINT / SIGTERM and trigger a graceful shutdown on the first one.
    pub async fn run_signal_handler(&self) {
        tracing::info!("Signal handler started. Listening for SIGTERM and SIGINT");

        tokio::select! {
            result = signal::ctrl_c() => {
                if let Err(e) = result {
                    tracing::error!("Failed to listen for Ctrl+C: {}", e);
                    return;
                }
                tracing::info!("Received SIGINT (Ctrl+C), initiating graceful shutdown...");
            }
            _ = wait_for_sigterm() => {
                tracing::info!("Received SIGTERM, initiating graceful shutdown...");
            }
        }

        self.trigger_shutdown(ShutdownReason::Graceful);
    }

    /// A token for tasks that need to stop when shutdown starts
    pub fn shutdown_token(&self) -> ShutdownToken {
        ShutdownToken {
            receiver: self.shutdown_tx.subscribe(),
            shutdown_initiated: self.shutdown_initiated.clone(),
        }
    }
}

impl Default for GracefulShutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{SignalKind, signal};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            tracing::error!("Failed to register SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    // On non-Unix systems, we only have Ctrl+C
    std::future::pending::<()>().await;
}

/// Receiving side of the shutdown broadcast
pub struct ShutdownToken {
    receiver: broadcast::Receiver<ShutdownReason>,
    shutdown_initiated: Arc<AtomicBool>,
}

impl Clone for ShutdownToken {
    fn clone(&self) -> Self {
        Self {
            receiver: self.receiver.resubscribe(),
            shutdown_initiated: self.shutdown_initiated.clone(),
        }
    }
}

impl ShutdownToken {
    pub fn is_shutdown_initiated(&self) -> bool {
        self.shutdown_initiated.load(Ordering::Acquire)
    }

    /// Resolve once shutdown has been triggered, including before this call.
    pub async fn wait_for_shutdown(&mut self) -> ShutdownReason {
        if self.is_shutdown_initiated() {
            return self
                .receiver
                .try_recv()
                .unwrap_or(ShutdownReason::Graceful);
        }
        match self.receiver.recv().await {
            Ok(reason) => reason,
            Err(_) => ShutdownReason::Force,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_graceful_shutdown_creation() {
        let shutdown = GracefulShutdown::new();
        assert!(!shutdown.is_shutdown_initiated());
        assert_eq!(shutdown.drain_timeout(), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_token_observes_trigger() {
        let shutdown = GracefulShutdown::new();
        let mut token = shutdown.shutdown_token();
        assert!(!token.is_shutdown_initiated());

        shutdown.trigger_shutdown(ShutdownReason::Graceful);

        assert!(token.is_shutdown_initiated());
        assert_eq!(token.wait_for_shutdown().await, ShutdownReason::Graceful);
    }

    #[tokio::test]
    async fn test_token_created_after_trigger_resolves() {
        let shutdown = GracefulShutdown::new();
        shutdown.trigger_shutdown(ShutdownReason::Graceful);

        let mut late = shutdown.shutdown_token();
        assert_eq!(late.wait_for_shutdown().await, ShutdownReason::Graceful);
    }

    #[tokio::test]
    async fn test_only_first_trigger_counts() {
        let shutdown = GracefulShutdown::new();
        let mut token = shutdown.shutdown_token();

        shutdown.trigger_shutdown(ShutdownReason::Graceful);
        shutdown.trigger_shutdown(ShutdownReason::Force);

        assert_eq!(token.wait_for_shutdown().await, ShutdownReason::Graceful);
    }

    #[tokio::test]
    async fn test_cloned_tokens_wake_together() {
        let shutdown = GracefulShutdown::new();
        let mut first = shutdown.shutdown_token();
        let mut second = first.clone();

        let waiter = tokio::spawn(async move { second.wait_for_shutdown().await });
        tokio::task::yield_now().await;
        shutdown.trigger_shutdown(ShutdownReason::Graceful);

        assert_eq!(first.wait_for_shutdown().await, ShutdownReason::Graceful);
        assert_eq!(waiter.await.unwrap(), ShutdownReason::Graceful);
    }
}
