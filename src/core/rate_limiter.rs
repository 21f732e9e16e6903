//! Per-client sliding window rate limiting.
//!
//! Each client (API key, or source address when no key is presented) owns an ordered log
//! of the timestamps of its accepted requests. Logs live in an `scc::HashMap`, so a check
//! only locks the bucket holding that client and unrelated clients never contend.
//!
//! Only accepted requests are recorded. A client hammering the gateway while limited does
//! not push its own reset time further out.
use std::{collections::VecDeque, time::Duration};

use chrono::{DateTime, TimeDelta, Utc};
use scc::HashMap;
use serde::Serialize;

use crate::config::RateLimitConfig;

/// Outcome of a single rate limit check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// When the oldest request in the window expires and a slot frees up
    pub reset_at: DateTime<Utc>,
    /// Set on rejection: time until the oldest request leaves the window
    pub retry_after: Option<Duration>,
}

impl RateDecision {
    /// Whole seconds to wait before retrying, rounded up and never zero.
    pub fn retry_after_secs(&self) -> Option<u64> {
        self.retry_after.map(|d| {
            let secs = d.as_secs() + u64::from(d.subsec_nanos() > 0);
            secs.max(1)
        })
    }
}

/// Observability view of one client's window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientWindow {
    pub request_count: u32,
    pub remaining: u32,
    /// Unix timestamp (seconds) at which the oldest recorded request expires
    pub reset: i64,
}

pub struct SlidingWindowLimiter {
    windows: HashMap<String, VecDeque<DateTime<Utc>>>,
    window: TimeDelta,
    window_std: Duration,
    max_requests: u32,
}

impl SlidingWindowLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            windows: HashMap::new(),
            window: TimeDelta::from_std(config.window).unwrap_or(TimeDelta::MAX),
            window_std: config.window,
            max_requests: config.max_requests,
        }
    }

    pub fn limit(&self) -> u32 {
        self.max_requests
    }

    pub fn window(&self) -> Duration {
        self.window_std
    }

    /// Check and, if allowed, record a request for `client` at the current time.
    pub async fn allow(&self, client: &str) -> RateDecision {
        self.allow_at(client, Utc::now()).await
    }

    /// Check and record a request for `client` as if it arrived at `now`.
    pub async fn allow_at(&self, client: &str, now: DateTime<Utc>) -> RateDecision {
        let cutoff = self.cutoff(now);
        let mut entry = self.windows.entry_async(client.to_string()).await.or_default();
        let timestamps = entry.get_mut();
        purge(timestamps, cutoff);

        let count = timestamps.len() as u32;
        if count >= self.max_requests {
            let reset_at = self.expiry(timestamps.front().map_or(now, |oldest| *oldest));
            let retry_after = (reset_at - now).to_std().unwrap_or(Duration::ZERO);
            tracing::debug!(client = %client, count, "Rate limit exceeded");
            return RateDecision {
                allowed: false,
                limit: self.max_requests,
                remaining: 0,
                reset_at,
                retry_after: Some(retry_after),
            };
        }

        timestamps.push_back(now);
        let reset_at = self.expiry(timestamps.front().map_or(now, |oldest| *oldest));
        RateDecision {
            allowed: true,
            limit: self.max_requests,
            remaining: self.max_requests - count - 1,
            reset_at,
            retry_after: None,
        }
    }

    /// Current window state for `client` without recording a request.
    pub async fn peek(&self, client: &str) -> RateDecision {
        self.peek_at(client, Utc::now()).await
    }

    pub async fn peek_at(&self, client: &str, now: DateTime<Utc>) -> RateDecision {
        let cutoff = self.cutoff(now);
        let (count, oldest) = self
            .windows
            .read_async(client, |_, timestamps| {
                let mut live = timestamps.iter().filter(|ts| **ts > cutoff);
                let oldest = live.next().copied();
                let count = oldest.map_or(0, |_| 1 + live.count());
                (count as u32, oldest)
            })
            .await
            .unwrap_or((0, None));

        RateDecision {
            allowed: count < self.max_requests,
            limit: self.max_requests,
            remaining: self.max_requests.saturating_sub(count),
            reset_at: self.expiry(oldest.unwrap_or(now)),
            retry_after: None,
        }
    }

    /// Dump every client with a non-empty window. Stale timestamps are purged along the
    /// way and idle clients are dropped from the table.
    pub async fn snapshot(&self) -> Vec<(String, ClientWindow)> {
        self.snapshot_at(Utc::now()).await
    }

    pub async fn snapshot_at(&self, now: DateTime<Utc>) -> Vec<(String, ClientWindow)> {
        let cutoff = self.cutoff(now);
        let mut clients = Vec::new();
        self.windows
            .retain_async(|client, timestamps| {
                purge(timestamps, cutoff);
                let Some(oldest) = timestamps.front() else {
                    return false;
                };
                let request_count = timestamps.len() as u32;
                clients.push((
                    client.clone(),
                    ClientWindow {
                        request_count,
                        remaining: self.max_requests.saturating_sub(request_count),
                        reset: self.expiry(*oldest).timestamp(),
                    },
                ));
                true
            })
            .await;
        clients.sort_by(|a, b| a.0.cmp(&b.0));
        clients
    }

    fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_sub_signed(self.window)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    fn expiry(&self, timestamp: DateTime<Utc>) -> DateTime<Utc> {
        timestamp
            .checked_add_signed(self.window)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Number of clients currently tracked.
    pub fn tracked_clients(&self) -> usize {
        self.windows.len()
    }
}

fn purge(timestamps: &mut VecDeque<DateTime<Utc>>, cutoff: DateTime<Utc>) {
    while timestamps.front().is_some_and(|ts| *ts <= cutoff) {
        timestamps.pop_front();
    }
}
