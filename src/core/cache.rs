//! Bounded in-process response cache with TTL expiry and LRU eviction.
//!
//! Entries are keyed by a request fingerprint (see [`cache_key`]) and stored in a
//! `moka` cache running the LRU eviction policy. Moka expires entries on its own clock;
//! reads additionally compare the insertion time against the caller's clock.
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, TimeDelta, Utc};
use http::{HeaderMap, StatusCode};
use moka::{future::Cache, policy::EvictionPolicy};
use sha2::{Digest, Sha256};

/// Moka rejects lifetimes beyond 1000 years
const MAX_ENTRY_LIFETIME: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// A response as it is stored in and served from the cache.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedResponse {
    pub status: StatusCode,
    /// Response headers that passed the forwarder's allow-list
    pub headers: HeaderMap,
    pub body: Bytes,
    pub content_type: Option<String>,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    response: CachedResponse,
    inserted_at: DateTime<Utc>,
}

/// Response cache shared by all request tasks.
pub struct ResponseCache {
    store: Cache<String, CacheEntry>,
    ttl: TimeDelta,
}

impl ResponseCache {
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        let store = Cache::builder()
            .max_capacity(max_entries.max(1) as u64)
            .eviction_policy(EvictionPolicy::lru())
            .time_to_live(ttl.min(MAX_ENTRY_LIFETIME))
            .eviction_listener(|key, _, cause| {
                if cause.was_evicted() {
                    tracing::debug!(key = %key, ?cause, "Evicted cache entry");
                }
            })
            .build();
        Self {
            store,
            ttl: TimeDelta::from_std(ttl).unwrap_or(TimeDelta::MAX),
        }
    }

    pub async fn get(&self, key: &str) -> Option<CachedResponse> {
        self.get_at(key, Utc::now()).await
    }

    /// Look up a live entry. An entry older than the TTL at `now` is dropped.
    pub async fn get_at(&self, key: &str, now: DateTime<Utc>) -> Option<CachedResponse> {
        let entry = self.store.get(key).await?;
        let expired = entry
            .inserted_at
            .checked_add_signed(self.ttl)
            .is_some_and(|expires_at| now > expires_at);
        if expired {
            self.store.invalidate(key).await;
            tracing::trace!(key = %key, "Cache entry expired");
            return None;
        }
        Some(entry.response)
    }

    pub async fn put(&self, key: String, response: CachedResponse) {
        self.put_at(key, response, Utc::now()).await;
    }

    /// Insert or replace an entry. Past capacity the least recently used entry goes.
    pub async fn put_at(&self, key: String, response: CachedResponse, now: DateTime<Utc>) {
        self.store
            .insert(
                key,
                CacheEntry {
                    response,
                    inserted_at: now,
                },
            )
            .await;
    }

    /// Drop every entry. Returns how many were removed.
    pub async fn clear(&self) -> usize {
        let removed = self.len().await;
        self.store.invalidate_all();
        removed
    }

    /// Entry count after pending evictions and invalidations have been applied.
    pub async fn len(&self) -> usize {
        self.store.run_pending_tasks().await;
        self.store.entry_count() as usize
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Fingerprint of a cacheable request.
///
/// Query parameters are decoded and sorted, and only the `vary` headers take part
/// (names compared case-insensitively, sorted). Two requests that differ only in query
/// parameter order or header order produce the same key. Every field is length-prefixed
/// so no name or value can imitate a boundary.
pub fn cache_key(
    service: &str,
    path: &str,
    query: Option<&str>,
    headers: &HeaderMap,
    vary: &[String],
) -> String {
    let mut params: Vec<(String, String)> = query
        .map(|q| {
            url::form_urlencoded::parse(q.as_bytes())
                .into_owned()
                .collect()
        })
        .unwrap_or_default();
    params.sort();

    let mut names: Vec<String> = vary.iter().map(|name| name.to_ascii_lowercase()).collect();
    names.sort();
    names.dedup();

    let mut hasher = Sha256::new();
    field(&mut hasher, service.as_bytes());
    field(&mut hasher, path.trim_start_matches('/').as_bytes());

    hasher.update((params.len() as u64).to_be_bytes());
    for (name, value) in &params {
        field(&mut hasher, name.as_bytes());
        field(&mut hasher, value.as_bytes());
    }

    for name in &names {
        let values: Vec<&[u8]> = headers
            .get_all(name.as_str())
            .iter()
            .map(|value| value.as_bytes())
            .collect();
        if values.is_empty() {
            continue;
        }
        field(&mut hasher, name.as_bytes());
        hasher.update((values.len() as u64).to_be_bytes());
        for value in values {
            field(&mut hasher, value);
        }
    }

    format!("{service}:{}", hex::encode(hasher.finalize()))
}

fn field(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_be_bytes());
    hasher.update(bytes);
}
