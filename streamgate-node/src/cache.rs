//! # Response Cache
//!
//! Bounded key/value store for pipeline fingerprint caching. The in-memory
//! core is an LRU list with TTL expiry, bounded by entry count AND byte
//! budget; whichever bound is hit first triggers eviction, expired entries
//! going first and least-recently-used entries after that.
//!
//! An optional Redis tier shares entries across instances. A failing backend
//! degrades the tier to miss-only: requests keep flowing, the failure is
//! logged and counted, and the tier recovers on the next successful call.
//! The memory lock is never held across a backend call.

use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// An opaque cached response body with its content-type hint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CachedValue {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

impl CachedValue {
    pub fn json(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            content_type: "application/json".to_string(),
        }
    }
}

/// A successful lookup.
#[derive(Debug, Clone)]
pub struct CacheHit {
    pub value: CachedValue,
    pub age: Duration,
}

#[derive(Debug, Clone, Serialize, Default, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: usize,
    pub bytes: usize,
    pub hit_rate: f64,
}

struct Entry {
    value: CachedValue,
    inserted: Instant,
    expires: Instant,
    hits: u64,
    size: usize,
}

struct Core {
    lru: LruCache<String, Entry>,
    bytes: usize,
}

pub struct ResponseCache {
    core: Mutex<Core>,
    max_entries: usize,
    max_bytes: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    redis: Option<redis::Client>,
    /// Set while the Redis tier is failing; cleared on the next success.
    redis_degraded: AtomicBool,
}

impl ResponseCache {
    pub fn new(max_entries: usize, max_bytes: usize, redis_url: Option<&str>) -> Self {
        let redis = redis_url.and_then(|url| match redis::Client::open(url) {
            Ok(client) => {
                tracing::info!(url, "cache redis tier configured");
                Some(client)
            }
            Err(e) => {
                tracing::warn!(url, error = %e, "cache redis tier unavailable, memory only");
                None
            }
        });
        Self {
            core: Mutex::new(Core {
                lru: LruCache::unbounded(),
                bytes: 0,
            }),
            max_entries: max_entries.max(1),
            max_bytes: max_bytes.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            redis,
            redis_degraded: AtomicBool::new(false),
        }
    }

    /// Look up `key`. Expired entries are evicted and count as misses.
    pub async fn get(&self, key: &str) -> Option<CacheHit> {
        let memory = {
            let mut core = self.core.lock().expect("cache lock poisoned");
            match core.lru.get_mut(key) {
                Some(entry) if entry.expires > Instant::now() => {
                    entry.hits += 1;
                    Some(CacheHit {
                        value: entry.value.clone(),
                        age: entry.inserted.elapsed(),
                    })
                }
                Some(_) => {
                    if let Some(expired) = core.lru.pop(key) {
                        core.bytes = core.bytes.saturating_sub(expired.size);
                        self.evictions.fetch_add(1, Ordering::Relaxed);
                    }
                    None
                }
                None => None,
            }
        };
        if let Some(hit) = memory {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Some(hit);
        }

        if let Some(hit) = self.redis_get(key).await {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Some(hit);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Store `value` under `key`. A non-positive TTL is a successful no-op.
    pub async fn put(&self, key: &str, value: CachedValue, ttl: Duration) {
        if ttl.is_zero() {
            return;
        }
        let size = key.len() + value.bytes.len() + value.content_type.len();
        let now = Instant::now();
        {
            let mut core = self.core.lock().expect("cache lock poisoned");
            if let Some(previous) = core.lru.pop(key) {
                core.bytes = core.bytes.saturating_sub(previous.size);
            }
            core.lru.put(
                key.to_string(),
                Entry {
                    value: value.clone(),
                    inserted: now,
                    expires: now + ttl,
                    hits: 0,
                    size,
                },
            );
            core.bytes += size;
            self.enforce_bounds(&mut core);
        }
        self.redis_put(key, &value, ttl).await;
    }

    /// Remove one key. Idempotent.
    pub async fn invalidate(&self, key: &str) {
        {
            let mut core = self.core.lock().expect("cache lock poisoned");
            if let Some(entry) = core.lru.pop(key) {
                core.bytes = core.bytes.saturating_sub(entry.size);
            }
        }
        self.redis_del(key).await;
    }

    /// Remove every key starting with `prefix`. The scan is O(n) under the
    /// memory lock; the backend delete happens after the lock is released.
    pub async fn invalidate_prefix(&self, prefix: &str) {
        {
            let mut core = self.core.lock().expect("cache lock poisoned");
            let doomed: Vec<String> = core
                .lru
                .iter()
                .filter(|(k, _)| k.starts_with(prefix))
                .map(|(k, _)| k.clone())
                .collect();
            for key in doomed {
                if let Some(entry) = core.lru.pop(&key) {
                    core.bytes = core.bytes.saturating_sub(entry.size);
                }
            }
        }
        self.redis_del_prefix(prefix).await;
    }

    pub fn stats(&self) -> CacheStats {
        let (entries, bytes) = {
            let core = self.core.lock().expect("cache lock poisoned");
            (core.lru.len(), core.bytes)
        };
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            hits,
            misses,
            evictions: self.evictions.load(Ordering::Relaxed),
            entries,
            bytes,
            hit_rate: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
        }
    }

    /// Expired entries leave first; after that, LRU order. Both bounds are
    /// enforced.
    fn enforce_bounds(&self, core: &mut Core) {
        if core.lru.len() > self.max_entries || core.bytes > self.max_bytes {
            let now = Instant::now();
            let expired: Vec<String> = core
                .lru
                .iter()
                .filter(|(_, entry)| entry.expires <= now)
                .map(|(k, _)| k.clone())
                .collect();
            for key in expired {
                if core.lru.len() <= self.max_entries && core.bytes <= self.max_bytes {
                    break;
                }
                if let Some(entry) = core.lru.pop(&key) {
                    core.bytes = core.bytes.saturating_sub(entry.size);
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        while core.lru.len() > self.max_entries || core.bytes > self.max_bytes {
            match core.lru.pop_lru() {
                Some((_, entry)) => {
                    core.bytes = core.bytes.saturating_sub(entry.size);
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                }
                None => break,
            }
        }
    }

    async fn redis_connection(&self) -> Option<redis::aio::MultiplexedConnection> {
        let client = self.redis.as_ref()?;
        match client.get_multiplexed_tokio_connection().await {
            Ok(conn) => {
                if self.redis_degraded.swap(false, Ordering::Relaxed) {
                    tracing::info!("cache redis tier recovered");
                }
                Some(conn)
            }
            Err(e) => {
                if !self.redis_degraded.swap(true, Ordering::Relaxed) {
                    tracing::warn!(error = %e, "cache redis tier degraded to miss-only");
                }
                None
            }
        }
    }

    async fn redis_get(&self, key: &str) -> Option<CacheHit> {
        let mut conn = self.redis_connection().await?;
        let raw: Option<Vec<u8>> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| {
                self.redis_degraded.store(true, Ordering::Relaxed);
                tracing::warn!(error = %e, "cache redis get failed");
            })
            .ok()?;
        let stored: StoredValue = serde_json::from_slice(&raw?).ok()?;
        Some(CacheHit {
            value: stored.value,
            age: Duration::from_millis(stored.age_ms),
        })
    }

    async fn redis_put(&self, key: &str, value: &CachedValue, ttl: Duration) {
        let Some(mut conn) = self.redis_connection().await else {
            return;
        };
        let stored = StoredValue {
            value: value.clone(),
            age_ms: 0,
        };
        let Ok(payload) = serde_json::to_vec(&stored) else {
            return;
        };
        let ttl_secs = ttl.as_secs().max(1);
        if let Err(e) = redis::cmd("SETEX")
            .arg(key)
            .arg(ttl_secs)
            .arg(payload)
            .query_async::<_, ()>(&mut conn)
            .await
        {
            self.redis_degraded.store(true, Ordering::Relaxed);
            tracing::warn!(error = %e, "cache redis put failed");
        }
    }

    async fn redis_del(&self, key: &str) {
        let Some(mut conn) = self.redis_connection().await else {
            return;
        };
        let _: Result<i64, _> = redis::cmd("DEL").arg(key).query_async(&mut conn).await;
    }

    async fn redis_del_prefix(&self, prefix: &str) {
        let Some(mut conn) = self.redis_connection().await else {
            return;
        };
        let pattern = format!("{prefix}*");
        let mut cursor: u64 = 0;
        loop {
            let page: Result<(u64, Vec<String>), _> = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(200)
                .query_async(&mut conn)
                .await;
            let (next, keys) = match page {
                Ok(page) => page,
                Err(e) => {
                    tracing::warn!(error = %e, "cache redis prefix scan failed");
                    return;
                }
            };
            if !keys.is_empty() {
                let _: Result<i64, _> = redis::cmd("DEL").arg(&keys).query_async(&mut conn).await;
            }
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
    }
}

#[derive(Serialize, Deserialize)]
struct StoredValue {
    value: CachedValue,
    age_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(max_entries: usize, max_bytes: usize) -> ResponseCache {
        ResponseCache::new(max_entries, max_bytes, None)
    }

    fn value(body: &str) -> CachedValue {
        CachedValue::json(body.as_bytes().to_vec())
    }

    #[tokio::test]
    async fn put_get_round_trip_with_age() {
        let c = cache(10, 1 << 20);
        c.put("k", value("hello"), Duration::from_secs(5)).await;
        let hit = c.get("k").await.unwrap();
        assert_eq!(hit.value.bytes, b"hello");
        assert!(hit.age < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn zero_ttl_put_is_a_noop() {
        let c = cache(10, 1 << 20);
        c.put("k", value("hello"), Duration::ZERO).await;
        assert!(c.get("k").await.is_none());
        let stats = c.stats();
        assert_eq!(stats.entries, 0);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn expired_entry_misses_and_evicts() {
        let c = cache(10, 1 << 20);
        c.put("k", value("hello"), Duration::from_millis(5)).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(c.get("k").await.is_none());
        let stats = c.stats();
        assert_eq!(stats.entries, 0);
        assert_eq!(stats.evictions, 1);
    }

    #[tokio::test]
    async fn entry_bound_evicts_least_recently_used() {
        let c = cache(2, 1 << 20);
        c.put("a", value("1"), Duration::from_secs(60)).await;
        c.put("b", value("2"), Duration::from_secs(60)).await;
        // Touch "a" so "b" is the LRU victim.
        c.get("a").await.unwrap();
        c.put("c", value("3"), Duration::from_secs(60)).await;

        assert!(c.get("a").await.is_some());
        assert!(c.get("b").await.is_none());
        assert!(c.get("c").await.is_some());
    }

    #[tokio::test]
    async fn byte_bound_triggers_eviction() {
        let c = cache(100, 64);
        c.put("a", value(&"x".repeat(40)), Duration::from_secs(60))
            .await;
        c.put("b", value(&"y".repeat(40)), Duration::from_secs(60))
            .await;
        let stats = c.stats();
        assert!(stats.bytes <= 64, "bytes {} over budget", stats.bytes);
        assert!(stats.evictions >= 1);
    }

    #[tokio::test]
    async fn expired_entries_are_evicted_before_live_ones() {
        let c = cache(2, 1 << 20);
        c.put("dying", value("1"), Duration::from_millis(1)).await;
        c.put("live", value("2"), Duration::from_secs(60)).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        // "dying" is expired and should be the victim even though "live" is
        // least recently used by insertion order after this put.
        c.put("new", value("3"), Duration::from_secs(60)).await;
        assert!(c.get("live").await.is_some());
        assert!(c.get("new").await.is_some());
    }

    #[tokio::test]
    async fn invalidate_is_idempotent() {
        let c = cache(10, 1 << 20);
        c.put("k", value("v"), Duration::from_secs(60)).await;
        c.invalidate("k").await;
        c.invalidate("k").await;
        assert!(c.get("k").await.is_none());
    }

    #[tokio::test]
    async fn prefix_invalidation_spares_other_keys() {
        let c = cache(10, 1 << 20);
        c.put("videos:1", value("a"), Duration::from_secs(60)).await;
        c.put("videos:2", value("b"), Duration::from_secs(60)).await;
        c.put("users:1", value("c"), Duration::from_secs(60)).await;
        c.invalidate_prefix("videos:").await;

        assert!(c.get("videos:1").await.is_none());
        assert!(c.get("videos:2").await.is_none());
        assert!(c.get("users:1").await.is_some());
    }

    #[tokio::test]
    async fn hits_plus_misses_equals_gets() {
        let c = cache(10, 1 << 20);
        c.put("k", value("v"), Duration::from_secs(60)).await;
        for i in 0..20 {
            let key = if i % 3 == 0 { "k" } else { "absent" };
            let _ = c.get(key).await;
        }
        let stats = c.stats();
        assert_eq!(stats.hits + stats.misses, 20);
    }
}
