/// Response caching keyed by request fingerprint
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use deadpool_redis::{Config as RedisPoolConfig, Pool, Runtime};
use log::debug;
use redis::AsyncCommands;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::error::{GatewayError, GatewayResult};

/// Prefix shared by every cache key
pub const CACHE_KEY_PREFIX: &str = "cache:";

/// Pattern used when an invalidation request names none
pub const DEFAULT_INVALIDATION_PATTERN: &str = "cache:*";

/// Deterministic cache key: `cache:` + hex(sha256(path ‖ method ‖ body))
pub fn fingerprint(path: &str, method: &str, body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(path.as_bytes());
    hasher.update(method.as_bytes());
    hasher.update(body);
    format!("{}{}", CACHE_KEY_PREFIX, hex::encode(hasher.finalize()))
}

/// Path fed into the fingerprint for a cached route.
///
/// `key_pattern` picks the query parameters that distinguish entries: `*` (or
/// empty) keeps the full query string, a comma separated list keeps only the
/// named parameters in sorted order. Without a query the path is used as-is.
pub fn cache_path(path: &str, query: Option<&str>, key_pattern: &str) -> String {
    let query = match query {
        Some(q) if !q.is_empty() => q,
        _ => return path.to_string(),
    };

    let pattern = key_pattern.trim();
    if pattern.is_empty() || pattern == "*" {
        return format!("{}?{}", path, query);
    }

    let wanted: Vec<&str> = pattern
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect();
    let mut pairs: Vec<&str> = query
        .split('&')
        .filter(|pair| {
            let name = pair.split('=').next().unwrap_or_default();
            wanted.contains(&name)
        })
        .collect();
    if pairs.is_empty() {
        return path.to_string();
    }
    pairs.sort_unstable();
    format!("{}?{}", path, pairs.join("&"))
}

/// Key/value store for cached response bodies
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> GatewayResult<Option<Bytes>>;

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> GatewayResult<()>;

    /// Delete every key matching the Redis-style glob `pattern`, returning the count
    async fn invalidate(&self, pattern: &str) -> GatewayResult<u64>;
}

/// Cached body with its expiry
#[derive(Debug, Clone)]
struct CachedEntry {
    data: Bytes,
    expires_at: Instant,
}

impl CachedEntry {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// Entries kept by a memory store built with `Default`
pub const DEFAULT_MAX_ENTRIES: usize = 100_000;

/// Minimum time between two sweeps of expired entries
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Single-process cache store, bounded to `max_entries`
pub struct MemoryCacheStore {
    entries: DashMap<String, CachedEntry>,
    max_entries: usize,
    sweep_interval: Duration,
    created: Instant,
    /// Milliseconds after `created` of the last sweep
    last_sweep_ms: AtomicU64,
}

impl Default for MemoryCacheStore {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES)
    }
}

impl MemoryCacheStore {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries: max_entries.max(1),
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            created: Instant::now(),
            last_sweep_ms: AtomicU64::new(0),
        }
    }

    pub fn with_sweep_interval(mut self, sweep_interval: Duration) -> Self {
        self.sweep_interval = sweep_interval;
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop expired entries, at most once per `sweep_interval` unless `force`d
    fn sweep_expired(&self, force: bool) {
        let now_ms = self.created.elapsed().as_millis() as u64;
        let last = self.last_sweep_ms.load(Ordering::Relaxed);
        let due = now_ms.saturating_sub(last) >= self.sweep_interval.as_millis() as u64;
        if !force && !due {
            return;
        }
        if !force
            && self
                .last_sweep_ms
                .compare_exchange(last, now_ms, Ordering::Relaxed, Ordering::Relaxed)
                .is_err()
        {
            // Another writer is sweeping
            return;
        }

        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired());
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!("Swept {} expired cache entries", removed);
        }
    }

    /// Make room for one new key: expired entries go first, then the entry
    /// closest to expiry
    fn make_room(&self) {
        self.sweep_expired(true);
        while self.entries.len() >= self.max_entries {
            let victim = self
                .entries
                .iter()
                .min_by_key(|entry| entry.value().expires_at)
                .map(|entry| entry.key().clone());
            match victim {
                Some(key) => {
                    self.entries.remove(&key);
                }
                None => break,
            }
        }
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(&self, key: &str) -> GatewayResult<Option<Bytes>> {
        let hit = self.entries.get(key).map(|entry| entry.clone());
        match hit {
            Some(entry) if entry.is_expired() => {
                self.entries.remove_if(key, |_, e| e.is_expired());
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.data)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> GatewayResult<()> {
        if ttl.is_zero() {
            return Ok(());
        }

        self.sweep_expired(false);
        if self.entries.len() >= self.max_entries && !self.entries.contains_key(key) {
            self.make_room();
        }

        self.entries.insert(
            key.to_string(),
            CachedEntry {
                data: value,
                expires_at: Instant::now() + ttl,
            },
        );
        debug!("Cached {} (TTL: {:?})", key, ttl);
        Ok(())
    }

    async fn invalidate(&self, pattern: &str) -> GatewayResult<u64> {
        let matcher = glob_matcher(pattern)?;
        let before = self.entries.len();
        self.entries.retain(|key, _| !matcher.is_match(key));
        Ok(before.saturating_sub(self.entries.len()) as u64)
    }
}

/// Cache store shared between gateway instances through Redis
pub struct RedisCacheStore {
    pool: Pool,
}

impl RedisCacheStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CacheStore for RedisCacheStore {
    async fn get(&self, key: &str) -> GatewayResult<Option<Bytes>> {
        let mut conn = self.pool.get().await?;
        let value: Option<Vec<u8>> = conn.get(key).await?;
        Ok(value.map(Bytes::from))
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> GatewayResult<()> {
        if ttl.is_zero() {
            return Ok(());
        }
        let mut conn = self.pool.get().await?;
        conn.set_ex::<_, _, ()>(key, value.as_ref(), ttl.as_secs().max(1))
            .await?;
        Ok(())
    }

    async fn invalidate(&self, pattern: &str) -> GatewayResult<u64> {
        let mut conn = self.pool.get().await?;
        let mut cursor: u64 = 0;
        let mut removed: u64 = 0;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(500)
                .query_async(&mut conn)
                .await?;
            if !keys.is_empty() {
                let deleted: u64 = conn.del(&keys).await?;
                removed += deleted;
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }
        debug!("Invalidated {} keys matching {}", removed, pattern);
        Ok(removed)
    }
}

/// Build a deadpool Redis pool for the cache store and rate limiter
pub fn create_redis_pool(url: &str, max_size: usize) -> anyhow::Result<Pool> {
    let mut config = RedisPoolConfig::from_url(url);
    config.pool = Some(deadpool_redis::PoolConfig::new(max_size));
    config
        .create_pool(Some(Runtime::Tokio1))
        .map_err(|e| anyhow::anyhow!("Failed to create Redis pool: {}", e))
}

/// Compile a Redis-style glob into an anchored regex
fn glob_matcher(pattern: &str) -> GatewayResult<Regex> {
    Regex::new(&glob_to_regex(pattern)).map_err(|e| {
        debug!("Rejected invalidation pattern {}: {}", pattern, e);
        GatewayError::InvalidRequest(format!("invalid pattern '{}'", pattern))
    })
}

/// Convert a Redis glob (`*`, `?`, `[...]`, `\x`) to a regex pattern
fn glob_to_regex(pattern: &str) -> String {
    let mut regex = String::with_capacity(pattern.len() * 2);
    regex.push('^');

    let mut chars = pattern.chars();
    while let Some(ch) = chars.next() {
        match ch {
            '*' => regex.push_str(".*"),
            '?' => regex.push('.'),
            '[' => {
                regex.push('[');
                for ch in chars.by_ref() {
                    match ch {
                        ']' => break,
                        '\\' | '[' | '&' | '~' => {
                            regex.push('\\');
                            regex.push(ch);
                        }
                        _ => regex.push(ch),
                    }
                }
                regex.push(']');
            }
            '\\' => {
                if let Some(escaped) = chars.next() {
                    regex.push_str(&regex::escape(&escaped.to_string()));
                }
            }
            _ => regex.push_str(&regex::escape(&ch.to_string())),
        }
    }

    regex.push('$');
    regex
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_is_deterministic() {
        assert_eq!(
            fingerprint("/foo", "GET", b""),
            "cache:976a5c5ce0f0fc3157af386c5ed68396c3ab2a4b7521ded890cc924287f83568"
        );
        assert_eq!(fingerprint("/foo", "GET", b""), fingerprint("/foo", "GET", b""));
    }

    #[test]
    fn test_fingerprint_varies_with_inputs() {
        let base = fingerprint("/foo", "GET", b"");
        assert_ne!(base, fingerprint("/foo", "POST", b""));
        assert_ne!(base, fingerprint("/bar", "GET", b""));
        assert_ne!(
            fingerprint("/foo", "POST", b"{\"a\":1}"),
            fingerprint("/foo", "POST", b"{\"a\":2}")
        );
    }

    #[test]
    fn test_cache_path_query_selection() {
        assert_eq!(cache_path("/foo", None, "*"), "/foo");
        assert_eq!(cache_path("/foo", Some(""), "*"), "/foo");
        assert_eq!(cache_path("/foo", Some("a=1"), "*"), "/foo?a=1");
        assert_eq!(cache_path("/foo", Some("a=1"), ""), "/foo?a=1");
        assert_eq!(
            cache_path("/foo", Some("page=2&token=x&lang=en"), "page, lang"),
            "/foo?lang=en&page=2"
        );
        assert_eq!(cache_path("/foo", Some("token=x"), "page"), "/foo");

        assert_eq!(
            fingerprint(&cache_path("/foo", Some("a=1"), "*"), "GET", b""),
            "cache:f09ce48aaa17d05b3c9cf11d10bdaf6939448bd07ab3427f31bf7a0efdb37bac"
        );
    }

    #[test]
    fn test_glob_to_regex() {
        assert_eq!(glob_to_regex("cache:*"), "^cache:.*$");
        assert_eq!(glob_to_regex("h?llo"), "^h.llo$");
        assert_eq!(glob_to_regex("h[ae]llo"), "^h[ae]llo$");
        assert_eq!(glob_to_regex("a.b"), "^a\\.b$");
        assert_eq!(glob_to_regex("a\\*b"), "^a\\*b$");
    }

    #[test]
    fn test_glob_matching() {
        let matcher = glob_matcher("cache:ab*").unwrap();
        assert!(matcher.is_match("cache:abcdef"));
        assert!(!matcher.is_match("cache:xyz"));
        assert!(!matcher.is_match("ratelimit:cache:ab"));
    }

    #[tokio::test]
    async fn test_memory_set_get() {
        let store = MemoryCacheStore::default();
        store
            .set("cache:1", Bytes::from_static(b"{\"ok\":true}"), Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(
            store.get("cache:1").await.unwrap(),
            Some(Bytes::from_static(b"{\"ok\":true}"))
        );
        assert_eq!(store.get("cache:2").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_memory_entries_expire() {
        let store = MemoryCacheStore::default();
        store
            .set("cache:1", Bytes::from_static(b"x"), Duration::from_millis(20))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert_eq!(store.get("cache:1").await.unwrap(), None);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_memory_zero_ttl_is_not_stored() {
        let store = MemoryCacheStore::default();
        store
            .set("cache:1", Bytes::from_static(b"x"), Duration::ZERO)
            .await
            .unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_expired_entries_are_swept_on_write() {
        let store = MemoryCacheStore::new(10_000).with_sweep_interval(Duration::from_millis(10));
        for i in 0..200 {
            store
                .set(&format!("cache:{}", i), Bytes::from_static(b"x"), Duration::from_millis(200))
                .await
                .unwrap();
        }
        assert_eq!(store.len(), 200);

        tokio::time::sleep(Duration::from_millis(300)).await;
        store
            .set("cache:fresh", Bytes::from_static(b"y"), Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(store.len(), 1);
        assert!(store.get("cache:fresh").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_capacity_evicts_entry_closest_to_expiry() {
        let store = MemoryCacheStore::new(2);
        store.set("cache:short", Bytes::from_static(b"1"), Duration::from_secs(5)).await.unwrap();
        store.set("cache:long", Bytes::from_static(b"2"), Duration::from_secs(600)).await.unwrap();
        store.set("cache:new", Bytes::from_static(b"3"), Duration::from_secs(60)).await.unwrap();

        assert_eq!(store.len(), 2);
        assert!(store.get("cache:short").await.unwrap().is_none());
        assert!(store.get("cache:long").await.unwrap().is_some());
        assert!(store.get("cache:new").await.unwrap().is_some());

        // Overwriting a present key never evicts
        store.set("cache:new", Bytes::from_static(b"4"), Duration::from_secs(60)).await.unwrap();
        assert_eq!(store.len(), 2);
        assert!(store.get("cache:long").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_invalid_pattern_is_rejected() {
        let store = MemoryCacheStore::default();
        let err = store.invalidate("cache:[").await.unwrap_err();
        assert_eq!(err.status_code(), 400);
        assert_eq!(err.client_message(), "invalid pattern 'cache:['");
    }

    #[tokio::test]
    async fn test_memory_invalidate_by_pattern() {
        let store = MemoryCacheStore::default();
        let ttl = Duration::from_secs(60);
        store.set("cache:aa", Bytes::from_static(b"1"), ttl).await.unwrap();
        store.set("cache:ab", Bytes::from_static(b"2"), ttl).await.unwrap();
        store.set("other:aa", Bytes::from_static(b"3"), ttl).await.unwrap();

        assert_eq!(store.invalidate("cache:a?").await.unwrap(), 2);
        assert_eq!(store.len(), 1);

        assert_eq!(store.invalidate(DEFAULT_INVALIDATION_PATTERN).await.unwrap(), 0);
        assert!(store.get("other:aa").await.unwrap().is_some());
    }

    #[tokio::test]
    #[ignore = "requires a running Redis at REDIS_URL"]
    async fn test_redis_round_trip() {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1/".into());
        let store = RedisCacheStore::new(create_redis_pool(&url, 4).unwrap());

        store
            .set("cache:it", Bytes::from_static(b"body"), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(
            store.get("cache:it").await.unwrap(),
            Some(Bytes::from_static(b"body"))
        );
        assert!(store.invalidate("cache:it*").await.unwrap() >= 1);
        assert_eq!(store.get("cache:it").await.unwrap(), None);
    }
}
