//! Fixed-window per-identity rate limiting
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use deadpool_redis::Pool;
use log::debug;
use redis::AsyncCommands;
use std::sync::atomic::{AtomicI64, Ordering};

use crate::error::GatewayResult;

/// Length of one counting window
pub const WINDOW_SECS: i64 = 60;

/// Counters outlive their window so a late increment never recreates an expired key
pub const WINDOW_EXPIRY_SECS: i64 = 2 * WINDOW_SECS;

#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Count this request and report whether it is within `limit_per_minute`
    async fn allow(&self, identity: &str, limit_per_minute: u32) -> GatewayResult<bool>;

    /// Requests counted in the current window
    async fn current_count(&self, identity: &str) -> GatewayResult<u64>;
}

/// Start of the window containing `unix_secs`
pub fn window_start(unix_secs: i64) -> i64 {
    unix_secs - unix_secs.rem_euclid(WINDOW_SECS)
}

/// `{prefix}:{identity}:{window_start}`
pub fn window_key(prefix: &str, identity: &str, unix_secs: i64) -> String {
    format!("{}:{}:{}", prefix, identity, window_start(unix_secs))
}

/// Rate limiter shared between gateway instances through Redis
pub struct RedisRateLimiter {
    pool: Pool,
    prefix: String,
}

impl RedisRateLimiter {
    pub fn new(pool: Pool, prefix: impl Into<String>) -> Self {
        Self {
            pool,
            prefix: prefix.into(),
        }
    }
}

#[async_trait]
impl RateLimiter for RedisRateLimiter {
    async fn allow(&self, identity: &str, limit_per_minute: u32) -> GatewayResult<bool> {
        let key = window_key(&self.prefix, identity, Utc::now().timestamp());
        let mut conn = self.pool.get().await?;

        // MULTI/EXEC keeps INCR and EXPIRE together
        let (count,): (u64,) = redis::pipe()
            .atomic()
            .incr(&key, 1)
            .expire(&key, WINDOW_EXPIRY_SECS)
            .ignore()
            .query_async(&mut conn)
            .await?;

        debug!("{} at {}/{} for current window", identity, count, limit_per_minute);
        Ok(count <= u64::from(limit_per_minute))
    }

    async fn current_count(&self, identity: &str) -> GatewayResult<u64> {
        let key = window_key(&self.prefix, identity, Utc::now().timestamp());
        let mut conn = self.pool.get().await?;
        let count: Option<u64> = conn.get(&key).await?;
        Ok(count.unwrap_or(0))
    }
}

#[derive(Debug, Clone, Copy)]
struct WindowCounter {
    count: u64,
    expires_at: i64,
}

/// Single-process rate limiter
pub struct MemoryRateLimiter {
    prefix: String,
    counters: DashMap<String, WindowCounter>,
    last_pruned_window: AtomicI64,
}

impl MemoryRateLimiter {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            counters: DashMap::new(),
            last_pruned_window: AtomicI64::new(0),
        }
    }

    fn allow_at(&self, identity: &str, limit_per_minute: u32, now: i64) -> bool {
        self.prune_expired(now);

        let key = window_key(&self.prefix, identity, now);
        let mut counter = self.counters.entry(key).or_insert(WindowCounter {
            count: 0,
            expires_at: now + WINDOW_EXPIRY_SECS,
        });
        counter.count += 1;
        counter.expires_at = now + WINDOW_EXPIRY_SECS;
        counter.count <= u64::from(limit_per_minute)
    }

    fn count_at(&self, identity: &str, now: i64) -> u64 {
        self.counters
            .get(&window_key(&self.prefix, identity, now))
            .filter(|counter| counter.expires_at > now)
            .map(|counter| counter.count)
            .unwrap_or(0)
    }

    /// Drop expired windows, at most once per window
    fn prune_expired(&self, now: i64) {
        let window = window_start(now);
        let previous = self.last_pruned_window.swap(window, Ordering::Relaxed);
        if previous != window {
            self.counters.retain(|_, counter| counter.expires_at > now);
        }
    }

    pub fn tracked_windows(&self) -> usize {
        self.counters.len()
    }
}

#[async_trait]
impl RateLimiter for MemoryRateLimiter {
    async fn allow(&self, identity: &str, limit_per_minute: u32) -> GatewayResult<bool> {
        Ok(self.allow_at(identity, limit_per_minute, Utc::now().timestamp()))
    }

    async fn current_count(&self, identity: &str) -> GatewayResult<u64> {
        Ok(self.count_at(identity, Utc::now().timestamp()))
    }
}
