//! Rate limiting for blunting credential-guessing attacks
//!
//! Attempts are counted per key (`login:{email}` for first-factor
//! attempts, `mfa:{account}:{method}` for second-factor attempts) within
//! a fixed window. The check counts the attempt it is deciding on, in
//! one atomic step, so concurrent attempts cannot slip past the limit
//! between a read and a deferred write. Production uses the Redis-backed
//! limiter: counters survive restarts and are shared across replicas.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use common::cache::RedisPool;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

/// Rate limiter configuration
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Attempts tolerated within one window
    pub max_attempts: u32,
    /// Window length in seconds
    pub window_seconds: u64,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            window_seconds: 900, // 15 minutes
        }
    }
}

/// Outcome of a rate-limit check, surfaced to the caller on denial
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: u32,
    pub resets_at: DateTime<Utc>,
}

/// Attempt counter seam
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Atomically count one attempt against `key` and decide whether it
    /// may proceed
    async fn check_and_count(&self, key: &str, now: DateTime<Utc>) -> Result<RateLimitDecision>;

    /// Clear the counter for `key` (successful authentication)
    async fn reset(&self, key: &str) -> Result<()>;
}

/// Redis-backed limiter: INCR with an expiry armed on the first
/// increment of each window
pub struct RedisRateLimiter {
    config: RateLimiterConfig,
    redis: Arc<RedisPool>,
}

impl RedisRateLimiter {
    pub fn new(config: RateLimiterConfig, redis: Arc<RedisPool>) -> Self {
        Self { config, redis }
    }

    fn key(key: &str) -> String {
        format!("rate_limit:{}", key)
    }
}

#[async_trait]
impl RateLimiter for RedisRateLimiter {
    async fn check_and_count(&self, key: &str, now: DateTime<Utc>) -> Result<RateLimitDecision> {
        let redis_key = Self::key(key);
        let attempts = self
            .redis
            .increment(&redis_key, self.config.window_seconds)
            .await? as u32;

        let ttl = self
            .redis
            .ttl(&redis_key)
            .await?
            .unwrap_or(self.config.window_seconds);

        if attempts == self.config.max_attempts {
            info!("Rate limit reached for key {}", key);
        }

        Ok(RateLimitDecision {
            allowed: attempts <= self.config.max_attempts,
            remaining: self.config.max_attempts.saturating_sub(attempts),
            resets_at: now + Duration::seconds(ttl as i64),
        })
    }

    async fn reset(&self, key: &str) -> Result<()> {
        self.redis.delete(&Self::key(key)).await
    }
}

#[derive(Debug)]
struct LocalEntry {
    attempts: u32,
    window_started: DateTime<Utc>,
}

/// Single-process limiter with the same count-on-check semantics,
/// counting under one lock. Backs the unit tests.
pub struct LocalRateLimiter {
    config: RateLimiterConfig,
    entries: Mutex<HashMap<String, LocalEntry>>,
}

impl LocalRateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn window(&self) -> Duration {
        Duration::seconds(self.config.window_seconds as i64)
    }
}

#[async_trait]
impl RateLimiter for LocalRateLimiter {
    async fn check_and_count(&self, key: &str, now: DateTime<Utc>) -> Result<RateLimitDecision> {
        let mut entries = self.entries.lock().await;

        let entry = entries.entry(key.to_string()).or_insert(LocalEntry {
            attempts: 0,
            window_started: now,
        });

        if now - entry.window_started >= self.window() {
            entry.attempts = 0;
            entry.window_started = now;
        }

        entry.attempts += 1;

        if entry.attempts == self.config.max_attempts {
            info!("Rate limit reached for key {}", key);
        }

        Ok(RateLimitDecision {
            allowed: entry.attempts <= self.config.max_attempts,
            remaining: self.config.max_attempts.saturating_sub(entry.attempts),
            resets_at: entry.window_started + self.window(),
        })
    }

    async fn reset(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.lock().await;
        entries.remove(key);
        Ok(())
    }
}
