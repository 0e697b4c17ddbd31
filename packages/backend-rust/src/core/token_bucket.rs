use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use super::CoordinationError;
use crate::cache::{keys, RedisCache};
use crate::config::AiConfig;

/// Refill-on-read bucket evaluated atomically inside Redis. The server clock
/// is used so every worker agrees on elapsed time.
const TOKEN_BUCKET_LUA: &str = r#"
local key = KEYS[1]
local rate = tonumber(ARGV[1])
local window_ms = tonumber(ARGV[2])
local capacity = tonumber(ARGV[3])
local cost = tonumber(ARGV[4])

local t = redis.call('TIME')
local now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)

local state = redis.call('HMGET', key, 'tokens', 'ts')
local tokens = tonumber(state[1])
local ts = tonumber(state[2])
if tokens == nil or ts == nil then
  tokens = capacity
  ts = now
end

local elapsed = math.max(0, now - ts)
tokens = math.min(capacity, tokens + (elapsed / window_ms) * rate)

local allowed = 0
local retry_ms = 0
if tokens >= cost then
  tokens = tokens - cost
  allowed = 1
elseif rate > 0 then
  retry_ms = math.ceil((cost - tokens) / rate * window_ms)
else
  retry_ms = window_ms
end

redis.call('HSET', key, 'tokens', tostring(tokens), 'ts', tostring(now))
redis.call('PEXPIRE', key, window_ms * 2)
return {allowed, math.floor(tokens), retry_ms}
"#;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketConfig {
    /// Tokens restored per window.
    pub rate: f64,
    pub window: Duration,
    pub capacity: f64,
}

impl BucketConfig {
    pub fn new(rate: u32, window: Duration, capacity: u32) -> Self {
        Self {
            rate: f64::from(rate),
            window,
            capacity: f64::from(capacity.max(1)),
        }
    }

    fn window_ms(&self) -> f64 {
        (self.window.as_millis() as f64).max(1.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketDecision {
    pub allowed: bool,
    pub remaining: u32,
    pub retry_after: Duration,
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: f64,
    updated: Instant,
}

/// In-process buckets. The mutex is the single arbiter that makes
/// check-and-decrement atomic.
#[derive(Default)]
pub struct MemoryBuckets {
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl MemoryBuckets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_consume_at(
        &self,
        key: &str,
        config: BucketConfig,
        cost: f64,
        now: Instant,
    ) -> BucketDecision {
        let mut buckets = self.buckets.lock();
        let bucket = buckets.entry(key.to_string()).or_insert(Bucket {
            tokens: config.capacity,
            updated: now,
        });

        let elapsed_ms = now.saturating_duration_since(bucket.updated).as_millis() as f64;
        let mut tokens =
            (bucket.tokens + elapsed_ms / config.window_ms() * config.rate).min(config.capacity);

        let decision = if tokens >= cost {
            tokens -= cost;
            BucketDecision {
                allowed: true,
                remaining: tokens.floor() as u32,
                retry_after: Duration::ZERO,
            }
        } else {
            let retry_ms = if config.rate > 0.0 {
                ((cost - tokens) / config.rate * config.window_ms()).ceil()
            } else {
                config.window_ms()
            };
            BucketDecision {
                allowed: false,
                remaining: tokens.floor() as u32,
                retry_after: Duration::from_millis(retry_ms as u64),
            }
        };

        bucket.tokens = tokens;
        bucket.updated = bucket.updated.max(now);
        decision
    }

    pub fn len(&self) -> usize {
        self.buckets.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.lock().is_empty()
    }

    /// Drops buckets that have been idle long enough to be full again.
    pub fn prune(&self, idle_for: Duration) {
        let now = Instant::now();
        self.buckets
            .lock()
            .retain(|_, bucket| now.saturating_duration_since(bucket.updated) < idle_for);
    }
}

#[derive(Clone)]
pub enum TokenBuckets {
    Redis(RedisCache),
    Memory(Arc<MemoryBuckets>),
}

impl TokenBuckets {
    pub fn memory() -> Self {
        TokenBuckets::Memory(Arc::new(MemoryBuckets::new()))
    }

    pub async fn try_consume(
        &self,
        key: &str,
        config: BucketConfig,
        cost: f64,
    ) -> Result<BucketDecision, CoordinationError> {
        match self {
            TokenBuckets::Memory(buckets) => Ok(buckets.try_consume_at(key, config, cost, Instant::now())),
            TokenBuckets::Redis(cache) => {
                let mut conn = cache.connection();
                let (allowed, remaining, retry_ms): (i64, i64, i64) =
                    redis::Script::new(TOKEN_BUCKET_LUA)
                        .key(key)
                        .arg(config.rate)
                        .arg(config.window_ms() as u64)
                        .arg(config.capacity)
                        .arg(cost)
                        .invoke_async(&mut conn)
                        .await?;
                Ok(BucketDecision {
                    allowed: allowed == 1,
                    remaining: remaining.max(0) as u32,
                    retry_after: Duration::from_millis(retry_ms.max(0) as u64),
                })
            }
        }
    }
}

/// Global and per-user admission for AI provider calls. Both buckets must
/// have a token for a call to proceed.
#[derive(Clone)]
pub struct AiRateLimiter {
    buckets: TokenBuckets,
    global: BucketConfig,
    per_user: BucketConfig,
}

impl AiRateLimiter {
    pub fn new(buckets: TokenBuckets, config: &AiConfig) -> Self {
        Self {
            buckets,
            global: config.global_bucket(),
            per_user: config.user_bucket(),
        }
    }

    pub fn with_buckets(buckets: TokenBuckets, global: BucketConfig, per_user: BucketConfig) -> Self {
        Self {
            buckets,
            global,
            per_user,
        }
    }

    pub async fn acquire(&self, user_id: &str) -> Result<bool, CoordinationError> {
        let user = self
            .buckets
            .try_consume(&keys::user_ai_rate_key(user_id), self.per_user, 1.0)
            .await?;
        if !user.allowed {
            tracing::debug!(user_id, "per-user AI rate limit exhausted");
            return Ok(false);
        }

        let global = self
            .buckets
            .try_consume(keys::global_ai_rate_key(), self.global, 1.0)
            .await?;
        if !global.allowed {
            tracing::debug!("global AI rate limit exhausted");
        }
        Ok(global.allowed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_burst_then_reject_then_refill() {
        let buckets = MemoryBuckets::new();
        let config = BucketConfig::new(10, Duration::from_secs(60), 5);
        let start = Instant::now();

        for i in 0..5 {
            let at = start + Duration::from_millis(i * 100);
            assert!(buckets.try_consume_at("u1", config, 1.0, at).allowed, "call {i}");
        }
        let sixth = buckets.try_consume_at("u1", config, 1.0, start + Duration::from_millis(600));
        assert!(!sixth.allowed);
        assert!(sixth.retry_after > Duration::ZERO);

        let later = start + Duration::from_secs(60);
        assert!(buckets.try_consume_at("u1", config, 1.0, later).allowed);
    }

    #[test]
    fn test_keys_are_independent() {
        let buckets = MemoryBuckets::new();
        let config = BucketConfig::new(1, Duration::from_secs(60), 1);
        let now = Instant::now();
        assert!(buckets.try_consume_at("a", config, 1.0, now).allowed);
        assert!(!buckets.try_consume_at("a", config, 1.0, now).allowed);
        assert!(buckets.try_consume_at("b", config, 1.0, now).allowed);
    }

    #[test]
    fn test_refill_never_exceeds_capacity() {
        let buckets = MemoryBuckets::new();
        let config = BucketConfig::new(100, Duration::from_secs(1), 3);
        let now = Instant::now();
        assert!(buckets.try_consume_at("k", config, 1.0, now).allowed);

        let much_later = now + Duration::from_secs(3600);
        let decision = buckets.try_consume_at("k", config, 1.0, much_later);
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_configured_burst_admits_five_of_six() {
        let config = AiConfig {
            user_per_min: 10,
            burst: 5,
            ..AiConfig::default()
        };
        let limiter = AiRateLimiter::new(TokenBuckets::memory(), &config);

        let mut allowed = 0;
        for _ in 0..6 {
            if limiter.acquire("u1").await.unwrap() {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 5);

        tokio::time::advance(config.window).await;
        assert!(limiter.acquire("u1").await.unwrap());
    }

    #[tokio::test]
    async fn test_ai_limiter_requires_both_buckets() {
        let limiter = AiRateLimiter::with_buckets(
            TokenBuckets::memory(),
            BucketConfig::new(0, Duration::from_secs(60), 3),
            BucketConfig::new(0, Duration::from_secs(60), 2),
        );

        assert!(limiter.acquire("alice").await.unwrap());
        assert!(limiter.acquire("alice").await.unwrap());
        assert!(!limiter.acquire("alice").await.unwrap());
        // Global bucket has one token left.
        assert!(limiter.acquire("bob").await.unwrap());
        assert!(!limiter.acquire("carol").await.unwrap());
    }
}
