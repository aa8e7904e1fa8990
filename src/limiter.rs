use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};

/// Outcome of a single `allow_n` call against one key.
#[derive(Debug, Clone, Copy)]
pub struct AllowResult {
    pub allowed: u64,
    pub retry_after: Duration,
}

/// An atomic, keyed "consume (or credit) N tokens" primitive. The GCRA/
/// token-bucket script lives on the other side of this trait — callers
/// never see the wire protocol.
#[async_trait]
pub trait DistributedLimiter: Send + Sync {
    async fn allow_n(
        &self,
        key: &str,
        rate: u64,
        burst: u64,
        period: Duration,
        n: i64,
    ) -> anyhow::Result<AllowResult>;
}

// A GCRA-style token bucket keyed in Redis. State per key is a hash of
// {tokens, updated_at_millis}, refilled lazily on each call rather than by a
// background sweep. `n` is signed: a negative `n` is treated as a credit
// back into the bucket (clamped at `burst`) rather than a denial, so
// reconciliation can return over-predicted tokens to the budget.
const GCRA_SCRIPT: &str = r#"
local key = KEYS[1]
local rate = tonumber(ARGV[1])
local burst = tonumber(ARGV[2])
local period_ms = tonumber(ARGV[3])
local n = tonumber(ARGV[4])
local now_ms = tonumber(ARGV[5])

local state = redis.call("HMGET", key, "tokens", "updated_at")
local tokens = tonumber(state[1])
local updated_at = tonumber(state[2])

if tokens == nil then
    tokens = burst
    updated_at = now_ms
end

local elapsed = math.max(0, now_ms - updated_at)
local refill = elapsed * (rate / period_ms)
tokens = math.min(burst, tokens + refill)

local allowed = 0
local retry_after_ms = 0

if n <= 0 then
    -- credit: always "allowed", never denies
    tokens = math.min(burst, tokens - n)
    allowed = 1
elseif tokens >= n then
    tokens = tokens - n
    allowed = 1
else
    local deficit = n - tokens
    retry_after_ms = math.ceil(deficit * period_ms / rate)
end

redis.call("HMSET", key, "tokens", tokens, "updated_at", now_ms)
redis.call("PEXPIRE", key, period_ms * 2)

return {allowed, retry_after_ms}
"#;

pub struct RedisLimiter {
    conn: ConnectionManager,
    script: Script,
}

impl RedisLimiter {
    pub async fn connect(addr: &str, username: &str, password: &str) -> anyhow::Result<Self> {
        let url = build_redis_url(addr, username, password);
        let client = redis::Client::open(url)?;
        let mut conn = ConnectionManager::new(client).await?;
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .map_err(|err| anyhow::anyhow!("redis connection failed: {err}"))?;
        Ok(Self {
            conn,
            script: Script::new(GCRA_SCRIPT),
        })
    }
}

fn build_redis_url(addr: &str, username: &str, password: &str) -> String {
    if username.is_empty() && password.is_empty() {
        return format!("redis://{addr}");
    }
    if username.is_empty() {
        return format!("redis://:{password}@{addr}");
    }
    format!("redis://{username}:{password}@{addr}")
}

#[async_trait]
impl DistributedLimiter for RedisLimiter {
    async fn allow_n(
        &self,
        key: &str,
        rate: u64,
        burst: u64,
        period: Duration,
        n: i64,
    ) -> anyhow::Result<AllowResult> {
        let now_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;

        let mut conn = self.conn.clone();
        let (allowed, retry_after_ms): (u64, u64) = self
            .script
            .key(key)
            .arg(rate)
            .arg(burst)
            .arg(period.as_millis() as u64)
            .arg(n)
            .arg(now_ms)
            .invoke_async(&mut conn)
            .await?;

        Ok(AllowResult {
            allowed,
            retry_after: Duration::from_millis(retry_after_ms),
        })
    }
}

/// Iterates `keys` and returns `true` iff every key allows `n`. Fails closed:
/// an infrastructure error, or a single denial, makes the whole call `false`.
/// Denials on later keys do not roll back debits already applied against
/// earlier keys in this list — a known imprecision for multi-key rules,
/// accepted because rolling back would require a second round trip per key.
pub async fn token_rate(
    limiter: &dyn DistributedLimiter,
    keys: &[String],
    rate: u64,
    burst: u64,
    period: Duration,
    n: i64,
) -> bool {
    for key in keys {
        match limiter.allow_n(key, rate, burst, period, n).await {
            Ok(result) if result.allowed == 0 => {
                tracing::info!(key, "rate limit denied: too many requests");
                return false;
            }
            Ok(result) => {
                tracing::debug!(key, allowed = result.allowed, "rate limit allowed");
            }
            Err(err) => {
                tracing::error!(key, error = %err, "redis error in token_rate");
                return false;
            }
        }
    }
    true
}

/// In-memory stand-in used by tests and by the demo harness when no Redis
/// address is configured. Implements the same signed-`n` GCRA semantics as
/// [`RedisLimiter`] without a network round trip.
pub struct InMemoryLimiter {
    buckets: tokio::sync::Mutex<std::collections::HashMap<String, (f64, std::time::Instant)>>,
}

impl InMemoryLimiter {
    pub fn new() -> Self {
        Self {
            buckets: tokio::sync::Mutex::new(std::collections::HashMap::new()),
        }
    }
}

impl Default for InMemoryLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DistributedLimiter for InMemoryLimiter {
    async fn allow_n(
        &self,
        key: &str,
        rate: u64,
        burst: u64,
        period: Duration,
        n: i64,
    ) -> anyhow::Result<AllowResult> {
        let mut buckets = self.buckets.lock().await;
        let now = std::time::Instant::now();
        let (tokens, updated_at) = buckets
            .entry(key.to_string())
            .or_insert((burst as f64, now));

        let elapsed = now.saturating_duration_since(*updated_at).as_secs_f64();
        let refill = elapsed * (rate as f64 / period.as_secs_f64());
        *tokens = (*tokens + refill).min(burst as f64);
        *updated_at = now;

        if n <= 0 {
            *tokens = (*tokens - n as f64).min(burst as f64);
            return Ok(AllowResult {
                allowed: 1,
                retry_after: Duration::ZERO,
            });
        }

        if *tokens >= n as f64 {
            *tokens -= n as f64;
            Ok(AllowResult {
                allowed: 1,
                retry_after: Duration::ZERO,
            })
        } else {
            let deficit = n as f64 - *tokens;
            let retry_after = Duration::from_secs_f64(deficit * period.as_secs_f64() / rate as f64);
            Ok(AllowResult {
                allowed: 0,
                retry_after,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allows_within_burst() {
        let limiter = InMemoryLimiter::new();
        let result = limiter
            .allow_n("k", 10, 100, Duration::from_secs(1), 50)
            .await
            .unwrap();
        assert_eq!(result.allowed, 1);
    }

    #[tokio::test]
    async fn denies_beyond_burst() {
        let limiter = InMemoryLimiter::new();
        let result = limiter
            .allow_n("k", 10, 100, Duration::from_secs(1), 150)
            .await
            .unwrap();
        assert_eq!(result.allowed, 0);
    }

    #[tokio::test]
    async fn negative_n_credits_without_denying() {
        let limiter = InMemoryLimiter::new();
        limiter
            .allow_n("k", 10, 100, Duration::from_secs(1), 100)
            .await
            .unwrap();
        let result = limiter
            .allow_n("k", 10, 100, Duration::from_secs(1), -50)
            .await
            .unwrap();
        assert_eq!(result.allowed, 1);
    }

    #[tokio::test]
    async fn token_rate_is_true_for_empty_keys() {
        let limiter = InMemoryLimiter::new();
        let allowed = token_rate(&limiter, &[], 1, 1, Duration::from_secs(1), 100).await;
        assert!(allowed);
    }

    #[tokio::test]
    async fn token_rate_denies_if_any_key_denies() {
        let limiter = InMemoryLimiter::new();
        let keys = vec!["a".to_string(), "b".to_string()];
        // Exhaust "b" first so the second key in the list denies.
        limiter
            .allow_n("b", 1, 1, Duration::from_secs(1), 1)
            .await
            .unwrap();
        let allowed = token_rate(&limiter, &keys, 1, 1, Duration::from_secs(1), 1).await;
        assert!(!allowed);
    }
}
