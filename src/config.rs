use std::fs;
use std::path::Path;
use std::sync::Arc;

use regex::Regex;
use serde::Deserialize;

use crate::adapter::{LlmAdapter, LlmAdapterType};
use crate::key_extractor::{LimitBy, RateRule};
use crate::limiter::{DistributedLimiter, InMemoryLimiter, RedisLimiter};
use crate::stats::{TokenStats, TokenStatsConfig};

/// Built once at config load, immutable thereafter, shared across
/// concurrent requests via `Arc`.
pub struct PluginConfig {
    pub rule: RateRule,
    pub regexps: Vec<Regex>,
    pub adapter: Arc<dyn LlmAdapter>,
    pub stats: Arc<TokenStats>,
    pub limiter: Arc<dyn DistributedLimiter>,
}

impl PluginConfig {
    /// Builds the immutable plugin configuration, compiling regexes and
    /// establishing (and pinging) the Redis connection. Any failure here is
    /// fatal: the plugin must not serve requests with a half-built config.
    pub async fn build(raw: RawConfig) -> anyhow::Result<Self> {
        let mut regexps = Vec::with_capacity(raw.rule.keys.len());
        for pattern in &raw.rule.keys {
            let re = Regex::new(pattern)
                .map_err(|err| anyhow::anyhow!("invalid regexp key {pattern:?}: {err}"))?;
            regexps.push(re);
        }

        let adapter_type = LlmAdapterType::parse(&raw.llm_adapter.adapter_type)?;
        let adapter = adapter_type.build();

        let stats = Arc::new(TokenStats::new(raw.token_stats.resolve()));

        let limiter: Arc<dyn DistributedLimiter> = if raw.redis.service_addr.is_empty() {
            if !raw.redis.allow_in_memory_fallback {
                anyhow::bail!(
                    "redis.service_addr is empty; set it to a reachable Redis instance, or set \
                     redis.allow_in_memory_fallback = true to explicitly run single-process-only \
                     (unenforced across replicas)"
                );
            }
            tracing::warn!(
                "redis.allow_in_memory_fallback is set and no redis.service_addr is configured; \
                 running with an in-memory limiter, rate limits are not enforced across replicas"
            );
            Arc::new(InMemoryLimiter::new())
        } else {
            Arc::new(
                RedisLimiter::connect(
                    &raw.redis.service_addr,
                    &raw.redis.username,
                    &raw.redis.password,
                )
                .await
                .map_err(|err| anyhow::anyhow!("redis connection failed: {err}"))?,
            )
        };

        Ok(Self {
            rule: raw.rule.resolve()?,
            regexps,
            adapter,
            stats,
            limiter,
        })
    }
}

/// The on-disk TOML schema. Every field is defaulted so an entirely empty
/// file is valid; `RawConfig::resolve`-style helpers below turn zero/empty
/// values into the documented defaults.
#[derive(Debug, Deserialize, Default)]
pub struct RawConfig {
    #[serde(default)]
    pub redis: RawRedisConfig,
    #[serde(default)]
    pub rule: RawRateRule,
    #[serde(default)]
    pub llm_adapter: RawLlmAdapterConfig,
    #[serde(default)]
    pub token_stats: RawTokenStatsConfig,
    #[serde(default)]
    pub server: RawServerConfig,
    #[serde(default)]
    pub log: RawLogConfig,
}

impl RawConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let text = fs::read_to_string(&path)
            .map_err(|err| anyhow::anyhow!("failed to read config file: {err}"))?;
        toml::from_str(&text).map_err(|err| anyhow::anyhow!("failed to parse config file: {err}"))
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct RawRedisConfig {
    #[serde(default)]
    pub service_addr: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Explicit opt-in to run without Redis (single-process, unenforced
    /// across replicas) when `service_addr` is empty. Without this, an
    /// empty `service_addr` is a fatal config error, matching the posture
    /// that a missing Redis connection should not silently downgrade
    /// enforcement.
    #[serde(default)]
    pub allow_in_memory_fallback: bool,
}

#[derive(Debug, Deserialize, Default)]
pub struct RawRateRule {
    #[serde(default)]
    pub rate: u64,
    #[serde(default)]
    pub burst: u64,
    #[serde(default)]
    pub limit_by: RawLimitBy,
    #[serde(default)]
    pub keys: Vec<String>,
}

impl RawRateRule {
    fn resolve(self) -> anyhow::Result<RateRule> {
        Ok(RateRule {
            rate: if self.rate == 0 { 100 } else { self.rate },
            burst: if self.burst == 0 { 100 } else { self.burst },
            limit_by: self.limit_by.resolve()?,
        })
    }
}

/// Tagged variant over the nine `limit-by` modes, deserialized as
/// `{ type = "per_header", name = "x-tenant" }` style tables.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RawLimitBy {
    Header { name: String },
    QueryParam { name: String },
    Cookie { name: String },
    Consumer,
    PerIp,
    PerHeader { name: String },
    PerQueryParam { name: String },
    PerCookie { name: String },
    PerConsumer,
}

impl Default for RawLimitBy {
    fn default() -> Self {
        RawLimitBy::PerIp
    }
}

impl RawLimitBy {
    fn resolve(self) -> anyhow::Result<LimitBy> {
        Ok(match self {
            RawLimitBy::Header { name } => LimitBy::Header(name),
            RawLimitBy::QueryParam { name } => LimitBy::QueryParam(name),
            RawLimitBy::Cookie { name } => LimitBy::Cookie(name),
            RawLimitBy::Consumer => LimitBy::Consumer,
            RawLimitBy::PerIp => LimitBy::PerIp,
            RawLimitBy::PerHeader { name } => LimitBy::PerHeader(name),
            RawLimitBy::PerQueryParam { name } => LimitBy::PerQueryParam(name),
            RawLimitBy::PerCookie { name } => LimitBy::PerCookie(name),
            RawLimitBy::PerConsumer => LimitBy::PerConsumer,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct RawLlmAdapterConfig {
    #[serde(rename = "type", default = "default_adapter_type")]
    pub adapter_type: String,
}

impl Default for RawLlmAdapterConfig {
    fn default() -> Self {
        Self {
            adapter_type: default_adapter_type(),
        }
    }
}

fn default_adapter_type() -> String {
    "openai".to_string()
}

#[derive(Debug, Deserialize, Default, Clone, Copy)]
pub struct RawTokenStatsConfig {
    #[serde(default)]
    pub window_size: usize,
    #[serde(default)]
    pub min_samples: usize,
    #[serde(default)]
    pub max_ratio: f64,
    #[serde(default)]
    pub max_tokens_per_req: u64,
    #[serde(default)]
    pub exceed_factor: f64,
}

impl RawTokenStatsConfig {
    fn resolve(self) -> TokenStatsConfig {
        TokenStatsConfig {
            window_size: self.window_size,
            min_samples: self.min_samples,
            max_ratio: self.max_ratio,
            max_tokens_per_req: self.max_tokens_per_req,
            exceed_factor: self.exceed_factor,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RawServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub upstream: String,
}

impl Default for RawServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            upstream: String::new(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    9090
}

#[derive(Debug, Deserialize)]
pub struct RawLogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for RawLogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaulted_rate_rule_falls_back_to_per_ip() {
        let raw = RawRateRule::default();
        let resolved = raw.resolve().unwrap();
        assert!(matches!(resolved.limit_by, LimitBy::PerIp));
        assert_eq!(resolved.rate, 100);
        assert_eq!(resolved.burst, 100);
    }

    #[test]
    fn parses_per_header_rule_from_toml() {
        let text = r#"
            [rule]
            rate = 500
            burst = 1000
            keys = ["foo=(\\w+)"]
            [rule.limit_by]
            type = "per_header"
            name = "x-tenant"
        "#;
        let raw: RawConfig = toml::from_str(text).unwrap();
        assert!(matches!(raw.rule.limit_by, RawLimitBy::PerHeader { .. }));
        assert_eq!(raw.rule.rate, 500);
    }

    #[test]
    fn empty_file_parses_to_all_defaults() {
        let raw: RawConfig = toml::from_str("").unwrap();
        assert_eq!(raw.llm_adapter.adapter_type, "openai");
        assert_eq!(raw.server.port, 9090);
        assert!(!raw.redis.allow_in_memory_fallback);
    }

    #[tokio::test]
    async fn build_fails_fatally_without_redis_addr_or_opt_in() {
        let raw = RawConfig::default();
        let err = PluginConfig::build(raw).await.unwrap_err();
        assert!(err.to_string().contains("redis.service_addr"));
    }

    #[tokio::test]
    async fn build_succeeds_with_explicit_in_memory_opt_in() {
        let mut raw = RawConfig::default();
        raw.redis.allow_in_memory_fallback = true;
        let config = PluginConfig::build(raw).await.unwrap();
        assert_eq!(config.rule.rate, 100);
    }
}
