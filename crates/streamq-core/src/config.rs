//! Queue configuration.
//!
//! Every value has a default; `from_env` overrides them from `STREAMQ_*`
//! variables. Hosts that keep their own config file can deserialize
//! `QueueConfig` directly (all fields are optional thanks to `#[serde(default)]`).

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::RetryBackoff;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Where the Redis server lives.
///
/// `url` wins when set; otherwise the URL is assembled from the parts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisSettings {
    pub url: Option<String>,
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub database: u32,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            url: None,
            scheme: "tcp".to_string(),
            host: "localhost".to_string(),
            port: 6379,
            database: 0,
        }
    }
}

impl RedisSettings {
    pub fn url(&self) -> String {
        if let Some(url) = &self.url {
            return url.clone();
        }
        let scheme = match self.scheme.as_str() {
            "tcp" | "redis" => "redis",
            "tls" | "rediss" => "rediss",
            other => other,
        };
        format!("{scheme}://{}:{}/{}", self.host, self.port, self.database)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub redis: RedisSettings,

    /// Stream holding pending tasks.
    pub stream_key: String,

    /// Stream receiving abandoned and undecodable tasks.
    pub dead_letter_key: String,

    /// Prefix of per-task lock keys.
    pub lock_prefix: String,

    /// Maximum entries per fetch.
    pub batch_count: usize,

    /// How long one fetch waits for new entries.
    pub block_timeout_ms: u64,

    /// Added to a task's timeout to size its lock expiry.
    pub lock_margin_secs: u64,

    /// Pause after a batch in which nothing could be processed.
    pub idle_interval_ms: u64,

    pub retry_backoff: RetryBackoff,

    /// Consumer group passed to `XACK`, if the stream is also read through one.
    pub ack_group: Option<String>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            redis: RedisSettings::default(),
            stream_key: "streamq:tasks".to_string(),
            dead_letter_key: "streamq:dead".to_string(),
            lock_prefix: "streamq:lock:".to_string(),
            batch_count: 10,
            block_timeout_ms: 5000,
            lock_margin_secs: 10,
            idle_interval_ms: 250,
            retry_backoff: RetryBackoff::Blocking,
            ack_group: None,
        }
    }
}

impl QueueConfig {
    /// Defaults overridden by `STREAMQ_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as `from_env`, reading variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = var("STREAMQ_REDIS_URL") {
            config.redis.url = Some(v);
        }
        if let Some(v) = var("STREAMQ_REDIS_SCHEME") {
            config.redis.scheme = v;
        }
        if let Some(v) = var("STREAMQ_REDIS_HOST") {
            config.redis.host = v;
        }
        if let Some(v) = var("STREAMQ_REDIS_PORT") {
            config.redis.port = parse("STREAMQ_REDIS_PORT", &v)?;
        }
        if let Some(v) = var("STREAMQ_REDIS_DB") {
            config.redis.database = parse("STREAMQ_REDIS_DB", &v)?;
        }
        if let Some(v) = var("STREAMQ_STREAM_KEY") {
            config.stream_key = v;
        }
        if let Some(v) = var("STREAMQ_DEAD_LETTER_KEY") {
            config.dead_letter_key = v;
        }
        if let Some(v) = var("STREAMQ_LOCK_PREFIX") {
            config.lock_prefix = v;
        }
        if let Some(v) = var("STREAMQ_BATCH_COUNT") {
            config.batch_count = parse("STREAMQ_BATCH_COUNT", &v)?;
        }
        if let Some(v) = var("STREAMQ_BLOCK_MS") {
            config.block_timeout_ms = parse("STREAMQ_BLOCK_MS", &v)?;
        }
        if let Some(v) = var("STREAMQ_LOCK_MARGIN_SECS") {
            config.lock_margin_secs = parse("STREAMQ_LOCK_MARGIN_SECS", &v)?;
        }
        if let Some(v) = var("STREAMQ_IDLE_MS") {
            config.idle_interval_ms = parse("STREAMQ_IDLE_MS", &v)?;
        }
        if let Some(v) = var("STREAMQ_RETRY_BACKOFF") {
            config.retry_backoff = v.parse().map_err(|reason| ConfigError::Invalid {
                key: "STREAMQ_RETRY_BACKOFF",
                value: v.clone(),
                reason,
            })?;
        }
        if let Some(v) = var("STREAMQ_ACK_GROUP") {
            config.ack_group = Some(v);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_count == 0 {
            return Err(ConfigError::Invalid {
                key: "batch_count",
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.stream_key == self.dead_letter_key {
            return Err(ConfigError::Invalid {
                key: "dead_letter_key",
                value: self.dead_letter_key.clone(),
                reason: "must differ from stream_key".to_string(),
            });
        }
        Ok(())
    }

    pub fn block_timeout(&self) -> Duration {
        Duration::from_millis(self.block_timeout_ms)
    }

    pub fn lock_margin(&self) -> Duration {
        Duration::from_secs(self.lock_margin_secs)
    }

    pub fn idle_interval(&self) -> Duration {
        Duration::from_millis(self.idle_interval_ms)
    }
}

fn parse<T>(key: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        key,
        value: raw.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_without_environment() {
        let config = QueueConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, QueueConfig::default());
        assert_eq!(config.batch_count, 10);
        assert_eq!(config.block_timeout(), Duration::from_millis(5000));
        assert_eq!(config.lock_margin(), Duration::from_secs(10));
        assert_eq!(config.redis.url(), "redis://localhost:6379/0");
    }

    #[test]
    fn environment_overrides_defaults() {
        let config = QueueConfig::from_lookup(lookup(&[
            ("STREAMQ_REDIS_HOST", "cache.internal"),
            ("STREAMQ_REDIS_PORT", "6380"),
            ("STREAMQ_REDIS_DB", "2"),
            ("STREAMQ_REDIS_SCHEME", "tls"),
            ("STREAMQ_BATCH_COUNT", "25"),
            ("STREAMQ_RETRY_BACKOFF", "deferred"),
            ("STREAMQ_STREAM_KEY", "shop:queue"),
        ]))
        .unwrap();

        assert_eq!(config.redis.url(), "rediss://cache.internal:6380/2");
        assert_eq!(config.batch_count, 25);
        assert_eq!(config.retry_backoff, RetryBackoff::Deferred);
        assert_eq!(config.stream_key, "shop:queue");
    }

    #[test]
    fn explicit_url_wins_over_parts() {
        let config = QueueConfig::from_lookup(lookup(&[
            ("STREAMQ_REDIS_URL", "redis://:secret@redis:6379/1"),
            ("STREAMQ_REDIS_HOST", "ignored"),
        ]))
        .unwrap();
        assert_eq!(config.redis.url(), "redis://:secret@redis:6379/1");
    }

    #[test]
    fn blank_values_fall_back_to_defaults() {
        let config = QueueConfig::from_lookup(lookup(&[("STREAMQ_BATCH_COUNT", "  ")])).unwrap();
        assert_eq!(config.batch_count, 10);
    }

    #[test]
    fn invalid_values_are_reported_with_their_key() {
        let err = QueueConfig::from_lookup(lookup(&[("STREAMQ_REDIS_PORT", "http")])).unwrap_err();
        assert!(err.to_string().contains("STREAMQ_REDIS_PORT"));

        let err = QueueConfig::from_lookup(lookup(&[("STREAMQ_BATCH_COUNT", "0")])).unwrap_err();
        assert!(err.to_string().contains("batch_count"));

        let err =
            QueueConfig::from_lookup(lookup(&[("STREAMQ_RETRY_BACKOFF", "sometimes")])).unwrap_err();
        assert!(err.to_string().contains("STREAMQ_RETRY_BACKOFF"));
    }

    #[test]
    fn deserializes_partial_documents() {
        let config: QueueConfig =
            serde_json::from_str(r#"{"batch_count": 3, "redis": {"host": "r1"}}"#).unwrap();
        assert_eq!(config.batch_count, 3);
        assert_eq!(config.redis.host, "r1");
        assert_eq!(config.redis.port, 6379);
        assert_eq!(config.stream_key, "streamq:tasks");
    }
}
