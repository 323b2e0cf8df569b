use std::env;
use std::str::FromStr;
use std::time::Duration;

use bench_core::constants::{DEFAULT_STATS_INTERVAL_SECS, UNKNOWN_REGION};

use crate::keydb::DEFAULT_KEYDB_URL;
use crate::kv::QueuePolicy;

const DEFAULT_POLL_MS: u64 = 1000;
/// Room for one page load's worth of records per producer, with headroom.
const DEFAULT_RATE_LIMIT_PER_SEC: u32 = 20;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {var}")]
    Invalid { var: &'static str, value: String },
}

/// Settings shared by the API process and the offline tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub keydb_url: String,
    pub keydb_replica_url: Option<String>,
    /// Region stamped on measurements that arrive without one.
    pub region_id: String,
    /// Token for the manual recompute endpoint. `None` disables it.
    pub stats_token: Option<String>,
    pub stats_interval: Duration,
    pub queue: QueuePolicy,
    pub poll_interval: Duration,
    /// Requests per second per client on the ingestion and read routes.
    pub rate_limit_per_sec: u32,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    /// Resolves every setting through `lookup`. Blank values count as unset;
    /// values that are set but do not parse are an error.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |var: &str| {
            lookup(var)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let defaults = QueuePolicy::default();

        Ok(ServerConfig {
            keydb_url: get("BENCH_KEYDB_URL").unwrap_or_else(|| DEFAULT_KEYDB_URL.to_string()),
            keydb_replica_url: get("BENCH_KEYDB_REPLICA_URL"),
            region_id: get("BENCH_REGION").unwrap_or_else(|| UNKNOWN_REGION.to_string()),
            stats_token: get("STATS_TOKEN"),
            stats_interval: Duration::from_secs(parse_or(
                "STATS_INTERVAL_SECS",
                get("STATS_INTERVAL_SECS"),
                DEFAULT_STATS_INTERVAL_SECS,
            )?),
            queue: QueuePolicy {
                max_attempts: parse_or(
                    "QUEUE_MAX_ATTEMPTS",
                    get("QUEUE_MAX_ATTEMPTS"),
                    defaults.max_attempts,
                )?,
                lease: Duration::from_secs(parse_or(
                    "QUEUE_LEASE_SECS",
                    get("QUEUE_LEASE_SECS"),
                    defaults.lease.as_secs(),
                )?),
                retry_backoff: Duration::from_millis(parse_or(
                    "QUEUE_RETRY_BACKOFF_MS",
                    get("QUEUE_RETRY_BACKOFF_MS"),
                    crate::clock::duration_ms(defaults.retry_backoff),
                )?),
            },
            poll_interval: Duration::from_millis(parse_or(
                "QUEUE_POLL_MS",
                get("QUEUE_POLL_MS"),
                DEFAULT_POLL_MS,
            )?),
            rate_limit_per_sec: positive(
                "API_RATE_LIMIT_PER_SEC",
                get("API_RATE_LIMIT_PER_SEC"),
                DEFAULT_RATE_LIMIT_PER_SEC,
            )?,
        })
    }
}

fn parse_or<T: FromStr>(var: &'static str, value: Option<String>, default: T) -> Result<T, ConfigError> {
    match value {
        None => Ok(default),
        Some(value) => value.parse().map_err(|_| ConfigError::Invalid { var, value }),
    }
}

fn positive(var: &'static str, value: Option<String>, default: u32) -> Result<u32, ConfigError> {
    match parse_or(var, value, default)? {
        0 => Err(ConfigError::Invalid {
            var,
            value: "0".to_string(),
        }),
        limit => Ok(limit),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config_from(pairs: &[(&str, &str)]) -> Result<ServerConfig, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_lookup(|var| vars.get(var).cloned())
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.keydb_url, DEFAULT_KEYDB_URL);
        assert_eq!(config.keydb_replica_url, None);
        assert_eq!(config.region_id, "unknown");
        assert_eq!(config.stats_token, None);
        assert_eq!(config.stats_interval, Duration::from_secs(86_400));
        assert_eq!(config.queue, QueuePolicy::default());
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.rate_limit_per_sec, 20);
    }

    #[test]
    fn values_are_trimmed_and_parsed() {
        let config = config_from(&[
            ("BENCH_REGION", " europe-west1 "),
            ("STATS_TOKEN", "s3cret"),
            ("STATS_INTERVAL_SECS", "3600"),
            ("QUEUE_MAX_ATTEMPTS", "2"),
            ("QUEUE_RETRY_BACKOFF_MS", "250"),
            ("BENCH_KEYDB_REPLICA_URL", ""),
            ("API_RATE_LIMIT_PER_SEC", "50"),
        ])
        .unwrap();
        assert_eq!(config.rate_limit_per_sec, 50);
        assert_eq!(config.region_id, "europe-west1");
        assert_eq!(config.stats_token.as_deref(), Some("s3cret"));
        assert_eq!(config.stats_interval, Duration::from_secs(3600));
        assert_eq!(config.queue.max_attempts, 2);
        assert_eq!(config.queue.retry_backoff, Duration::from_millis(250));
        assert_eq!(config.keydb_replica_url, None);
    }

    #[test]
    fn unparsable_value_is_an_error() {
        let err = config_from(&[("QUEUE_POLL_MS", "soon")]).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid {
                var: "QUEUE_POLL_MS",
                value: "soon".to_string()
            }
        );
    }

    #[test]
    fn zero_rate_limit_is_an_error() {
        let err = config_from(&[("API_RATE_LIMIT_PER_SEC", "0")]).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid {
                var: "API_RATE_LIMIT_PER_SEC",
                value: "0".to_string()
            }
        );
    }
}
