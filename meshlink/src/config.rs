// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//!
//! Pool and watch settings.

use faststr::FastStr;
use governor::Quota;
use serde::{Deserialize, Serialize};
use std::num::NonZeroU32;
use std::time::Duration;

/// Environment variable holding the pool size.
pub const ENV_POOL_SIZE: &str = "MESHLINK_POOL_SIZE";
/// Environment variable holding the pool ttl, in humantime format such as `30s`.
pub const ENV_POOL_TTL: &str = "MESHLINK_POOL_TTL";

const DEFAULT_POOL_SIZE: usize = 100;
const DEFAULT_POOL_TTL: Duration = Duration::from_secs(30);
const DEFAULT_WATCH_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_WATCH_BURST: u32 = 3;
const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(5);

/// Invalid configuration.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The pool size is not a non-negative integer.
    #[error("invalid pool size: {0}")]
    InvalidSize(FastStr),
    /// The pool ttl is not a non-negative duration.
    #[error("invalid pool ttl: {0}")]
    InvalidTtl(FastStr),
    /// The watch burst is zero.
    #[error("watch burst must be greater than zero")]
    InvalidBurst,
    /// The watch refill interval is zero.
    #[error("watch interval must be greater than zero")]
    InvalidInterval,
    /// The transport codec name is unknown.
    #[error("unknown codec: {0}")]
    InvalidCodec(FastStr),
}

/// Connection pool settings.
///
/// Deserializes from `{"size": 100, "ttl": "30s"}`; both fields are optional.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawPoolConfig", into = "RawPoolConfig")]
#[non_exhaustive]
pub struct PoolConfig {
    /// Maximum idle connections kept per address. Zero disables reuse.
    pub size: usize,
    /// Maximum idle age of a reusable connection. Zero disables reuse.
    pub ttl: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: DEFAULT_POOL_SIZE,
            ttl: DEFAULT_POOL_TTL,
        }
    }
}

impl PoolConfig {
    /// Creates a pool config.
    pub fn new(size: usize, ttl: Duration) -> Self {
        Self { size, ttl }
    }
    /// Set the maximum idle connections kept per address.
    /// Default is 100.
    pub fn with_size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }
    /// Set the maximum idle age of a reusable connection.
    /// Default is 30s.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }
    /// Whether connections are ever kept for reuse.
    #[inline]
    pub fn is_passthrough(&self) -> bool {
        self.size == 0 || self.ttl.is_zero()
    }
    /// Reads [`ENV_POOL_SIZE`] and [`ENV_POOL_TTL`], keeping defaults for unset variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }
    /// Like [`PoolConfig::from_env`], reading variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        RawPoolConfig {
            size: lookup(ENV_POOL_SIZE),
            ttl: lookup(ENV_POOL_TTL),
        }
        .try_into()
    }
}

#[derive(Serialize, Deserialize)]
struct RawPoolConfig {
    #[serde(default, deserialize_with = "de_size")]
    size: Option<String>,
    #[serde(default)]
    ttl: Option<String>,
}

fn de_size<'de, D: serde::Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Size {
        Int(i64),
        Str(String),
    }
    Ok(Option::<Size>::deserialize(deserializer)?.map(|size| match size {
        Size::Int(i) => i.to_string(),
        Size::Str(s) => s,
    }))
}

impl TryFrom<RawPoolConfig> for PoolConfig {
    type Error = ConfigError;

    fn try_from(raw: RawPoolConfig) -> Result<Self, Self::Error> {
        let mut config = PoolConfig::default();
        if let Some(size) = raw.size {
            config.size = size.trim().parse::<usize>().map_err(|_| ConfigError::InvalidSize(FastStr::from_string(size)))?;
        }
        if let Some(ttl) = raw.ttl {
            config.ttl = humantime::parse_duration(ttl.trim()).map_err(|e| ConfigError::InvalidTtl(FastStr::from_string(format!("{ttl}: {e}"))))?;
        }
        Ok(config)
    }
}

impl From<PoolConfig> for RawPoolConfig {
    fn from(config: PoolConfig) -> Self {
        Self {
            size: Some(config.size.to_string()),
            ttl: Some(humantime::format_duration(config.ttl).to_string()),
        }
    }
}

/// Settings of the resolver's registry calls and watch loops.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub struct WatchConfig {
    /// Time to refill one token of the watch rate limiter.
    pub interval: Duration,
    /// Number of events the watch loop may consume back to back.
    pub burst: u32,
    /// Bound on the initial snapshot fetch and watch establishment of a service.
    pub fetch_timeout: Duration,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_WATCH_INTERVAL,
            burst: DEFAULT_WATCH_BURST,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
        }
    }
}

impl WatchConfig {
    /// Set the time to refill one rate limiter token.
    /// Default is 1s.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
    /// Set the rate limiter burst.
    /// Default is 3.
    pub fn with_burst(mut self, burst: u32) -> Self {
        self.burst = burst;
        self
    }
    /// Set the registry call timeout.
    /// Default is 5s.
    pub fn with_fetch_timeout(mut self, fetch_timeout: Duration) -> Self {
        self.fetch_timeout = fetch_timeout;
        self
    }
    /// Checks the settings and returns the rate limiter quota.
    pub fn quota(&self) -> Result<Quota, ConfigError> {
        let burst = NonZeroU32::new(self.burst).ok_or(ConfigError::InvalidBurst)?;
        let quota = Quota::with_period(self.interval).ok_or(ConfigError::InvalidInterval)?;
        Ok(quota.allow_burst(burst))
    }
}

#[cfg(test)]
mod tests {
    use super::{ConfigError, PoolConfig, WatchConfig, ENV_POOL_SIZE, ENV_POOL_TTL};
    use assert_matches::assert_matches;
    use std::collections::HashMap;
    use std::time::Duration;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_pool_config_from_lookup() {
        assert_eq!(PoolConfig::from_lookup(lookup(&[])).unwrap(), PoolConfig::default());
        let config = PoolConfig::from_lookup(lookup(&[(ENV_POOL_SIZE, "5"), (ENV_POOL_TTL, "1m")])).unwrap();
        assert_eq!(config, PoolConfig::new(5, Duration::from_secs(60)));
        assert!(PoolConfig::from_lookup(lookup(&[(ENV_POOL_SIZE, "0")])).unwrap().is_passthrough());
    }

    #[test]
    fn test_pool_config_rejects_bad_values() {
        assert_matches!(PoolConfig::from_lookup(lookup(&[(ENV_POOL_SIZE, "-1")])), Err(ConfigError::InvalidSize(_)));
        assert_matches!(PoolConfig::from_lookup(lookup(&[(ENV_POOL_SIZE, "many")])), Err(ConfigError::InvalidSize(_)));
        assert_matches!(PoolConfig::from_lookup(lookup(&[(ENV_POOL_TTL, "soon")])), Err(ConfigError::InvalidTtl(_)));
    }

    #[test]
    fn test_pool_config_serde() {
        let config: PoolConfig = serde_json::from_str(r#"{"size": 5, "ttl": "1m 30s"}"#).unwrap();
        assert_eq!(config, PoolConfig::new(5, Duration::from_secs(90)));
        let config: PoolConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, PoolConfig::default());
        assert!(serde_json::from_str::<PoolConfig>(r#"{"size": -3}"#).is_err());

        let json = serde_json::to_value(PoolConfig::new(5, Duration::from_secs(90))).unwrap();
        assert_eq!(json["ttl"], "1m 30s");
    }

    #[test]
    fn test_watch_config_quota() {
        assert!(WatchConfig::default().quota().is_ok());
        assert_matches!(WatchConfig::default().with_burst(0).quota(), Err(ConfigError::InvalidBurst));
        assert_matches!(WatchConfig::default().with_interval(Duration::ZERO).quota(), Err(ConfigError::InvalidInterval));
    }
}
