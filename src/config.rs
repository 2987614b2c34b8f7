//! Process-level configuration.
//!
//! Every component takes its configuration explicitly; [`BusConfig`] only bundles them and
//! knows how to read overrides from the environment.

use std::str::FromStr;
use std::time::Duration;

use bon::Builder;
use thiserror::Error;

use crate::broker::PoolConfig;
use crate::rpcbus::{RpcClientConfig, RpcServerConfig};
use crate::stream_set::StreamSetConfig;

pub const ENV_POOL_MAX_IDLE: &str = "BOXY_POOL_MAX_IDLE";
pub const ENV_POOL_MAX_ACTIVE: &str = "BOXY_POOL_MAX_ACTIVE";
pub const ENV_POOL_IDLE_TIMEOUT_SECS: &str = "BOXY_POOL_IDLE_TIMEOUT_SECS";
pub const ENV_PING_INTERVAL_SECS: &str = "BOXY_PING_INTERVAL_SECS";
pub const ENV_REQUEST_TIMEOUT_SECS: &str = "BOXY_REQUEST_TIMEOUT_SECS";
pub const ENV_HANDLER_MAX_CONCURRENCY: &str = "BOXY_HANDLER_MAX_CONCURRENCY";

#[derive(Debug, Error)]
#[error("invalid value '{value}' for {key}: {reason}")]
pub struct ConfigError {
    pub key: &'static str,
    pub value: String,
    pub reason: String,
}

/// Configuration of every bus component in one process.
#[derive(Debug, Clone, Default, Builder)]
pub struct BusConfig {
    #[builder(default)]
    pub pool: PoolConfig,
    #[builder(default)]
    pub client: RpcClientConfig,
    #[builder(default)]
    pub server: RpcServerConfig,
    #[builder(default)]
    pub stream_set: StreamSetConfig,
}

impl BusConfig {
    /// Defaults overridden by the `BOXY_*` environment variables that are set.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&'static str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(max_idle) = parse(&lookup, ENV_POOL_MAX_IDLE)? {
            config.pool.max_idle = max_idle;
        }
        if let Some(max_active) = parse(&lookup, ENV_POOL_MAX_ACTIVE)? {
            config.pool.max_active = max_active;
        }
        if let Some(secs) = parse(&lookup, ENV_POOL_IDLE_TIMEOUT_SECS)? {
            config.pool.idle_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse::<u64>(&lookup, ENV_PING_INTERVAL_SECS)? {
            if secs == 0 {
                return Err(ConfigError {
                    key: ENV_PING_INTERVAL_SECS,
                    value: secs.to_string(),
                    reason: "must be at least one second".to_string(),
                });
            }
            config.client.ping_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = parse(&lookup, ENV_REQUEST_TIMEOUT_SECS)? {
            config.client.timeout = Duration::from_secs(secs);
        }
        if let Some(limit) = parse(&lookup, ENV_HANDLER_MAX_CONCURRENCY)? {
            config.server.max_concurrency = Some(limit);
        }

        Ok(config)
    }
}

fn parse<T>(
    lookup: &impl Fn(&'static str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(value) => match value.trim().parse() {
            Ok(parsed) => Ok(Some(parsed)),
            Err(e) => Err(ConfigError {
                key,
                reason: e.to_string(),
                value,
            }),
        },
    }
}
