// slowwatch/src/config.rs
//
// Consumer configuration. The three identity fields are mandatory and checked
// before any source is built; everything else has a default.
//
// Environment:
//   DOPPLER_ADDR                 connection endpoint
//   CF_ACCESS_TOKEN              auth credential
//   SUBSCRIPTION_ID              firehose subscription (consumer group)
//   SLOWWATCH_INSECURE           "true" / "1" to skip TLS verification
//   SLOWWATCH_CHANNEL_CAPACITY   bounded channel size

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::pipeline::DEFAULT_CHANNEL_CAPACITY;

pub const ENV_DOPPLER_ADDR: &str = "DOPPLER_ADDR";
pub const ENV_TOKEN: &str = "CF_ACCESS_TOKEN";
pub const ENV_SUBSCRIPTION_ID: &str = "SUBSCRIPTION_ID";
pub const ENV_INSECURE: &str = "SLOWWATCH_INSECURE";
pub const ENV_CHANNEL_CAPACITY: &str = "SLOWWATCH_CHANNEL_CAPACITY";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    pub doppler_addr: String,
    pub token: String,
    /// Consumers sharing a subscription id split the firehose between them.
    pub subscription_id: String,
    pub insecure: bool,
    pub channel_capacity: usize,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            doppler_addr: String::new(),
            token: String::new(),
            subscription_id: String::new(),
            insecure: false,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

impl ConsumerConfig {
    pub fn new(
        doppler_addr: impl Into<String>,
        token: impl Into<String>,
        subscription_id: impl Into<String>,
    ) -> Self {
        Self {
            doppler_addr: doppler_addr.into(),
            token: token.into(),
            subscription_id: subscription_id.into(),
            ..Self::default()
        }
    }

    /// Read from the environment. Unset variables leave the default in place;
    /// call [`validate`](Self::validate) afterwards.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        if let Some(v) = lookup(ENV_DOPPLER_ADDR) { cfg.doppler_addr = v; }
        if let Some(v) = lookup(ENV_TOKEN) { cfg.token = v; }
        if let Some(v) = lookup(ENV_SUBSCRIPTION_ID) { cfg.subscription_id = v; }
        if let Some(v) = lookup(ENV_INSECURE) {
            cfg.insecure = matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        }
        if let Some(v) = lookup(ENV_CHANNEL_CAPACITY) {
            cfg.channel_capacity = v.trim().parse().map_err(|e| ConfigError::Invalid {
                field: "channel_capacity",
                reason: format!("{:?}: {}", v, e),
            })?;
        }
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.doppler_addr.is_empty() {
            return Err(ConfigError::Missing("doppler_addr"));
        }
        if self.token.is_empty() {
            return Err(ConfigError::Missing("token"));
        }
        if self.subscription_id.is_empty() {
            return Err(ConfigError::Missing("subscription_id"));
        }
        if self.channel_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "channel_capacity",
                reason: "must be at least 1".into(),
            });
        }
        Ok(())
    }
}
