//! Queue-wide tunables persisted in `config.json`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backoff::{BackoffPolicy, DEFAULT_BACKOFF_BASE};
use crate::job::DEFAULT_MAX_RETRIES;

/// Largest accepted `max_retries`; beyond this the backoff delay saturates.
pub const MAX_RETRIES_LIMIT: u32 = 32;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: &'static str, reason: String },

    #[error("unknown config key '{0}' (expected maxRetries or backoffBase)")]
    UnknownKey(String),

    #[error("malformed config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("config io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Validated queue configuration.
///
/// Serialized in camelCase (`maxRetries`, `backoffBase`) so existing
/// `config.json` files keep working.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct QueueConfig {
    pub max_retries: u32,
    pub backoff_base: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_base: DEFAULT_BACKOFF_BASE,
        }
    }
}

impl QueueConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backoff_base < 2 {
            return Err(ConfigError::InvalidValue {
                key: "backoffBase",
                reason: format!("must be at least 2, got {}", self.backoff_base),
            });
        }
        if self.max_retries > MAX_RETRIES_LIMIT {
            return Err(ConfigError::InvalidValue {
                key: "maxRetries",
                reason: format!(
                    "must be at most {MAX_RETRIES_LIMIT}, got {}",
                    self.max_retries
                ),
            });
        }
        Ok(())
    }

    /// Parse and validate.
    pub fn from_json(input: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json_pretty(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Apply a `key = value` update, accepting both the on-disk camelCase
    /// names and their snake_case spelling. The result is validated; on error
    /// `self` is left unchanged.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let mut next = *self;
        match key {
            "maxRetries" | "max_retries" | "max-retries" => {
                next.max_retries = parse_u32("maxRetries", value)?;
            }
            "backoffBase" | "backoff_base" | "backoff-base" => {
                next.backoff_base = parse_u32("backoffBase", value)?;
            }
            other => return Err(ConfigError::UnknownKey(other.to_string())),
        }
        next.validate()?;
        *self = next;
        Ok(())
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(self.backoff_base)
    }
}

fn parse_u32(key: &'static str, value: &str) -> Result<u32, ConfigError> {
    value
        .trim()
        .parse::<u32>()
        .map_err(|e| ConfigError::InvalidValue {
            key,
            reason: format!("'{value}' is not a non-negative integer ({e})"),
        })
}
