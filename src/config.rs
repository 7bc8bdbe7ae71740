//! Runtime configuration
//!
//! | Variable | Default | |
//! |----------|---------|-|
//! | `POS_LOG_LEVEL` | `info` | Fallback when `RUST_LOG` is not set |
//! | `POS_IDEMPOTENCY_POLICY` | `replay` | `replay` or `reject` |
//! | `DATABASE_URL` | | Required by the PostgreSQL adapter |
//! | `POS_DB_MAX_CONNECTIONS` | `5` | Pool size of the PostgreSQL adapter |
//!
//! A `.env` file in the working directory is loaded first, if present.

use std::str::FromStr;

const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 5;

/// How a purchase reusing a committed idempotency key is answered
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum IdempotencyPolicy {
    /// Return the committed result, if the request describes the same purchase
    #[default]
    Replay,
    /// Answer with a conflict
    Reject,
}

impl FromStr for IdempotencyPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "replay" => Ok(IdempotencyPolicy::Replay),
            "reject" => Ok(IdempotencyPolicy::Reject),
            _ => Err(ConfigError::Invalid {
                key: "POS_IDEMPOTENCY_POLICY",
                value: s.to_string(),
            }),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub log_level: String,
    pub idempotency_policy: IdempotencyPolicy,
    pub database_url: Option<String>,
    pub db_max_connections: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            idempotency_policy: IdempotencyPolicy::default(),
            database_url: None,
            db_max_connections: DEFAULT_DB_MAX_CONNECTIONS,
        }
    }
}

impl Config {
    /// Load from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from any key lookup; unset and blank values fall back to defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let defaults = Self::default();

        let idempotency_policy = match get("POS_IDEMPOTENCY_POLICY") {
            Some(value) => value.parse()?,
            None => defaults.idempotency_policy,
        };
        let db_max_connections = match get("POS_DB_MAX_CONNECTIONS") {
            Some(value) => value
                .parse::<u32>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or(ConfigError::Invalid {
                    key: "POS_DB_MAX_CONNECTIONS",
                    value,
                })?,
            None => defaults.db_max_connections,
        };

        Ok(Self {
            log_level: get("POS_LOG_LEVEL").unwrap_or(defaults.log_level),
            idempotency_policy,
            database_url: get("DATABASE_URL"),
            db_max_connections,
        })
    }

    pub fn database_url(&self) -> Result<&str, ConfigError> {
        self.database_url
            .as_deref()
            .ok_or(ConfigError::Missing("DATABASE_URL"))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} is not set")]
    Missing(&'static str),
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}
