//! Engine configuration.
//!
//! Loaded from `ENTITLEMENT__*` environment variables; every field has a
//! default so an empty environment yields a usable configuration.
//!
//! - `ENTITLEMENT__LOCK_RETRY_ATTEMPTS=40` -> `lock_retry_attempts = 40`
//! - `ENTITLEMENT__LOCK_TTL_SECS=120` -> `lock_ttl_secs = 120`

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration loading failed: {0}")]
    LoadError(#[from] config::ConfigError),

    #[error("validation failed: {0}")]
    ValidationFailed(&'static str),
}

/// Upper bound on `lock_ttl_secs`: one year.
pub const MAX_LOCK_TTL_SECS: u64 = 365 * 24 * 60 * 60;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EngineConfig {
    /// Attempts made to take a bundle lock before giving up.
    #[serde(default = "default_lock_retry_attempts")]
    pub lock_retry_attempts: u32,

    /// Pause between two lock attempts, in milliseconds.
    #[serde(default = "default_lock_retry_backoff_ms")]
    pub lock_retry_backoff_ms: u64,

    /// Age after which a held lock counts as abandoned.
    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: u64,
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let config: Self = config::Config::builder()
            .add_source(
                config::Environment::default()
                    .prefix("ENTITLEMENT")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lock_retry_attempts == 0 {
            return Err(ConfigError::ValidationFailed(
                "lock_retry_attempts must be at least 1",
            ));
        }
        if self.lock_ttl_secs == 0 {
            return Err(ConfigError::ValidationFailed("lock_ttl_secs must be at least 1"));
        }
        if self.lock_ttl_secs > MAX_LOCK_TTL_SECS {
            return Err(ConfigError::ValidationFailed("lock_ttl_secs must be at most one year"));
        }
        Ok(())
    }

    pub fn lock_backoff(&self) -> Duration {
        Duration::from_millis(self.lock_retry_backoff_ms)
    }

    pub fn lock_ttl(&self) -> chrono::Duration {
        let secs = self.lock_ttl_secs.min(MAX_LOCK_TTL_SECS) as i64;
        chrono::Duration::seconds(secs)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lock_retry_attempts: default_lock_retry_attempts(),
            lock_retry_backoff_ms: default_lock_retry_backoff_ms(),
            lock_ttl_secs: default_lock_ttl_secs(),
        }
    }
}

fn default_lock_retry_attempts() -> u32 {
    20
}

fn default_lock_retry_backoff_ms() -> u64 {
    25
}

fn default_lock_ttl_secs() -> u64 {
    60
}
