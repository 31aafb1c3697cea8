//! Typed configuration from environment variables or a TOML file.
//!
//! Loads once at startup and fails fast on malformed values.
//! Sensitive values wrapped in secrecy::SecretString to prevent log leaks.

pub mod secrets;

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

#[derive(Debug)]
pub struct Config {
    /// Only needed for the Postgres fact backend.
    pub database_url: Option<SecretString>,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    pub coordinator: CoordinatorConfig,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: std::env::var("DATABASE_URL").ok().map(SecretString::from),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            coordinator: CoordinatorConfig::from_env()?,
        })
    }

    pub fn require_database_url(&self) -> Result<&SecretString> {
        self.database_url.as_ref().ok_or_else(|| {
            Error::Config("required environment variable DATABASE_URL is not set".to_string())
        })
    }
}

/// Coordinator, cache and retention tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CoordinatorConfig {
    /// Automatic dispatches before a work item escalates.
    pub max_attempts: u32,
    pub attempt_timeout_secs: u64,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    pub cache_ttl_secs: u64,
    pub cache_sweep_secs: u64,
    pub retention_hours: u64,
    pub retention_sweep_secs: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            attempt_timeout_secs: 30 * 60,
            backoff_base_ms: 1_000,
            backoff_cap_ms: 5 * 60 * 1_000,
            cache_ttl_secs: 2 * 60 * 60,
            cache_sweep_secs: 60,
            retention_hours: 7 * 24,
            retention_sweep_secs: 60 * 60,
        }
    }
}

#[derive(Deserialize)]
struct ConfigFile {
    #[serde(default)]
    coordinator: CoordinatorConfig,
}

impl CoordinatorConfig {
    /// Longest attempt timeout a work item may ask for.
    pub const MAX_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(30 * 24 * 60 * 60);
    /// Longest delay between two attempts.
    pub const MAX_BACKOFF: Duration = Duration::from_secs(24 * 60 * 60);
    /// Longest retention window, ten years.
    pub const MAX_RETENTION_HOURS: u64 = 10 * 365 * 24;

    /// Defaults overridden by any `HANDOFF_*` variables that are set.
    pub fn from_env() -> Result<Self> {
        let d = Self::default();
        let config = Self {
            max_attempts: optional_var("HANDOFF_MAX_ATTEMPTS", d.max_attempts)?,
            attempt_timeout_secs: optional_var(
                "HANDOFF_ATTEMPT_TIMEOUT_SECS",
                d.attempt_timeout_secs,
            )?,
            backoff_base_ms: optional_var("HANDOFF_BACKOFF_BASE_MS", d.backoff_base_ms)?,
            backoff_cap_ms: optional_var("HANDOFF_BACKOFF_CAP_MS", d.backoff_cap_ms)?,
            cache_ttl_secs: optional_var("HANDOFF_CACHE_TTL_SECS", d.cache_ttl_secs)?,
            cache_sweep_secs: optional_var("HANDOFF_CACHE_SWEEP_SECS", d.cache_sweep_secs)?,
            retention_hours: optional_var("HANDOFF_RETENTION_HOURS", d.retention_hours)?,
            retention_sweep_secs: optional_var(
                "HANDOFF_RETENTION_SWEEP_SECS",
                d.retention_sweep_secs,
            )?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Parse the `[coordinator]` table of a TOML document.
    pub fn from_toml(text: &str) -> Result<Self> {
        let file: ConfigFile =
            toml::from_str(text).map_err(|e| Error::Config(format!("invalid TOML: {e}")))?;
        file.coordinator.validate()?;
        Ok(file.coordinator)
    }

    pub fn load_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::Config("max_attempts must be at least 1".to_string()));
        }
        if self.attempt_timeout_secs == 0
            || self.attempt_timeout_secs > Self::MAX_ATTEMPT_TIMEOUT.as_secs()
        {
            return Err(Error::Config(format!(
                "attempt_timeout_secs must be between 1 and {}",
                Self::MAX_ATTEMPT_TIMEOUT.as_secs()
            )));
        }
        if self.backoff_base_ms == 0 {
            return Err(Error::Config("backoff_base_ms must be positive".to_string()));
        }
        if self.backoff_cap_ms < self.backoff_base_ms {
            return Err(Error::Config(
                "backoff_cap_ms must not be below backoff_base_ms".to_string(),
            ));
        }
        if u128::from(self.backoff_cap_ms) > Self::MAX_BACKOFF.as_millis() {
            return Err(Error::Config(format!(
                "backoff_cap_ms must not exceed {}",
                Self::MAX_BACKOFF.as_millis()
            )));
        }
        if self.cache_ttl_secs == 0 || self.cache_sweep_secs == 0 {
            return Err(Error::Config("cache TTL and sweep interval must be positive".to_string()));
        }
        if self.retention_hours > Self::MAX_RETENTION_HOURS {
            return Err(Error::Config(format!(
                "retention_hours must not exceed {}",
                Self::MAX_RETENTION_HOURS
            )));
        }
        if self.retention_hours == 0 || self.retention_sweep_secs == 0 {
            return Err(Error::Config(
                "retention window and sweep interval must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_millis(self.backoff_cap_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn cache_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.cache_sweep_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_hours.saturating_mul(60 * 60))
    }

    pub fn retention_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.retention_sweep_secs)
    }
}

fn optional_var<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("{name}={raw:?} is invalid: {e}"))),
        Err(_) => Ok(default),
    }
}
