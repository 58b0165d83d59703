//! Queue configuration.
//!
//! [`QueueConfig`] can be built in code or loaded from a TOML file. Every
//! field has a default, so a file only needs the values it changes:
//!
//! ```toml
//! network_workers = 8
//! cache_dir = "/var/cache/courier"
//! max_retries = 5
//! ```
//!
//! The default config file lives at `$XDG_CONFIG_HOME/courier/config.toml`
//! (falling back to `$HOME/.config/courier/config.toml`).

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::cache::{DEFAULT_CAPACITY_BYTES, DEFAULT_LOW_WATERMARK};
use crate::request::{DEFAULT_MAX_RETRIES, RetryPolicy};

/// Default number of network workers.
pub const DEFAULT_NETWORK_WORKERS: usize = 4;

/// Upper bound on network workers.
pub const MAX_NETWORK_WORKERS: usize = 64;

/// Upper bound on `max_retries`.
pub const MAX_RETRIES_LIMIT: u32 = 10;

/// Errors loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Read {
        /// Config file path.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The config file is not valid TOML for [`QueueConfig`].
    #[error("failed to parse config: {source}")]
    Parse {
        /// TOML error.
        #[from]
        source: toml::de::Error,
    },

    /// A value is outside its accepted range.
    #[error("Invalid config value for `{field}`: {value}. Expected {expected}")]
    Invalid {
        /// Field name.
        field: &'static str,
        /// Offending value, rendered.
        value: String,
        /// Accepted range.
        expected: &'static str,
    },
}

/// Tunables for a [`RequestQueue`](crate::RequestQueue).
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueueConfig {
    /// Number of network dispatcher workers (1..=64).
    pub network_workers: usize,
    /// Directory for the disk cache; `None` resolves the XDG cache dir.
    pub cache_dir: Option<PathBuf>,
    /// Disk cache capacity in bytes.
    pub cache_capacity_bytes: u64,
    /// Fraction of capacity the cache prunes down to, in (0, 1].
    pub low_watermark: f64,
    /// Freshness applied when the server sends no cache headers.
    pub default_ttl_secs: u64,
    /// Retries after the initial attempt (0..=10).
    pub max_retries: u32,
    /// Per-attempt timeout in milliseconds.
    pub timeout_ms: u64,
    /// First backoff delay in milliseconds.
    pub base_backoff_ms: u64,
    /// Backoff cap in milliseconds.
    pub max_backoff_ms: u64,
    /// Backoff growth factor (>= 1.0).
    pub backoff_multiplier: f32,
    /// Upper bound of random jitter added to each delay, in milliseconds.
    pub jitter_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            network_workers: DEFAULT_NETWORK_WORKERS,
            cache_dir: None,
            cache_capacity_bytes: DEFAULT_CAPACITY_BYTES,
            low_watermark: DEFAULT_LOW_WATERMARK,
            default_ttl_secs: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            timeout_ms: 2_500,
            base_backoff_ms: 1_000,
            max_backoff_ms: 32_000,
            backoff_multiplier: 2.0,
            jitter_ms: 500,
        }
    }
}

impl QueueConfig {
    /// Parses a TOML document and validates it.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed TOML or unknown keys and
    /// [`ConfigError::Invalid`] for out-of-range values.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads and validates a TOML config file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`] when the file cannot be read, plus the
    /// errors of [`from_toml_str`](Self::from_toml_str).
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Validates config values against their accepted ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=MAX_NETWORK_WORKERS).contains(&self.network_workers) {
            return Err(invalid("network_workers", self.network_workers, "range 1..=64"));
        }
        if self.cache_capacity_bytes == 0 {
            return Err(invalid("cache_capacity_bytes", 0, "a positive byte count"));
        }
        if self.low_watermark.is_nan() || self.low_watermark <= 0.0 || self.low_watermark > 1.0 {
            return Err(invalid("low_watermark", self.low_watermark, "range (0, 1]"));
        }
        if self.max_retries > MAX_RETRIES_LIMIT {
            return Err(invalid("max_retries", self.max_retries, "range 0..=10"));
        }
        if self.timeout_ms == 0 {
            return Err(invalid("timeout_ms", 0, "a positive duration"));
        }
        if self.max_backoff_ms < self.base_backoff_ms {
            return Err(invalid(
                "max_backoff_ms",
                self.max_backoff_ms,
                "a value >= base_backoff_ms",
            ));
        }
        if self.backoff_multiplier.is_nan() || self.backoff_multiplier < 1.0 {
            return Err(invalid(
                "backoff_multiplier",
                self.backoff_multiplier,
                "a value >= 1.0",
            ));
        }
        Ok(())
    }

    /// The retry policy attached to requests that don't carry their own.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(self.timeout_ms),
            self.max_retries,
            Duration::from_millis(self.base_backoff_ms),
            Duration::from_millis(self.max_backoff_ms),
            self.backoff_multiplier,
        )
        .with_jitter(Duration::from_millis(self.jitter_ms))
    }

    /// Freshness applied when the server sends no cache headers.
    #[must_use]
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    /// Configured cache directory, or the XDG default.
    #[must_use]
    pub fn resolved_cache_dir(&self) -> Option<PathBuf> {
        self.cache_dir.clone().or_else(resolve_default_cache_dir)
    }
}

fn invalid(field: &'static str, value: impl ToString, expected: &'static str) -> ConfigError {
    ConfigError::Invalid {
        field,
        value: value.to_string(),
        expected,
    }
}

/// Resolves default config path.
///
/// Priority:
/// 1. `$XDG_CONFIG_HOME/courier/config.toml`
/// 2. `$HOME/.config/courier/config.toml`
#[must_use]
pub fn resolve_default_config_path() -> Option<PathBuf> {
    if let Some(xdg_config_home) = env_var_non_empty_os("XDG_CONFIG_HOME") {
        return Some(PathBuf::from(xdg_config_home).join("courier").join("config.toml"));
    }

    let home = env_var_non_empty_os("HOME")?;
    Some(
        PathBuf::from(home)
            .join(".config")
            .join("courier")
            .join("config.toml"),
    )
}

/// Resolves default cache directory.
///
/// Priority:
/// 1. `$XDG_CACHE_HOME/courier`
/// 2. `$HOME/.cache/courier`
#[must_use]
pub fn resolve_default_cache_dir() -> Option<PathBuf> {
    if let Some(xdg_cache_home) = env_var_non_empty_os("XDG_CACHE_HOME") {
        return Some(PathBuf::from(xdg_cache_home).join("courier"));
    }

    let home = env_var_non_empty_os("HOME")?;
    Some(PathBuf::from(home).join(".cache").join("courier"))
}

fn env_var_non_empty_os(name: &str) -> Option<std::ffi::OsString> {
    let value = env::var_os(name)?;
    if value.is_empty() { None } else { Some(value) }
}
