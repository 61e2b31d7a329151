//! Engine configuration via `arbor.toml`
//!
//! A database can be configured in code (builder setters) or from a TOML file
//! kept next to the application's data. Missing keys take their defaults, so
//! an empty file is a valid configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use arbor_core::{ArborError, ArborResult, DEFAULT_MAX_INLINE_VALUE_SIZE};

use super::transactions::RetryConfig;

/// Config file name conventionally used for engine settings.
pub const CONFIG_FILE_NAME: &str = "arbor.toml";

/// Engine configuration.
///
/// # Example
///
/// ```toml
/// max_inline_value_size = 50
/// lock_timeout_secs = 90
/// cache_enabled = true
/// cache_ttl_secs = 60
/// remove_void_properties = false
///
/// [transaction_retries]
/// max_retries = 10
/// base_delay_ms = 1
/// max_delay_ms = 100
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Values whose encoded size is below this many bytes are stored inline
    pub max_inline_value_size: usize,
    /// Seconds an unreleased lock is held before timeout warnings start
    pub lock_timeout_secs: u64,
    /// Enable the node info cache
    pub cache_enabled: bool,
    /// Keep-alive of node info cache entries, in seconds
    pub cache_ttl_secs: u64,
    /// Strip `Void` properties instead of rejecting them
    pub remove_void_properties: bool,
    /// Retry policy of optimistic transactions
    pub transaction_retries: RetryConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_inline_value_size: DEFAULT_MAX_INLINE_VALUE_SIZE,
            lock_timeout_secs: 90,
            cache_enabled: true,
            cache_ttl_secs: 60,
            remove_void_properties: false,
            transaction_retries: RetryConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Create a configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the inline size threshold
    pub fn with_max_inline_value_size(mut self, size: usize) -> Self {
        self.max_inline_value_size = size;
        self
    }

    /// Set the lock timeout
    pub fn with_lock_timeout_secs(mut self, secs: u64) -> Self {
        self.lock_timeout_secs = secs;
        self
    }

    /// Enable or disable the node info cache
    pub fn with_cache_enabled(mut self, enabled: bool) -> Self {
        self.cache_enabled = enabled;
        self
    }

    /// Set the cache keep-alive duration
    pub fn with_cache_ttl_secs(mut self, secs: u64) -> Self {
        self.cache_ttl_secs = secs;
        self
    }

    /// Strip `Void` properties instead of rejecting writes containing them
    pub fn with_remove_void_properties(mut self, remove: bool) -> Self {
        self.remove_void_properties = remove;
        self
    }

    /// Set the transaction retry policy
    pub fn with_transaction_retries(mut self, retries: RetryConfig) -> Self {
        self.transaction_retries = retries;
        self
    }

    /// Lock timeout as a duration
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    /// Cache keep-alive as a duration
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    /// Check that every setting is usable.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` naming the first offending setting.
    pub fn validate(&self) -> ArborResult<()> {
        if self.max_inline_value_size < 1 {
            return Err(ArborError::InvalidConfig(
                "max_inline_value_size must be at least 1".to_string(),
            ));
        }
        if self.lock_timeout_secs == 0 {
            return Err(ArborError::InvalidConfig(
                "lock_timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.cache_enabled && self.cache_ttl_secs == 0 {
            return Err(ArborError::InvalidConfig(
                "cache_ttl_secs must be greater than 0 when the cache is enabled".to_string(),
            ));
        }
        let retries = &self.transaction_retries;
        if retries.base_delay_ms > retries.max_delay_ms {
            return Err(ArborError::InvalidConfig(format!(
                "transaction_retries.base_delay_ms ({}) exceeds max_delay_ms ({})",
                retries.base_delay_ms, retries.max_delay_ms
            )));
        }
        Ok(())
    }

    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# Arbor engine configuration

# Values smaller than this many bytes are embedded in their parent's record.
max_inline_value_size = 50

# Seconds before a lock that was never released expires.
lock_timeout_secs = 90

# Node info cache.
cache_enabled = true
cache_ttl_secs = 60

# Strip undefined properties instead of rejecting the write.
remove_void_properties = false

# Optimistic transaction retries (exponential backoff).
[transaction_retries]
max_retries = 10
base_delay_ms = 1
max_delay_ms = 100
"#
    }

    /// Parse and validate a TOML configuration.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the text is not valid TOML for this
    /// structure, or a setting is out of range.
    pub fn from_toml_str(content: &str) -> ArborResult<Self> {
        let config: EngineConfig = toml::from_str(content)
            .map_err(|e| ArborError::InvalidConfig(format!("failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a config file.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the file cannot be read or parsed.
    pub fn load(path: &Path) -> ArborResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ArborError::InvalidConfig(format!(
                "failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        Self::from_toml_str(&content)
    }

    /// Write the default config file if it does not already exist.
    ///
    /// Returns `Ok(())` whether the file was created or already existed.
    pub fn write_default_if_missing(path: &Path) -> ArborResult<()> {
        if !path.exists() {
            std::fs::write(path, Self::default_toml()).map_err(|e| {
                ArborError::InvalidConfig(format!(
                    "failed to write default config file '{}': {}",
                    path.display(),
                    e
                ))
            })?;
        }
        Ok(())
    }
}
