//! Row store configuration.
//!
//! Defines the tunables of the hierarchical row engine: retry budget,
//! deferred index tranche sizing, table-status flush cadence, and scan
//! buffer defaults.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::constants::{
    DEFAULT_DEFERRED_INDEX_TRANCHE, DEFAULT_HISTOGRAM_SAMPLE_SIZE, DEFAULT_SCAN_BUFFER_SIZE,
    DEFERRED_KEY_OVERHEAD, MAX_TRANSACTION_RETRY_COUNT, ROW_ENVELOPE_SIZE, ROW_PREFIX_SIZE,
};
use crate::error::{CanopyError, CanopyResult};

/// Row store configuration.
///
/// # Example
///
/// ```rust
/// use canopy_common::config::StoreConfig;
///
/// let config = StoreConfig::default();
/// assert_eq!(config.deferred_index_tranche_bytes, 10 * 1024 * 1024);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Attempts a mutation makes before failing with `TransactionFailed`.
    /// Default: 10
    #[serde(default = "default_max_transaction_retries")]
    pub max_transaction_retries: u32,

    /// Accounted size of pending deferred index keys that triggers a flush.
    /// Default: 10 MiB
    #[serde(default = "default_deferred_index_tranche_bytes")]
    pub deferred_index_tranche_bytes: usize,

    /// Bytes charged per deferred key in addition to its length.
    /// Default: 64
    #[serde(default = "default_deferred_key_overhead_bytes")]
    pub deferred_key_overhead_bytes: usize,

    /// Start with deferred index maintenance enabled.
    /// Default: false
    #[serde(default)]
    pub defer_indexes: bool,

    /// Interval between background table-status flushes.
    /// Default: 1s
    #[serde(
        default = "default_table_status_flush_interval",
        with = "humantime_serde"
    )]
    pub table_status_flush_interval: Duration,

    /// Whether scans may answer from a covering index without row fetches.
    /// Default: true
    #[serde(default = "default_true")]
    pub covering_index_support: bool,

    /// Capacity of scan buffers created by convenience APIs.
    /// Default: 64 KiB
    #[serde(default = "default_scan_buffer_bytes")]
    pub default_scan_buffer_bytes: usize,

    /// Samples kept per index histogram.
    /// Default: 32
    #[serde(default = "default_histogram_sample_size")]
    pub histogram_sample_size: usize,
}

fn default_max_transaction_retries() -> u32 {
    MAX_TRANSACTION_RETRY_COUNT
}

fn default_deferred_index_tranche_bytes() -> usize {
    DEFAULT_DEFERRED_INDEX_TRANCHE
}

fn default_deferred_key_overhead_bytes() -> usize {
    DEFERRED_KEY_OVERHEAD
}

fn default_table_status_flush_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_true() -> bool {
    true
}

fn default_scan_buffer_bytes() -> usize {
    DEFAULT_SCAN_BUFFER_SIZE
}

fn default_histogram_sample_size() -> usize {
    DEFAULT_HISTOGRAM_SAMPLE_SIZE
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_transaction_retries: default_max_transaction_retries(),
            deferred_index_tranche_bytes: default_deferred_index_tranche_bytes(),
            deferred_key_overhead_bytes: default_deferred_key_overhead_bytes(),
            defer_indexes: false,
            table_status_flush_interval: default_table_status_flush_interval(),
            covering_index_support: true,
            default_scan_buffer_bytes: default_scan_buffer_bytes(),
            histogram_sample_size: default_histogram_sample_size(),
        }
    }
}

impl StoreConfig {
    /// Creates a new default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a configuration for tests: small tranches and a fast flusher.
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            deferred_index_tranche_bytes: 4 * 1024,
            table_status_flush_interval: Duration::from_millis(50),
            default_scan_buffer_bytes: 4 * 1024,
            ..Default::default()
        }
    }

    /// Sets whether indexes start deferred.
    #[must_use]
    pub fn with_defer_indexes(mut self, defer: bool) -> Self {
        self.defer_indexes = defer;
        self
    }

    /// Sets the deferred index tranche size.
    #[must_use]
    pub fn with_deferred_index_tranche(mut self, bytes: usize) -> Self {
        self.deferred_index_tranche_bytes = bytes;
        self
    }

    /// Sets whether covering index scans are allowed.
    #[must_use]
    pub fn with_covering_index_support(mut self, enabled: bool) -> Self {
        self.covering_index_support = enabled;
        self
    }

    /// Validates the configuration and returns an error if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_transaction_retries == 0 {
            return Err("max_transaction_retries must be at least 1".to_string());
        }

        if self.deferred_index_tranche_bytes < self.deferred_key_overhead_bytes {
            return Err(
                "deferred_index_tranche_bytes must hold at least one pending key".to_string(),
            );
        }

        if self.default_scan_buffer_bytes < ROW_ENVELOPE_SIZE + ROW_PREFIX_SIZE {
            return Err("default_scan_buffer_bytes cannot hold a single row".to_string());
        }

        if self.table_status_flush_interval.is_zero() {
            return Err("table_status_flush_interval must be non-zero".to_string());
        }

        if self.histogram_sample_size == 0 {
            return Err("histogram_sample_size must be at least 1".to_string());
        }

        Ok(())
    }

    /// Loads configuration from a TOML file.
    pub fn from_file(path: &Path) -> CanopyResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate().map_err(CanopyError::invalid_config)?;
        Ok(config)
    }

    /// Saves configuration to a TOML file.
    pub fn save(&self, path: &Path) -> CanopyResult<()> {
        let content = self.to_toml()?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, content)?;
        Ok(())
    }

    /// Converts configuration to a TOML string.
    pub fn to_toml(&self) -> CanopyResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

/// Serde helper for Duration using humantime format.
mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        s.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
