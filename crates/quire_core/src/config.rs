//! Configuration types for the write coordinator.
//!
//! [`CoordinatorConfig`] controls how long updates are buffered before they are
//! persisted, how persistence failures are retried, and which worker channel the
//! coordinator listens on. It is usually loaded from a TOML file; every field has
//! a default, so an empty file is a valid configuration.
//!
//! # Example
//!
//! ```ignore
//! use quire_core::config::CoordinatorConfig;
//!
//! let config = CoordinatorConfig::from_toml_str(r#"
//!     debounce_ms = 500
//!     max_buffered_updates = 200
//!
//!     [[copy_fields]]
//!     field = "name"
//!     map = "non_collab_fields"
//!     key = "name"
//! "#)?;
//! assert_eq!(config.debounce().as_millis(), 500);
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Default name of the channel the save worker consumes.
pub const DEFAULT_WORKER_CHANNEL: &str = "doc-save";

/// Settings for [`WriteCoordinator`](crate::coordinator::WriteCoordinator).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Idle time after the last update before a connection's buffer is flushed
    pub debounce_ms: u64,

    /// Attempts per flush before the failure is reported and the buffer requeued
    pub max_flush_attempts: u32,

    /// Base delay between flush attempts; attempt `n` waits `n * retry_backoff_ms`
    pub retry_backoff_ms: u64,

    /// Flush immediately once a buffer holds this many updates.
    /// Unset means no limit.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_buffered_updates: Option<usize>,

    /// Flush immediately once the oldest buffered update is this old, even if
    /// updates keep arriving. Unset means no limit.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_buffered_ms: Option<u64>,

    /// Worker channel name the coordinator is registered under
    pub worker_channel: String,

    /// Values copied out of each document on every flush
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub copy_fields: Vec<CopyField>,
}

/// A value copied from a document's root map into its stored fields.
///
/// A missing key is stored as `null`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyField {
    /// Name the value is stored under
    pub field: String,
    /// Root map holding the value
    pub map: String,
    /// Key within the map
    pub key: String,
}

impl CopyField {
    /// Copy `map[key]` into `field`.
    pub fn new(field: impl Into<String>, map: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            map: map.into(),
            key: key.into(),
        }
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 1000,
            max_flush_attempts: 3,
            retry_backoff_ms: 50,
            max_buffered_updates: None,
            max_buffered_ms: None,
            worker_channel: DEFAULT_WORKER_CHANNEL.to_string(),
            copy_fields: Vec::new(),
        }
    }
}

impl CoordinatorConfig {
    /// Parse a configuration from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Load a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Debounce window as a [`Duration`]
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// Delay before retry number `attempt` (1-based)
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(u64::from(attempt)))
    }

    /// Maximum buffering age as a [`Duration`], if bounded
    pub fn max_buffered_age(&self) -> Option<Duration> {
        self.max_buffered_ms.map(Duration::from_millis)
    }

    /// Builder-style override of the debounce window.
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce_ms = debounce.as_millis() as u64;
        self
    }
}
