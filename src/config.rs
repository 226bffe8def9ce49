//! WolfElect Configuration
//!
//! This module provides configuration structures for the WolfElect
//! leader election coordinator.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main WolfElect configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElectorConfig {
    /// Node-specific configuration
    #[serde(default)]
    pub node: NodeConfig,

    /// Coordination store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Election loop configuration
    #[serde(default)]
    pub election: ElectionConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Directory in which the node key is stored
    #[serde(default)]
    pub data_dir: PathBuf,

    /// Label attached to every log event of this coordinator
    #[serde(default)]
    pub name: Option<String>,
}

/// Coordination store (etcd) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// etcd endpoints, e.g. "http://127.0.0.1:2379"
    #[serde(default)]
    pub endpoints: Vec<String>,

    /// Membership lease TTL in seconds
    #[serde(default = "default_lease_ttl_secs")]
    pub lease_ttl_secs: u64,

    /// Connection timeout in milliseconds
    #[serde(default = "default_dial_timeout_ms")]
    pub dial_timeout_ms: u64,

    /// Per-request timeout in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

/// What the election loop does when a tick fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FaultPolicy {
    /// Stop the loop and freeze the leadership flag
    Halt,
    /// Retry with exponential backoff
    Retry,
}

/// Election loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElectionConfig {
    /// Tick interval in milliseconds
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    /// Timeout for the membership query in milliseconds
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,

    /// Behaviour on store errors
    #[serde(default = "default_fault_policy")]
    pub on_store_error: FaultPolicy,

    /// First retry delay in milliseconds
    #[serde(default = "default_retry_backoff_min_ms")]
    pub retry_backoff_min_ms: u64,

    /// Retry delay cap in milliseconds
    #[serde(default = "default_retry_backoff_max_ms")]
    pub retry_backoff_max_ms: u64,

    /// Give up once more than this many ticks in a row have failed (0 = never)
    #[serde(default)]
    pub max_consecutive_failures: u32,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_lease_ttl_secs() -> u64 {
    5
}

fn default_dial_timeout_ms() -> u64 {
    5000
}

fn default_request_timeout_ms() -> u64 {
    5000
}

fn default_interval_ms() -> u64 {
    5000
}

fn default_query_timeout_ms() -> u64 {
    3000
}

fn default_fault_policy() -> FaultPolicy {
    FaultPolicy::Retry
}

fn default_retry_backoff_min_ms() -> u64 {
    500
}

fn default_retry_backoff_max_ms() -> u64 {
    5000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            lease_ttl_secs: default_lease_ttl_secs(),
            dial_timeout_ms: default_dial_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            query_timeout_ms: default_query_timeout_ms(),
            on_store_error: default_fault_policy(),
            retry_backoff_min_ms: default_retry_backoff_min_ms(),
            retry_backoff_max_ms: default_retry_backoff_max_ms(),
            max_consecutive_failures: 0,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl ElectionConfig {
    /// Get tick interval as Duration
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Get membership query timeout as Duration
    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    /// Backoff before retry number `attempt` (1-based), doubling up to the cap
    pub fn retry_backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let ms = self
            .retry_backoff_min_ms
            .saturating_mul(1u64 << shift)
            .min(self.retry_backoff_max_ms);
        Duration::from_millis(ms)
    }

    fn validate(&self) -> crate::Result<()> {
        if self.interval_ms == 0 {
            return Err(crate::Error::Config("election.interval_ms must be positive".into()));
        }
        if self.query_timeout_ms == 0 {
            return Err(crate::Error::Config("election.query_timeout_ms must be positive".into()));
        }
        if self.retry_backoff_min_ms > self.retry_backoff_max_ms {
            return Err(crate::Error::Config(
                "election.retry_backoff_min_ms cannot exceed retry_backoff_max_ms".into(),
            ));
        }
        Ok(())
    }
}

impl ElectorConfig {
    /// Create a configuration with defaults for everything but the required fields
    pub fn new(data_dir: impl Into<PathBuf>, endpoints: Vec<String>) -> Self {
        Self {
            node: NodeConfig {
                data_dir: data_dir.into(),
                name: None,
            },
            store: StoreConfig {
                endpoints,
                ..StoreConfig::default()
            },
            election: ElectionConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ElectorConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: ElectorConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        self.validate_local()?;

        if self.store.endpoints.is_empty() {
            return Err(crate::Error::Config("store.endpoints cannot be empty".into()));
        }
        if self.store.endpoints.iter().any(|e| e.trim().is_empty()) {
            return Err(crate::Error::Config("store.endpoints cannot contain blank entries".into()));
        }

        Ok(())
    }

    /// Validate everything that does not concern how the store is reached
    pub(crate) fn validate_local(&self) -> crate::Result<()> {
        if self.node.data_dir.as_os_str().is_empty() {
            return Err(crate::Error::Config("node.data_dir cannot be empty".into()));
        }
        if self.store.lease_ttl_secs == 0 {
            return Err(crate::Error::Config("store.lease_ttl_secs must be at least 1".into()));
        }
        self.election.validate()
    }

    /// Get the data directory path
    pub fn data_dir(&self) -> &PathBuf {
        &self.node.data_dir
    }

    /// Get lease TTL as Duration
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.store.lease_ttl_secs)
    }

    /// Get dial timeout as Duration
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.store.dial_timeout_ms)
    }

    /// Get request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.store.request_timeout_ms)
    }
}
