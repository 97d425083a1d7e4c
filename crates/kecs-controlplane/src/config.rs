//! Control plane configuration
//!
//! Loaded from YAML (see [`ControlPlaneConfig::from_file`]) and then
//! overridden by command line flags in the binary.

use crate::error::{ControlPlaneError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ControlPlaneConfig {
    /// Region encoded in ARNs and namespaces
    #[serde(default = "default_region")]
    pub region: String,

    /// Account id encoded in ARNs
    #[serde(default = "default_account_id")]
    pub account_id: String,

    /// ARN partition
    #[serde(default = "default_partition")]
    pub partition: String,

    /// Reverse path settings
    #[serde(default)]
    pub sync: SyncConfig,

    /// Storage write coalescing settings
    #[serde(default)]
    pub batch: BatchConfig,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_account_id() -> String {
    "000000000000".to_string()
}

fn default_partition() -> String {
    "aws".to_string()
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            region: default_region(),
            account_id: default_account_id(),
            partition: default_partition(),
            sync: SyncConfig::default(),
            batch: BatchConfig::default(),
        }
    }
}

impl ControlPlaneConfig {
    /// Load configuration from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ControlPlaneError::InvalidParameter(format!(
                "failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_yaml(&raw)
    }

    /// Parse configuration from a YAML document
    pub fn from_yaml(raw: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(raw)
            .map_err(|e| ControlPlaneError::InvalidParameter(format!("invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }

    pub fn with_account_id(mut self, account_id: impl Into<String>) -> Self {
        self.account_id = account_id.into();
        self
    }

    pub fn with_sync(mut self, sync: SyncConfig) -> Self {
        self.sync = sync;
        self
    }

    pub fn with_batch(mut self, batch: BatchConfig) -> Self {
        self.batch = batch;
        self
    }

    /// Reject settings that would stall the reverse path
    pub fn validate(&self) -> Result<()> {
        if !crate::naming::is_region(&self.region) {
            return Err(ControlPlaneError::InvalidParameter(format!(
                "'{}' is not a valid region",
                self.region
            )));
        }
        if self.account_id.len() != 12 || !self.account_id.chars().all(|c| c.is_ascii_digit()) {
            return Err(ControlPlaneError::InvalidParameter(format!(
                "account id '{}' must be 12 digits",
                self.account_id
            )));
        }
        if self.sync.workers == 0 || self.sync.queue_capacity == 0 {
            return Err(ControlPlaneError::InvalidParameter(
                "sync workers and queue capacity must be greater than zero".to_string(),
            ));
        }
        if self.batch.max_batch_size == 0 || self.batch.max_attempts == 0 {
            return Err(ControlPlaneError::InvalidParameter(
                "batch size and attempts must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Sync controller settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SyncConfig {
    /// Number of reconcile workers
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Capacity of the watch event channel
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Attempts per key before an event is dropped
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// First retry delay
    #[serde(default = "default_retry_initial_ms")]
    pub retry_initial_ms: u64,

    /// Retry delay ceiling
    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,

    /// Backoff growth factor
    #[serde(default = "default_retry_multiplier")]
    pub retry_multiplier: f64,

    /// Seconds between full resyncs; 0 disables them
    #[serde(default = "default_resync_interval_secs")]
    pub resync_interval_secs: u64,
}

fn default_workers() -> usize {
    4
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_initial_ms() -> u64 {
    100
}

fn default_retry_max_ms() -> u64 {
    10_000
}

fn default_retry_multiplier() -> f64 {
    2.0
}

fn default_resync_interval_secs() -> u64 {
    300
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
            max_retries: default_max_retries(),
            retry_initial_ms: default_retry_initial_ms(),
            retry_max_ms: default_retry_max_ms(),
            retry_multiplier: default_retry_multiplier(),
            resync_interval_secs: default_resync_interval_secs(),
        }
    }
}

impl SyncConfig {
    pub fn retry_initial(&self) -> Duration {
        Duration::from_millis(self.retry_initial_ms)
    }

    pub fn retry_max(&self) -> Duration {
        Duration::from_millis(self.retry_max_ms)
    }

    pub fn resync_interval(&self) -> Option<Duration> {
        (self.resync_interval_secs > 0).then(|| Duration::from_secs(self.resync_interval_secs))
    }

    pub fn with_resync_interval_secs(mut self, secs: u64) -> Self {
        self.resync_interval_secs = secs;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

/// Batch updater settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct BatchConfig {
    /// Pending entries that trigger an immediate flush
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Maximum age of the oldest pending entry
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Write attempts per entry before it is dropped
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_max_batch_size() -> usize {
    100
}

fn default_max_delay_ms() -> u64 {
    2_000
}

fn default_max_attempts() -> u32 {
    3
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: default_max_batch_size(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl BatchConfig {
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn with_max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = ControlPlaneConfig::default();
        assert_eq!(config.region, "us-east-1");
        assert_eq!(config.batch.max_batch_size, 100);
        assert_eq!(config.batch.max_delay(), Duration::from_secs(2));
        assert_eq!(config.sync.max_retries, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let config = ControlPlaneConfig::from_yaml(
            r#"
region: eu-west-2
batch:
  max_batch_size: 10
"#,
        )
        .unwrap();
        assert_eq!(config.region, "eu-west-2");
        assert_eq!(config.batch.max_batch_size, 10);
        assert_eq!(config.batch.max_delay_ms, 2_000);
        assert_eq!(config.sync.workers, 4);
        assert_eq!(config.sync.resync_interval(), Some(Duration::from_secs(300)));
    }

    #[test]
    fn test_resync_can_be_disabled() {
        let config = ControlPlaneConfig::from_yaml("sync:\n  resync_interval_secs: 0").unwrap();
        assert_eq!(config.sync.resync_interval(), None);
    }

    #[test]
    fn test_invalid_config_rejected() {
        assert!(ControlPlaneConfig::from_yaml("region: nowhere").is_err());
        assert!(ControlPlaneConfig::from_yaml("sync:\n  workers: 0").is_err());
        assert!(ControlPlaneConfig::from_yaml("account_id: '123'").is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "account_id: '123456789012'").unwrap();
        let config = ControlPlaneConfig::from_file(file.path()).unwrap();
        assert_eq!(config.account_id, "123456789012");
    }
}
