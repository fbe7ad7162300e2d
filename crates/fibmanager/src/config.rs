//! Configuration file support for fibmanager.
//!
//! Loads and validates the engine configuration from TOML.
//! Default location: /etc/vpnfib/fibmanager.toml

use crate::daemon::FibDaemonConfig;
use crate::error::{FibError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use vpnfib_orch_common::{BatchingConfig, JobCoordinatorConfig};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/vpnfib/fibmanager.toml";

/// Job coordinator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobsConfig {
    /// Jobs running at the same time across all keys
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,

    /// Resubmissions of a job failing with a retryable error
    #[serde(default = "default_max_job_retries")]
    pub max_job_retries: u32,
}

/// Transaction runner configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Commit attempts after a transient failure
    #[serde(default = "default_tx_max_retries")]
    pub tx_max_retries: u32,

    /// Base backoff between commit attempts in milliseconds
    #[serde(default = "default_tx_retry_backoff_ms")]
    pub tx_retry_backoff_ms: u64,
}

/// Batching of externally learned (BGP) routes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BgpQueueConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Flush interval in milliseconds
    #[serde(default = "default_batch_interval_ms")]
    pub batch_interval_ms: u64,

    /// Pending mutations accepted before producers wait
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

/// Next-hop group configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NextHopConfig {
    /// Identifier pool for group ids
    #[serde(default = "default_nexthop_pool_name")]
    pub pool_name: String,

    #[serde(default = "default_pool_start")]
    pub pool_start: u32,

    #[serde(default = "default_pool_end")]
    pub pool_end: u32,

    /// Wait after programming a load-balancing group before dependent flows
    #[serde(default = "default_group_settle_wait_ms")]
    pub group_settle_wait_ms: u64,

    #[serde(default = "default_cluster_lock_timeout_ms")]
    pub cluster_lock_timeout_ms: u64,
}

/// Label pool configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelsConfig {
    #[serde(default = "default_label_pool_name")]
    pub pool_name: String,
}

/// Controlled-upgrade behaviour
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpgradeConfig {
    /// Local installs wait for their interface to come up while set
    #[serde(default)]
    pub upgrade_in_progress: bool,

    #[serde(default = "default_interface_wait_timeout_secs")]
    pub interface_wait_timeout_secs: u64,
}

/// Complete fibmanager configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FibConfig {
    #[serde(default)]
    pub jobs: JobsConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub bgp_queue: BgpQueueConfig,

    #[serde(default)]
    pub nexthop: NextHopConfig,

    #[serde(default)]
    pub labels: LabelsConfig,

    #[serde(default)]
    pub upgrade: UpgradeConfig,

    #[serde(default)]
    pub daemon: FibDaemonConfig,
}

fn default_max_concurrent_jobs() -> usize {
    16
}

fn default_max_job_retries() -> u32 {
    3
}

fn default_tx_max_retries() -> u32 {
    3
}

fn default_tx_retry_backoff_ms() -> u64 {
    10
}

fn default_batch_size() -> usize {
    1000
}

fn default_batch_interval_ms() -> u64 {
    500
}

fn default_queue_capacity() -> usize {
    10_000
}

fn default_nexthop_pool_name() -> String {
    "nextHopPointerPool".to_string()
}

fn default_pool_start() -> u32 {
    150_000
}

fn default_pool_end() -> u32 {
    175_000
}

fn default_group_settle_wait_ms() -> u64 {
    300
}

fn default_cluster_lock_timeout_ms() -> u64 {
    3000
}

fn default_label_pool_name() -> String {
    "vpnservices".to_string()
}

fn default_interface_wait_timeout_secs() -> u64 {
    1800
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: default_max_concurrent_jobs(),
            max_job_retries: default_max_job_retries(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            tx_max_retries: default_tx_max_retries(),
            tx_retry_backoff_ms: default_tx_retry_backoff_ms(),
        }
    }
}

impl Default for BgpQueueConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            batch_interval_ms: default_batch_interval_ms(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl Default for NextHopConfig {
    fn default() -> Self {
        Self {
            pool_name: default_nexthop_pool_name(),
            pool_start: default_pool_start(),
            pool_end: default_pool_end(),
            group_settle_wait_ms: default_group_settle_wait_ms(),
            cluster_lock_timeout_ms: default_cluster_lock_timeout_ms(),
        }
    }
}

impl Default for LabelsConfig {
    fn default() -> Self {
        Self {
            pool_name: default_label_pool_name(),
        }
    }
}

impl Default for UpgradeConfig {
    fn default() -> Self {
        Self {
            upgrade_in_progress: false,
            interface_wait_timeout_secs: default_interface_wait_timeout_secs(),
        }
    }
}

impl FibConfig {
    /// Load configuration from file, falling back to defaults if file not found
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let config: FibConfig = match fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content).map_err(|e| {
                FibError::Config(format!(
                    "Failed to parse config file {}: {}",
                    path.display(),
                    e
                ))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::info!(
                    "FibConfig: {} not found, using defaults",
                    path.display()
                );
                Self::default()
            }
            Err(e) => return Err(FibError::Io(e)),
        };

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| FibError::Config(format!("Failed to serialize config: {}", e)))?;
        fs::write(path.as_ref(), content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.jobs.max_concurrent_jobs == 0 {
            return Err(FibError::Config(
                "jobs.max_concurrent_jobs must be > 0".to_string(),
            ));
        }

        if self.bgp_queue.batch_size == 0 {
            return Err(FibError::Config(
                "bgp_queue.batch_size must be > 0".to_string(),
            ));
        }

        if self.bgp_queue.queue_capacity < self.bgp_queue.batch_size {
            return Err(FibError::Config(format!(
                "bgp_queue.queue_capacity ({}) must be >= batch_size ({})",
                self.bgp_queue.queue_capacity, self.bgp_queue.batch_size
            )));
        }

        if self.nexthop.pool_start >= self.nexthop.pool_end {
            return Err(FibError::Config(format!(
                "nexthop pool range {}..{} is empty",
                self.nexthop.pool_start, self.nexthop.pool_end
            )));
        }

        if self.daemon.heartbeat_interval_ms == 0 || self.daemon.batch_size == 0 {
            return Err(FibError::Config(
                "daemon.heartbeat_interval_ms and daemon.batch_size must be > 0".to_string(),
            ));
        }

        if self.nexthop.pool_name.is_empty() || self.labels.pool_name.is_empty() {
            return Err(FibError::Config("pool names must not be empty".to_string()));
        }

        Ok(())
    }

    pub fn job_coordinator_config(&self) -> JobCoordinatorConfig {
        JobCoordinatorConfig {
            max_concurrent_jobs: self.jobs.max_concurrent_jobs,
            max_retries: self.jobs.max_job_retries,
            retry_backoff: self.tx_retry_backoff(),
        }
    }

    pub fn bgp_batching_config(&self) -> BatchingConfig {
        BatchingConfig {
            name: "BGP_ROUTES".to_string(),
            batch_size: self.bgp_queue.batch_size,
            flush_interval: Duration::from_millis(self.bgp_queue.batch_interval_ms),
            capacity: self.bgp_queue.queue_capacity,
            coalesce: false,
        }
    }

    pub fn tx_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.store.tx_retry_backoff_ms)
    }

    pub fn group_settle_wait(&self) -> Duration {
        Duration::from_millis(self.nexthop.group_settle_wait_ms)
    }

    pub fn cluster_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.nexthop.cluster_lock_timeout_ms)
    }

    pub fn interface_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.upgrade.interface_wait_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults() {
        let config = FibConfig::default();
        assert_eq!(config.jobs.max_concurrent_jobs, 16);
        assert_eq!(config.jobs.max_job_retries, 3);
        assert_eq!(config.bgp_queue.batch_size, 1000);
        assert_eq!(config.bgp_queue.batch_interval_ms, 500);
        assert_eq!(config.nexthop.pool_name, "nextHopPointerPool");
        assert_eq!(config.nexthop.pool_start, 150_000);
        assert_eq!(config.nexthop.pool_end, 175_000);
        assert_eq!(config.labels.pool_name, "vpnservices");
        assert!(!config.upgrade.upgrade_in_progress);
        assert_eq!(config.daemon.heartbeat_interval_ms, 1000);
    }

    #[test]
    fn test_durations() {
        let config = FibConfig::default();
        assert_eq!(config.group_settle_wait(), Duration::from_millis(300));
        assert_eq!(config.cluster_lock_timeout(), Duration::from_secs(3));
        assert_eq!(config.interface_wait_timeout(), Duration::from_secs(1800));
        assert_eq!(
            config.bgp_batching_config().flush_interval,
            Duration::from_millis(500)
        );
    }

    #[test]
    fn test_validate_rejects_empty_pool_range() {
        let mut config = FibConfig::default();
        config.nexthop.pool_end = config.nexthop.pool_start;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_small_queue() {
        let mut config = FibConfig::default();
        config.bgp_queue.queue_capacity = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let toml_str = r#"
[jobs]
max_concurrent_jobs = 4

[upgrade]
upgrade_in_progress = true
"#;
        let config: FibConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.jobs.max_concurrent_jobs, 4);
        assert_eq!(config.jobs.max_job_retries, 3);
        assert!(config.upgrade.upgrade_in_progress);
        assert_eq!(config.upgrade.interface_wait_timeout_secs, 1800);
        assert_eq!(config.store, StoreConfig::default());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fibmanager.toml");

        let mut config = FibConfig::default();
        config.bgp_queue.batch_size = 50;
        config.save(&path).unwrap();

        let loaded = FibConfig::load_or_default(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let config = FibConfig::load_or_default("/nonexistent/fibmanager.toml").unwrap();
        assert_eq!(config, FibConfig::default());
    }

    #[test]
    fn test_invalid_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        fs::write(&path, "[jobs]\nmax_concurrent_jobs = 0\n").unwrap();
        assert!(matches!(
            FibConfig::load_or_default(&path),
            Err(FibError::Config(_))
        ));
    }
}
