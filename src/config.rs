//! Configuration types for resumable-dl

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};

/// Transfer behavior configuration (temp files, concurrency, flushing)
///
/// Used as a nested sub-config within [`Config`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Directory holding in-progress `task_<id>.part` files (default: "./temp")
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,

    /// Maximum concurrent downloads (default: 3)
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_downloads: usize,

    /// Flush to disk and persist progress after this many bytes (default: 1 MiB)
    #[serde(default = "default_flush_bytes")]
    pub flush_bytes: u64,

    /// Flush to disk and persist progress at least this often (default: 1000 ms)
    #[serde(default = "default_flush_interval", with = "millis_serde")]
    pub flush_interval: Duration,

    /// When a server ignores the range on resume but the resource is unchanged,
    /// restart from byte 0 instead of failing the task (default: false)
    #[serde(default)]
    pub restart_without_range: bool,

    /// Stale-resource restarts tolerated within one admission before the
    /// attempt counts as a transient failure (default: 3)
    #[serde(default = "default_max_stale_restarts")]
    pub max_stale_restarts: u32,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            temp_dir: default_temp_dir(),
            max_concurrent_downloads: default_max_concurrent(),
            flush_bytes: default_flush_bytes(),
            flush_interval: default_flush_interval(),
            restart_without_range: false,
            max_stale_restarts: default_max_stale_restarts(),
        }
    }
}

/// Retry configuration for transient failures
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of failed attempts before a task is marked failed (default: 5)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay before first retry (default: 1 second)
    #[serde(default = "default_initial_delay", with = "duration_serde")]
    pub initial_delay: Duration,

    /// Maximum delay between retries (default: 60 seconds)
    #[serde(default = "default_max_delay", with = "duration_serde")]
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Full jitter: pick the delay uniformly from `[0, computed]` (default: true)
    #[serde(default = "default_true")]
    pub jitter: bool,

    /// Seed for the jitter random source (None = seeded from entropy)
    #[serde(default)]
    pub jitter_seed: Option<u64>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter: true,
            jitter_seed: None,
        }
    }
}

/// HTTP transport configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransportConfig {
    /// TCP connect timeout (default: 30 seconds)
    #[serde(default = "default_connect_timeout", with = "duration_serde")]
    pub connect_timeout: Duration,

    /// Maximum wait for the next chunk of a response (default: 60 seconds)
    #[serde(default = "default_read_timeout", with = "duration_serde")]
    pub read_timeout: Duration,

    /// User-Agent header sent with every request
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: default_connect_timeout(),
            read_timeout: default_read_timeout(),
            user_agent: default_user_agent(),
        }
    }
}

/// Disk space checking configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DiskSpaceConfig {
    /// Check free space on the temp volume before each admission (default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Minimum free space to maintain (default: 1 GB)
    #[serde(default = "default_min_free_space")]
    pub min_free_space: u64,
}

impl Default for DiskSpaceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_free_space: 1024 * 1024 * 1024, // 1 GB
        }
    }
}

/// Data storage configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Database path (default: "./resumable-dl.db")
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
        }
    }
}

/// Main configuration for DownloadManager
///
/// Fields are organized into logical sub-configs:
/// - [`download`](DownloadConfig) - temp files, concurrency, flush thresholds
/// - [`retry`](RetryConfig) - backoff for transient failures
/// - [`transport`](TransportConfig) - HTTP timeouts and user agent
/// - [`disk_space`](DiskSpaceConfig) - free-space preflight
/// - [`persistence`](PersistenceConfig) - database location
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Transfer behavior settings
    #[serde(default)]
    pub download: DownloadConfig,

    /// Retry behavior for transient failures
    #[serde(default)]
    pub retry: RetryConfig,

    /// HTTP transport settings
    #[serde(default)]
    pub transport: TransportConfig,

    /// Disk space checking
    #[serde(default)]
    pub disk_space: DiskSpaceConfig,

    /// Data storage
    #[serde(default)]
    pub persistence: PersistenceConfig,

    /// Capacity of the broadcast event channel (default: 1000)
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,

    /// How long shutdown waits for active transfers to stop (default: 30 seconds)
    #[serde(default = "default_shutdown_timeout", with = "duration_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            download: DownloadConfig::default(),
            retry: RetryConfig::default(),
            transport: TransportConfig::default(),
            disk_space: DiskSpaceConfig::default(),
            persistence: PersistenceConfig::default(),
            event_buffer: default_event_buffer(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

impl Config {
    /// Temporary directory
    pub fn temp_dir(&self) -> &PathBuf {
        &self.download.temp_dir
    }

    /// Reject settings the manager cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.download.max_concurrent_downloads == 0 {
            return Err(Error::Config {
                message: "max_concurrent_downloads must be at least 1".into(),
                key: Some("download.max_concurrent_downloads".into()),
            });
        }
        if self.download.flush_bytes == 0 {
            return Err(Error::Config {
                message: "flush_bytes must be at least 1".into(),
                key: Some("download.flush_bytes".into()),
            });
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::Config {
                message: "max_attempts must be at least 1".into(),
                key: Some("retry.max_attempts".into()),
            });
        }
        let multiplier = self.retry.backoff_multiplier;
        if multiplier.is_nan() || multiplier < 1.0 {
            return Err(Error::Config {
                message: format!(
                    "backoff_multiplier must be >= 1.0, got {}",
                    self.retry.backoff_multiplier
                ),
                key: Some("retry.backoff_multiplier".into()),
            });
        }
        if self.event_buffer == 0 {
            return Err(Error::Config {
                message: "event_buffer must be at least 1".into(),
                key: Some("event_buffer".into()),
            });
        }
        Ok(())
    }
}

fn default_temp_dir() -> PathBuf {
    PathBuf::from("./temp")
}

fn default_max_concurrent() -> usize {
    3
}

fn default_flush_bytes() -> u64 {
    1024 * 1024
}

fn default_flush_interval() -> Duration {
    Duration::from_millis(1000)
}

fn default_max_stale_restarts() -> u32 {
    3
}

fn default_database_path() -> PathBuf {
    PathBuf::from("./resumable-dl.db")
}

fn default_true() -> bool {
    true
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_read_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_user_agent() -> String {
    format!("resumable-dl/{}", env!("CARGO_PKG_VERSION"))
}

fn default_min_free_space() -> u64 {
    1024 * 1024 * 1024
}

fn default_event_buffer() -> usize {
    1000
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(30)
}

// Duration serialization helper
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

// Millisecond Duration serialization helper
mod millis_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_yields_defaults() {
        let config: Config = serde_json::from_str("{}").expect("deserialize failed");

        assert_eq!(config.download.max_concurrent_downloads, 3);
        assert_eq!(config.download.flush_bytes, 1024 * 1024);
        assert_eq!(config.download.flush_interval, Duration::from_millis(1000));
        assert!(!config.download.restart_without_range);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.initial_delay, Duration::from_secs(1));
        assert_eq!(config.retry.max_delay, Duration::from_secs(60));
        assert!(config.retry.jitter);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn durations_use_seconds_and_flush_interval_uses_millis() {
        let json = r#"{
            "download": { "flush_interval": 250 },
            "retry": { "initial_delay": 2, "max_delay": 10 },
            "shutdown_timeout": 5
        }"#;
        let config: Config = serde_json::from_str(json).expect("deserialize failed");

        assert_eq!(config.download.flush_interval, Duration::from_millis(250));
        assert_eq!(config.retry.initial_delay, Duration::from_secs(2));
        assert_eq!(config.retry.max_delay, Duration::from_secs(10));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(5));

        let value = serde_json::to_value(&config).expect("serialize failed");
        assert_eq!(value["download"]["flush_interval"], 250);
        assert_eq!(value["retry"]["initial_delay"], 2);
    }

    #[test]
    fn sub_config_defaults_match_default_impl() {
        let from_json: RetryConfig = serde_json::from_str("{}").unwrap();
        let default = RetryConfig::default();
        assert_eq!(from_json.max_attempts, default.max_attempts);
        assert_eq!(from_json.backoff_multiplier, default.backoff_multiplier);

        let disk: DiskSpaceConfig = serde_json::from_str("{}").unwrap();
        assert!(disk.enabled);
        assert_eq!(disk.min_free_space, DiskSpaceConfig::default().min_free_space);
    }

    #[test]
    fn validate_rejects_zero_concurrency() {
        let mut config = Config::default();
        config.download.max_concurrent_downloads = 0;

        match config.validate() {
            Err(Error::Config { key, .. }) => {
                assert_eq!(key.as_deref(), Some("download.max_concurrent_downloads"))
            }
            other => panic!("expected config error, got {other:?}"),
        }
    }

    #[test]
    fn validate_rejects_zero_attempts_and_shrinking_backoff() {
        let mut config = Config::default();
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.retry.backoff_multiplier = 0.5;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.retry.backoff_multiplier = f64::NAN;
        assert!(config.validate().is_err());
    }
}
