//! Telemetry configuration and management

use crate::{Error, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main telemetry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Global enable/disable toggle
    pub enabled: bool,

    /// Ingestion endpoints
    pub endpoints: EndpointConfig,

    /// Level thresholds
    pub logging: LoggingConfig,

    /// Batching transport settings
    pub transport: TransportConfig,

    /// Duplicate suppression settings
    pub dedup: DedupConfig,

    /// Exception pipeline settings
    pub exceptions: ExceptionConfig,
}

/// Where batches are delivered
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Log ingestion endpoint (POST)
    pub log_url: String,

    /// Exception ingestion endpoint (POST)
    pub exception_url: String,
}

/// Level thresholds for the two outputs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Minimum level forwarded to the transport
    pub transport_level: crate::LogLevel,

    /// Minimum level mirrored to local tracing output
    pub console_level: crate::LogLevel,
}

/// Batching queue settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Entries per batch; reaching this cuts a batch immediately
    pub batch_size: usize,

    /// Interval flush period in milliseconds
    pub flush_interval_ms: u64,

    /// Queue bound; oldest entries are dropped past this
    pub max_queue: usize,

    /// Per-request send timeout in milliseconds
    pub request_timeout_ms: u64,

    /// Backoff delays between retry attempts, in milliseconds
    pub retry_schedule_ms: Vec<u64>,

    /// Retry attempts after the initial send before a batch is dropped
    pub max_retries: usize,
}

/// Duplicate suppression settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    /// Suppression window in milliseconds
    pub window_ms: u64,

    /// Sweep period for aged-out keys, in milliseconds
    pub sweep_interval_ms: u64,
}

/// Exception pipeline settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExceptionConfig {
    /// Suppression window for duplicate exceptions, in milliseconds
    pub window_ms: u64,

    /// Records per batch
    pub batch_size: usize,

    /// Interval flush period in milliseconds
    pub flush_interval_ms: u64,

    /// Queue bound for pending records
    pub max_queue: usize,

    /// Backoff delays between retry attempts, in milliseconds
    pub retry_schedule_ms: Vec<u64>,

    /// Retry attempts after the initial send before a batch is dropped
    pub max_retries: usize,

    /// Maximum stored stack length in bytes; longer stacks are truncated
    pub max_stack_len: usize,

    /// Hard cap on records reported per session
    pub session_cap: usize,

    /// Fraction of network-category / low-impact records kept
    pub network_sample_rate: f64,

    /// Messages dropped outright as noise
    pub drop_messages: Vec<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoints: EndpointConfig {
                log_url: "http://localhost:8000/api/logs/frontend".to_string(),
                exception_url: "http://localhost:8000/api/logs/exceptions".to_string(),
            },
            logging: LoggingConfig {
                transport_level: crate::LogLevel::Info,
                console_level: crate::LogLevel::Warning,
            },
            transport: TransportConfig {
                batch_size: 20,
                flush_interval_ms: 10_000,
                max_queue: 200,
                request_timeout_ms: 10_000,
                retry_schedule_ms: vec![1_000, 2_000, 4_000, 8_000],
                max_retries: 3,
            },
            dedup: DedupConfig {
                window_ms: 10_000,
                sweep_interval_ms: 30_000,
            },
            exceptions: ExceptionConfig {
                window_ms: 30_000,
                batch_size: 10,
                flush_interval_ms: 15_000,
                max_queue: 100,
                retry_schedule_ms: vec![1_000, 2_000, 4_000, 8_000],
                max_retries: 3,
                max_stack_len: 4_096,
                session_cap: 100,
                network_sample_rate: 0.2,
                drop_messages: vec!["Script error.".to_string()],
            },
        }
    }
}

impl TelemetryConfig {
    /// Load configuration from file or create default
    pub async fn load(config_path: Option<&Path>) -> Result<Self> {
        let config_file = match config_path {
            Some(path) => path.to_path_buf(),
            None => Self::default_config_path()?,
        };

        if config_file.exists() {
            let content = tokio::fs::read_to_string(&config_file)
                .await
                .map_err(|e| Error::Config {
                    message: format!("Failed to read telemetry config: {}", e),
                })?;
            let config: TelemetryConfig = toml::from_str(&content).map_err(|e| Error::Config {
                message: format!("Failed to parse telemetry config: {}", e),
            })?;
            Ok(config)
        } else {
            let mut config = Self::default();
            config.load_env_overrides();
            Ok(config)
        }
    }

    /// Save configuration to file
    pub async fn save(&self, config_path: Option<&Path>) -> Result<()> {
        let config_file = match config_path {
            Some(path) => path.to_path_buf(),
            None => Self::default_config_path()?,
        };

        if let Some(parent) = config_file.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::Config {
                    message: format!("Failed to create config dir: {}", e),
                })?;
        }

        let content = toml::to_string_pretty(self).map_err(|e| Error::Config {
            message: format!("Failed to serialize telemetry config: {}", e),
        })?;

        tokio::fs::write(&config_file, content)
            .await
            .map_err(|e| Error::Config {
                message: format!("Failed to write telemetry config: {}", e),
            })?;
        Ok(())
    }

    /// Load environment variable overrides
    pub fn load_env_overrides(&mut self) {
        if let Ok(enabled) = std::env::var("BEACON_TELEMETRY_ENABLED") {
            self.enabled = enabled.parse().unwrap_or(self.enabled);
        }

        if let Ok(url) = std::env::var("BEACON_LOG_URL") {
            self.endpoints.log_url = url;
        }

        if let Ok(url) = std::env::var("BEACON_EXCEPTION_URL") {
            self.endpoints.exception_url = url;
        }

        if let Ok(level) = std::env::var("BEACON_TRANSPORT_LEVEL") {
            if let Some(parsed) = crate::LogLevel::parse(&level) {
                self.logging.transport_level = parsed;
            }
        }

        if let Ok(level) = std::env::var("BEACON_CONSOLE_LEVEL") {
            if let Some(parsed) = crate::LogLevel::parse(&level) {
                self.logging.console_level = parsed;
            }
        }

        if let Ok(size) = std::env::var("BEACON_BATCH_SIZE") {
            self.transport.batch_size = size.parse().unwrap_or(self.transport.batch_size);
        }

        if let Ok(rate) = std::env::var("BEACON_EXCEPTION_SAMPLE_RATE") {
            self.exceptions.network_sample_rate = rate
                .parse()
                .unwrap_or(self.exceptions.network_sample_rate);
        }
    }

    /// Get default configuration file path
    fn default_config_path() -> Result<PathBuf> {
        let project_dirs =
            ProjectDirs::from("com", "beacon", "beacon").ok_or_else(|| Error::Config {
                message: "Could not determine config directory".to_string(),
            })?;

        Ok(project_dirs.config_dir().join("telemetry.toml"))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.transport.batch_size == 0 {
            return Err(Error::Config {
                message: "transport.batch_size must be greater than 0".to_string(),
            });
        }

        if self.transport.retry_schedule_ms.is_empty() {
            return Err(Error::Config {
                message: "transport.retry_schedule_ms must not be empty".to_string(),
            });
        }

        if self.transport.max_queue < self.transport.batch_size {
            return Err(Error::Config {
                message: "transport.max_queue must be at least transport.batch_size".to_string(),
            });
        }

        if !(0.0..=1.0).contains(&self.exceptions.network_sample_rate) {
            return Err(Error::Config {
                message: "exceptions.network_sample_rate must be within 0..=1".to_string(),
            });
        }

        for url in [&self.endpoints.log_url, &self.endpoints.exception_url] {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(Error::Config {
                    message: format!("Endpoint URL must start with http:// or https://: {url}"),
                });
            }
        }

        Ok(())
    }
}

impl TransportConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Delay before retry attempt `n` (zero-based); the schedule's last
    /// entry repeats for attempts past its end.
    pub fn retry_delay(&self, attempt: usize) -> Duration {
        let idx = attempt.min(self.retry_schedule_ms.len().saturating_sub(1));
        Duration::from_millis(*self.retry_schedule_ms.get(idx).unwrap_or(&1_000))
    }
}

impl DedupConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

impl ExceptionConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn retry_delay(&self, attempt: usize) -> Duration {
        let idx = attempt.min(self.retry_schedule_ms.len().saturating_sub(1));
        Duration::from_millis(*self.retry_schedule_ms.get(idx).unwrap_or(&1_000))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    #[tokio::test]
    async fn config_save_load_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("telemetry.toml");

        let original = TelemetryConfig::default();
        original.save(Some(&config_path)).await.unwrap();

        let loaded = TelemetryConfig::load(Some(&config_path)).await.unwrap();
        assert_eq!(original.enabled, loaded.enabled);
        assert_eq!(original.transport.batch_size, loaded.transport.batch_size);
        assert_eq!(
            original.transport.retry_schedule_ms,
            loaded.transport.retry_schedule_ms
        );
    }

    #[test]
    #[serial]
    fn env_overrides() {
        std::env::set_var("BEACON_BATCH_SIZE", "5");
        std::env::set_var("BEACON_TRANSPORT_LEVEL", "ERROR");

        let mut config = TelemetryConfig::default();
        config.load_env_overrides();

        assert_eq!(config.transport.batch_size, 5);
        assert_eq!(config.logging.transport_level, crate::LogLevel::Error);

        std::env::remove_var("BEACON_BATCH_SIZE");
        std::env::remove_var("BEACON_TRANSPORT_LEVEL");
    }

    #[test]
    fn validation_rejects_bad_settings() {
        let mut config = TelemetryConfig::default();
        config.transport.batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = TelemetryConfig::default();
        config.exceptions.network_sample_rate = 1.5;
        assert!(config.validate().is_err());

        let mut config = TelemetryConfig::default();
        config.endpoints.log_url = "not-a-url".to_string();
        assert!(config.validate().is_err());

        assert!(TelemetryConfig::default().validate().is_ok());
    }

    #[test]
    fn retry_delay_repeats_final_entry() {
        let config = TelemetryConfig::default().transport;
        assert_eq!(config.retry_delay(0), Duration::from_millis(1_000));
        assert_eq!(config.retry_delay(3), Duration::from_millis(8_000));
        assert_eq!(config.retry_delay(10), Duration::from_millis(8_000));
    }
}
