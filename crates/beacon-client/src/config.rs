//! API client configuration

use crate::error::ApiError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Base URL joined with relative request paths
    pub base_url: String,

    /// Per-request timeout in milliseconds
    pub request_timeout_ms: u64,

    /// Calls slower than this are flagged as a Performance warning
    pub slow_call_threshold_ms: u64,

    /// Ingestion endpoints; calls to these are never logged
    pub ingestion_urls: Vec<String>,

    /// Recovery behavior
    pub recovery: RecoveryConfig,

    /// GET response cache
    pub cache: CacheConfig,

    /// Offline write queue
    pub offline: OfflineConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Master switch; disabled means errors propagate untouched
    pub enabled: bool,

    /// Total dispatch attempts per request key, including the first
    pub max_attempts: usize,

    /// Backoff delays between attempts, in milliseconds
    pub retry_schedule_ms: Vec<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Time-to-live for cached GET responses, in milliseconds
    pub ttl_ms: u64,

    /// Sweep period for expired entries, in milliseconds
    pub sweep_interval_ms: u64,

    /// Entry bound; the entry closest to expiry is evicted first
    pub max_entries: usize,

    /// Mirror the cache to the durable store so a restart starts warm
    pub persist: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfflineConfig {
    /// Queue bound; oldest requests are dropped past this
    pub max_queue: usize,

    /// Queued requests older than this are skipped on replay
    pub staleness_ceiling_ms: u64,

    /// Replay attempts per item before permanent drop
    pub replay_attempts: u32,

    /// Delay between replayed items, in milliseconds
    pub replay_delay_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            request_timeout_ms: 10_000,
            slow_call_threshold_ms: 3_000,
            ingestion_urls: vec![
                "http://localhost:8000/api/logs/frontend".to_string(),
                "http://localhost:8000/api/logs/exceptions".to_string(),
            ],
            recovery: RecoveryConfig {
                enabled: true,
                max_attempts: 3,
                retry_schedule_ms: vec![1_000, 2_000, 4_000],
            },
            cache: CacheConfig {
                ttl_ms: 5 * 60 * 1_000,
                sweep_interval_ms: 60_000,
                max_entries: 200,
                persist: true,
            },
            offline: OfflineConfig {
                max_queue: 50,
                staleness_ceiling_ms: 60 * 60 * 1_000,
                replay_attempts: 3,
                replay_delay_ms: 100,
            },
        }
    }
}

impl ClientConfig {
    /// Load environment variable overrides
    pub fn load_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("BEACON_API_BASE_URL") {
            self.base_url = url;
        }

        if let Ok(timeout) = std::env::var("BEACON_API_TIMEOUT_MS") {
            self.request_timeout_ms = timeout.parse().unwrap_or(self.request_timeout_ms);
        }

        if let Ok(enabled) = std::env::var("BEACON_RECOVERY_ENABLED") {
            self.recovery.enabled = enabled.parse().unwrap_or(self.recovery.enabled);
        }

        if let Ok(ttl) = std::env::var("BEACON_CACHE_TTL_MS") {
            self.cache.ttl_ms = ttl.parse().unwrap_or(self.cache.ttl_ms);
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> std::result::Result<(), ApiError> {
        if !self.base_url.starts_with("http://") && !self.base_url.starts_with("https://") {
            return Err(ApiError::Dispatch {
                message: "base_url must start with http:// or https://".to_string(),
            });
        }

        if self.recovery.max_attempts == 0 {
            return Err(ApiError::Dispatch {
                message: "recovery.max_attempts must be greater than 0".to_string(),
            });
        }

        if self.recovery.retry_schedule_ms.is_empty() {
            return Err(ApiError::Dispatch {
                message: "recovery.retry_schedule_ms must not be empty".to_string(),
            });
        }

        if self.offline.replay_attempts == 0 {
            return Err(ApiError::Dispatch {
                message: "offline.replay_attempts must be greater than 0".to_string(),
            });
        }

        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn slow_call_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_call_threshold_ms)
    }
}

impl RecoveryConfig {
    /// Delay before retry attempt `n` (zero-based); the schedule's last
    /// entry repeats past its end.
    pub fn retry_delay(&self, attempt: usize) -> Duration {
        let idx = attempt.min(self.retry_schedule_ms.len().saturating_sub(1));
        Duration::from_millis(*self.retry_schedule_ms.get(idx).unwrap_or(&1_000))
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

impl OfflineConfig {
    pub fn staleness_ceiling(&self) -> Duration {
        Duration::from_millis(self.staleness_ceiling_ms)
    }

    pub fn replay_delay(&self) -> Duration {
        Duration::from_millis(self.replay_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(ClientConfig::default().validate().is_ok());
    }

    #[test]
    fn validation_rejects_bad_settings() {
        let mut config = ClientConfig::default();
        config.base_url = "localhost".to_string();
        assert!(config.validate().is_err());

        let mut config = ClientConfig::default();
        config.recovery.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = ClientConfig::default();
        config.recovery.retry_schedule_ms.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn retry_delay_repeats_final_entry() {
        let config = ClientConfig::default().recovery;
        assert_eq!(config.retry_delay(0), Duration::from_millis(1_000));
        assert_eq!(config.retry_delay(2), Duration::from_millis(4_000));
        assert_eq!(config.retry_delay(9), Duration::from_millis(4_000));
    }
}
