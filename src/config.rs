//! Pipeline configuration loaded from YAML.
//!
//! Every field has a default, so an empty document is a valid configuration.
//! Durations are written as integer milliseconds.
//!
//! ```rust
//! use fleetwire::PipelineConfig;
//!
//! let config = PipelineConfig::from_yaml_str(
//!     "batcher:\n  batch_size: 50\n  flush_interval_ms: 250\n",
//! ).unwrap();
//! assert_eq!(config.batcher.batch_size, 50);
//! assert_eq!(config.batcher.queue_capacity(), 200);
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{IngestError, Result};

/// Top-level configuration for a [`Pipeline`](crate::Pipeline).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    pub frame: FrameConfig,
    pub batcher: BatcherConfig,
    pub hub: HubConfig,
    pub upstream: UpstreamConfig,
    pub monitor: MonitorConfig,
    pub retention: RetentionConfig,
}

impl PipelineConfig {
    /// Parse and validate a YAML document.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: PipelineConfig = serde_yaml_ng::from_str(yaml)
            .map_err(|e| IngestError::config(format!("YAML parse failed: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path)
            .map_err(|e| IngestError::io(format!("reading {}", path.display()), e))?;
        Self::from_yaml_str(&yaml)
    }

    /// Reject settings no component can run with.
    pub fn validate(&self) -> Result<()> {
        if self.frame.max_payload_bytes == 0 {
            return Err(IngestError::config("frame.max_payload_bytes must be positive"));
        }
        if self.batcher.batch_size == 0 {
            return Err(IngestError::config("batcher.batch_size must be positive"));
        }
        if self.batcher.max_concurrent_flushes == 0
            || self.batcher.max_concurrent_flushes > crate::batcher::MAX_CONCURRENT_FLUSHES
        {
            return Err(IngestError::config(format!(
                "batcher.max_concurrent_flushes must be between 1 and {}",
                crate::batcher::MAX_CONCURRENT_FLUSHES
            )));
        }
        if self.batcher.dedup_window_ms == 0 {
            return Err(IngestError::config("batcher.dedup_window_ms must be positive"));
        }
        if self.batcher.flush_interval_ms == 0 {
            return Err(IngestError::config("batcher.flush_interval_ms must be positive"));
        }
        if self.batcher.queue_capacity == Some(0) {
            return Err(IngestError::config("batcher.queue_capacity must be positive"));
        }
        if self.hub.inbound_capacity == 0 || self.hub.client_queue_capacity == 0 {
            return Err(IngestError::config("hub queue capacities must be positive"));
        }
        if self.upstream.enabled {
            if self.upstream.url.is_empty() {
                return Err(IngestError::config("upstream.url is required when enabled"));
            }
            if self.upstream.app_id.is_empty() || self.upstream.app_secret.is_empty() {
                return Err(IngestError::config(
                    "upstream.app_id and upstream.app_secret are required when enabled",
                ));
            }
            if self.upstream.heartbeat_interval_ms == 0 {
                return Err(IngestError::config("upstream.heartbeat_interval_ms must be positive"));
            }
            if self.upstream.backoff_base_ms == 0
                || self.upstream.backoff_max_ms < self.upstream.backoff_base_ms
            {
                return Err(IngestError::config(
                    "upstream backoff needs 0 < backoff_base_ms <= backoff_max_ms",
                ));
            }
        }
        if self.retention.stale_after_ms == 0 || self.retention.prune_interval_ms == 0 {
            return Err(IngestError::config(
                "retention.stale_after_ms and retention.prune_interval_ms must be positive",
            ));
        }
        if !self.monitor.arrival_threshold_m.is_finite() {
            return Err(IngestError::config("monitor.arrival_threshold_m must be finite"));
        }
        Ok(())
    }
}

/// Binary frame listener settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FrameConfig {
    pub listen_addr: String,
    pub max_payload_bytes: u32,
    pub heartbeat_write_timeout_ms: u64,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:9000".to_string(),
            max_payload_bytes: crate::frame::DEFAULT_MAX_PAYLOAD,
            heartbeat_write_timeout_ms: 5_000,
        }
    }
}

impl FrameConfig {
    pub fn heartbeat_write_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_write_timeout_ms)
    }
}

/// Which projections the batcher pushes to the broadcast hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FanoutMode {
    /// Nothing is broadcast.
    Off,
    /// One live payload per enqueued record.
    Record,
    /// One compact array per flushed batch.
    Batch,
    /// Both of the above.
    #[default]
    Both,
}

impl FanoutMode {
    pub fn per_record(self) -> bool {
        matches!(self, FanoutMode::Record | FanoutMode::Both)
    }

    pub fn per_batch(self) -> bool {
        matches!(self, FanoutMode::Batch | FanoutMode::Both)
    }
}

/// Ingestion batcher settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BatcherConfig {
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    pub max_concurrent_flushes: usize,
    /// Defaults to four batches worth of records.
    pub queue_capacity: Option<usize>,
    pub enqueue_timeout_ms: u64,
    pub fanout: FanoutMode,
    pub live_retry_timeout_ms: u64,
    /// How long a vehicle's last timestamp is kept for duplicate suppression.
    pub dedup_window_ms: u64,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            batch_size: 200,
            flush_interval_ms: 1_000,
            max_concurrent_flushes: 4,
            queue_capacity: None,
            enqueue_timeout_ms: 200,
            fanout: FanoutMode::default(),
            live_retry_timeout_ms: 200,
            dedup_window_ms: 600_000,
        }
    }
}

impl BatcherConfig {
    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity.unwrap_or(self.batch_size.saturating_mul(4)).max(1)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn enqueue_timeout(&self) -> Duration {
        Duration::from_millis(self.enqueue_timeout_ms)
    }

    pub fn live_retry_timeout(&self) -> Duration {
        Duration::from_millis(self.live_retry_timeout_ms)
    }

    pub fn dedup_window(&self) -> Duration {
        Duration::from_millis(self.dedup_window_ms)
    }
}

/// Broadcast hub settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HubConfig {
    pub inbound_capacity: usize,
    pub client_queue_capacity: usize,
    /// Websocket subscriber listener; disabled when absent.
    pub listen_addr: Option<String>,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self { inbound_capacity: 256, client_queue_capacity: 256, listen_addr: None }
    }
}

/// Subscriptions registered with the upstream feed at startup.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SubscriptionConfig {
    pub vehicle_ids: Vec<String>,
    pub category_codes: Vec<i32>,
}

/// Upstream push feed settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UpstreamConfig {
    pub enabled: bool,
    pub url: String,
    pub app_id: String,
    pub app_secret: String,
    pub handshake_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Minimum spacing between processed messages per vehicle; 0 disables shaping.
    pub min_sample_interval_ms: u64,
    pub query_timeout_ms: u64,
    pub outbound_capacity: usize,
    pub subscriptions: SubscriptionConfig,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: String::new(),
            app_id: String::new(),
            app_secret: String::new(),
            handshake_timeout_ms: 10_000,
            heartbeat_interval_ms: 30_000,
            backoff_base_ms: 1_000,
            backoff_max_ms: 30_000,
            min_sample_interval_ms: 1_000,
            query_timeout_ms: 10_000,
            outbound_capacity: 64,
            subscriptions: SubscriptionConfig::default(),
        }
    }
}

impl UpstreamConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Silence longer than this forces a reconnect.
    pub fn read_deadline(&self) -> Duration {
        self.heartbeat_interval() * 3
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }
}

/// Geofence task monitor settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MonitorConfig {
    /// Values at or below zero fall back to 100 m.
    pub arrival_threshold_m: f64,
    pub event_group: String,
    pub event_queue_capacity: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            arrival_threshold_m: crate::monitor::DEFAULT_ARRIVAL_THRESHOLD_M,
            event_group: "orders".to_string(),
            event_queue_capacity: 1024,
        }
    }
}

/// Eviction of per-vehicle state for vehicles that went quiet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetentionConfig {
    /// Online status and rate-shaping entries older than this are forgotten.
    pub stale_after_ms: u64,
    pub prune_interval_ms: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self { stale_after_ms: 600_000, prune_interval_ms: 60_000 }
    }
}

impl RetentionConfig {
    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }

    pub fn prune_interval(&self) -> Duration {
        Duration::from_millis(self.prune_interval_ms)
    }
}
