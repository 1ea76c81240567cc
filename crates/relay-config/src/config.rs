//! Relay configuration types.
//!
//! Every section has defaults so a partial `relay.toml` only needs to name
//! what it changes. Defaults reproduce the operator tuning the relay was
//! built around: capacity-10 sample queues, 20-row batches, a 10 s flush
//! interval, and slow idle polling for once-a-minute metrics.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use relay_common::StreamKind;

use crate::CONFIG_SCHEMA_VERSION;

/// Complete relay configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RelayConfig {
    pub schema_version: String,

    /// Enabled pipelines, by stream kind name.
    pub pipelines: Vec<String>,

    pub queue: QueueConfig,
    pub stream: StreamConfig,
    pub ingest: IngestConfig,
    pub batch: BatchConfig,
    pub storage: StorageConfig,
    pub viewer: ViewerConfig,
    pub http: HttpConfig,
    pub backpressure: BackpressureConfig,
    pub logging: LoggingConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            schema_version: CONFIG_SCHEMA_VERSION.to_string(),
            pipelines: StreamKind::ALL.iter().map(|k| k.to_string()).collect(),
            queue: QueueConfig::default(),
            stream: StreamConfig::default(),
            ingest: IngestConfig::default(),
            batch: BatchConfig::default(),
            storage: StorageConfig::default(),
            viewer: ViewerConfig::default(),
            http: HttpConfig::default(),
            backpressure: BackpressureConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl RelayConfig {
    /// Parse a TOML document.
    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Enabled pipeline kinds. Unknown names are skipped; `validate` reports them.
    pub fn pipeline_kinds(&self) -> Vec<StreamKind> {
        let mut kinds: Vec<StreamKind> = self
            .pipelines
            .iter()
            .filter_map(|name| name.parse().ok())
            .collect();
        kinds.sort();
        kinds.dedup();
        kinds
    }
}

/// Producer-side sample queue settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueueConfig {
    /// Slots per kind before drop-oldest eviction kicks in.
    pub capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { capacity: 10 }
    }
}

/// Stream server settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StreamConfig {
    pub bind: String,

    /// Idle poll interval per kind, in milliseconds.
    pub idle_poll_ms: BTreeMap<String, u64>,

    /// Fallback for kinds missing from `idle_poll_ms`.
    pub default_idle_poll_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        let idle_poll_ms = BTreeMap::from([
            (StreamKind::Kpm.to_string(), 20_000),
            (StreamKind::Cpm.to_string(), 20_000),
            (StreamKind::Title.to_string(), 10_000),
            (StreamKind::Pxm.to_string(), 500),
            (StreamKind::Telemetry.to_string(), 500),
        ]);
        Self {
            bind: "127.0.0.1:50052".to_string(),
            idle_poll_ms,
            default_idle_poll_ms: 500,
        }
    }
}

impl StreamConfig {
    /// Idle poll interval for a kind.
    pub fn idle_poll(&self, kind: StreamKind) -> Duration {
        let ms = self
            .idle_poll_ms
            .get(kind.as_str())
            .copied()
            .unwrap_or(self.default_idle_poll_ms);
        Duration::from_millis(ms)
    }
}

/// What normalization does with a telemetry frame carrying several payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadConflictPolicy {
    /// Treat the frame as malformed and drop it.
    #[default]
    Reject,
    /// Keep the first payload in temperature → pressure → velocity order.
    FirstMatch,
}

/// Ingestion reader settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IngestConfig {
    /// Upstream stream server address.
    pub upstream: String,
    pub payload_conflict: PayloadConflictPolicy,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            upstream: "127.0.0.1:50052".to_string(),
            payload_conflict: PayloadConflictPolicy::default(),
        }
    }
}

/// What the accumulator does with rows from a failed bulk load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushFailurePolicy {
    /// Put the batch back at the head of the pending queue (at-least-once).
    #[default]
    Requeue,
    /// Discard the batch (at-most-once).
    Drop,
}

/// Batch accumulator settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BatchConfig {
    /// Size trigger: flush as soon as the buffer holds this many rows.
    pub max_rows: usize,
    /// Timer trigger period, in seconds.
    pub interval_secs: u64,
    pub failure_policy: FlushFailurePolicy,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_rows: 20,
            interval_secs: 10,
            failure_policy: FlushFailurePolicy::default(),
        }
    }
}

impl BatchConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Bulk-load storage settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    /// Root directory for table files.
    pub dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dir: default_data_dir().join("tables"),
        }
    }
}

/// Live viewer channel settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ViewerConfig {
    pub bind: String,
    /// Upper bound on a single session delivery before the session is pruned.
    pub delivery_timeout_ms: u64,
    /// Per-session outbound frame buffer.
    pub session_buffer: usize,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8765".to_string(),
            delivery_timeout_ms: 2_000,
            session_buffer: 256,
        }
    }
}

impl ViewerConfig {
    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery_timeout_ms)
    }
}

/// Ingestion/metrics HTTP endpoint settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HttpConfig {
    pub enabled: bool,
    pub bind: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: "127.0.0.1:8000".to_string(),
        }
    }
}

/// Backpressure queue settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackpressureConfig {
    /// Directory where undrained entries are spilled on shutdown.
    pub spill_dir: Option<PathBuf>,
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Human,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::default(),
        }
    }
}

/// Get the default data directory.
pub fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("telemetry_relay")
}
