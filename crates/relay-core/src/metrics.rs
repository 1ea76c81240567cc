//! Prometheus metrics for the relay.
//!
//! One [`RelayMetrics`] per process, each with its own [`Registry`] so that
//! tests can build independent instances. Components receive pre-labelled
//! handles rather than the whole struct.

use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge,
    IntGaugeVec, Opts, Registry, TextEncoder,
};

use relay_common::{PipelineName, StreamKind};

/// Per-row creation → persisted buckets, in seconds.
pub const LATENCY_BUCKETS: [f64; 20] = [
    0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 5.0, 10.0, 20.0, 30.0, 40.0, 50.0, 60.0, 70.0, 80.0,
    90.0, 100.0, 150.0, 200.0,
];

/// Per-flush bulk-load duration buckets, in seconds.
pub const PERSIST_BUCKETS: [f64; 24] = [
    0.007, 0.008, 0.0085, 0.009, 0.0092, 0.0094, 0.0096, 0.0098, 0.01, 0.011, 0.012, 0.015, 0.02,
    0.08, 0.1, 0.2, 0.3, 0.4, 0.5, 0.8, 1.0, 2.0, 4.0, 10.0,
];

/// Normalization duration buckets, in seconds.
pub const NORMALIZE_BUCKETS: [f64; 16] = [
    0.007, 0.008, 0.0085, 0.009, 0.0092, 0.0094, 0.0096, 0.0098, 0.01, 0.011, 0.012, 0.015, 0.02,
    0.08, 0.1, 0.2,
];

/// All relay metrics.
pub struct RelayMetrics {
    registry: Registry,

    // ── Queues ──────────────────────────────────────────────────────────
    /// Current backpressure queue depth (by pipeline)
    pub backpressure_depth: IntGaugeVec,

    /// Samples dropped by drop-oldest eviction (by kind)
    pub samples_evicted: IntCounterVec,

    // ── Persistence ─────────────────────────────────────────────────────
    /// Per-row creation → persisted latency (by pipeline)
    pub latency_to_persist: HistogramVec,

    /// Per-flush bulk-load duration (by pipeline)
    pub persist_duration: HistogramVec,

    /// Rows committed to storage (by pipeline)
    pub rows_persisted: IntCounterVec,

    /// Bulk loads that failed (by pipeline)
    pub flush_failures: IntCounterVec,

    // ── Ingestion ───────────────────────────────────────────────────────
    /// Normalization duration (by pipeline)
    pub normalize_duration: HistogramVec,

    /// Messages dropped before reaching a buffer (by pipeline, reason)
    pub messages_dropped: IntCounterVec,

    // ── Viewers ─────────────────────────────────────────────────────────
    /// Connected viewer sessions (by pipeline)
    pub viewer_sessions: IntGaugeVec,

    /// Sessions pruned after a failed delivery (by pipeline)
    pub viewer_pruned: IntCounterVec,
}

impl RelayMetrics {
    /// Create and register every metric family.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let backpressure_depth = IntGaugeVec::new(
            Opts::new(
                "relay_backpressure_queue_depth",
                "Entries waiting in the backpressure queue",
            ),
            &["pipeline"],
        )?;
        let samples_evicted = IntCounterVec::new(
            Opts::new(
                "relay_samples_evicted_total",
                "Samples evicted from full sample queues",
            ),
            &["kind"],
        )?;
        let latency_to_persist = HistogramVec::new(
            HistogramOpts::new(
                "relay_latency_to_persist_seconds",
                "Time from reading creation to bulk-load transmission",
            )
            .buckets(LATENCY_BUCKETS.to_vec()),
            &["pipeline"],
        )?;
        let persist_duration = HistogramVec::new(
            HistogramOpts::new(
                "relay_persist_duration_seconds",
                "Duration of one bulk-load flush",
            )
            .buckets(PERSIST_BUCKETS.to_vec()),
            &["pipeline"],
        )?;
        let rows_persisted = IntCounterVec::new(
            Opts::new("relay_rows_persisted_total", "Rows committed to storage"),
            &["pipeline"],
        )?;
        let flush_failures = IntCounterVec::new(
            Opts::new("relay_flush_failures_total", "Bulk loads that failed"),
            &["pipeline"],
        )?;
        let normalize_duration = HistogramVec::new(
            HistogramOpts::new(
                "relay_normalize_duration_seconds",
                "Duration of upstream message normalization",
            )
            .buckets(NORMALIZE_BUCKETS.to_vec()),
            &["pipeline"],
        )?;
        let messages_dropped = IntCounterVec::new(
            Opts::new(
                "relay_messages_dropped_total",
                "Messages dropped before reaching a batch buffer",
            ),
            &["pipeline", "reason"],
        )?;
        let viewer_sessions = IntGaugeVec::new(
            Opts::new("relay_viewer_sessions", "Connected live viewer sessions"),
            &["pipeline"],
        )?;
        let viewer_pruned = IntCounterVec::new(
            Opts::new(
                "relay_viewer_pruned_total",
                "Viewer sessions removed after a failed delivery",
            ),
            &["pipeline"],
        )?;

        registry.register(Box::new(backpressure_depth.clone()))?;
        registry.register(Box::new(samples_evicted.clone()))?;
        registry.register(Box::new(latency_to_persist.clone()))?;
        registry.register(Box::new(persist_duration.clone()))?;
        registry.register(Box::new(rows_persisted.clone()))?;
        registry.register(Box::new(flush_failures.clone()))?;
        registry.register(Box::new(normalize_duration.clone()))?;
        registry.register(Box::new(messages_dropped.clone()))?;
        registry.register(Box::new(viewer_sessions.clone()))?;
        registry.register(Box::new(viewer_pruned.clone()))?;

        Ok(Self {
            registry,
            backpressure_depth,
            samples_evicted,
            latency_to_persist,
            persist_duration,
            rows_persisted,
            flush_failures,
            normalize_duration,
            messages_dropped,
            viewer_sessions,
            viewer_pruned,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render every family in the Prometheus text format.
    pub fn encode_text(&self) -> Result<String, prometheus::Error> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        String::from_utf8(buf).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }

    pub fn depth_gauge(&self, pipeline: &PipelineName) -> IntGauge {
        self.backpressure_depth
            .with_label_values(&[pipeline.as_str()])
    }

    pub fn eviction_counter(&self, kind: StreamKind) -> IntCounter {
        self.samples_evicted.with_label_values(&[kind.as_str()])
    }

    pub fn persist(&self, pipeline: &PipelineName) -> PersistMetrics {
        let label = [pipeline.as_str()];
        PersistMetrics {
            latency: self.latency_to_persist.with_label_values(&label),
            duration: self.persist_duration.with_label_values(&label),
            rows: self.rows_persisted.with_label_values(&label),
            failures: self.flush_failures.with_label_values(&label),
        }
    }

    pub fn ingest(&self, pipeline: &PipelineName) -> IngestMetrics {
        IngestMetrics {
            pipeline: pipeline.as_str().to_string(),
            normalize: self
                .normalize_duration
                .with_label_values(&[pipeline.as_str()]),
            dropped: self.messages_dropped.clone(),
        }
    }

    pub fn viewers(&self, pipeline: &PipelineName) -> ViewerMetrics {
        let label = [pipeline.as_str()];
        ViewerMetrics {
            sessions: self.viewer_sessions.with_label_values(&label),
            pruned: self.viewer_pruned.with_label_values(&label),
        }
    }
}

/// Handles used by the bulk persister.
#[derive(Clone)]
pub struct PersistMetrics {
    pub latency: Histogram,
    pub duration: Histogram,
    pub rows: IntCounter,
    pub failures: IntCounter,
}

/// Handles used by ingestion and the writer loop.
#[derive(Clone)]
pub struct IngestMetrics {
    pipeline: String,
    pub normalize: Histogram,
    dropped: IntCounterVec,
}

impl IngestMetrics {
    /// Count one dropped message under `reason`.
    pub fn dropped(&self, reason: &str) {
        self.dropped
            .with_label_values(&[self.pipeline.as_str(), reason])
            .inc();
    }

    pub fn dropped_count(&self, reason: &str) -> u64 {
        self.dropped
            .with_label_values(&[self.pipeline.as_str(), reason])
            .get()
    }
}

/// Handles used by the live broadcaster.
#[derive(Clone)]
pub struct ViewerMetrics {
    pub sessions: IntGauge,
    pub pruned: IntCounter,
}
