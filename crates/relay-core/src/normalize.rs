//! Upstream message normalization.
//!
//! Raw frames become [`PipelineRecord`]s with the canonical envelope and an
//! explicit null for every payload field the frame does not carry. The
//! payload is chosen by which sub-message is present, in temperature →
//! pressure → velocity order; a frame carrying more than one is handled per
//! [`PayloadConflictPolicy`].

use chrono::Utc;
use thiserror::Error;

use relay_common::sample::parse_timestamp;
use relay_common::{
    MetricMessage, MetricRecord, PipelineRecord, RawTelemetry, StreamKind, TelemetryPayload,
    TelemetryRecord, TelemetryType,
};
use relay_config::PayloadConflictPolicy;

/// Why a message could not be normalized. Every variant drops the message.
#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("message is not valid JSON for this pipeline: {0}")]
    Json(#[from] serde_json::Error),

    #[error("no payload sub-message present")]
    NoPayload,

    #[error("multiple payload sub-messages present: {0:?}")]
    ConflictingPayloads(Vec<TelemetryType>),

    #[error("multiple metric values present: {0:?}")]
    ConflictingMetrics(Vec<StreamKind>),

    #[error("invalid timestamp: {0}")]
    Timestamp(String),

    #[error("{found} value in {expected} pipeline")]
    KindMismatch {
        expected: StreamKind,
        found: StreamKind,
    },
}

impl NormalizeError {
    /// Short label for drop counters.
    pub fn reason(&self) -> &'static str {
        match self {
            NormalizeError::Json(_) => "invalid_json",
            NormalizeError::NoPayload => "no_payload",
            NormalizeError::ConflictingPayloads(_) | NormalizeError::ConflictingMetrics(_) => {
                "conflicting_payloads"
            }
            NormalizeError::Timestamp(_) => "invalid_timestamp",
            NormalizeError::KindMismatch { .. } => "kind_mismatch",
        }
    }
}

/// Normalizer for one pipeline.
#[derive(Debug, Clone, Copy)]
pub struct Normalizer {
    kind: StreamKind,
    conflict: PayloadConflictPolicy,
}

impl Normalizer {
    pub fn new(kind: StreamKind, conflict: PayloadConflictPolicy) -> Self {
        Self { kind, conflict }
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    /// Normalize one raw line from the upstream transport.
    pub fn normalize(&self, line: &str) -> Result<PipelineRecord, NormalizeError> {
        if self.kind.is_metric() {
            let msg: MetricMessage = serde_json::from_str(line)?;
            Ok(PipelineRecord::Metric(normalize_metric(self.kind, msg)?))
        } else {
            let raw: RawTelemetry = serde_json::from_str(line)?;
            Ok(PipelineRecord::Telemetry(normalize_telemetry(
                raw,
                self.conflict,
            )?))
        }
    }
}

fn reading_timestamp(raw: Option<&str>) -> Result<chrono::DateTime<Utc>, NormalizeError> {
    match raw {
        // Frames without a timestamp are stamped on arrival.
        None => Ok(Utc::now()),
        Some(s) => parse_timestamp(s).ok_or_else(|| NormalizeError::Timestamp(s.to_string())),
    }
}

/// Map a sensor frame onto the canonical record.
pub fn normalize_telemetry(
    raw: RawTelemetry,
    conflict: PayloadConflictPolicy,
) -> Result<TelemetryRecord, NormalizeError> {
    let markers = raw.payload_markers();
    let chosen = match (markers.as_slice(), conflict) {
        ([], _) => return Err(NormalizeError::NoPayload),
        ([only], _) => *only,
        ([first, ..], PayloadConflictPolicy::FirstMatch) => *first,
        (_, PayloadConflictPolicy::Reject) => {
            return Err(NormalizeError::ConflictingPayloads(markers))
        }
    };
    let reading_timestamp = reading_timestamp(raw.timestamp.as_deref())?;

    let record = match chosen {
        TelemetryType::Temperature => {
            let t = raw.temperature.unwrap_or_default();
            TelemetryRecord {
                reading_timestamp,
                sensor_id: t.sensor_id,
                subsystem: t.subsystem,
                sequence_number: t.sequence_number,
                status_bitmask: t.status_bitmask,
                payload: TelemetryPayload::Temperature {
                    temperature: t.temperature,
                    temp_unit: t.unit,
                },
            }
        }
        TelemetryType::Pressure => {
            let p = raw.pressure.unwrap_or_default();
            TelemetryRecord {
                reading_timestamp,
                sensor_id: p.sensor_id,
                subsystem: p.subsystem,
                sequence_number: p.sequence_number,
                status_bitmask: p.status_bitmask,
                payload: TelemetryPayload::Pressure {
                    pressure: p.pressure,
                    pressure_unit: p.unit,
                    leak_detected: p.leak_detected,
                },
            }
        }
        TelemetryType::Velocity => {
            let v = raw.velocity.unwrap_or_default();
            TelemetryRecord {
                reading_timestamp,
                sensor_id: v.sensor_id,
                subsystem: v.subsystem,
                sequence_number: v.sequence_number,
                status_bitmask: v.status_bitmask,
                payload: TelemetryPayload::Velocity {
                    velocity_x: v.velocity_x,
                    velocity_y: v.velocity_y,
                    velocity_z: v.velocity_z,
                    velocity_unit: v.unit,
                    vibration_magnitude: v.vibration_mag,
                },
            }
        }
    };
    Ok(record)
}

/// Map an activity frame onto a metric record for `kind`.
pub fn normalize_metric(kind: StreamKind, msg: MetricMessage) -> Result<MetricRecord, NormalizeError> {
    let populated = msg.populated();
    let val = match populated.as_slice() {
        [] => return Err(NormalizeError::NoPayload),
        [(found, value)] if *found == kind => value.clone(),
        [(found, _)] => {
            return Err(NormalizeError::KindMismatch {
                expected: kind,
                found: *found,
            })
        }
        many => {
            let kinds = many.iter().map(|(k, _)| *k).collect();
            return Err(NormalizeError::ConflictingMetrics(kinds));
        }
    };
    let reading_timestamp = parse_timestamp(&msg.timestamp)
        .ok_or_else(|| NormalizeError::Timestamp(msg.timestamp.clone()))?;
    Ok(MetricRecord {
        reading_timestamp,
        metric_type: kind,
        val,
    })
}
