//! Normalized records.
//!
//! A [`TelemetryRecord`] carries a shared envelope plus exactly one payload
//! variant. Its serialized form is always the flat 16-field shape with
//! explicit nulls for every field the payload does not use, because the
//! storage bulk-load contract is a fixed column list.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::Error;
use crate::kind::StreamKind;
use crate::sample::{format_timestamp, parse_timestamp, SampleValue};

/// Closed set of telemetry payload kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TelemetryType {
    Temperature,
    Pressure,
    Velocity,
}

impl TelemetryType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Temperature => "TEMPERATURE",
            Self::Pressure => "PRESSURE",
            Self::Velocity => "VELOCITY",
        }
    }
}

impl fmt::Display for TelemetryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Type-specific payload. The enum makes "exactly one variant" structural.
#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryPayload {
    Temperature {
        temperature: Option<f64>,
        temp_unit: Option<String>,
    },
    Pressure {
        pressure: Option<f64>,
        pressure_unit: Option<String>,
        leak_detected: Option<i64>,
    },
    Velocity {
        velocity_x: Option<f64>,
        velocity_y: Option<f64>,
        velocity_z: Option<f64>,
        velocity_unit: Option<String>,
        vibration_magnitude: Option<f64>,
    },
}

impl TelemetryPayload {
    pub fn telemetry_type(&self) -> TelemetryType {
        match self {
            Self::Temperature { .. } => TelemetryType::Temperature,
            Self::Pressure { .. } => TelemetryType::Pressure,
            Self::Velocity { .. } => TelemetryType::Velocity,
        }
    }
}

/// A normalized sensor reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "FlatTelemetry", try_from = "FlatTelemetry")]
pub struct TelemetryRecord {
    pub reading_timestamp: DateTime<Utc>,
    pub sensor_id: Option<String>,
    pub subsystem: Option<String>,
    pub sequence_number: Option<i64>,
    pub status_bitmask: Option<i64>,
    pub payload: TelemetryPayload,
}

impl TelemetryRecord {
    pub fn telemetry_type(&self) -> TelemetryType {
        self.payload.telemetry_type()
    }

    /// Flat, fixed-shape view of this record.
    pub fn flatten(&self) -> FlatTelemetry {
        FlatTelemetry::from(self.clone())
    }
}

/// Flat record shape: the canonical column set, unused fields as null.
///
/// Field order matches the `telemetry_data` column order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlatTelemetry {
    pub reading_timestamp: String,
    pub telemetry_type: Option<TelemetryType>,
    #[serde(default)]
    pub sensor_id: Option<String>,
    #[serde(default)]
    pub subsystem: Option<String>,
    #[serde(default)]
    pub sequence_number: Option<i64>,
    #[serde(default)]
    pub status_bitmask: Option<i64>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub temp_unit: Option<String>,
    #[serde(default)]
    pub pressure: Option<f64>,
    #[serde(default)]
    pub pressure_unit: Option<String>,
    #[serde(default)]
    pub leak_detected: Option<i64>,
    #[serde(default)]
    pub velocity_x: Option<f64>,
    #[serde(default)]
    pub velocity_y: Option<f64>,
    #[serde(default)]
    pub velocity_z: Option<f64>,
    #[serde(default)]
    pub velocity_unit: Option<String>,
    #[serde(default)]
    pub vibration_magnitude: Option<f64>,
}

impl From<TelemetryRecord> for FlatTelemetry {
    fn from(record: TelemetryRecord) -> Self {
        let mut flat = FlatTelemetry {
            reading_timestamp: format_timestamp(&record.reading_timestamp),
            telemetry_type: Some(record.payload.telemetry_type()),
            sensor_id: record.sensor_id,
            subsystem: record.subsystem,
            sequence_number: record.sequence_number,
            status_bitmask: record.status_bitmask,
            ..Default::default()
        };
        match record.payload {
            TelemetryPayload::Temperature {
                temperature,
                temp_unit,
            } => {
                flat.temperature = temperature;
                flat.temp_unit = temp_unit;
            }
            TelemetryPayload::Pressure {
                pressure,
                pressure_unit,
                leak_detected,
            } => {
                flat.pressure = pressure;
                flat.pressure_unit = pressure_unit;
                flat.leak_detected = leak_detected;
            }
            TelemetryPayload::Velocity {
                velocity_x,
                velocity_y,
                velocity_z,
                velocity_unit,
                vibration_magnitude,
            } => {
                flat.velocity_x = velocity_x;
                flat.velocity_y = velocity_y;
                flat.velocity_z = velocity_z;
                flat.velocity_unit = velocity_unit;
                flat.vibration_magnitude = vibration_magnitude;
            }
        }
        flat
    }
}

impl TryFrom<FlatTelemetry> for TelemetryRecord {
    type Error = Error;

    fn try_from(flat: FlatTelemetry) -> Result<Self, Self::Error> {
        let reading_timestamp = parse_timestamp(&flat.reading_timestamp)
            .ok_or_else(|| Error::InvalidTimestamp(flat.reading_timestamp.clone()))?;
        let telemetry_type = flat
            .telemetry_type
            .ok_or_else(|| Error::Malformed("telemetry_type is null".to_string()))?;

        let temperature_set = flat.temperature.is_some() || flat.temp_unit.is_some();
        let pressure_set = flat.pressure.is_some()
            || flat.pressure_unit.is_some()
            || flat.leak_detected.is_some();
        let velocity_set = flat.velocity_x.is_some()
            || flat.velocity_y.is_some()
            || flat.velocity_z.is_some()
            || flat.velocity_unit.is_some()
            || flat.vibration_magnitude.is_some();

        let foreign = match telemetry_type {
            TelemetryType::Temperature => pressure_set || velocity_set,
            TelemetryType::Pressure => temperature_set || velocity_set,
            TelemetryType::Velocity => temperature_set || pressure_set,
        };
        if foreign {
            return Err(Error::Malformed(format!(
                "{} record carries fields of another payload",
                telemetry_type
            )));
        }

        let payload = match telemetry_type {
            TelemetryType::Temperature => TelemetryPayload::Temperature {
                temperature: flat.temperature,
                temp_unit: flat.temp_unit,
            },
            TelemetryType::Pressure => TelemetryPayload::Pressure {
                pressure: flat.pressure,
                pressure_unit: flat.pressure_unit,
                leak_detected: flat.leak_detected,
            },
            TelemetryType::Velocity => TelemetryPayload::Velocity {
                velocity_x: flat.velocity_x,
                velocity_y: flat.velocity_y,
                velocity_z: flat.velocity_z,
                velocity_unit: flat.velocity_unit,
                vibration_magnitude: flat.vibration_magnitude,
            },
        };

        Ok(TelemetryRecord {
            reading_timestamp,
            sensor_id: flat.sensor_id,
            subsystem: flat.subsystem,
            sequence_number: flat.sequence_number,
            status_bitmask: flat.status_bitmask,
            payload,
        })
    }
}

/// A normalized user-activity metric reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    #[serde(rename = "timestamp")]
    pub reading_timestamp: DateTime<Utc>,
    pub metric_type: StreamKind,
    pub val: SampleValue,
}

/// Whatever a pipeline carries: one normalized record.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum PipelineRecord {
    Telemetry(TelemetryRecord),
    Metric(MetricRecord),
}

impl PipelineRecord {
    /// Instant the reading was created upstream.
    pub fn created_at(&self) -> DateTime<Utc> {
        match self {
            Self::Telemetry(r) => r.reading_timestamp,
            Self::Metric(r) => r.reading_timestamp,
        }
    }

    pub fn kind(&self) -> StreamKind {
        match self {
            Self::Telemetry(_) => StreamKind::Telemetry,
            Self::Metric(r) => r.metric_type,
        }
    }

    /// Serialize to the opaque JSON entry form.
    pub fn encode(&self) -> Result<String, Error> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode an entry produced by [`PipelineRecord::encode`] for a pipeline kind.
    pub fn decode(kind: StreamKind, entry: &str) -> Result<Self, Error> {
        if kind.is_metric() {
            let record: MetricRecord = serde_json::from_str(entry)?;
            if record.metric_type != kind {
                return Err(Error::Malformed(format!(
                    "{} entry found in {} pipeline",
                    record.metric_type, kind
                )));
            }
            Ok(Self::Metric(record))
        } else {
            Ok(Self::Telemetry(serde_json::from_str(entry)?))
        }
    }
}
