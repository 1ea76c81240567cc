//! Bulk-load row tuples.

use chrono::{DateTime, Utc};

use relay_common::{MetricRecord, PipelineRecord, SampleValue, TelemetryPayload, TelemetryRecord};

/// One cell of a row.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
}

impl CellValue {
    pub fn is_null(&self) -> bool {
        matches!(self, CellValue::Null)
    }

    /// Type label for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            CellValue::Null => "null",
            CellValue::Int(_) => "int64",
            CellValue::Float(_) => "float64",
            CellValue::Text(_) => "utf8",
            CellValue::Timestamp(_) => "timestamp",
        }
    }
}

impl From<Option<i64>> for CellValue {
    fn from(v: Option<i64>) -> Self {
        v.map_or(CellValue::Null, CellValue::Int)
    }
}

impl From<Option<f64>> for CellValue {
    fn from(v: Option<f64>) -> Self {
        v.map_or(CellValue::Null, CellValue::Float)
    }
}

impl From<Option<String>> for CellValue {
    fn from(v: Option<String>) -> Self {
        v.map_or(CellValue::Null, CellValue::Text)
    }
}

impl From<SampleValue> for CellValue {
    fn from(v: SampleValue) -> Self {
        match v {
            SampleValue::Int(i) => CellValue::Int(i),
            SampleValue::Float(f) => CellValue::Float(f),
            SampleValue::Text(s) => CellValue::Text(s),
        }
    }
}

/// A positional tuple in table column order, plus the instant the reading
/// was created upstream (used for latency-to-persist, not stored).
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub created_at: DateTime<Utc>,
    pub cells: Vec<CellValue>,
}

impl From<&TelemetryRecord> for Row {
    fn from(record: &TelemetryRecord) -> Self {
        let mut cells = vec![
            CellValue::Timestamp(record.reading_timestamp),
            CellValue::Text(record.telemetry_type().as_str().to_string()),
            record.sensor_id.clone().into(),
            record.subsystem.clone().into(),
            record.sequence_number.into(),
            record.status_bitmask.into(),
        ];
        // temperature, temp_unit, pressure, pressure_unit, leak_detected,
        // velocity x/y/z, velocity_unit, vibration_magnitude
        let mut payload = vec![CellValue::Null; 10];
        match &record.payload {
            TelemetryPayload::Temperature {
                temperature,
                temp_unit,
            } => {
                payload[0] = (*temperature).into();
                payload[1] = temp_unit.clone().into();
            }
            TelemetryPayload::Pressure {
                pressure,
                pressure_unit,
                leak_detected,
            } => {
                payload[2] = (*pressure).into();
                payload[3] = pressure_unit.clone().into();
                payload[4] = (*leak_detected).into();
            }
            TelemetryPayload::Velocity {
                velocity_x,
                velocity_y,
                velocity_z,
                velocity_unit,
                vibration_magnitude,
            } => {
                payload[5] = (*velocity_x).into();
                payload[6] = (*velocity_y).into();
                payload[7] = (*velocity_z).into();
                payload[8] = velocity_unit.clone().into();
                payload[9] = (*vibration_magnitude).into();
            }
        }
        cells.extend(payload);
        Row {
            created_at: record.reading_timestamp,
            cells,
        }
    }
}

impl From<&MetricRecord> for Row {
    fn from(record: &MetricRecord) -> Self {
        Row {
            created_at: record.reading_timestamp,
            cells: vec![
                CellValue::Timestamp(record.reading_timestamp),
                record.val.clone().into(),
            ],
        }
    }
}

impl From<&PipelineRecord> for Row {
    fn from(record: &PipelineRecord) -> Self {
        match record {
            PipelineRecord::Telemetry(r) => r.into(),
            PipelineRecord::Metric(r) => r.into(),
        }
    }
}
