//! Upstream wire messages.
//!
//! These mirror the frames streamed by producer-side stream servers. Field
//! names follow the upstream camelCase convention; every field is optional
//! because upstream senders omit unset fields. Mapping onto the canonical
//! envelope happens during normalization, not here.

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::kind::StreamKind;
use crate::record::TelemetryType;
use crate::sample::{format_timestamp, Sample, SampleValue};

/// One sensor reading frame. Exactly one payload sub-message is expected.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawTelemetry {
    #[serde(default)]
    pub timestamp: Option<String>,

    /// Upstream type hint; informational only, payload presence decides.
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_hint: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<TemperatureReading>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pressure: Option<PressureReading>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub velocity: Option<VelocityReading>,
}

impl RawTelemetry {
    /// Payload markers present in this frame, in precedence order
    /// (temperature, pressure, velocity).
    pub fn payload_markers(&self) -> Vec<TelemetryType> {
        let mut markers = Vec::with_capacity(1);
        if self.temperature.is_some() {
            markers.push(TelemetryType::Temperature);
        }
        if self.pressure.is_some() {
            markers.push(TelemetryType::Pressure);
        }
        if self.velocity.is_some() {
            markers.push(TelemetryType::Velocity);
        }
        markers
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemperatureReading {
    #[serde(default)]
    pub sensor_id: Option<String>,
    #[serde(default)]
    pub subsystem: Option<String>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub status_bitmask: Option<i64>,
    #[serde(default)]
    pub sequence_number: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PressureReading {
    #[serde(default)]
    pub sensor_id: Option<String>,
    #[serde(default)]
    pub subsystem: Option<String>,
    #[serde(default)]
    pub pressure: Option<f64>,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub status_bitmask: Option<i64>,
    #[serde(default)]
    pub leak_detected: Option<i64>,
    #[serde(default)]
    pub sequence_number: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VelocityReading {
    #[serde(default)]
    pub sensor_id: Option<String>,
    #[serde(default)]
    pub subsystem: Option<String>,
    #[serde(default)]
    pub velocity_x: Option<f64>,
    #[serde(default)]
    pub velocity_y: Option<f64>,
    #[serde(default)]
    pub velocity_z: Option<f64>,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub vibration_mag: Option<f64>,
    #[serde(default)]
    pub status_bitmask: Option<i64>,
    #[serde(default)]
    pub sequence_number: Option<i64>,
}

/// One user-activity metric frame with a one-of payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricMessage {
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kpm: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pxm: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpm: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

impl MetricMessage {
    /// Build a frame for a metric kind from a queued sample.
    ///
    /// Integers widen to floats for `pxm`; every other mismatch between the
    /// kind and the value type is rejected.
    pub fn from_sample(kind: StreamKind, sample: &Sample<SampleValue>) -> Result<Self, Error> {
        let mut msg = MetricMessage {
            timestamp: format_timestamp(&sample.timestamp),
            ..Default::default()
        };
        match (kind, &sample.value) {
            (StreamKind::Kpm, SampleValue::Int(v)) => msg.kpm = Some(*v),
            (StreamKind::Cpm, SampleValue::Int(v)) => msg.cpm = Some(*v),
            (StreamKind::Pxm, SampleValue::Float(v)) => msg.pxm = Some(*v),
            (StreamKind::Pxm, SampleValue::Int(v)) => msg.pxm = Some(*v as f64),
            (StreamKind::Title, SampleValue::Text(v)) => msg.title = Some(v.clone()),
            (kind, value) => {
                return Err(Error::Malformed(format!(
                    "{} sample cannot carry a {} value",
                    kind,
                    value.type_name()
                )))
            }
        }
        Ok(msg)
    }

    /// Populated payloads as `(kind, value)` pairs.
    pub fn populated(&self) -> Vec<(StreamKind, SampleValue)> {
        let mut out = Vec::with_capacity(1);
        if let Some(v) = self.kpm {
            out.push((StreamKind::Kpm, SampleValue::Int(v)));
        }
        if let Some(v) = self.pxm {
            out.push((StreamKind::Pxm, SampleValue::Float(v)));
        }
        if let Some(v) = self.cpm {
            out.push((StreamKind::Cpm, SampleValue::Int(v)));
        }
        if let Some(v) = &self.title {
            out.push((StreamKind::Title, SampleValue::Text(v.clone())));
        }
        out
    }
}
