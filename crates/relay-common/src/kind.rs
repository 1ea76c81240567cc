//! Stream kinds carried by the relay.
//!
//! Each kind owns one SampleQueue on the producer side and one pipeline on the
//! ingestion side. Four kinds are user-activity metrics; `Telemetry` carries
//! sensor readings.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// A metric or telemetry kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    /// Sensor telemetry (temperature, pressure, velocity).
    Telemetry,
    /// Keys per minute.
    Kpm,
    /// Mouse speed in pixels per second.
    Pxm,
    /// Clicks per minute.
    Cpm,
    /// Active media title.
    Title,
}

impl StreamKind {
    /// Every kind, in a stable order.
    pub const ALL: [StreamKind; 5] = [
        StreamKind::Telemetry,
        StreamKind::Kpm,
        StreamKind::Pxm,
        StreamKind::Cpm,
        StreamKind::Title,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Telemetry => "telemetry",
            Self::Kpm => "kpm",
            Self::Pxm => "pxm",
            Self::Cpm => "cpm",
            Self::Title => "title",
        }
    }

    /// Whether this kind is a user-activity metric (single `val` column).
    pub fn is_metric(self) -> bool {
        !matches!(self, Self::Telemetry)
    }

    /// Storage table receiving this kind's rows.
    pub fn table_name(self) -> String {
        match self {
            Self::Telemetry => "telemetry_data".to_string(),
            other => format!("metric_data_{}", other.as_str()),
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StreamKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "telemetry" => Ok(Self::Telemetry),
            "kpm" => Ok(Self::Kpm),
            "pxm" => Ok(Self::Pxm),
            "cpm" => Ok(Self::Cpm),
            "title" => Ok(Self::Title),
            other => Err(Error::UnknownKind(other.to_string())),
        }
    }
}
