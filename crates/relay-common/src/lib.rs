//! Telemetry relay common types, identities, wire messages, and errors.
//!
//! This crate provides foundational types shared across the relay crates:
//! - Stream kinds and timestamped samples
//! - Upstream wire messages as they arrive from stream transports
//! - Normalized records with a fixed envelope and explicit nulls
//! - Pipeline and viewer session identity types
//! - Common error types

pub mod error;
pub mod id;
pub mod kind;
pub mod record;
pub mod sample;
pub mod schema;
pub mod wire;

pub use error::{Error, Result};
pub use id::{PipelineName, SessionId};
pub use kind::StreamKind;
pub use record::{
    FlatTelemetry, MetricRecord, PipelineRecord, TelemetryPayload, TelemetryRecord, TelemetryType,
};
pub use sample::{Sample, SampleValue};
pub use schema::SCHEMA_VERSION;
pub use wire::{MetricMessage, PressureReading, RawTelemetry, TemperatureReading, VelocityReading};
