//! Error types for the telemetry relay.

use thiserror::Error;

/// Result type alias for relay operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for the telemetry relay.
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors (10-19)
    #[error("configuration error: {0}")]
    Config(String),

    #[error("unknown stream kind: {0}")]
    UnknownKind(String),

    // Transport errors (20-29)
    #[error("upstream transport failed: {0}")]
    Transport(String),

    #[error("handshake rejected: {0}")]
    Handshake(String),

    // Normalization errors (30-39)
    #[error("malformed upstream message: {0}")]
    Malformed(String),

    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),

    // Persistence errors (40-49)
    #[error("bulk load failed: {0}")]
    BulkLoad(String),

    #[error("pipeline {pipeline} stopped: {reason}")]
    PipelineStopped { pipeline: String, reason: String },

    // Delivery errors (50-59)
    #[error("delivery to session {session_id} failed")]
    Delivery { session_id: String },

    // I/O errors (60-69)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Returns the error code for this error type.
    /// Used for detailed error reporting in JSON output.
    pub fn code(&self) -> u32 {
        match self {
            Error::Config(_) => 10,
            Error::UnknownKind(_) => 11,
            Error::Transport(_) => 20,
            Error::Handshake(_) => 21,
            Error::Malformed(_) => 30,
            Error::InvalidTimestamp(_) => 31,
            Error::BulkLoad(_) => 40,
            Error::PipelineStopped { .. } => 41,
            Error::Delivery { .. } => 50,
            Error::Io(_) => 60,
            Error::Json(_) => 61,
        }
    }
}
