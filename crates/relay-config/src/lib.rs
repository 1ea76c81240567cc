//! Telemetry relay configuration loading and validation.
//!
//! This crate provides:
//! - Typed Rust structs for `relay.toml`
//! - Config resolution (CLI → env → XDG → defaults)
//! - Semantic validation that reports every problem at once
//! - The per-kind idle poll table used by stream servers

pub mod config;
pub mod resolve;
pub mod validate;

pub use config::{
    BackpressureConfig, BatchConfig, FlushFailurePolicy, HttpConfig, IngestConfig, LogFormat,
    LoggingConfig, PayloadConflictPolicy, QueueConfig, RelayConfig, StorageConfig, StreamConfig,
    ViewerConfig,
};
pub use resolve::{resolve_config, resolve_config_from, ConfigError, ConfigSource, ResolvedConfig};
pub use validate::{validate_config, ValidationError, ValidationResult};

/// Schema version for configuration files.
pub const CONFIG_SCHEMA_VERSION: &str = "1.0.0";

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV_VAR: &str = "RELAY_CONFIG";

/// Config file name looked up in the XDG config directory.
pub const CONFIG_FILE_NAME: &str = "relay.toml";
