//! Semantic validation for relay configuration.
//!
//! Parsing already enforces shape; this pass checks the values that would
//! otherwise surface as a stalled pipeline or a spinning poll loop at runtime.

use std::collections::BTreeSet;
use std::fmt;

use relay_common::StreamKind;

use crate::config::RelayConfig;
use crate::CONFIG_SCHEMA_VERSION;

/// A single validation problem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path of the offending field.
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// All problems found in one config.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationResult {
    pub errors: Vec<ValidationError>,
}

impl ValidationResult {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    fn push(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ValidationError::new(field, message));
    }
}

impl fmt::Display for ValidationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lines: Vec<String> = self.errors.iter().map(|e| e.to_string()).collect();
        f.write_str(&lines.join("; "))
    }
}

/// Validate a configuration, collecting every problem.
pub fn validate_config(config: &RelayConfig) -> ValidationResult {
    let mut result = ValidationResult::default();

    let major = |v: &str| v.split('.').next().map(str::to_string);
    if major(&config.schema_version) != major(CONFIG_SCHEMA_VERSION) {
        result.push(
            "schema_version",
            format!(
                "unsupported version {} (expected {})",
                config.schema_version, CONFIG_SCHEMA_VERSION
            ),
        );
    }

    if config.pipelines.is_empty() {
        result.push("pipelines", "at least one pipeline must be enabled");
    }
    let mut seen = BTreeSet::new();
    for name in &config.pipelines {
        match name.parse::<StreamKind>() {
            Ok(kind) => {
                if !seen.insert(kind) {
                    result.push("pipelines", format!("duplicate pipeline '{}'", name));
                }
            }
            Err(_) => result.push("pipelines", format!("unknown stream kind '{}'", name)),
        }
    }

    if config.queue.capacity == 0 {
        result.push("queue.capacity", "must be at least 1");
    }

    for (name, ms) in &config.stream.idle_poll_ms {
        if name.parse::<StreamKind>().is_err() {
            result.push(
                format!("stream.idle_poll_ms.{}", name),
                "unknown stream kind",
            );
        }
        if *ms == 0 {
            result.push(
                format!("stream.idle_poll_ms.{}", name),
                "must be greater than zero",
            );
        }
    }
    if config.stream.default_idle_poll_ms == 0 {
        result.push("stream.default_idle_poll_ms", "must be greater than zero");
    }

    if config.batch.max_rows == 0 {
        result.push("batch.max_rows", "must be at least 1");
    }
    if config.batch.interval_secs == 0 {
        result.push("batch.interval_secs", "must be greater than zero");
    }

    if config.viewer.delivery_timeout_ms == 0 {
        result.push("viewer.delivery_timeout_ms", "must be greater than zero");
    }
    if config.viewer.session_buffer == 0 {
        result.push("viewer.session_buffer", "must be at least 1");
    }

    for (field, addr) in [
        ("stream.bind", &config.stream.bind),
        ("ingest.upstream", &config.ingest.upstream),
        ("viewer.bind", &config.viewer.bind),
        ("http.bind", &config.http.bind),
    ] {
        if !looks_like_socket_addr(addr) {
            result.push(field, format!("'{}' is not a host:port address", addr));
        }
    }

    result
}

fn looks_like_socket_addr(addr: &str) -> bool {
    match addr.rsplit_once(':') {
        Some((host, port)) => !host.is_empty() && port.parse::<u16>().is_ok(),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let result = validate_config(&RelayConfig::default());
        assert!(result.is_ok(), "{result}");
    }

    #[test]
    fn test_collects_every_problem() {
        let mut config = RelayConfig::default();
        config.queue.capacity = 0;
        config.batch.max_rows = 0;
        config.batch.interval_secs = 0;
        config.pipelines = vec!["kpm".into(), "kpm".into(), "humidity".into()];
        config.http.bind = "localhost".into();

        let result = validate_config(&config);
        let fields: Vec<&str> = result.errors.iter().map(|e| e.field.as_str()).collect();
        assert!(fields.contains(&"queue.capacity"));
        assert!(fields.contains(&"batch.max_rows"));
        assert!(fields.contains(&"batch.interval_secs"));
        assert!(fields.contains(&"http.bind"));
        assert_eq!(fields.iter().filter(|f| **f == "pipelines").count(), 2);
    }

    #[test]
    fn test_zero_idle_poll_rejected() {
        let mut config = RelayConfig::default();
        config.stream.idle_poll_ms.insert("pxm".into(), 0);
        let result = validate_config(&config);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].field, "stream.idle_poll_ms.pxm");
    }

    #[test]
    fn test_schema_major_mismatch() {
        let config = RelayConfig {
            schema_version: "2.0.0".into(),
            ..Default::default()
        };
        assert!(!validate_config(&config).is_ok());
    }
}
