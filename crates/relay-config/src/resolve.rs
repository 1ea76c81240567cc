//! Config resolution: CLI → env → XDG → defaults.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::config::RelayConfig;
use crate::validate::{validate_config, ValidationResult};
use crate::{CONFIG_ENV_VAR, CONFIG_FILE_NAME};

/// Errors from config resolution.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("config file not found: {0}")]
    NotFound(PathBuf),

    #[error("invalid configuration: {0}")]
    Invalid(ValidationResult),
}

/// Where the effective configuration came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSource {
    Cli,
    Env,
    Xdg,
    Defaults,
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigSource::Cli => write!(f, "cli"),
            ConfigSource::Env => write!(f, "env"),
            ConfigSource::Xdg => write!(f, "xdg"),
            ConfigSource::Defaults => write!(f, "defaults"),
        }
    }
}

/// A validated configuration plus its provenance.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub config: RelayConfig,
    pub source: ConfigSource,
    pub path: Option<PathBuf>,
}

/// Resolve the effective configuration from the process environment.
pub fn resolve_config(cli_path: Option<&Path>) -> Result<ResolvedConfig, ConfigError> {
    let env_path = std::env::var_os(CONFIG_ENV_VAR).map(PathBuf::from);
    let xdg_dir = dirs::config_dir().map(|d| d.join("telemetry_relay"));
    resolve_config_from(cli_path, env_path.as_deref(), xdg_dir.as_deref())
}

/// Resolve with explicit inputs.
///
/// An explicit CLI or env path must exist; the XDG file is optional.
pub fn resolve_config_from(
    cli_path: Option<&Path>,
    env_path: Option<&Path>,
    xdg_dir: Option<&Path>,
) -> Result<ResolvedConfig, ConfigError> {
    let (config, source, path) = if let Some(path) = cli_path {
        (load_file(path)?, ConfigSource::Cli, Some(path.to_path_buf()))
    } else if let Some(path) = env_path {
        (load_file(path)?, ConfigSource::Env, Some(path.to_path_buf()))
    } else if let Some(path) = xdg_dir
        .map(|dir| dir.join(CONFIG_FILE_NAME))
        .filter(|p| p.is_file())
    {
        (load_file(&path)?, ConfigSource::Xdg, Some(path))
    } else {
        (RelayConfig::default(), ConfigSource::Defaults, None)
    };

    let validation = validate_config(&config);
    if !validation.is_ok() {
        return Err(ConfigError::Invalid(validation));
    }

    Ok(ResolvedConfig {
        config,
        source,
        path,
    })
}

fn load_file(path: &Path) -> Result<RelayConfig, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }
    let content = fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    RelayConfig::from_toml(&content).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        source: e,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(dir: &TempDir, name: &str, body: &str) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, body).expect("write config");
        path
    }

    #[test]
    fn test_defaults_when_nothing_configured() {
        let dir = TempDir::new().expect("tempdir");
        let resolved = resolve_config_from(None, None, Some(dir.path())).expect("resolve");
        assert_eq!(resolved.source, ConfigSource::Defaults);
        assert!(resolved.path.is_none());
    }

    #[test]
    fn test_cli_beats_env() {
        let dir = TempDir::new().expect("tempdir");
        let cli = write(&dir, "cli.toml", "[batch]\nmax_rows = 7\n");
        let env = write(&dir, "env.toml", "[batch]\nmax_rows = 9\n");

        let resolved = resolve_config_from(Some(&cli), Some(&env), None).expect("resolve");
        assert_eq!(resolved.source, ConfigSource::Cli);
        assert_eq!(resolved.config.batch.max_rows, 7);

        let resolved = resolve_config_from(None, Some(&env), None).expect("resolve");
        assert_eq!(resolved.source, ConfigSource::Env);
        assert_eq!(resolved.config.batch.max_rows, 9);
    }

    #[test]
    fn test_xdg_file_is_picked_up() {
        let dir = TempDir::new().expect("tempdir");
        write(&dir, CONFIG_FILE_NAME, "[queue]\ncapacity = 32\n");
        let resolved = resolve_config_from(None, None, Some(dir.path())).expect("resolve");
        assert_eq!(resolved.source, ConfigSource::Xdg);
        assert_eq!(resolved.config.queue.capacity, 32);
    }

    #[test]
    fn test_missing_explicit_file_is_error() {
        let dir = TempDir::new().expect("tempdir");
        let missing = dir.path().join("nope.toml");
        let err = resolve_config_from(Some(&missing), None, None).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let dir = TempDir::new().expect("tempdir");
        let cli = write(&dir, "bad.toml", "[queue]\ncapacity = 0\n");
        let err = resolve_config_from(Some(&cli), None, None).unwrap_err();
        match err {
            ConfigError::Invalid(result) => {
                assert_eq!(result.errors[0].field, "queue.capacity");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_parse_error_names_file() {
        let dir = TempDir::new().expect("tempdir");
        let cli = write(&dir, "broken.toml", "[batch\n");
        let err = resolve_config_from(Some(&cli), None, None).unwrap_err();
        assert!(err.to_string().contains("broken.toml"));
    }
}
