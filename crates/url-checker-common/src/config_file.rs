//! Configuration file structures for url-checker.
//!
//! This module defines structures for TOML configuration files:
//! - [`ConfigFile`]: Top-level configuration file structure
//! - [`LoggingConfig`]: Log filter and output format

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::CheckerConfig;

/// Top-level configuration file structure.
///
/// # Example
///
/// ```toml
/// [engine]
/// kind = "wasmtime"
/// cranelift_opt_level = "speed"
///
/// [execution]
/// fuel_metering = true
/// max_fuel = 50_000_000
/// max_memory_mb = 64
///
/// [guest]
/// path = "./checker.wasm"
/// encoding = "nul_terminated"
///
/// [logging]
/// filter = "info,url_checker_core=debug"
/// json = false
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ConfigFile {
    /// Engine, execution and guest settings.
    #[serde(flatten)]
    pub checker: CheckerConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl ConfigFile {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigFileError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigFileError::Io {
            path: path.as_ref().display().to_string(),
            source: e,
        })?;

        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string cannot be parsed as TOML.
    pub fn from_toml(content: &str) -> Result<Self, ConfigFileError> {
        toml::from_str(content).map_err(|e| ConfigFileError::Parse {
            message: e.to_string(),
        })
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directive; `RUST_LOG` takes precedence when set.
    #[serde(default)]
    pub filter: Option<String>,

    /// Emit JSON log lines instead of human-readable ones.
    #[serde(default)]
    pub json: bool,
}

/// Configuration file errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigFileError {
    /// Failed to read configuration file.
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse configuration file.
    #[error("Failed to parse config file: {message}")]
    Parse { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CompileOptLevel, EngineKind, WireEncoding};

    #[test]
    fn test_default_config_file() {
        let config = ConfigFile::default();

        assert_eq!(config.checker.engine.kind, EngineKind::Wasmtime);
        assert!(config.checker.guest.path.is_none());
        assert!(config.logging.filter.is_none());
        assert!(!config.logging.json);
    }

    #[test]
    fn test_parse_minimal_config() {
        let toml = r#"
            [engine]
            kind = "wasmi"
        "#;

        let config = ConfigFile::from_toml(toml).unwrap();

        assert_eq!(config.checker.engine.kind, EngineKind::Wasmi);
        // Defaults applied
        assert_eq!(config.checker.execution.max_memory_mb, 128);
        assert_eq!(config.checker.guest.encoding, WireEncoding::NulTerminated);
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
            [engine]
            kind = "wasmtime"
            pooling_allocator = true
            max_instances = 4
            cranelift_opt_level = "speed_and_size"

            [execution]
            fuel_metering = true
            max_fuel = 5_000_000
            max_memory_mb = 32
            inherit_stdio = true

            [guest]
            path = "./guest/checker.wasm"
            encoding = "raw"

            [logging]
            filter = "debug"
            json = true
        "#;

        let config = ConfigFile::from_toml(toml).unwrap();

        assert!(config.checker.engine.pooling_allocator);
        assert_eq!(config.checker.engine.max_instances, 4);
        assert_eq!(
            config.checker.engine.cranelift_opt_level,
            CompileOptLevel::SpeedAndSize
        );
        assert!(config.checker.execution.fuel_metering);
        assert_eq!(config.checker.execution.max_fuel, 5_000_000);
        assert_eq!(config.checker.execution.max_memory_mb, 32);
        assert!(config.checker.execution.inherit_stdio);
        assert_eq!(
            config.checker.guest.path.as_deref(),
            Some(Path::new("./guest/checker.wasm"))
        );
        assert_eq!(config.checker.guest.encoding, WireEncoding::Raw);
        assert_eq!(config.logging.filter.as_deref(), Some("debug"));
        assert!(config.logging.json);
    }

    #[test]
    fn test_parse_unknown_engine() {
        let toml = r#"
            [engine]
            kind = "wazero"
        "#;
        assert!(ConfigFile::from_toml(toml).is_err());
    }

    #[test]
    fn test_parse_invalid_toml() {
        let invalid = "this is not valid toml [";
        let result = ConfigFile::from_toml(invalid);
        assert!(result.is_err());
    }

    #[test]
    fn test_missing_file() {
        let result = ConfigFile::from_file("/nonexistent/url-checker.toml");
        assert!(matches!(result, Err(ConfigFileError::Io { .. })));
    }
}
