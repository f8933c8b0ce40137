//! Common types, errors, and configuration for url-checker.
//!
//! This crate provides shared functionality used across the url-checker workspace:
//! - [`CheckerError`]: the host/guest protocol error taxonomy
//! - Configuration structures for engines, execution limits and the guest artifact
//! - TOML configuration file loading

pub mod config;
pub mod config_file;
pub mod error;

pub use config::{
    CheckerConfig, CompileOptLevel, EngineConfig, EngineKind, ExecutionConfig, GuestConfig,
    WireEncoding,
};
pub use config_file::{ConfigFile, ConfigFileError, LoggingConfig};
pub use error::{BootstrapStage, CheckerError};
