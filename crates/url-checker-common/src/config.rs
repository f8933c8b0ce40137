//! Configuration structures for url-checker.
//!
//! This module defines configuration options for various components:
//! - [`CheckerConfig`]: Top-level configuration containing all settings
//! - [`EngineConfig`]: Engine selection and engine-wide settings
//! - [`ExecutionConfig`]: Per-instance execution limits (fuel, memory)
//! - [`GuestConfig`]: Guest artifact location and wire encoding

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Top-level checker configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CheckerConfig {
    /// Engine configuration.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Per-instance execution configuration.
    #[serde(default)]
    pub execution: ExecutionConfig,

    /// Guest artifact configuration.
    #[serde(default)]
    pub guest: GuestConfig,
}

/// The WebAssembly engine that runs the guest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// Wasmtime with a WASI preview 1 context.
    #[default]
    Wasmtime,
    /// The wasmi interpreter with a stub system-interface shim.
    Wasmi,
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineKind::Wasmtime => f.write_str("wasmtime"),
            EngineKind::Wasmi => f.write_str("wasmi"),
        }
    }
}

impl FromStr for EngineKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "wasmtime" => Ok(EngineKind::Wasmtime),
            "wasmi" => Ok(EngineKind::Wasmi),
            other => Err(format!(
                "unknown engine '{other}' (expected 'wasmtime' or 'wasmi')"
            )),
        }
    }
}

/// Optimization level used when compiling the guest (wasmtime only).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompileOptLevel {
    /// No optimizations.
    None,
    /// Optimize for speed.
    #[default]
    Speed,
    /// Optimize for speed and size.
    SpeedAndSize,
}

/// Engine configuration.
///
/// These settings affect the engine shared by every instance created from it.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Which engine runs the guest.
    #[serde(default)]
    pub kind: EngineKind,

    /// Enable the wasmtime pooling allocator.
    ///
    /// Useful when many short-lived instances are created; off by default
    /// since a checker usually keeps one instance alive.
    #[serde(default = "defaults::pooling_allocator")]
    pub pooling_allocator: bool,

    /// Maximum concurrent instances in the pool.
    ///
    /// Only effective when `pooling_allocator` is enabled.
    #[serde(default = "defaults::max_instances")]
    pub max_instances: u32,

    /// Memory per pool slot in megabytes.
    ///
    /// Only effective when `pooling_allocator` is enabled.
    #[serde(default = "defaults::instance_memory_mb")]
    pub instance_memory_mb: u32,

    /// Cranelift optimization level.
    #[serde(default)]
    pub cranelift_opt_level: CompileOptLevel,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            kind: EngineKind::default(),
            pooling_allocator: defaults::pooling_allocator(),
            max_instances: defaults::max_instances(),
            instance_memory_mb: defaults::instance_memory_mb(),
            cranelift_opt_level: CompileOptLevel::default(),
        }
    }
}

impl EngineConfig {
    /// Return a copy of this configuration targeting `kind`.
    #[must_use]
    pub fn with_kind(mut self, kind: EngineKind) -> Self {
        self.kind = kind;
        self
    }
}

/// Per-instance execution configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExecutionConfig {
    /// Enable fuel metering.
    ///
    /// When enabled, each guest call is given `max_fuel` units and traps
    /// once they are used up.
    #[serde(default = "defaults::fuel_metering")]
    pub fuel_metering: bool,

    /// Fuel granted to each guest call.
    #[serde(default = "defaults::max_fuel")]
    pub max_fuel: u64,

    /// Maximum guest linear memory in megabytes.
    #[serde(default = "defaults::max_memory_mb")]
    pub max_memory_mb: u32,

    /// Let the guest write to the host's stdout/stderr (wasmtime only).
    #[serde(default)]
    pub inherit_stdio: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            fuel_metering: defaults::fuel_metering(),
            max_fuel: defaults::max_fuel(),
            max_memory_mb: defaults::max_memory_mb(),
            inherit_stdio: false,
        }
    }
}

impl ExecutionConfig {
    /// Get the memory limit in bytes.
    pub fn max_memory_bytes(&self) -> usize {
        usize::try_from(u64::from(self.max_memory_mb).saturating_mul(1024 * 1024))
            .unwrap_or(usize::MAX)
    }
}

/// How a host string is laid out in guest memory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WireEncoding {
    /// UTF-8 bytes followed by one `0x00` sentinel.
    #[default]
    NulTerminated,
    /// UTF-8 bytes only.
    Raw,
}

/// Guest artifact configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct GuestConfig {
    /// Path to the guest `.wasm` file.
    ///
    /// When unset, the artifact embedded at build time is used.
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Wire encoding of string arguments.
    #[serde(default)]
    pub encoding: WireEncoding,
}

/// Default value functions for serde.
mod defaults {
    pub const fn pooling_allocator() -> bool {
        false
    }

    pub const fn max_instances() -> u32 {
        16
    }

    pub const fn instance_memory_mb() -> u32 {
        64
    }

    pub const fn fuel_metering() -> bool {
        false
    }

    pub const fn max_fuel() -> u64 {
        100_000_000
    }

    pub const fn max_memory_mb() -> u32 {
        128
    }
}
