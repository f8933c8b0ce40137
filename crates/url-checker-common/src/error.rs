//! Error types for url-checker.
//!
//! [`CheckerError`] is the single error type returned across the host/guest
//! boundary. Every predicate call either yields a boolean or one of these
//! errors; callers must treat an error as "validity unknown", never as `false`.

use std::fmt;

use thiserror::Error;

/// Stage of instance bootstrap at which a failure occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapStage {
    /// Loading or validating the module artifact.
    Artifact,
    /// Constructing the engine.
    Engine,
    /// Compiling the module artifact.
    Compile,
    /// Registering the system-interface shim.
    Shim,
    /// Instantiating the module.
    Instantiate,
    /// Running the guest's `_initialize` export.
    Initialize,
}

impl fmt::Display for BootstrapStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stage = match self {
            BootstrapStage::Artifact => "artifact",
            BootstrapStage::Engine => "engine",
            BootstrapStage::Compile => "compile",
            BootstrapStage::Shim => "shim",
            BootstrapStage::Instantiate => "instantiate",
            BootstrapStage::Initialize => "initialize",
        };
        f.write_str(stage)
    }
}

/// Host/guest protocol errors.
#[derive(Error, Debug)]
pub enum CheckerError {
    /// Engine construction, compilation, instantiation or the initializer failed.
    ///
    /// Fatal to the instance; the caller must discard it.
    #[error("Bootstrap failed at {stage} stage: {reason}")]
    BootstrapFailed {
        /// The stage that failed.
        stage: BootstrapStage,
        /// Description of the failure.
        reason: String,
    },

    /// A required export is missing or has the wrong shape.
    ///
    /// Indicates an artifact/version mismatch between host and guest.
    #[error("Export '{name}' unusable: {reason}")]
    ExportNotFound {
        /// Name of the export.
        name: String,
        /// Either "missing" or a signature mismatch description.
        reason: String,
    },

    /// A guest export trapped or the engine reported a call error.
    #[error("Guest call '{export}' failed: {reason}")]
    GuestCallFailed {
        /// Name of the export that was called.
        export: String,
        /// Trap or engine error description.
        reason: String,
    },

    /// A host write into guest memory exceeded the lease or memory bounds.
    #[error("Out of guest memory: write of {length} bytes at {pointer:#x} (memory size {memory_size})")]
    OutOfMemory {
        /// Guest address of the write.
        pointer: u32,
        /// Number of bytes that were to be written.
        length: usize,
        /// Size of guest linear memory (or of the lease) at the time of the write.
        memory_size: usize,
    },

    /// A call returned no result or a result of the wrong type.
    #[error("Unexpected result shape from '{export}': {reason}")]
    UnexpectedResultShape {
        /// Name of the export that was called.
        export: String,
        /// Description of what was received.
        reason: String,
    },

    /// A previous guest call failed and the instance's memory can no longer be trusted.
    #[error("Instance poisoned by an earlier guest call failure")]
    InstancePoisoned,
}

impl CheckerError {
    /// Create a new `BootstrapFailed` error.
    pub fn bootstrap(stage: BootstrapStage, reason: impl Into<String>) -> Self {
        Self::BootstrapFailed {
            stage,
            reason: reason.into(),
        }
    }

    /// Create an `ExportNotFound` error for an absent export.
    pub fn export_missing(name: impl Into<String>) -> Self {
        Self::ExportNotFound {
            name: name.into(),
            reason: "missing".into(),
        }
    }

    /// Create an `ExportNotFound` error for an export of the wrong shape.
    pub fn signature_mismatch(name: impl Into<String>, detail: impl fmt::Display) -> Self {
        Self::ExportNotFound {
            name: name.into(),
            reason: format!("signature mismatch: {detail}"),
        }
    }

    /// Create a new `GuestCallFailed` error.
    pub fn guest_call(export: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::GuestCallFailed {
            export: export.into(),
            reason: reason.into(),
        }
    }

    /// Create a new `UnexpectedResultShape` error.
    pub fn result_shape(export: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::UnexpectedResultShape {
            export: export.into(),
            reason: reason.into(),
        }
    }

    /// Returns `true` if the instance that produced this error must be discarded.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::BootstrapFailed { .. }
                | Self::ExportNotFound { .. }
                | Self::GuestCallFailed { .. }
                | Self::InstancePoisoned
        )
    }

    /// Returns `true` if this error means host and guest disagree on the contract.
    pub fn is_contract_mismatch(&self) -> bool {
        matches!(
            self,
            Self::ExportNotFound { .. } | Self::UnexpectedResultShape { .. }
        )
    }
}
